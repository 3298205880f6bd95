//! Usage counter stores: atomic per-window request counters with expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;

use crate::error::StoreError;

/// Shared counter store keyed by `ratelimit:<credential>:<window>`.
///
/// `incr_and_get` must be atomic across callers: k concurrent increments on
/// one key yield k distinct post-increment values and a final value of k.
#[async_trait]
pub trait UsageCounterStore: Send + Sync {
    /// Increment the counter by one and return the post-increment value.
    async fn incr_and_get(&self, key: &str) -> Result<u64, StoreError>;

    /// Increment like [`incr_and_get`](Self::incr_and_get) and, in the same
    /// atomic step, set `ttl` if the counter has no expiry yet.
    ///
    /// A counter never outlives its window even if an earlier expiry was
    /// lost: the next increment puts it back.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Set the counter's time to live. Idempotent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Current value, zero when absent. Diagnostics only.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Every live counter whose key starts with `prefix`, with its value.
    /// Diagnostics only; order is unspecified.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError>;
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

// ============================================================================
// Redis
// ============================================================================

// TTL is -1 when the key exists without an expiry.
const INCR_WITH_EXPIRY: &str = r#"
local n = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return n
"#;

const SCAN_BATCH: usize = 500;

/// Counter store backed by Redis `INCR`/`EXPIRE`.
///
/// The connection is established lazily and re-established by the
/// connection manager after a Redis restart, so a failed first connect
/// surfaces as a store error for that request only.
pub struct RedisCounterStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    incr_with_expiry: Script,
}

impl RedisCounterStore {
    /// Create a store for the given `redis://` URL without connecting yet.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                log::info!("Connected to Redis usage counter store");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl UsageCounterStore for RedisCounterStore {
    async fn incr_and_get(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let value: u64 = conn.incr(key, 1u64).await?;
        Ok(value)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let value: u64 = self
            .incr_with_expiry
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                // Keys can expire between SCAN and MGET.
                let values: Vec<Option<u64>> =
                    redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
                found.extend(
                    keys.into_iter()
                        .zip(values)
                        .filter_map(|(key, value)| value.map(|v| (key, v))),
                );
            }
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }
}

// ============================================================================
// In-process
// ============================================================================

#[derive(Debug)]
struct Counter {
    value: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process counter store.
///
/// Only correct for a single gateway instance; several instances each keep
/// their own counts.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.lock().expect("counter store poisoned");
        let before = counters.len();
        counters.retain(|_, c| !c.is_expired(now));
        before - counters.len()
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.counters
            .lock()
            .expect("counter store poisoned")
            .values()
            .filter(|c| !c.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time left before `key` expires; `None` when absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.counters
            .lock()
            .expect("counter store poisoned")
            .get(key)
            .filter(|c| !c.is_expired(now))
            .and_then(|c| c.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn bump(&self, key: &str, ttl: Option<Duration>) -> u64 {
        let now = Instant::now();
        let mut counters = self.counters.lock().expect("counter store poisoned");
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if counter.is_expired(now) {
            counter.value = 0;
            counter.expires_at = None;
        }
        counter.value += 1;
        if let (Some(ttl), None) = (ttl, counter.expires_at) {
            counter.expires_at = Some(now + ttl);
        }
        counter.value
    }
}

#[async_trait]
impl UsageCounterStore for MemoryCounterStore {
    async fn incr_and_get(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.bump(key, None))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.bump(key, Some(ttl)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut counters = self.counters.lock().expect("counter store poisoned");
        if let Some(counter) = counters.get_mut(key) {
            counter.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let counters = self.counters.lock().expect("counter store poisoned");
        Ok(counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map_or(0, |c| c.value))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let now = Instant::now();
        let counters = self.counters.lock().expect("counter store poisoned");
        Ok(counters
            .iter()
            .filter(|(key, c)| key.starts_with(prefix) && !c.is_expired(now))
            .map(|(key, c)| (key.clone(), c.value))
            .collect())
    }
}
