//! The rate limiter: per-key, plan-tiered daily quota enforcement.
//!
//! Every gated request goes through [`RateLimiter::check`]:
//!
//! 1. extract the bearer credential (no store is touched if it is bad),
//! 2. read the key's plan and active flag from the [`PlanDirectory`],
//! 3. resolve the plan's ceiling from the [`QuotaPolicy`],
//! 4. atomically increment `ratelimit:<key>:<YYYYMMDD>` in the
//!    [`UsageCounterStore`], setting its expiry in the same step whenever the
//!    counter has none,
//! 5. allow while the post-increment count is at most the ceiling.
//!
//! Both stores fail closed. If either is unreachable or slower than the
//! store timeout the request is denied with [`Denial::StoreUnavailable`], so
//! a counter store outage takes gated endpoints down with it. Nothing is
//! retried: retrying an increment would double count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::counter::UsageCounterStore;
use crate::directory::PlanDirectory;
use crate::error::{Store, StoreError};
use crate::quota::QuotaPolicy;
use crate::window::{COUNTER_KEY_PREFIX, Clock, SystemClock, Window, parse_counter_key};

pub const AUTHORIZATION_HEADER: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// An admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    /// Requests counted in this window, including this one.
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
}

/// One counter in a usage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUsage {
    pub credential: String,
    /// Window id, `YYYYMMDD`.
    pub window: String,
    pub used: u64,
}

/// The limiter's verdict for a request, as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Unauthenticated,
    KeyNotFound,
    KeyInactive,
    QuotaExceeded,
    /// A store failed; the request was denied without a quota decision.
    Unavailable,
}

/// Why a request was rejected. Every variant is terminal for the request.
#[derive(Debug, Error)]
pub enum Denial {
    #[error("missing API key")]
    MissingCredential,

    #[error("invalid API key")]
    MalformedCredential,

    #[error("API key not found")]
    KeyNotFound,

    #[error("API key is inactive")]
    KeyInactive,

    #[error("rate limit exceeded")]
    QuotaExceeded { limit: u64, retry_after: Duration },

    #[error("{store} unavailable: {source}")]
    StoreUnavailable {
        store: Store,
        #[source]
        source: StoreError,
    },
}

impl Denial {
    /// HTTP status for the rejection.
    pub fn status(&self) -> u16 {
        match self {
            Denial::MissingCredential | Denial::MalformedCredential => 401,
            Denial::KeyNotFound | Denial::KeyInactive => 403,
            Denial::QuotaExceeded { .. } => 429,
            Denial::StoreUnavailable { .. } => 503,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Denial::MissingCredential | Denial::MalformedCredential => Outcome::Unauthenticated,
            Denial::KeyNotFound => Outcome::KeyNotFound,
            Denial::KeyInactive => Outcome::KeyInactive,
            Denial::QuotaExceeded { .. } => Outcome::QuotaExceeded,
            Denial::StoreUnavailable { .. } => Outcome::Unavailable,
        }
    }

    /// Retry hint, only present for quota denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Denial::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, Denial> {
    let value = match header.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Err(Denial::MissingCredential),
    };
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or(Denial::MalformedCredential)?
        .trim();
    if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Denial::MalformedCredential);
    }
    Ok(token)
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

fn unavailable(store: Store, source: StoreError) -> Denial {
    log::error!("Failing closed, {} unavailable: {}", store, source);
    Denial::StoreUnavailable { store, source }
}

/// Orchestrates the plan directory, quota policy and usage counters.
///
/// Holds no mutable state of its own; share it behind an `Arc` and call it
/// from as many requests as needed.
pub struct RateLimiter {
    directory: Arc<dyn PlanDirectory>,
    counters: Arc<dyn UsageCounterStore>,
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        directory: Arc<dyn PlanDirectory>,
        counters: Arc<dyn UsageCounterStore>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            directory,
            counters,
            policy,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Decide a request from its raw `Authorization` header value.
    pub async fn check(&self, authorization: Option<&str>) -> Result<Allowance, Denial> {
        let credential = extract_bearer(authorization)?;
        self.check_credential(credential).await
    }

    /// Decide a request for an already extracted credential.
    pub async fn check_credential(&self, credential: &str) -> Result<Allowance, Denial> {
        let record = bounded(self.store_timeout, self.directory.lookup(credential))
            .await
            .map_err(|e| unavailable(Store::PlanDirectory, e))?
            .ok_or(Denial::KeyNotFound)?;
        if !record.active {
            return Err(Denial::KeyInactive);
        }

        let ceiling = self.policy.ceiling_for(&record.plan);
        if ceiling.fallback {
            log::warn!(
                "Unknown plan '{}', applying fallback ceiling {}",
                record.plan,
                ceiling.limit
            );
        }

        // One clock read decides the window for both the key and the expiry.
        let window = Window::containing(self.clock.now());
        let counter_key = window.counter_key(credential);

        let used = bounded(
            self.store_timeout,
            self.counters.incr_with_expiry(&counter_key, window.counter_ttl()),
        )
        .await
        .map_err(|e| unavailable(Store::UsageCounter, e))?;

        if used > ceiling.limit {
            log::debug!(
                "Quota exceeded for plan {} ({} > {})",
                record.plan,
                used,
                ceiling.limit
            );
            return Err(Denial::QuotaExceeded {
                limit: ceiling.limit,
                retry_after: window.remaining(),
            });
        }

        Ok(Allowance {
            used,
            limit: ceiling.limit,
            remaining: ceiling.limit - used,
            reset_after: window.remaining(),
        })
    }

    /// Requests counted for `credential` in the current window.
    pub async fn usage(&self, credential: &str) -> Result<u64, StoreError> {
        let window = Window::containing(self.clock.now());
        bounded(
            self.store_timeout,
            self.counters.get(&window.counter_key(credential)),
        )
        .await
    }

    /// Every live counter in the store, ordered by window then credential.
    pub async fn usage_report(&self) -> Result<Vec<KeyUsage>, StoreError> {
        let counters =
            bounded(self.store_timeout, self.counters.scan(COUNTER_KEY_PREFIX)).await?;
        let mut report: Vec<KeyUsage> = counters
            .iter()
            .filter_map(|(key, used)| {
                let (credential, window) = parse_counter_key(key)?;
                Some(KeyUsage {
                    credential: credential.to_string(),
                    window: window.to_string(),
                    used: *used,
                })
            })
            .collect();
        report.sort_by(|a, b| {
            a.window
                .cmp(&b.window)
                .then_with(|| a.credential.cmp(&b.credential))
        });
        Ok(report)
    }
}
