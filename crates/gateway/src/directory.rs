//! Plan directory: durable mapping from API key to (plan, active).
//!
//! The rate limiter only ever calls [`PlanDirectory::lookup`]. Key issuance,
//! revocation and plan changes are separate write paths used by the admin
//! tooling and billing sync.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use api_key::ApiKeyConfig;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::error::StoreError;
use crate::quota::{FREE, QuotaPolicy};

// ============================================================================
// Read contract
// ============================================================================

/// The fields of an API key row the limiter consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub plan: String,
    pub active: bool,
}

/// Read-only view of the plan directory used on the request path.
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    /// Look up a key by exact match. `Ok(None)` when the key was never issued.
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>, StoreError>;
}

// ============================================================================
// Write paths
// ============================================================================

/// Errors from the administrative write paths.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("API key not found")]
    KeyNotFound,

    #[error("no user matches '{0}'")]
    UserNotFound(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A freshly issued key.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: String,
    pub plan: String,
}

/// One row of a user's key listing.
#[derive(Debug, Clone)]
pub struct KeySummary {
    pub key: String,
    pub plan: String,
    pub active: bool,
    pub created_at: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT UNIQUE NOT NULL,
    stripe_customer_id TEXT
);
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    key TEXT UNIQUE NOT NULL,
    plan TEXT NOT NULL DEFAULT 'free',
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_users_customer ON users(stripe_customer_id);
"#;

// ============================================================================
// SQLite directory
// ============================================================================

/// Plan directory stored in SQLite.
///
/// Lookups read the row on every call, so a plan change or revocation is
/// visible to the very next request.
pub struct SqlitePlanDirectory {
    conn: Arc<Mutex<Connection>>,
    key_config: ApiKeyConfig,
}

impl SqlitePlanDirectory {
    /// Open (and create if needed) the directory database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory directory.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(1))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            key_config: ApiKeyConfig::default(),
        })
    }

    /// Use a custom prefix for issued keys.
    pub fn with_key_config(mut self, key_config: ApiKeyConfig) -> Self {
        self.key_config = key_config;
        self
    }

    fn lookup_row(conn: &Connection, key: &str) -> Result<Option<KeyRecord>, rusqlite::Error> {
        conn.query_row(
            "SELECT plan, is_active FROM api_keys WHERE key = ?1",
            [key],
            |row| {
                Ok(KeyRecord {
                    plan: row.get(0)?,
                    active: row.get(1)?,
                })
            },
        )
        .optional()
    }

    /// Synchronous lookup, for tooling outside the request path.
    pub fn lookup_blocking(&self, key: &str) -> Result<Option<KeyRecord>, rusqlite::Error> {
        let conn = self.conn.lock().expect("plan directory poisoned");
        Self::lookup_row(&conn, key)
    }

    /// Issue a new key on the free plan, creating the user if needed.
    pub fn issue_key(
        &self,
        email: &str,
        stripe_customer_id: &str,
    ) -> Result<IssuedKey, DirectoryError> {
        let token = api_key::generate(&self.key_config);
        let mut conn = self.conn.lock().expect("plan directory poisoned");
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row("SELECT id FROM users WHERE email = ?1", [email], |row| {
                row.get(0)
            })
            .optional()?;
        let user_id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO users (email, stripe_customer_id) VALUES (?1, ?2)",
                    params![email, stripe_customer_id],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO api_keys (user_id, key, plan, is_active) VALUES (?1, ?2, ?3, 1)",
            params![user_id, token.token, FREE],
        )?;
        tx.commit()?;

        log::info!("Issued API key {} for user {}", token.id, user_id);
        Ok(IssuedKey {
            key: token.token,
            plan: FREE.to_string(),
        })
    }

    /// All keys belonging to the user with `email`.
    pub fn keys_for_email(&self, email: &str) -> Result<Vec<KeySummary>, DirectoryError> {
        let conn = self.conn.lock().expect("plan directory poisoned");
        let mut stmt = conn.prepare(
            "SELECT k.key, k.plan, k.is_active, k.created_at
             FROM api_keys k JOIN users u ON k.user_id = u.id
             WHERE u.email = ?1 ORDER BY k.id",
        )?;
        let rows = stmt.query_map([email], |row| {
            Ok(KeySummary {
                key: row.get(0)?,
                plan: row.get(1)?,
                active: row.get(2)?,
                created_at: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Soft-revoke a key. The row is kept.
    pub fn revoke(&self, key: &str) -> Result<(), DirectoryError> {
        let conn = self.conn.lock().expect("plan directory poisoned");
        let updated = conn.execute("UPDATE api_keys SET is_active = 0 WHERE key = ?1", [key])?;
        if updated == 0 {
            return Err(DirectoryError::KeyNotFound);
        }
        log::info!("Revoked API key");
        Ok(())
    }

    /// Admin plan change for every key of the user with `email`.
    pub fn set_plan_for_email(
        &self,
        email: &str,
        plan: &str,
        policy: &QuotaPolicy,
    ) -> Result<usize, DirectoryError> {
        if !policy.is_known(plan) {
            return Err(DirectoryError::UnknownPlan(plan.to_string()));
        }
        let conn = self.conn.lock().expect("plan directory poisoned");
        let updated = conn.execute(
            "UPDATE api_keys SET plan = ?1
             WHERE user_id = (SELECT id FROM users WHERE email = ?2)",
            params![plan, email],
        )?;
        if updated == 0 {
            return Err(DirectoryError::UserNotFound(email.to_string()));
        }
        log::info!("Set plan {} on {} key(s)", plan, updated);
        Ok(updated)
    }

    /// Billing-driven update of plan and active flag for every key of a customer.
    pub fn set_plan_for_customer(
        &self,
        stripe_customer_id: &str,
        plan: &str,
        active: bool,
    ) -> Result<usize, DirectoryError> {
        let conn = self.conn.lock().expect("plan directory poisoned");
        let updated = conn.execute(
            "UPDATE api_keys SET plan = ?1, is_active = ?2
             WHERE user_id = (SELECT id FROM users WHERE stripe_customer_id = ?3)",
            params![plan, active, stripe_customer_id],
        )?;
        if updated == 0 {
            return Err(DirectoryError::UserNotFound(stripe_customer_id.to_string()));
        }
        log::info!(
            "Billing sync set plan={} active={} on {} key(s)",
            plan,
            active,
            updated
        );
        Ok(updated)
    }
}

#[async_trait]
impl PlanDirectory for SqlitePlanDirectory {
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        let record = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("plan directory poisoned");
            Self::lookup_row(&conn, &key)
        })
        .await??;
        Ok(record)
    }
}

// ============================================================================
// In-memory directory
// ============================================================================

/// Thread-safe in-memory plan directory.
#[derive(Debug, Default)]
pub struct MemoryPlanDirectory {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl MemoryPlanDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly issued key on the free plan.
    pub fn issue(&self, key: &str) {
        self.upsert(
            key,
            KeyRecord {
                plan: FREE.to_string(),
                active: true,
            },
        );
    }

    /// Insert or replace a key's record.
    pub fn upsert(&self, key: &str, record: KeyRecord) {
        self.keys
            .write()
            .expect("plan directory poisoned")
            .insert(key.to_string(), record);
    }

    /// Change a key's plan. Returns false when the key is unknown.
    pub fn set_plan(&self, key: &str, plan: &str) -> bool {
        let mut keys = self.keys.write().expect("plan directory poisoned");
        match keys.get_mut(key) {
            Some(record) => {
                record.plan = plan.to_string();
                true
            }
            None => false,
        }
    }

    /// Mark a key inactive. Returns false when the key is unknown.
    pub fn revoke(&self, key: &str) -> bool {
        let mut keys = self.keys.write().expect("plan directory poisoned");
        match keys.get_mut(key) {
            Some(record) => {
                record.active = false;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PlanDirectory for MemoryPlanDirectory {
    async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>, StoreError> {
        Ok(self
            .keys
            .read()
            .expect("plan directory poisoned")
            .get(key)
            .cloned())
    }
}
