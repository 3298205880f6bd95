//! Error types for plan directory and usage counter store access.

use std::fmt;

use thiserror::Error;

/// Which backing store a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    PlanDirectory,
    UsageCounter,
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Store::PlanDirectory => f.write_str("plan directory"),
            Store::UsageCounter => f.write_str("usage counter store"),
        }
    }
}

/// Errors raised while talking to a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// In-process store refused the call (used to simulate outages).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
