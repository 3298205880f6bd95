//! Configuration for API key generation.

/// Configuration for API key generation.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    /// Prefix for token strings (e.g., "addr" produces "addr_...").
    pub prefix: String,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: "addr".to_string(),
        }
    }
}

impl ApiKeyConfig {
    /// Create a new config with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}
