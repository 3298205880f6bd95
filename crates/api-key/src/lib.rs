//! Opaque API key generation for the address gateway.
//!
//! Issued keys are bearer tokens: the gateway compares them by exact match
//! against the plan directory and never interprets their contents.
//!
//! # Token Format
//!
//! Tokens follow the format: `{prefix}_{base32(uuid || secret)}`
//!
//! Example: `addr_06bqmf0s2n9v8c4h...`
//!
//! The UUIDv7 prefix keeps tokens roughly time-ordered, which makes
//! directory indexes friendlier; the 256-bit secret makes them unguessable.
//!
//! # Example
//!
//! ```rust
//! use api_key::{ApiKeyConfig, generate};
//!
//! let config = ApiKeyConfig::new("addr");
//! let token = generate(&config);
//! assert!(token.token.starts_with("addr_"));
//! ```

mod config;
mod token;

pub use config::ApiKeyConfig;
pub use token::{ApiKeyToken, generate};
