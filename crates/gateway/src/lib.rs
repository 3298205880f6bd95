//! Rate-limited gateway for the address lookup API.
//!
//! Requests carry `Authorization: Bearer <key>`. Each key has a plan in the
//! SQLite plan directory; each plan has a daily request ceiling. Usage is
//! counted per key per UTC day in a shared counter store (Redis in
//! production), and admitted requests are proxied to the lookup backends.

pub mod billing;
pub mod configuration;
pub mod counter;
pub mod directory;
pub mod error;
pub mod lb;
pub mod limiter;
pub mod metric;
pub mod quota;
pub mod server;
pub mod window;
