/// Manager configuration and the built-in claim definitions.
pub mod config;

/// Bridges the `log` facade to a host-provided logger.
pub mod logger;

pub use config::{ClaimsManagerConfig, BASE_SCOPE};
