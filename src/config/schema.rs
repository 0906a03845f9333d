//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files, and every
//! section has defaults so a minimal (or empty) file is valid.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct XdsConfig {
    /// Client-side resolver settings.
    pub resolver: ResolverConfig,

    /// Server-side listener settings.
    pub server: ServerConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// URI scheme the resolver builder registers for.
    pub target_scheme: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            target_scheme: "xds".to_string(),
        }
    }
}

/// Listener wrapper configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Backoff applied to temporary accept errors.
    pub accept_backoff: BackoffConfig,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay of the first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound of the delay in milliseconds (before jitter).
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
