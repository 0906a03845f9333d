//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (delays > 0, max >= base)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: XdsConfig → Result<(), Vec<ValidationError>>

use thiserror::Error;

use crate::config::schema::XdsConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("resolver.target_scheme must not be empty")]
    EmptyScheme,

    #[error("server.accept_backoff.base_delay_ms must be greater than 0")]
    ZeroBaseDelay,

    #[error("server.accept_backoff.max_delay_ms ({max}) is below base_delay_ms ({base})")]
    MaxBelowBase { base: u64, max: u64 },

    #[error("observability.log_level '{0}' is not one of trace, debug, info, warn, error")]
    UnknownLogLevel(String),
}

pub fn validate_config(config: &XdsConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.resolver.target_scheme.trim().is_empty() {
        errors.push(ValidationError::EmptyScheme);
    }

    let backoff = &config.server.accept_backoff;
    if backoff.base_delay_ms == 0 {
        errors.push(ValidationError::ZeroBaseDelay);
    }
    if backoff.max_delay_ms < backoff.base_delay_ms {
        errors.push(ValidationError::MaxBelowBase {
            base: backoff.base_delay_ms,
            max: backoff.max_delay_ms,
        });
    }

    let level = config.observability.log_level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::UnknownLogLevel(
            config.observability.log_level.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
