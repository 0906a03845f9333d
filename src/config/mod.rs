//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → XdsConfig (validated, immutable)
//!     → ResolverBuilder / ListenerWrapperParams / init_logging
//! ```
//!
//! # Design Decisions
//! - Only local tunables live here; routing state always comes from the control plane
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{BackoffConfig, ObservabilityConfig, ResolverConfig, ServerConfig, XdsConfig};
