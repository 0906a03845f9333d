//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! resolver / listener wrapper produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → whatever subscriber / recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Fields, not formatted strings, for resource names and addresses
//! - The library never installs a metrics exporter
//! - Metric updates are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
