//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Temporary accept error in server::ListenerWrapper:
//!     → attempt counter incremented
//!     → backoff.rs (exponential delay with jitter, capped)
//!     → interruptible sleep, then accept again
//! Successful accept:
//!     → attempt counter reset
//! ```
//!
//! # Design Decisions
//! - The delay policy is a plain function so callers and tests can swap it
//! - Jitter only adds to the delay; the capped exponential value is a floor

pub mod backoff;

pub use backoff::{backoff_fn, calculate_backoff, BackoffFn};
