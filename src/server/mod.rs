//! Server-side xDS listener integration.
//!
//! # Data Flow
//! ```text
//! Listener resource update
//!     → filter_chain.rs (FilterChainManager built from the ordered chains)
//!     → listener_wrapper.rs (diff route names, start/cancel route watches)
//!     → readiness.rs (gate fires once every route resolved for the generation)
//!     → serving_mode.rs (Starting → Serving / NotServing callbacks)
//!
//! Inbound connection:
//!     → ListenerWrapper::accept (backoff on temporary errors)
//!     → FilterChainManager::lookup(local, remote) via cidr.rs predicates
//!     → ServerConn (matched chain + lazy route lookup) or silent close
//! ```
//!
//! # Design Decisions
//! - Each listener update replaces the matcher wholesale
//! - No filter chain match is not an error; the connection is just closed
//! - Transport security parameters are carried, never interpreted

pub mod cidr;
pub mod filter_chain;
pub mod listener_wrapper;
pub mod readiness;
pub mod serving_mode;

pub use cidr::{CidrError, CidrRange};
pub use filter_chain::{
    FilterChain, FilterChainError, FilterChainManager, FilterChainMatch, RouteSource, SourceType,
    TransportSecurity,
};
pub use listener_wrapper::{ListenerWrapper, ListenerWrapperParams, ServerConn};
pub use readiness::{ReadinessGate, ReadyReceiver};
pub use serving_mode::{ServingMode, ServingModeCallback, ServingModeChange};
