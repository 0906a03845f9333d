//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Underlying listener (tokio TcpListener or any Acceptor)
//!     → listener.rs (accept, classify errors as temporary or fatal)
//!     → connection.rs (connection id, local/peer addresses)
//!     → Hand off to server::ListenerWrapper for filter chain matching
//! ```
//!
//! # Design Decisions
//! - The accept path is generic over `Acceptor` so it can be driven without sockets
//! - Error classification lives next to the socket code, not in the wrapper

pub mod connection;
pub mod listener;

pub use connection::{ConnectionId, InboundConnection};
pub use listener::{bind, is_temporary, Acceptor, ListenerError};
