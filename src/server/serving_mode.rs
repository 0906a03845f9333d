//! Serving mode reporting.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Whether the listener is accepting connections for RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingMode {
    /// No good listener configuration received yet.
    Starting,
    Serving,
    /// Configuration is missing or unusable; new connections are closed.
    NotServing,
}

impl ServingMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ServingMode::Starting => 0,
            ServingMode::Serving => 1,
            ServingMode::NotServing => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ServingMode::Serving,
            2 => ServingMode::NotServing,
            _ => ServingMode::Starting,
        }
    }
}

impl fmt::Display for ServingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServingMode::Starting => "starting",
            ServingMode::Serving => "serving",
            ServingMode::NotServing => "not_serving",
        };
        f.write_str(s)
    }
}

/// Argument of the serving mode callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingModeChange {
    pub mode: ServingMode,
    /// Why the listener is not serving, if it is not.
    pub error: Option<String>,
}

/// Invoked with the bound address on every serving mode change.
pub type ServingModeCallback = Arc<dyn Fn(SocketAddr, ServingModeChange) + Send + Sync>;
