//! Discovery client contract.
//!
//! # Data Flow
//! ```text
//! Control plane (LDS / RDS / CDS push)
//!     → DiscoveryClient (transport + parsing, external)
//!     → WatchCallback(Result<Update, WatchError>)
//!     → resolver mailbox / listener control task
//! ```
//!
//! # Design Decisions
//! - The client is injected, never looked up through a global
//! - Callbacks may run on any thread; receivers only enqueue
//! - A watch stays registered until its `WatchHandle` is dropped

pub mod in_memory;
pub mod resources;

use std::fmt;
use thiserror::Error;

pub use in_memory::{InMemoryDiscoveryClient, ResourceKind, WatchEvent};
pub use resources::{
    ListenerUpdate, Route, RouteAction, RouteConfigUpdate, RouteMatch, ServiceUpdate,
    VirtualHost, WeightedCluster,
};

/// Classification of a watch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// The control plane explicitly withdrew the named resource.
    ResourceNotFound,
    /// Any other control-plane or transport problem.
    Other,
}

/// Error delivered to a watch callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct WatchError {
    pub kind: WatchErrorKind,
    pub message: String,
}

impl WatchError {
    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self {
            kind: WatchErrorKind::ResourceNotFound,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: WatchErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_resource_not_found(&self) -> bool {
        self.kind == WatchErrorKind::ResourceNotFound
    }
}

/// Callback invoked by the discovery client for every update or error on a watch.
pub type WatchCallback<T> = Box<dyn Fn(Result<T, WatchError>) + Send + Sync>;

/// Registration of a single watch.
///
/// Dropping the handle cancels the watch. Cancelling only stops future callbacks.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancel the watch now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Bootstrap information the client was created with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapInfo {
    /// Names of configured certificate provider instances.
    pub certificate_providers: Vec<String>,
}

/// Subscribe/watch side of the discovery protocol.
pub trait DiscoveryClient: Send + Sync {
    /// Watch the service resource (listener plus its route configuration) for a dial target.
    fn watch_service(&self, name: &str, callback: WatchCallback<ServiceUpdate>) -> WatchHandle;

    /// Watch an inbound listener resource.
    fn watch_listener(&self, name: &str, callback: WatchCallback<ListenerUpdate>) -> WatchHandle;

    /// Watch a route configuration resource.
    fn watch_route_config(
        &self,
        name: &str,
        callback: WatchCallback<RouteConfigUpdate>,
    ) -> WatchHandle;

    fn bootstrap(&self) -> BootstrapInfo;

    /// Release the client. Watches still registered receive no further callbacks.
    fn close(&self);
}
