//! In-memory discovery client.
//!
//! # Responsibilities
//! - Record watch registrations and cancellations
//! - Deliver caller-supplied updates and errors to every watcher of a resource
//! - Report watch lifecycle events to subscribers
//!
//! Used by tests and by embedders that drive configuration programmatically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use super::{
    BootstrapInfo, DiscoveryClient, ListenerUpdate, RouteConfigUpdate, ServiceUpdate,
    WatchCallback, WatchError, WatchHandle,
};

/// Resource category of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Service,
    Listener,
    RouteConfig,
}

/// Watch lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Started { kind: ResourceKind, name: String },
    Cancelled { kind: ResourceKind, name: String },
}

type SharedCallback<T> = Arc<dyn Fn(Result<T, WatchError>) + Send + Sync>;

struct WatchSet<T> {
    watchers: HashMap<String, Vec<(u64, SharedCallback<T>)>>,
}

impl<T> Default for WatchSet<T> {
    fn default() -> Self {
        Self {
            watchers: HashMap::new(),
        }
    }
}

impl<T> WatchSet<T> {
    fn add(&mut self, name: &str, id: u64, callback: SharedCallback<T>) {
        self.watchers
            .entry(name.to_string())
            .or_default()
            .push((id, callback));
    }

    fn remove(&mut self, name: &str, id: u64) -> bool {
        let Some(list) = self.watchers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(watch_id, _)| *watch_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.watchers.remove(name);
        }
        removed
    }

    fn callbacks(&self, name: &str) -> Vec<SharedCallback<T>> {
        self.watchers
            .get(name)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    services: WatchSet<ServiceUpdate>,
    listeners: WatchSet<ListenerUpdate>,
    routes: WatchSet<RouteConfigUpdate>,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    closed: bool,
}

impl Registry {
    fn emit(&mut self, event: WatchEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn remove(&mut self, kind: ResourceKind, name: &str, id: u64) -> bool {
        match kind {
            ResourceKind::Service => self.services.remove(name, id),
            ResourceKind::Listener => self.listeners.remove(name, id),
            ResourceKind::RouteConfig => self.routes.remove(name, id),
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Discovery client whose resources are pushed by the caller.
#[derive(Default)]
pub struct InMemoryDiscoveryClient {
    registry: Arc<Mutex<Registry>>,
    bootstrap: BootstrapInfo,
}

impl InMemoryDiscoveryClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_bootstrap(bootstrap: BootstrapInfo) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::default(),
            bootstrap,
        })
    }

    /// Subscribe to watch lifecycle events registered from now on.
    pub fn events(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry).subscribers.push(tx);
        rx
    }

    /// Names currently watched for the given kind, sorted.
    pub fn watched(&self, kind: ResourceKind) -> Vec<String> {
        let registry = lock(&self.registry);
        match kind {
            ResourceKind::Service => registry.services.names(),
            ResourceKind::Listener => registry.listeners.names(),
            ResourceKind::RouteConfig => registry.routes.names(),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }

    /// Deliver a service update or error. Returns the number of callbacks invoked.
    pub fn push_service(&self, name: &str, update: Result<ServiceUpdate, WatchError>) -> usize {
        let callbacks = {
            let registry = lock(&self.registry);
            if registry.closed {
                return 0;
            }
            registry.services.callbacks(name)
        };
        deliver(&callbacks, update)
    }

    pub fn push_listener(&self, name: &str, update: Result<ListenerUpdate, WatchError>) -> usize {
        let callbacks = {
            let registry = lock(&self.registry);
            if registry.closed {
                return 0;
            }
            registry.listeners.callbacks(name)
        };
        deliver(&callbacks, update)
    }

    pub fn push_route_config(
        &self,
        name: &str,
        update: Result<RouteConfigUpdate, WatchError>,
    ) -> usize {
        let callbacks = {
            let registry = lock(&self.registry);
            if registry.closed {
                return 0;
            }
            registry.routes.callbacks(name)
        };
        deliver(&callbacks, update)
    }

    fn register<F>(&self, kind: ResourceKind, name: &str, add: F) -> WatchHandle
    where
        F: FnOnce(&mut Registry, u64),
    {
        let id = {
            let mut registry = lock(&self.registry);
            registry.next_id += 1;
            let id = registry.next_id;
            add(&mut registry, id);
            registry.emit(WatchEvent::Started {
                kind,
                name: name.to_string(),
            });
            id
        };

        let weak: Weak<Mutex<Registry>> = Arc::downgrade(&self.registry);
        let name = name.to_string();
        WatchHandle::new(move || {
            if let Some(registry) = weak.upgrade() {
                let mut registry = lock(&registry);
                if registry.remove(kind, &name, id) {
                    registry.emit(WatchEvent::Cancelled { kind, name });
                }
            }
        })
    }
}

fn deliver<T: Clone>(callbacks: &[SharedCallback<T>], update: Result<T, WatchError>) -> usize {
    for callback in callbacks {
        callback(update.clone());
    }
    callbacks.len()
}

impl DiscoveryClient for InMemoryDiscoveryClient {
    fn watch_service(&self, name: &str, callback: WatchCallback<ServiceUpdate>) -> WatchHandle {
        let callback: SharedCallback<ServiceUpdate> = Arc::from(callback);
        self.register(ResourceKind::Service, name, |r, id| {
            r.services.add(name, id, callback)
        })
    }

    fn watch_listener(&self, name: &str, callback: WatchCallback<ListenerUpdate>) -> WatchHandle {
        let callback: SharedCallback<ListenerUpdate> = Arc::from(callback);
        self.register(ResourceKind::Listener, name, |r, id| {
            r.listeners.add(name, id, callback)
        })
    }

    fn watch_route_config(
        &self,
        name: &str,
        callback: WatchCallback<RouteConfigUpdate>,
    ) -> WatchHandle {
        let callback: SharedCallback<RouteConfigUpdate> = Arc::from(callback);
        self.register(ResourceKind::RouteConfig, name, |r, id| {
            r.routes.add(name, id, callback)
        })
    }

    fn bootstrap(&self) -> BootstrapInfo {
        self.bootstrap.clone()
    }

    fn close(&self) {
        let mut registry = lock(&self.registry);
        if !registry.closed {
            registry.closed = true;
            tracing::debug!("In-memory discovery client closed");
        }
    }
}
