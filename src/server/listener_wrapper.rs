//! xDS-aware listener wrapper.
//!
//! # Responsibilities
//! - Watch the listener resource and rebuild the filter chain matcher on each update
//! - Start and cancel route configuration watches as the required route set changes
//! - Gate readiness until every dynamic route of the current generation resolved once
//! - Accept connections, retrying temporary errors with backoff, and hand out only
//!   connections that match a filter chain while serving
//!
//! # Data Flow
//! ```text
//! listener watch callback ─┐
//! route watch callbacks  ──┼→ mpsc → control task (generation, gate, serving mode)
//!                          │           → ArcSwap<FilterChainManager> snapshot
//!                          │           → DashMap route lookup
//!                          │           → ready signal / serving mode callback
//! accept() ── underlying listener → snapshot lookup → ServerConn
//! ```
//!
//! # Design Decisions
//! - Every watch callback only enqueues; the control task is the single writer
//! - Route callbacks carry the id of the watch that produced them, so callbacks from
//!   a cancelled watch never reach a newer generation
//! - Close is synchronous: it cancels all watches before returning

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::config::{BackoffConfig, ServerConfig};
use crate::discovery::{
    DiscoveryClient, ListenerUpdate, RouteConfigUpdate, WatchError, WatchHandle,
};
use crate::net::{is_temporary, Acceptor, ConnectionId, InboundConnection, ListenerError};
use crate::observability::metrics;
use crate::resilience::{backoff_fn, BackoffFn};
use crate::server::filter_chain::{
    FilterChain, FilterChainManager, RouteSource, TransportSecurity,
};
use crate::server::readiness::{ready_channel, ReadinessGate, ReadyReceiver, ReadySender};
use crate::server::serving_mode::{ServingMode, ServingModeCallback, ServingModeChange};

type RouteTable = DashMap<String, Arc<RouteConfigUpdate>>;

/// Construction parameters of a [`ListenerWrapper`].
pub struct ListenerWrapperParams<L> {
    /// Bound listener to accept from.
    pub listener: L,
    /// Name of the listener resource to watch.
    pub listener_resource_name: String,
    pub client: Arc<dyn DiscoveryClient>,
    pub mode_callback: Option<ServingModeCallback>,
    /// Delay before retry `n` (1-based) after a temporary accept error.
    pub backoff: BackoffFn,
}

impl<L> ListenerWrapperParams<L> {
    pub fn new(
        listener: L,
        listener_resource_name: impl Into<String>,
        client: Arc<dyn DiscoveryClient>,
    ) -> Self {
        Self {
            listener,
            listener_resource_name: listener_resource_name.into(),
            client,
            mode_callback: None,
            backoff: backoff_fn(&BackoffConfig::default()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: &ServerConfig) -> Self {
        self.backoff = backoff_fn(&config.accept_backoff);
        self
    }

    #[must_use]
    pub fn with_mode_callback(mut self, callback: ServingModeCallback) -> Self {
        self.mode_callback = Some(callback);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }
}

enum ControlEvent {
    Listener(Result<ListenerUpdate, WatchError>),
    Route {
        name: String,
        watch_id: u64,
        result: Result<RouteConfigUpdate, WatchError>,
    },
}

struct RouteWatch {
    id: u64,
    _handle: WatchHandle,
}

/// State shared between the accept path, the control task and `close`.
struct Shared {
    addr: SocketAddr,
    resource_name: String,
    filter_chains: ArcSwapOption<FilterChainManager>,
    routes: Arc<RouteTable>,
    mode: AtomicU8,
    route_watches: Mutex<HashMap<String, RouteWatch>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn mode(&self) -> ServingMode {
        ServingMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn route_watches(&self) -> MutexGuard<'_, HashMap<String, RouteWatch>> {
        self.route_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A listener that only hands out connections matching the current xDS configuration.
pub struct ListenerWrapper<L: Acceptor> {
    listener: L,
    shared: Arc<Shared>,
    backoff: BackoffFn,
    listener_watch: Mutex<Option<WatchHandle>>,
}

impl<L: Acceptor> ListenerWrapper<L> {
    /// Start watching the listener resource. Must be called within a tokio runtime.
    ///
    /// The returned receiver yields once per listener generation that became ready.
    pub fn new(params: ListenerWrapperParams<L>) -> Result<(Self, ReadyReceiver), ListenerError> {
        let addr = params.listener.local_addr().map_err(ListenerError::LocalAddr)?;
        let (closed, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            addr,
            resource_name: params.listener_resource_name,
            filter_chains: ArcSwapOption::empty(),
            routes: Arc::new(DashMap::new()),
            mode: AtomicU8::new(ServingMode::Starting.as_u8()),
            route_watches: Mutex::new(HashMap::new()),
            closed,
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = ready_channel();

        let listener_watch = {
            let tx = events_tx.clone();
            params.client.watch_listener(
                &shared.resource_name,
                Box::new(move |res| {
                    let _ = tx.send(ControlEvent::Listener(res));
                }),
            )
        };
        tracing::info!(
            address = %addr,
            resource = %shared.resource_name,
            "Listener watch started"
        );

        let task = ControlTask {
            shared: shared.clone(),
            client: params.client,
            events_tx,
            ready: ready_tx,
            mode_callback: params.mode_callback,
            generation: 0,
            gate: None,
            next_watch_id: 0,
        };
        tokio::spawn(task.run(events_rx, closed_rx));

        Ok((
            Self {
                listener: params.listener,
                shared,
                backoff: params.backoff,
                listener_watch: Mutex::new(Some(listener_watch)),
            },
            ready_rx,
        ))
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn listener_resource_name(&self) -> &str {
        &self.shared.resource_name
    }

    pub fn serving_mode(&self) -> ServingMode {
        self.shared.mode()
    }

    /// Accept the next connection that matches a filter chain.
    ///
    /// Temporary errors are retried after a backoff; connections that match no
    /// chain, or arrive while not serving, are closed and skipped.
    pub async fn accept(&self) -> Result<ServerConn<L::Conn>, ListenerError> {
        let mut attempt: u32 = 0;
        loop {
            if self.shared.is_closed() {
                return Err(ListenerError::Closed);
            }

            let res = tokio::select! {
                _ = closed_signal(self.shared.closed.subscribe()) => return Err(ListenerError::Closed),
                res = self.listener.accept() => res,
            };

            let conn = match res {
                Ok(conn) => conn,
                Err(e) if is_temporary(&e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = (self.backoff)(attempt);
                    metrics::record_accept_backoff();
                    tracing::debug!(
                        address = %self.shared.addr,
                        error = %e,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Temporary accept error, backing off"
                    );
                    tokio::select! {
                        _ = closed_signal(self.shared.closed.subscribe()) => return Err(ListenerError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(address = %self.shared.addr, error = %e, "Accept failed");
                    return Err(ListenerError::Accept(e));
                }
            };
            attempt = 0;

            if let Some(conn) = self.admit(conn) {
                return Ok(conn);
            }
        }
    }

    fn admit(&self, conn: L::Conn) -> Option<ServerConn<L::Conn>> {
        let id = ConnectionId::new();

        if self.shared.mode() != ServingMode::Serving {
            metrics::record_connection("not_serving");
            tracing::debug!(connection_id = %id, "Closing connection, listener not serving");
            return None;
        }

        let (local, remote) = match (conn.local_addr(), conn.peer_addr()) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Err(e), _) | (_, Err(e)) => {
                metrics::record_connection("no_match");
                tracing::debug!(connection_id = %id, error = %e, "Closing connection without addresses");
                return None;
            }
        };

        let filter_chain = self
            .shared
            .filter_chains
            .load_full()
            .and_then(|fcm| fcm.lookup(local, remote));

        let Some(filter_chain) = filter_chain else {
            metrics::record_connection("no_match");
            tracing::debug!(
                connection_id = %id,
                local = %local,
                remote = %remote,
                "No matching filter chain, closing connection"
            );
            return None;
        };

        metrics::record_connection("matched");
        tracing::debug!(
            connection_id = %id,
            remote = %remote,
            filter_chain = %filter_chain.name,
            "Connection accepted"
        );
        Some(ServerConn {
            conn,
            id,
            filter_chain,
            routes: self.shared.routes.clone(),
        })
    }

    /// Stop accepting and cancel every watch. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }

        let listener_watch = self
            .listener_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(listener_watch);

        let route_watches = std::mem::take(&mut *self.shared.route_watches());
        let cancelled = route_watches.len();
        drop(route_watches);

        tracing::info!(
            address = %self.shared.addr,
            resource = %self.shared.resource_name,
            route_watches = cancelled,
            "Listener wrapper closed"
        );
    }
}

impl<L: Acceptor> Drop for ListenerWrapper<L> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves once the closed flag is set or its sender is gone.
async fn closed_signal(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// An accepted connection with the filter chain it matched.
#[derive(Debug)]
pub struct ServerConn<C> {
    conn: C,
    id: ConnectionId,
    filter_chain: Arc<FilterChain>,
    routes: Arc<RouteTable>,
}

impl<C> ServerConn<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.filter_chain
    }

    pub fn security(&self) -> Option<&TransportSecurity> {
        self.filter_chain.security.as_ref()
    }

    /// Route configuration for this connection, looked up now for dynamic routes.
    pub fn route_config(&self) -> Option<Arc<RouteConfigUpdate>> {
        match &self.filter_chain.route {
            RouteSource::Static(route) => Some(route.clone()),
            RouteSource::Dynamic(name) => self.routes.get(name).map(|r| r.value().clone()),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

/// Single writer of listener generations, route watches and serving mode.
struct ControlTask {
    shared: Arc<Shared>,
    client: Arc<dyn DiscoveryClient>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    ready: ReadySender,
    mode_callback: Option<ServingModeCallback>,
    generation: u64,
    gate: Option<ReadinessGate>,
    next_watch_id: u64,
}

impl ControlTask {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
        closed: watch::Receiver<bool>,
    ) {
        let closed = closed_signal(closed);
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                event = events.recv() => match event {
                    Some(ControlEvent::Listener(res)) => self.on_listener(res),
                    Some(ControlEvent::Route { name, watch_id, result }) => {
                        self.on_route(name, watch_id, result)
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(address = %self.shared.addr, "Listener control task exited");
    }

    fn on_listener(&mut self, res: Result<ListenerUpdate, WatchError>) {
        let update = match res {
            Ok(update) => update,
            Err(err) if err.is_resource_not_found() => {
                tracing::warn!(
                    resource = %self.shared.resource_name,
                    error = %err,
                    "Listener resource removed"
                );
                self.drop_configuration();
                self.switch_mode(ServingMode::NotServing, Some(err.to_string()));
                return;
            }
            Err(err) => {
                tracing::warn!(
                    resource = %self.shared.resource_name,
                    error = %err,
                    "Listener watch error, keeping last good config"
                );
                return;
            }
        };

        let addr = self.shared.addr;
        if update.address.to_canonical() != addr.ip().to_canonical() || update.port != addr.port() {
            let msg = format!(
                "listener resource address {}:{} does not match bound address {}",
                update.address, update.port, addr
            );
            tracing::warn!(resource = %self.shared.resource_name, "{msg}");
            self.drop_configuration();
            self.switch_mode(ServingMode::NotServing, Some(msg));
            return;
        }

        let fcm = match FilterChainManager::new(update.filter_chains, update.default_filter_chain) {
            Ok(fcm) => fcm,
            Err(err) => {
                tracing::warn!(
                    resource = %self.shared.resource_name,
                    error = %err,
                    "Rejected listener update"
                );
                return;
            }
        };

        self.generation += 1;
        let required = fcm.route_config_names().clone();
        self.update_route_watches(&required);
        self.shared.filter_chains.store(Some(Arc::new(fcm)));

        let routes = &self.shared.routes;
        let outstanding = required
            .iter()
            .filter(|name| !routes.contains_key(name.as_str()))
            .cloned();
        let gate = ReadinessGate::new(self.generation, outstanding);
        tracing::info!(
            address = %addr,
            generation = self.generation,
            routes = required.len(),
            outstanding = gate.outstanding(),
            "Listener configuration updated"
        );
        self.gate = Some(gate);
        self.check_ready();
    }

    fn on_route(
        &mut self,
        name: String,
        watch_id: u64,
        result: Result<RouteConfigUpdate, WatchError>,
    ) {
        let current = self.shared.route_watches().get(&name).map(|w| w.id);
        if current != Some(watch_id) {
            tracing::debug!(route = %name, watch_id, "Ignoring callback from cancelled route watch");
            return;
        }

        match result {
            Ok(update) => {
                tracing::debug!(route = %name, generation = self.generation, "Route configuration received");
                self.shared.routes.insert(name.clone(), Arc::new(update));
                if let Some(gate) = self.gate.as_mut() {
                    gate.resolve(&name);
                }
                self.check_ready();
            }
            Err(err) if err.is_resource_not_found() => {
                tracing::warn!(route = %name, error = %err, "Route configuration removed");
                self.shared.routes.remove(&name);
                self.switch_mode(ServingMode::NotServing, Some(err.to_string()));
            }
            Err(err) => {
                tracing::warn!(route = %name, error = %err, "Route watch error, keeping last good config");
            }
        }
    }

    /// Forget the current generation so no later route callback can resume serving it.
    fn drop_configuration(&mut self) {
        self.shared.filter_chains.store(None);
        self.gate = None;
        self.update_route_watches(&BTreeSet::new());
    }

    /// Serve once every route is known, and fire ready once per generation.
    fn check_ready(&mut self) {
        let Some(gate) = self.gate.as_mut() else {
            return;
        };
        let fire = gate.take_ready();
        let generation = gate.generation();
        if !gate.has_fired() {
            return;
        }

        let all_resolved = self.shared.filter_chains.load_full().is_some_and(|fcm| {
            fcm.route_config_names()
                .iter()
                .all(|name| self.shared.routes.contains_key(name.as_str()))
        });
        if all_resolved {
            self.switch_mode(ServingMode::Serving, None);
        }

        if fire {
            tracing::info!(address = %self.shared.addr, generation, "Listener ready");
            self.ready.fire(generation);
        }
    }

    /// Start watches for new names and cancel watches for names no longer required.
    fn update_route_watches(&mut self, required: &BTreeSet<String>) {
        let mut watches = self.shared.route_watches();
        if self.shared.is_closed() {
            return;
        }

        let stale: Vec<String> = watches
            .keys()
            .filter(|name| !required.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            watches.remove(&name);
            self.shared.routes.remove(&name);
            tracing::info!(route = %name, "Route watch cancelled");
        }

        for name in required {
            if watches.contains_key(name) {
                continue;
            }
            self.next_watch_id += 1;
            let id = self.next_watch_id;
            let tx = self.events_tx.clone();
            let route = name.clone();
            let handle = self.client.watch_route_config(
                name,
                Box::new(move |result| {
                    let _ = tx.send(ControlEvent::Route {
                        name: route.clone(),
                        watch_id: id,
                        result,
                    });
                }),
            );
            watches.insert(name.clone(), RouteWatch { id, _handle: handle });
            tracing::info!(route = %name, watch_id = id, "Route watch started");
        }
    }

    fn switch_mode(&self, mode: ServingMode, error: Option<String>) {
        let previous = self.shared.mode();
        if previous == ServingMode::Serving && mode == ServingMode::Serving {
            return;
        }
        self.shared.mode.store(mode.as_u8(), Ordering::SeqCst);
        metrics::record_serving(self.shared.addr, mode == ServingMode::Serving);

        match &error {
            Some(err) => tracing::warn!(address = %self.shared.addr, from = %previous, to = %mode, error = %err, "Serving mode changed"),
            None => tracing::info!(address = %self.shared.addr, from = %previous, to = %mode, "Serving mode changed"),
        }

        if let Some(callback) = &self.mode_callback {
            callback(self.shared.addr, ServingModeChange { mode, error });
        }
    }
}
