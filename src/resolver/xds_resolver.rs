//! Resolver state machine.
//!
//! # States
//! - Active: watch registered, worker consuming the mailbox
//! - Closed: watch cancelled, client released, mailbox closed
//!
//! # Transitions (per consumed envelope while Active)
//! ```text
//! Error(ResourceNotFound) → publish failing config, stop + clear current selector
//! Error(Other)            → report error, keep last good state
//! RepublishCurrent        → prune, publish from the current selector
//! Service(update)         → build selector, prune, publish, stop previous selector
//! ```
//!
//! # Design Decisions
//! - One worker task owns the cluster table and the current selector; no locks
//! - The previous selector is stopped only after the new one has been published
//! - A failed publish discards the new selector and keeps the old one

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ResolverConfig;
use crate::discovery::{DiscoveryClient, WatchError, WatchHandle};
use crate::observability::metrics;
use crate::resolver::cluster_table::ClusterRefTable;
use crate::resolver::config_selector::{ConfigSelector, SelectorError};
use crate::resolver::mailbox::{UpdateEnvelope, UpdateMailbox};
use crate::resolver::service_config::{default_encoder, ServiceConfigEncoder, EMPTY_SERVICE_CONFIG};

/// Errors surfaced by the resolver, either from `build` or through the sink.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("failed to create discovery client: {0}")]
    ClientCreation(String),

    #[error("xDS credentials specified but bootstrap has no certificate providers")]
    MissingCertificateProviders,

    #[error("failed to generate service config: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid service update: {0}")]
    InvalidUpdate(#[from] SelectorError),

    #[error("watch error: {0}")]
    Watch(#[from] WatchError),
}

/// State handed to the name-resolution sink.
#[derive(Debug, Clone)]
pub struct ResolverState {
    /// Service config JSON.
    pub service_config: String,
    /// `None` means every pick fails.
    pub config_selector: Option<Arc<ConfigSelector>>,
}

/// Name-resolution sink of the RPC framework.
pub trait ResolutionSink: Send + Sync {
    fn update_state(&self, state: ResolverState);
    fn report_error(&self, err: ResolverError);
}

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Creates the discovery client for each resolver built.
pub type ClientFactory =
    Arc<dyn Fn() -> Result<Arc<dyn DiscoveryClient>, ClientError> + Send + Sync>;

/// Dial target of a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Resource name watched on the control plane.
    pub endpoint: String,
}

impl Target {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Parse `scheme://authority/endpoint`; anything without `://` is taken verbatim.
    pub fn parse(uri: &str) -> Self {
        let endpoint = match uri.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map_or("", |(_, path)| path),
            None => uri,
        };
        Self::new(endpoint)
    }
}

/// Options passed by the channel when building a resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// The channel's transport credentials are xDS-driven.
    pub uses_xds_credentials: bool,
}

/// Builds resolvers that watch the control plane through an injected client factory.
#[derive(Clone)]
pub struct ResolverBuilder {
    factory: ClientFactory,
    config: ResolverConfig,
    encoder: ServiceConfigEncoder,
}

impl ResolverBuilder {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn DiscoveryClient>, ClientError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            config: ResolverConfig::default(),
            encoder: default_encoder(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the service config encoder.
    #[must_use]
    pub fn with_service_config_encoder(mut self, encoder: ServiceConfigEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn scheme(&self) -> &str {
        &self.config.target_scheme
    }

    /// Create a client, register the service watch and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(
        &self,
        target: Target,
        sink: Arc<dyn ResolutionSink>,
        opts: BuildOptions,
    ) -> Result<XdsResolver, ResolverError> {
        tracing::info!(endpoint = %target.endpoint, "Creating resolver");

        let client =
            (self.factory)().map_err(|e| ResolverError::ClientCreation(e.to_string()))?;

        // Fail now rather than on the first cluster that carries security config.
        if opts.uses_xds_credentials && client.bootstrap().certificate_providers.is_empty() {
            client.close();
            return Err(ResolverError::MissingCertificateProviders);
        }

        let mailbox = Arc::new(UpdateMailbox::new());
        let watch = {
            let mailbox = mailbox.clone();
            client.watch_service(
                &target.endpoint,
                Box::new(move |res| {
                    mailbox.publish(res.into());
                }),
            )
        };
        tracing::info!(endpoint = %target.endpoint, "Watch started");

        let worker = ResolverWorker::new(target.clone(), sink, mailbox.clone(), self.encoder.clone());
        let task = tokio::spawn(worker.run());

        Ok(XdsResolver {
            target,
            client,
            mailbox,
            watch: Mutex::new(Some(watch)),
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running resolver. Closes on drop.
pub struct XdsResolver {
    target: Target,
    client: Arc<dyn DiscoveryClient>,
    mailbox: Arc<UpdateMailbox>,
    watch: Mutex<Option<WatchHandle>>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl XdsResolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Updates are pushed by the control plane; there is nothing to re-resolve.
    pub fn resolve_now(&self) {}

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancel the watch, release the client and stop the worker. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(watch);
        tracing::info!(endpoint = %self.target.endpoint, "Watch cancelled");

        self.client.close();
        self.mailbox.close();
        tracing::info!(endpoint = %self.target.endpoint, "Resolver shut down");
    }

    /// Wait for the worker to exit after `close`.
    pub async fn closed(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for XdsResolver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Single consumer of the mailbox. Owns all derived resolver state.
pub(crate) struct ResolverWorker {
    target: Target,
    sink: Arc<dyn ResolutionSink>,
    mailbox: Arc<UpdateMailbox>,
    clusters: ClusterRefTable,
    current: Option<Arc<ConfigSelector>>,
    encoder: ServiceConfigEncoder,
}

impl ResolverWorker {
    pub(crate) fn new(
        target: Target,
        sink: Arc<dyn ResolutionSink>,
        mailbox: Arc<UpdateMailbox>,
        encoder: ServiceConfigEncoder,
    ) -> Self {
        Self {
            target,
            sink,
            mailbox,
            clusters: ClusterRefTable::new(),
            current: None,
            encoder,
        }
    }

    async fn run(mut self) {
        while let Some(envelope) = self.mailbox.consume().await {
            self.handle(envelope);
        }

        if let Some(current) = self.current.take() {
            current.stop();
        }
        tracing::debug!(endpoint = %self.target.endpoint, "Resolver worker exited");
    }

    pub(crate) fn handle(&mut self, envelope: UpdateEnvelope) {
        metrics::record_resolver_update(envelope.kind());

        match envelope {
            UpdateEnvelope::Error(err) if err.is_resource_not_found() => {
                tracing::warn!(endpoint = %self.target.endpoint, error = %err, "Service resource removed");
                self.publish(None);
                if let Some(current) = self.current.take() {
                    current.stop();
                }
            }
            UpdateEnvelope::Error(err) => {
                tracing::warn!(endpoint = %self.target.endpoint, error = %err, "Watch error, keeping last good config");
                self.sink.report_error(ResolverError::Watch(err));
            }
            UpdateEnvelope::RepublishCurrent => {
                let current = self.current.clone();
                self.publish(current);
            }
            UpdateEnvelope::Service(update) => {
                let selector = match ConfigSelector::build(
                    &update,
                    &mut self.clusters,
                    Arc::downgrade(&self.mailbox),
                ) {
                    Ok(selector) => selector,
                    Err(err) => {
                        tracing::warn!(endpoint = %self.target.endpoint, error = %err, "Rejected service update");
                        self.sink.report_error(err.into());
                        return;
                    }
                };

                if !self.publish(Some(selector.clone())) {
                    selector.stop();
                    return;
                }

                if let Some(previous) = self.current.replace(selector) {
                    previous.stop();
                }
            }
        }
    }

    /// Prune, encode and publish. Returns false if the config could not be generated.
    fn publish(&mut self, selector: Option<Arc<ConfigSelector>>) -> bool {
        self.clusters.prune();

        if selector.is_none() && self.clusters.is_empty() {
            metrics::record_active_clusters(0);
            self.sink.update_state(ResolverState {
                service_config: EMPTY_SERVICE_CONFIG.to_string(),
                config_selector: None,
            });
            return true;
        }

        match (self.encoder)(&self.clusters) {
            Ok(service_config) => {
                tracing::info!(
                    endpoint = %self.target.endpoint,
                    clusters = self.clusters.len(),
                    service_config = %service_config,
                    "Publishing service config"
                );
                metrics::record_active_clusters(self.clusters.len());
                self.sink.update_state(ResolverState {
                    service_config,
                    config_selector: selector,
                });
                true
            }
            Err(err) => {
                tracing::error!(endpoint = %self.target.endpoint, error = %err, "Failed to generate service config");
                metrics::record_serialization_failure();
                self.sink.report_error(ResolverError::Serialization(err));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Route, RouteAction, ServiceUpdate};
    use crate::resolver::service_config::service_config_json;

    #[derive(Default)]
    struct RecordingSink {
        states: Mutex<Vec<ResolverState>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn states(&self) -> Vec<ResolverState> {
            self.states.lock().unwrap().clone()
        }

        fn last(&self) -> ResolverState {
            self.states.lock().unwrap().last().cloned().unwrap()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl ResolutionSink for RecordingSink {
        fn update_state(&self, state: ResolverState) {
            self.states.lock().unwrap().push(state);
        }

        fn report_error(&self, err: ResolverError) {
            self.errors.lock().unwrap().push(err.to_string());
        }
    }

    fn worker_with(encoder: ServiceConfigEncoder) -> (ResolverWorker, Arc<RecordingSink>, Arc<UpdateMailbox>) {
        let sink = Arc::new(RecordingSink::default());
        let mailbox = Arc::new(UpdateMailbox::new());
        let worker = ResolverWorker::new(Target::new("svc"), sink.clone(), mailbox.clone(), encoder);
        (worker, sink, mailbox)
    }

    fn worker() -> (ResolverWorker, Arc<RecordingSink>, Arc<UpdateMailbox>) {
        worker_with(default_encoder())
    }

    fn clusters(names: &[&str]) -> UpdateEnvelope {
        let routes = names
            .iter()
            .map(|n| Route::prefix(format!("/{n}/"), RouteAction::Cluster(n.to_string())))
            .collect();
        UpdateEnvelope::Service(ServiceUpdate::new(routes))
    }

    fn table_names(worker: &ResolverWorker) -> Vec<String> {
        worker.clusters.names().map(String::from).collect()
    }

    fn drain(worker: &mut ResolverWorker, mailbox: &UpdateMailbox) {
        while let Some(envelope) = mailbox.try_take() {
            worker.handle(envelope);
        }
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("xds:///foo.example:8080").endpoint, "foo.example:8080");
        assert_eq!(Target::parse("xds://authority/svc").endpoint, "svc");
        assert_eq!(Target::parse("plain-name").endpoint, "plain-name");
    }

    #[test]
    fn test_service_update_publishes_selector() {
        let (mut worker, sink, _mailbox) = worker();
        worker.handle(clusters(&["a", "b"]));

        let state = sink.last();
        let selector = state.config_selector.unwrap();
        assert_eq!(selector.pick("/a/Get"), Some("a"));
        assert!(state.service_config.contains("cluster:a"));
        assert!(state.service_config.contains("cluster:b"));
        assert_eq!(worker.clusters.ref_count("a"), Some(1));
    }

    #[test]
    fn test_swap_prunes_released_clusters() {
        let (mut worker, sink, mailbox) = worker();
        worker.handle(clusters(&["A", "B"]));
        let first = sink.last().config_selector.unwrap();

        worker.handle(clusters(&["B", "C"]));
        assert!(first.is_stopped());
        assert_eq!(worker.clusters.ref_count("A"), Some(0));
        // A was still referenced by the old selector when the new config was published.
        assert!(sink.last().service_config.contains("cluster:A"));

        drain(&mut worker, &mailbox);
        assert_eq!(table_names(&worker), vec!["B", "C"]);
        assert!(!sink.last().service_config.contains("cluster:A"));
        assert_eq!(worker.clusters.ref_count("B"), Some(1));
    }

    #[test]
    fn test_leased_selector_keeps_cluster_until_release() {
        let (mut worker, sink, mailbox) = worker();
        worker.handle(clusters(&["A"]));
        let lease = sink.last().config_selector.unwrap().retain().unwrap();

        worker.handle(clusters(&["B"]));
        assert!(mailbox.try_take().is_none());
        assert_eq!(worker.clusters.ref_count("A"), Some(1));
        assert_eq!(lease.pick("/A/Get"), Some("A"));

        drop(lease);
        drain(&mut worker, &mailbox);
        assert_eq!(table_names(&worker), vec!["B"]);
    }

    #[test]
    fn test_release_does_not_drop_pending_update() {
        let (mut worker, sink, mailbox) = worker();
        worker.handle(clusters(&["A"]));
        let lease = sink.last().config_selector.unwrap().retain().unwrap();
        worker.handle(clusters(&["B"]));

        assert!(mailbox.publish(clusters(&["C"])));
        drop(lease);
        drain(&mut worker, &mailbox);

        let selector = sink.last().config_selector.unwrap();
        assert_eq!(selector.pick("/C/Get"), Some("C"));
        assert_eq!(selector.pick("/B/Get"), None);
        assert_eq!(table_names(&worker), vec!["C"]);
    }

    #[test]
    fn test_resource_not_found_degrades() {
        let (mut worker, sink, mailbox) = worker();
        worker.handle(clusters(&["X"]));
        let selector = sink.last().config_selector.unwrap();

        worker.handle(UpdateEnvelope::Error(WatchError::resource_not_found("lds gone")));
        let state = sink.last();
        assert!(state.config_selector.is_none());
        assert!(selector.is_stopped());
        assert_eq!(selector.external_refs(), 0);
        assert_eq!(worker.clusters.ref_count("X"), Some(0));
        assert!(worker.current.is_none());

        drain(&mut worker, &mailbox);
        let state = sink.last();
        assert_eq!(state.service_config, EMPTY_SERVICE_CONFIG);
        assert!(state.config_selector.is_none());
        assert!(worker.clusters.is_empty());
    }

    #[test]
    fn test_other_error_keeps_state() {
        let (mut worker, sink, _mailbox) = worker();
        worker.handle(clusters(&["X"]));
        let published = sink.states().len();

        worker.handle(UpdateEnvelope::Error(WatchError::other("stream reset")));
        assert_eq!(sink.states().len(), published);
        assert_eq!(sink.errors().len(), 1);
        assert!(sink.errors()[0].contains("stream reset"));
        assert!(worker.current.is_some());
        assert_eq!(worker.clusters.ref_count("X"), Some(1));
    }

    #[test]
    fn test_republish_is_idempotent() {
        let (mut worker, sink, _mailbox) = worker();
        worker.handle(clusters(&["a", "b"]));

        worker.handle(UpdateEnvelope::RepublishCurrent);
        worker.handle(UpdateEnvelope::RepublishCurrent);

        let states = sink.states();
        let (x, y) = (&states[states.len() - 2], &states[states.len() - 1]);
        assert_eq!(x.service_config, y.service_config);
        assert!(Arc::ptr_eq(
            x.config_selector.as_ref().unwrap(),
            y.config_selector.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_republish_without_selector_sends_empty_config() {
        let (mut worker, sink, _mailbox) = worker();
        worker.handle(UpdateEnvelope::RepublishCurrent);
        assert_eq!(sink.last().service_config, EMPTY_SERVICE_CONFIG);
    }

    #[test]
    fn test_serialization_failure_keeps_old_selector() {
        let encoder: ServiceConfigEncoder = Arc::new(|table: &ClusterRefTable| {
            if table.names().any(|n| n == "bad") {
                Err(<serde_json::Error as serde::ser::Error>::custom("unencodable cluster"))
            } else {
                service_config_json(table)
            }
        });
        let (mut worker, sink, mailbox) = worker_with(encoder);

        worker.handle(clusters(&["good"]));
        let good = sink.last().config_selector.unwrap();
        let published = sink.states().len();

        worker.handle(clusters(&["bad"]));
        assert_eq!(sink.states().len(), published);
        assert!(sink.errors()[0].contains("unencodable cluster"));
        assert!(!good.is_stopped());
        assert!(Arc::ptr_eq(worker.current.as_ref().unwrap(), &good));
        assert_eq!(worker.clusters.ref_count("bad"), Some(0));

        drain(&mut worker, &mailbox);
        assert_eq!(table_names(&worker), vec!["good"]);
        assert!(Arc::ptr_eq(sink.last().config_selector.as_ref().unwrap(), &good));
    }

    #[test]
    fn test_invalid_update_reported() {
        let (mut worker, sink, _mailbox) = worker();
        worker.handle(UpdateEnvelope::Service(ServiceUpdate::new(vec![Route::prefix(
            "/",
            RouteAction::NonForwarding,
        )])));
        assert!(sink.states().is_empty());
        assert_eq!(sink.errors().len(), 1);
        assert!(worker.clusters.is_empty());
    }
}
