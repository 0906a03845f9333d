//! End-to-end resolver tests against the in-memory discovery client.

use std::sync::Arc;

use xds_core::config::ResolverConfig;
use xds_core::discovery::{
    BootstrapInfo, DiscoveryClient, InMemoryDiscoveryClient, ResourceKind, Route, RouteAction,
    ServiceUpdate, WatchError, WeightedCluster,
};
use xds_core::resolver::{
    BuildOptions, ResolverBuilder, ResolverError, Target, XdsResolver, EMPTY_SERVICE_CONFIG,
};

mod common;
use common::{RecordingSink, SinkEvents};

const TARGET: &str = "xds:///foo.example.com:8080";
const SERVICE: &str = "foo.example.com:8080";

fn builder_for(client: &Arc<InMemoryDiscoveryClient>) -> ResolverBuilder {
    let client = client.clone();
    ResolverBuilder::new(move || Ok(client.clone() as Arc<dyn DiscoveryClient>))
}

fn start(client: &Arc<InMemoryDiscoveryClient>) -> (XdsResolver, SinkEvents) {
    let (sink, events) = RecordingSink::new();
    let resolver = builder_for(client)
        .build(Target::parse(TARGET), sink, BuildOptions::default())
        .unwrap();
    (resolver, events)
}

fn routes_to(clusters: &[&str]) -> ServiceUpdate {
    ServiceUpdate::new(
        clusters
            .iter()
            .map(|c| Route::prefix(format!("/{c}/"), RouteAction::Cluster(c.to_string())))
            .collect(),
    )
}

fn has_cluster(config: &str, name: &str) -> bool {
    config.contains(&format!("\"cluster:{name}\""))
}

#[tokio::test]
async fn test_build_watches_target_endpoint() {
    let client = InMemoryDiscoveryClient::new();
    let (resolver, _events) = start(&client);

    assert_eq!(resolver.target().endpoint, SERVICE);
    assert_eq!(client.watched(ResourceKind::Service), vec![SERVICE]);
    resolver.resolve_now();
}

#[tokio::test]
async fn test_scheme_comes_from_config() {
    let client = InMemoryDiscoveryClient::new();
    let builder = builder_for(&client);
    assert_eq!(builder.scheme(), "xds");

    let builder = builder.with_config(ResolverConfig {
        target_scheme: "xds-experimental".into(),
    });
    assert_eq!(builder.scheme(), "xds-experimental");
}

#[tokio::test]
async fn test_client_creation_failure() {
    let builder = ResolverBuilder::new(|| Err("no bootstrap file".into()));
    let (sink, _events) = RecordingSink::new();

    let err = builder
        .build(Target::parse(TARGET), sink, BuildOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, ResolverError::ClientCreation(ref m) if m.contains("no bootstrap file")));
}

#[tokio::test]
async fn test_xds_credentials_require_certificate_providers() {
    let client = InMemoryDiscoveryClient::new();
    let (sink, _events) = RecordingSink::new();
    let opts = BuildOptions {
        uses_xds_credentials: true,
    };

    let err = builder_for(&client)
        .build(Target::parse(TARGET), sink.clone(), opts)
        .err()
        .unwrap();
    assert!(matches!(err, ResolverError::MissingCertificateProviders));
    assert!(client.is_closed());
    assert!(client.watched(ResourceKind::Service).is_empty());

    let client = InMemoryDiscoveryClient::with_bootstrap(BootstrapInfo {
        certificate_providers: vec!["default".into()],
    });
    let resolver = builder_for(&client).build(Target::parse(TARGET), sink, opts);
    assert!(resolver.is_ok());
}

#[tokio::test]
async fn test_service_update_publishes_routable_config() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    assert_eq!(client.push_service(SERVICE, Ok(routes_to(&["a", "b"]))), 1);
    let state = events.next_state().await;

    assert!(has_cluster(&state.service_config, "a"));
    assert!(has_cluster(&state.service_config, "b"));
    let selector = state.config_selector.unwrap();
    assert_eq!(selector.pick("/a/Get"), Some("a"));
    assert_eq!(selector.pick("/b/Get"), Some("b"));
    assert_eq!(selector.pick("/c/Get"), None);
}

#[tokio::test]
async fn test_replaced_clusters_are_pruned() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    client.push_service(SERVICE, Ok(routes_to(&["A", "B"])));
    let first = events.next_state().await.config_selector.unwrap();

    client.push_service(SERVICE, Ok(routes_to(&["B", "C"])));
    let swapped = events.next_state().await;
    assert!(has_cluster(&swapped.service_config, "A"));
    assert!(has_cluster(&swapped.service_config, "C"));
    assert!(first.is_stopped());

    let pruned = events.next_state().await;
    assert!(!has_cluster(&pruned.service_config, "A"));
    assert!(has_cluster(&pruned.service_config, "B"));
    assert!(has_cluster(&pruned.service_config, "C"));
    assert!(Arc::ptr_eq(
        swapped.config_selector.as_ref().unwrap(),
        pruned.config_selector.as_ref().unwrap()
    ));
}

#[tokio::test]
async fn test_in_flight_rpc_keeps_cluster_alive() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    client.push_service(SERVICE, Ok(routes_to(&["old"])));
    let lease = events
        .next_state()
        .await
        .config_selector
        .unwrap()
        .retain()
        .unwrap();

    client.push_service(SERVICE, Ok(routes_to(&["new"])));
    let swapped = events.next_state().await;
    assert!(has_cluster(&swapped.service_config, "old"));
    common::assert_pending(events.states.recv(), "republish while RPC in flight").await;

    assert_eq!(lease.pick("/old/Get"), Some("old"));
    drop(lease);

    let pruned = events.next_state().await;
    assert!(!has_cluster(&pruned.service_config, "old"));
    assert!(has_cluster(&pruned.service_config, "new"));
}

#[tokio::test]
async fn test_resource_not_found_fails_calls() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    client.push_service(SERVICE, Ok(routes_to(&["X"])));
    let selector = events.next_state().await.config_selector.unwrap();

    client.push_service(SERVICE, Err(WatchError::resource_not_found("listener removed")));
    let failing = events.next_state().await;
    assert!(failing.config_selector.is_none());
    assert!(selector.is_stopped());

    let empty = events.next_state().await;
    assert_eq!(empty.service_config, EMPTY_SERVICE_CONFIG);
    assert!(empty.config_selector.is_none());
}

#[tokio::test]
async fn test_other_errors_keep_last_good_config() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    client.push_service(SERVICE, Ok(routes_to(&["X"])));
    let selector = events.next_state().await.config_selector.unwrap();

    client.push_service(SERVICE, Err(WatchError::other("ads stream reset")));
    let err = events.next_error().await;
    assert!(matches!(err, ResolverError::Watch(ref e) if !e.is_resource_not_found()));
    assert!(!selector.is_stopped());
    common::assert_pending(events.states.recv(), "state published on transient error").await;
}

#[tokio::test]
async fn test_invalid_update_is_reported() {
    let client = InMemoryDiscoveryClient::new();
    let (_resolver, mut events) = start(&client);

    let update = ServiceUpdate::new(vec![Route::prefix(
        "/",
        RouteAction::WeightedClusters(vec![WeightedCluster::new("a", 0)]),
    )]);
    client.push_service(SERVICE, Ok(update));

    assert!(matches!(events.next_error().await, ResolverError::InvalidUpdate(_)));
}

#[tokio::test]
async fn test_close_cancels_watch_and_releases_client() {
    let client = InMemoryDiscoveryClient::new();
    let (resolver, mut events) = start(&client);

    client.push_service(SERVICE, Ok(routes_to(&["X"])));
    let selector = events.next_state().await.config_selector.unwrap();

    resolver.close();
    resolver.close();
    common::within(resolver.closed()).await;

    assert!(resolver.is_closed());
    assert!(client.is_closed());
    assert!(client.watched(ResourceKind::Service).is_empty());
    assert_eq!(client.push_service(SERVICE, Ok(routes_to(&["Y"]))), 0);
    assert!(selector.is_stopped());
}
