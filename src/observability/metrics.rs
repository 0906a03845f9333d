//! Metrics collection.
//!
//! # Metrics
//! - `xds_resolver_updates_total` (counter): consumed envelopes by kind
//! - `xds_resolver_serialization_failures_total` (counter)
//! - `xds_resolver_active_clusters` (gauge): clusters in the last published config
//! - `xds_listener_connections_total` (counter): accepted connections by outcome
//! - `xds_listener_accept_backoff_total` (counter): backoff waits after temporary errors
//! - `xds_listener_serving` (gauge): 1=serving, 0=not serving, per listener address

use std::net::SocketAddr;

pub fn record_resolver_update(kind: &'static str) {
    metrics::counter!("xds_resolver_updates_total", "kind" => kind).increment(1);
}

pub fn record_serialization_failure() {
    metrics::counter!("xds_resolver_serialization_failures_total").increment(1);
}

pub fn record_active_clusters(count: usize) {
    metrics::gauge!("xds_resolver_active_clusters").set(count as f64);
}

pub fn record_connection(outcome: &'static str) {
    metrics::counter!("xds_listener_connections_total", "outcome" => outcome).increment(1);
}

pub fn record_accept_backoff() {
    metrics::counter!("xds_listener_accept_backoff_total").increment(1);
}

pub fn record_serving(addr: SocketAddr, serving: bool) {
    metrics::gauge!("xds_listener_serving", "address" => addr.to_string())
        .set(if serving { 1.0 } else { 0.0 });
}
