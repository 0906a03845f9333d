//! Service config generation.
//!
//! Produces the cluster-manager load-balancing config for the set of active clusters:
//!
//! ```text
//! {"loadBalancingConfig":[{"xds_cluster_manager_experimental":{"children":{
//!     "cluster:A":{"childPolicy":[{"cds_experimental":{"cluster":"A"}}]}}}}]}
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::resolver::cluster_table::ClusterRefTable;

/// Config published when nothing is routable: pick-first with no addresses.
pub const EMPTY_SERVICE_CONFIG: &str = "{}";

/// Prefix of child policy names in the cluster manager config.
pub const CLUSTER_PREFIX: &str = "cluster:";

/// Encodes the active cluster set into a service config string.
pub type ServiceConfigEncoder =
    Arc<dyn Fn(&ClusterRefTable) -> Result<String, serde_json::Error> + Send + Sync>;

#[derive(Serialize)]
struct ServiceConfig<'a> {
    #[serde(rename = "loadBalancingConfig")]
    load_balancing_config: [BalancerConfig<'a>; 1],
}

#[derive(Serialize)]
struct BalancerConfig<'a> {
    xds_cluster_manager_experimental: ClusterManagerConfig<'a>,
}

#[derive(Serialize)]
struct ClusterManagerConfig<'a> {
    children: BTreeMap<String, ChildConfig<'a>>,
}

#[derive(Serialize)]
struct ChildConfig<'a> {
    #[serde(rename = "childPolicy")]
    child_policy: [CdsBalancer<'a>; 1],
}

#[derive(Serialize)]
struct CdsBalancer<'a> {
    cds_experimental: CdsConfig<'a>,
}

#[derive(Serialize)]
struct CdsConfig<'a> {
    cluster: &'a str,
}

/// Serialize the cluster manager config for every cluster in `table`.
pub fn service_config_json(table: &ClusterRefTable) -> Result<String, serde_json::Error> {
    let children = table
        .names()
        .map(|name| {
            (
                format!("{CLUSTER_PREFIX}{name}"),
                ChildConfig {
                    child_policy: [CdsBalancer {
                        cds_experimental: CdsConfig { cluster: name },
                    }],
                },
            )
        })
        .collect();

    serde_json::to_string(&ServiceConfig {
        load_balancing_config: [BalancerConfig {
            xds_cluster_manager_experimental: ClusterManagerConfig { children },
        }],
    })
}

pub(crate) fn default_encoder() -> ServiceConfigEncoder {
    Arc::new(service_config_json)
}
