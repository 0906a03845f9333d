//! Client-side xDS name resolver.
//!
//! # Data Flow
//! ```text
//! DiscoveryClient service watch
//!     → mailbox.rs (capacity-one slot, newest envelope wins)
//!     → xds_resolver.rs worker (single consumer)
//!         → config_selector.rs (validate routes, acquire clusters)
//!         → cluster_table.rs (prune drained clusters)
//!         → service_config.rs (encode active clusters)
//!     → ResolutionSink::update_state / report_error
//!
//! Cluster release:
//!     last SelectorLease dropped
//!     → cluster refs reach zero
//!     → RepublishCurrent posted to the mailbox
//! ```
//!
//! # Design Decisions
//! - Selectors hold a weak mailbox handle, never the resolver itself
//! - Clusters stay in the service config until no selector or RPC references them
//! - Only the newest unread update is kept; intermediate updates are skipped

pub mod cluster_table;
pub mod config_selector;
pub mod mailbox;
pub mod service_config;
pub mod xds_resolver;

pub use cluster_table::{ClusterRef, ClusterRefTable};
pub use config_selector::{ConfigSelector, SelectorError, SelectorLease};
pub use mailbox::{UpdateEnvelope, UpdateMailbox};
pub use service_config::{service_config_json, ServiceConfigEncoder, EMPTY_SERVICE_CONFIG};
pub use xds_resolver::{
    BuildOptions, ClientError, ClientFactory, ResolutionSink, ResolverBuilder, ResolverError,
    ResolverState, Target, XdsResolver,
};
