//! Immutable per-generation route → cluster selector.
//!
//! # Responsibilities
//! - Map an RPC method to a cluster using the routes of one service update
//! - Hold one reference on every cluster it can pick
//! - Release those references once the resolver and every RPC lease let go
//!
//! # Design Decisions
//! - Never mutated after construction; a swap installs a new selector
//! - External count starts at one, the resolver's own hold, dropped by `stop()`
//! - No handle back into the resolver; a drained cluster is reported by posting
//!   a republish marker to the mailbox, unless an update is already pending

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use rand::Rng;
use thiserror::Error;

use crate::discovery::{Route, RouteAction, ServiceUpdate};
use crate::resolver::cluster_table::{ClusterRef, ClusterRefTable};
use crate::resolver::mailbox::UpdateMailbox;

/// A service update that cannot be turned into a selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("route {index}: non-forwarding action is not valid for clients")]
    NonForwarding { index: usize },

    #[error("route {index}: weighted clusters have no positive weight")]
    ZeroWeight { index: usize },

    #[error("route {index}: empty cluster name")]
    EmptyCluster { index: usize },
}

#[derive(Debug)]
enum Target {
    Single(String),
    Weighted { clusters: Vec<(String, u32)>, total: u64 },
}

impl Target {
    fn from_action(index: usize, action: &RouteAction) -> Result<Self, SelectorError> {
        match action {
            RouteAction::Cluster(name) if name.is_empty() => Err(SelectorError::EmptyCluster { index }),
            RouteAction::Cluster(name) => Ok(Target::Single(name.clone())),
            RouteAction::WeightedClusters(list) => {
                if list.iter().any(|wc| wc.name.is_empty()) {
                    return Err(SelectorError::EmptyCluster { index });
                }
                let clusters: Vec<(String, u32)> = list
                    .iter()
                    .filter(|wc| wc.weight > 0)
                    .map(|wc| (wc.name.clone(), wc.weight))
                    .collect();
                let total: u64 = clusters.iter().map(|(_, w)| u64::from(*w)).sum();
                if total == 0 {
                    return Err(SelectorError::ZeroWeight { index });
                }
                Ok(Target::Weighted { clusters, total })
            }
            RouteAction::NonForwarding => Err(SelectorError::NonForwarding { index }),
        }
    }

    fn names(&self) -> Vec<&str> {
        match self {
            Target::Single(name) => vec![name.as_str()],
            Target::Weighted { clusters, .. } => clusters.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }

    fn choose(&self) -> &str {
        match self {
            Target::Single(name) => name,
            Target::Weighted { clusters, total } => {
                let mut point = rand::thread_rng().gen_range(0..*total);
                for (name, weight) in clusters {
                    let weight = u64::from(*weight);
                    if point < weight {
                        return name;
                    }
                    point -= weight;
                }
                // Unreachable while total is the sum of weights.
                &clusters[clusters.len() - 1].0
            }
        }
    }
}

#[derive(Debug)]
struct SelectorRoute {
    route: Route,
    target: Target,
}

/// Route → cluster snapshot built from one service update.
pub struct ConfigSelector {
    routes: Vec<SelectorRoute>,
    clusters: Vec<Arc<ClusterRef>>,
    refs: AtomicUsize,
    stopped: AtomicBool,
    mailbox: Weak<UpdateMailbox>,
}

impl ConfigSelector {
    /// Build a selector and take one reference on each distinct cluster it targets.
    ///
    /// Nothing is acquired if the update is rejected.
    pub fn build(
        update: &ServiceUpdate,
        table: &mut ClusterRefTable,
        mailbox: Weak<UpdateMailbox>,
    ) -> Result<Arc<Self>, SelectorError> {
        let routes = update
            .virtual_host
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| {
                Ok(SelectorRoute {
                    route: route.clone(),
                    target: Target::from_action(index, &route.action)?,
                })
            })
            .collect::<Result<Vec<_>, SelectorError>>()?;

        let names: BTreeSet<&str> = routes.iter().flat_map(|r| r.target.names()).collect();
        let clusters = names.into_iter().map(|name| table.acquire(name)).collect();

        Ok(Arc::new(Self {
            routes,
            clusters,
            refs: AtomicUsize::new(1),
            stopped: AtomicBool::new(false),
            mailbox,
        }))
    }

    /// Pick the cluster for a full method name. First matching route wins.
    pub fn pick(&self, method: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.route.matches(method))
            .map(|r| r.target.choose())
    }

    /// Take an RPC lease on this selector.
    ///
    /// Returns `None` if the selector has already been fully released.
    pub fn retain(self: &Arc<Self>) -> Option<SelectorLease> {
        self.refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .ok()
            .map(|_| SelectorLease {
                selector: self.clone(),
            })
    }

    /// Drop the resolver's hold. Only the first call has an effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::warn!("Config selector stopped more than once");
            return;
        }
        self.release();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Current holders: the resolver (until stopped) plus outstanding leases.
    pub fn external_refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Clusters referenced by this selector, sorted.
    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.name()).collect()
    }

    fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev != 1 {
            return;
        }

        let mut drained = false;
        for cluster in &self.clusters {
            if cluster.release() {
                drained = true;
            }
        }

        if drained {
            if let Some(mailbox) = self.mailbox.upgrade() {
                mailbox.nudge();
            }
        }
    }
}

impl fmt::Debug for ConfigSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSelector")
            .field("routes", &self.routes.len())
            .field("clusters", &self.cluster_names())
            .field("refs", &self.external_refs())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// RPC lease on a selector. Released on drop.
#[derive(Debug)]
pub struct SelectorLease {
    selector: Arc<ConfigSelector>,
}

impl Deref for SelectorLease {
    type Target = ConfigSelector;
    fn deref(&self) -> &Self::Target {
        &self.selector
    }
}

impl Drop for SelectorLease {
    fn drop(&mut self) {
        self.selector.release();
    }
}
