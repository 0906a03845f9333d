//! Cluster reference table.
//!
//! # Responsibilities
//! - Map cluster name to the number of live config selectors referencing it
//! - Prune entries whose count dropped to zero before each publish
//!
//! # Design Decisions
//! - The map is owned by the resolver worker; only the counters are shared
//! - Counters are atomic because a selector's final release may run on an RPC thread

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A single cluster and its reference count.
#[derive(Debug)]
pub struct ClusterRef {
    name: String,
    refs: AtomicUsize,
}

impl ClusterRef {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference. Returns true if this release brought the count to zero.
    pub(crate) fn release(&self) -> bool {
        match self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(prev) => prev == 1,
            Err(_) => {
                tracing::error!(cluster = %self.name, "Cluster released with no references held");
                false
            }
        }
    }
}

/// Active clusters of one resolver, keyed by name.
#[derive(Debug, Default)]
pub struct ClusterRefTable {
    clusters: BTreeMap<String, Arc<ClusterRef>>,
}

impl ClusterRefTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one reference on `name`, creating the entry on first use.
    pub fn acquire(&mut self, name: &str) -> Arc<ClusterRef> {
        let cluster = self
            .clusters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ClusterRef::new(name)))
            .clone();
        cluster.acquire();
        cluster
    }

    /// Remove clusters with no remaining references. Returns the removed names.
    pub fn prune(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .clusters
            .iter()
            .filter(|(_, c)| c.ref_count() == 0)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &dead {
            self.clusters.remove(name);
        }
        if !dead.is_empty() {
            tracing::debug!(clusters = ?dead, "Pruned unreferenced clusters");
        }
        dead
    }

    /// Reference count of `name`, if present.
    pub fn ref_count(&self, name: &str) -> Option<usize> {
        self.clusters.get(name).map(|c| c.ref_count())
    }

    /// Cluster names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}
