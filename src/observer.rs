//! State observer
//!
//! Collects actual state from every node through the backend drivers and
//! publishes an immutable [`ActualStateSnapshot`]. A node whose drivers
//! cannot be reached is excluded from the snapshot and recorded as
//! unreachable; the diff engine computes no changes for it this cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, warn};

use crate::driver::{ContainerDriver, StorageDriver};
use crate::error::{Error, Result};
use crate::model::{ActualStateSnapshot, NodeId, NodeState};

pub struct StateObserver {
    storage: Arc<dyn StorageDriver>,
    containers: Arc<dyn ContainerDriver>,
    current: RwLock<Arc<ActualStateSnapshot>>,
}

impl StateObserver {
    pub fn new(storage: Arc<dyn StorageDriver>, containers: Arc<dyn ContainerDriver>) -> Self {
        StateObserver {
            storage,
            containers,
            current: RwLock::new(Arc::new(ActualStateSnapshot::empty())),
        }
    }

    /// The most recent snapshot; empty until the first observation completes
    pub fn current(&self) -> Arc<ActualStateSnapshot> {
        self.current.read().expect("snapshot lock poisoned").clone()
    }

    /// Observe the given nodes and publish a fresh snapshot
    ///
    /// Fails only when no node at all could be observed; partial reachability
    /// produces a snapshot covering the reachable subset.
    pub async fn observe(&self, nodes: &BTreeSet<NodeId>) -> Result<Arc<ActualStateSnapshot>> {
        let mut observed = BTreeMap::new();
        let mut unreachable = BTreeSet::new();

        for &node in nodes {
            match self.observe_node(node).await {
                Ok(state) => {
                    observed.insert(node, state);
                }
                Err(e) => {
                    warn!(%node, error = %e, "node excluded from this cycle");
                    unreachable.insert(node);
                }
            }
        }

        if observed.is_empty() && !nodes.is_empty() {
            return Err(Error::Observation(format!(
                "none of {} node(s) could be observed",
                nodes.len()
            )));
        }

        let snapshot = Arc::new(ActualStateSnapshot {
            nodes: observed,
            unreachable,
            observed_at: Utc::now(),
        });

        debug!(
            nodes = snapshot.nodes.len(),
            unreachable = snapshot.unreachable.len(),
            "published actual state snapshot"
        );

        *self.current.write().expect("snapshot lock poisoned") = snapshot.clone();
        Ok(snapshot)
    }

    async fn observe_node(&self, node: NodeId) -> Result<NodeState> {
        let applications = self.containers.list(node).await?;
        let datasets = self.storage.list(node).await?;
        Ok(NodeState {
            applications: applications.into_iter().collect(),
            datasets: datasets.into_iter().map(|d| (d.dataset_id, d)).collect(),
        })
    }
}
