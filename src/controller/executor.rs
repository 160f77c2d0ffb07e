//! Change executor
//!
//! Applies a diffed batch against the backend drivers. Changes that share a
//! serialization key (same dataset, or same node+application) run strictly in
//! diff order; independent changes run concurrently. Every change
//! re-validates its precondition against live state immediately before
//! acting, because real time has passed since the snapshot was taken.
//!
//! A change's failure is recorded, never propagated: the next cycle's diff
//! re-derives whatever is still missing. Eventual convergence, not
//! exactly-once transactions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::driver::{ContainerDriver, DriverError, DriverResult, StorageDriver};
use crate::error::Error;
use crate::model::{DatasetId, NodeId};

use super::diff::Change;

/// Per-change result of an apply pass
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Succeeded,
    /// Backend failure or timeout; the next cycle retries via re-diff
    Failed(String),
    /// Precondition no longer held; nothing was done
    Skipped(String),
}

#[derive(Clone, Debug)]
pub struct ChangeOutcome {
    pub change: Change,
    pub outcome: Outcome,
}

pub struct ChangeExecutor {
    storage: Arc<dyn StorageDriver>,
    containers: Arc<dyn ContainerDriver>,
    /// Bound on each individual backend call
    call_timeout: Duration,
}

impl ChangeExecutor {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        containers: Arc<dyn ContainerDriver>,
        call_timeout: Duration,
    ) -> Self {
        ChangeExecutor {
            storage,
            containers,
            call_timeout,
        }
    }

    /// Apply a batch, returning one outcome per change in the batch's order
    pub async fn apply(&self, changes: Vec<Change>) -> Vec<ChangeOutcome> {
        // Partition into serialization groups, keeping diff order inside
        // each group.
        let mut groups: Vec<Vec<(usize, Change)>> = Vec::new();
        let mut slots: HashMap<String, usize> = HashMap::new();
        for (index, change) in changes.into_iter().enumerate() {
            let slot = *slots.entry(change.serialization_key()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push((index, change));
        }

        let group_runs = groups.into_iter().map(|group| async move {
            let mut outcomes = Vec::with_capacity(group.len());
            for (index, change) in group {
                let outcome = self.apply_one(&change).await;
                match &outcome {
                    Outcome::Succeeded => debug!(change = %change, "change applied"),
                    Outcome::Skipped(reason) => {
                        debug!(change = %change, reason, "change skipped")
                    }
                    Outcome::Failed(reason) => {
                        warn!(change = %change, reason, "change failed, will retry next cycle")
                    }
                }
                outcomes.push((index, ChangeOutcome { change, outcome }));
            }
            outcomes
        });

        let mut all: Vec<(usize, ChangeOutcome)> =
            join_all(group_runs).await.into_iter().flatten().collect();
        all.sort_by_key(|(index, _)| *index);
        all.into_iter().map(|(_, outcome)| outcome).collect()
    }

    async fn apply_one(&self, change: &Change) -> Outcome {
        // Re-validate against current real state; the snapshot this change
        // was derived from may be stale.
        match self.precondition(change).await {
            Ok(()) => {}
            Err(Error::Precondition(reason)) => return Outcome::Skipped(reason),
            Err(e) => return Outcome::Failed(format!("precondition check failed: {}", e)),
        }

        let result = match change {
            Change::CreateDataset {
                dataset_id,
                node,
                maximum_size,
                metadata,
            } => {
                self.bounded(
                    "create",
                    self.storage
                        .create(*dataset_id, *node, *maximum_size, metadata.clone()),
                )
                .await
            }
            Change::DeleteDataset { dataset_id, node } => {
                self.bounded("destroy", self.storage.destroy(*dataset_id, *node))
                    .await
            }
            Change::MoveDataset { dataset_id, from, to } => {
                self.move_dataset(*dataset_id, *from, *to).await
            }
            Change::ResizeDataset {
                dataset_id,
                node,
                maximum_size,
            } => {
                self.bounded(
                    "resize",
                    self.storage.resize(*dataset_id, *node, *maximum_size),
                )
                .await
            }
            Change::SetDatasetMetadata {
                dataset_id,
                node,
                metadata,
            } => {
                self.bounded(
                    "set_metadata",
                    self.storage.set_metadata(*dataset_id, *node, metadata.clone()),
                )
                .await
            }
            Change::CreateContainer { node, application } => {
                self.bounded("create container", self.containers.create(*node, application))
                    .await
            }
            Change::StopContainer { node, name } => {
                self.bounded("stop container", self.containers.stop(*node, name))
                    .await
            }
        };

        match result {
            Ok(()) => Outcome::Succeeded,
            Err(DriverError::AlreadyConverged) => {
                Outcome::Skipped("already in desired state".to_string())
            }
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    /// The move sub-protocol: record the handoff, transfer data, attach on
    /// the destination. The origin stays authoritative until attach succeeds;
    /// a failure at either step leaves the data consistent where it was and
    /// the unchanged desired/actual mismatch retries the move next cycle.
    async fn move_dataset(&self, dataset_id: DatasetId, from: NodeId, to: NodeId) -> DriverResult<()> {
        info!(%dataset_id, %from, %to, "dataset handoff in progress");
        self.bounded("transfer", self.storage.transfer(dataset_id, from, to))
            .await?;
        self.bounded("attach", self.storage.attach(dataset_id, to))
            .await?;
        Ok(())
    }

    /// Check whether `change` still applies
    ///
    /// `Error::Precondition` means the change is stale and should be skipped;
    /// any other error means the check itself could not run.
    async fn precondition(&self, change: &Change) -> crate::Result<()> {
        match change {
            Change::CreateDataset { dataset_id, node, .. } => {
                let attached = self.bounded("list", self.storage.list(*node)).await?;
                if attached.iter().any(|d| d.dataset_id == *dataset_id) {
                    return Err(Error::Precondition(format!(
                        "dataset {} already present",
                        dataset_id
                    )));
                }
            }
            Change::DeleteDataset { dataset_id, node } => {
                let attached = self.bounded("list", self.storage.list(*node)).await?;
                if !attached.iter().any(|d| d.dataset_id == *dataset_id) {
                    return Err(Error::Precondition(format!(
                        "dataset {} already absent",
                        dataset_id
                    )));
                }
            }
            Change::MoveDataset { dataset_id, from, to } => {
                let destination = self.bounded("list", self.storage.list(*to)).await?;
                if destination.iter().any(|d| d.dataset_id == *dataset_id) {
                    return Err(Error::Precondition(format!(
                        "dataset {} already attached on destination",
                        dataset_id
                    )));
                }
                let origin = self.bounded("list", self.storage.list(*from)).await?;
                if !origin.iter().any(|d| d.dataset_id == *dataset_id) {
                    return Err(Error::Precondition(format!(
                        "dataset {} no longer attached on origin",
                        dataset_id
                    )));
                }
            }
            Change::ResizeDataset {
                dataset_id,
                node,
                maximum_size,
            } => {
                let attached = self.bounded("list", self.storage.list(*node)).await?;
                match attached.iter().find(|d| d.dataset_id == *dataset_id) {
                    None => {
                        return Err(Error::Precondition(format!(
                            "dataset {} not attached here",
                            dataset_id
                        )))
                    }
                    Some(d) if d.maximum_size == *maximum_size => {
                        return Err(Error::Precondition("size already matches".to_string()))
                    }
                    Some(_) => {}
                }
            }
            Change::SetDatasetMetadata {
                dataset_id,
                node,
                metadata,
            } => {
                let attached = self.bounded("list", self.storage.list(*node)).await?;
                match attached.iter().find(|d| d.dataset_id == *dataset_id) {
                    None => {
                        return Err(Error::Precondition(format!(
                            "dataset {} not attached here",
                            dataset_id
                        )))
                    }
                    Some(d) if d.metadata == *metadata => {
                        return Err(Error::Precondition(
                            "metadata already matches".to_string(),
                        ))
                    }
                    Some(_) => {}
                }
            }
            Change::CreateContainer { node, application } => {
                let running = self.bounded("list", self.containers.list(*node)).await?;
                if running.iter().any(|a| a.converges_with(application)) {
                    return Err(Error::Precondition(format!(
                        "{} already running",
                        application.name
                    )));
                }
                let attached = self.bounded("list", self.storage.list(*node)).await?;
                for dependency in application.dataset_dependencies() {
                    if !attached.iter().any(|d| d.dataset_id == dependency) {
                        return Err(Error::Precondition(format!(
                            "dataset {} not yet present on node",
                            dependency
                        )));
                    }
                }
            }
            Change::StopContainer { node, name } => {
                let running = self.bounded("list", self.containers.list(*node)).await?;
                if !running.iter().any(|a| a.name == *name) {
                    return Err(Error::Precondition(format!("{} not running", name)));
                }
            }
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = DriverResult<T>>,
    ) -> DriverResult<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Backend(format!(
                "{} timed out after {:?}",
                what, self.call_timeout
            ))),
        }
    }
}
