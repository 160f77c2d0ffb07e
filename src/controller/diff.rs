//! Diff engine
//!
//! Compares an observed cluster snapshot against the desired configuration
//! and produces the ordered list of corrective [`Change`]s. The computation
//! is purely local: it never talks to a backend and never fails. Conditions
//! that cannot converge yet (a container waiting for its dataset, a dataset
//! that may live on an unobserved node) are deferred to a later cycle, not
//! errors.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::model::{
    ActualStateSnapshot, Application, DatasetId, DesiredConfiguration, NodeId,
};

/// An atomic, independently applicable unit of corrective action
///
/// Each variant carries everything needed to re-validate its precondition
/// against live state and to apply it, with no reference back to the snapshot
/// it was derived from.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    CreateDataset {
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
        metadata: BTreeMap<String, String>,
    },
    DeleteDataset {
        dataset_id: DatasetId,
        node: NodeId,
    },
    /// A move is one logical change, not delete+create, so the executor can
    /// use an in-place backend move where supported.
    MoveDataset {
        dataset_id: DatasetId,
        from: NodeId,
        to: NodeId,
    },
    ResizeDataset {
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
    },
    /// Metadata bookkeeping only; never touches volume data
    SetDatasetMetadata {
        dataset_id: DatasetId,
        node: NodeId,
        metadata: BTreeMap<String, String>,
    },
    CreateContainer {
        node: NodeId,
        application: Application,
    },
    StopContainer {
        node: NodeId,
        name: String,
    },
}

impl Change {
    /// Changes with the same key are strictly serialized relative to each
    /// other; changes with different keys may run concurrently.
    pub fn serialization_key(&self) -> String {
        match self {
            Change::CreateDataset { dataset_id, .. }
            | Change::DeleteDataset { dataset_id, .. }
            | Change::MoveDataset { dataset_id, .. }
            | Change::ResizeDataset { dataset_id, .. }
            | Change::SetDatasetMetadata { dataset_id, .. } => {
                format!("dataset:{}", dataset_id)
            }
            Change::CreateContainer { node, application } => {
                format!("container:{}/{}", node, application.name)
            }
            Change::StopContainer { node, name } => format!("container:{}/{}", node, name),
        }
    }

    /// Variant name, used for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Change::CreateDataset { .. } => "create_dataset",
            Change::DeleteDataset { .. } => "delete_dataset",
            Change::MoveDataset { .. } => "move_dataset",
            Change::ResizeDataset { .. } => "resize_dataset",
            Change::SetDatasetMetadata { .. } => "set_dataset_metadata",
            Change::CreateContainer { .. } => "create_container",
            Change::StopContainer { .. } => "stop_container",
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::CreateDataset { dataset_id, node, .. } => {
                write!(f, "create dataset {} on {}", dataset_id, node)
            }
            Change::DeleteDataset { dataset_id, node } => {
                write!(f, "delete dataset {} on {}", dataset_id, node)
            }
            Change::MoveDataset { dataset_id, from, to } => {
                write!(f, "move dataset {} from {} to {}", dataset_id, from, to)
            }
            Change::ResizeDataset { dataset_id, node, .. } => {
                write!(f, "resize dataset {} on {}", dataset_id, node)
            }
            Change::SetDatasetMetadata { dataset_id, node, .. } => {
                write!(f, "update metadata of dataset {} on {}", dataset_id, node)
            }
            Change::CreateContainer { node, application } => {
                write!(f, "create container {} on {}", application.name, node)
            }
            Change::StopContainer { node, name } => {
                write!(f, "stop container {} on {}", name, node)
            }
        }
    }
}

/// Compute the ordered, minimal set of changes that converges `actual`
/// toward `desired`
///
/// Dataset changes are emitted before container changes because containers
/// may mount a dataset. Iteration over the `BTreeMap`s keeps the output
/// deterministic for a given input pair. Diffing unchanged state yields an
/// empty list.
pub fn compute_changes(
    actual: &ActualStateSnapshot,
    desired: &DesiredConfiguration,
) -> Vec<Change> {
    let mut changes = Vec::new();

    // Datasets declared by the configuration, in dataset_id order.
    for (&dataset_id, dataset) in &desired.datasets {
        let located = actual.locate_dataset(dataset_id);

        if dataset.deleted {
            if let Some((node, _)) = located {
                changes.push(Change::DeleteDataset { dataset_id, node });
            }
            continue;
        }

        match located {
            None => {
                // Not located in the snapshot proves absence only if every
                // node was observed; otherwise the data may live on an
                // unobserved node and creating a second copy would leave the
                // dataset attached on two nodes once that node returns.
                if !actual.unreachable.is_empty() {
                    debug!(
                        %dataset_id, primary = %dataset.primary,
                        "dataset creation deferred, not every node was observed"
                    );
                    continue;
                }
                changes.push(Change::CreateDataset {
                    dataset_id,
                    node: dataset.primary,
                    maximum_size: dataset.maximum_size,
                    metadata: dataset.metadata.clone(),
                });
            }
            Some((node, _)) if node != dataset.primary => {
                if actual.unreachable.contains(&dataset.primary) {
                    debug!(
                        %dataset_id, primary = %dataset.primary,
                        "dataset move deferred, destination unreachable"
                    );
                    continue;
                }
                changes.push(Change::MoveDataset {
                    dataset_id,
                    from: node,
                    to: dataset.primary,
                });
            }
            Some((node, attached)) => {
                if attached.maximum_size != dataset.maximum_size {
                    changes.push(Change::ResizeDataset {
                        dataset_id,
                        node,
                        maximum_size: dataset.maximum_size,
                    });
                }
                if attached.metadata != dataset.metadata {
                    changes.push(Change::SetDatasetMetadata {
                        dataset_id,
                        node,
                        metadata: dataset.metadata.clone(),
                    });
                }
            }
        }
    }

    // Datasets observed on a node but absent from the configuration.
    for (&node, state) in &actual.nodes {
        for &dataset_id in state.datasets.keys() {
            if !desired.datasets.contains_key(&dataset_id) {
                changes.push(Change::DeleteDataset { dataset_id, node });
            }
        }
    }

    // Containers: stops first, so replacing an application releases its
    // ports before the new version claims them.
    let no_applications = BTreeSet::new();
    for (&node, state) in &actual.nodes {
        let desired_apps = desired.applications.get(&node).unwrap_or(&no_applications);
        for app in &state.applications {
            if !desired_apps.iter().any(|d| d.converges_with(app)) {
                changes.push(Change::StopContainer {
                    node,
                    name: app.name.clone(),
                });
            }
        }
    }

    for (&node, desired_apps) in &desired.applications {
        let Some(state) = actual.nodes.get(&node) else {
            if actual.unreachable.contains(&node) {
                debug!(%node, "container changes deferred, node unreachable");
            }
            continue;
        };
        for app in desired_apps {
            if state.applications.iter().any(|a| a.converges_with(app)) {
                continue;
            }
            let missing: Vec<DatasetId> = app
                .dataset_dependencies()
                .filter(|id| !state.datasets.contains_key(id))
                .collect();
            if !missing.is_empty() {
                // Not yet convergeable: the dataset change emitted above (or
                // a move still in flight) must land first.
                debug!(
                    %node, application = %app.name, missing = ?missing,
                    "container creation deferred, dataset not yet present"
                );
                continue;
            }
            changes.push(Change::CreateContainer {
                node,
                application: app.clone(),
            });
        }
    }

    changes
}
