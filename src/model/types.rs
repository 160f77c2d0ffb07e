//! Core value types: datasets, applications, desired configuration and
//! observed state snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Globally unique, stable identity of a dataset
///
/// The identity never changes across moves between nodes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DatasetId(pub Uuid);

impl DatasetId {
    pub fn new_random() -> Self {
        DatasetId(Uuid::new_v4())
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a cluster node
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new_random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Desired attributes of a dataset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: DatasetId,
    /// Upper bound on the dataset size in bytes, unbounded when `None`
    #[serde(default)]
    pub maximum_size: Option<u64>,
    /// The node that hosts the dataset's data; at most one at any time
    pub primary: NodeId,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Tombstone: the dataset should be removed from the cluster. The entry
    /// stays in the configuration until the removal has converged so that
    /// repeated diffs keep proposing the deletion.
    #[serde(default)]
    pub deleted: bool,
}

/// A single port exposed by an application
///
/// Internal and external ports are each unique within a node at a given time.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PortMap {
    pub internal_port: u16,
    pub external_port: u16,
}

/// A filesystem mount from a node path into a container
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub node_path: PathBuf,
    pub container_path: PathBuf,
    /// When set, the mount is backed by a managed dataset and the container
    /// must not start before that dataset is present on the node.
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
}

/// Observed activation state of an application container
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ActivationState {
    #[default]
    Active,
    Inactive,
    Transitioning,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationState::Active => write!(f, "active"),
            ActivationState::Inactive => write!(f, "inactive"),
            ActivationState::Transitioning => write!(f, "transitioning"),
        }
    }
}

/// A single-container application
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Container image reference
    pub image: String,
    #[serde(default)]
    pub ports: BTreeSet<PortMap>,
    #[serde(default)]
    pub volumes: BTreeSet<Volume>,
    #[serde(default)]
    pub state: ActivationState,
}

impl Application {
    /// Value equality for convergence purposes: name, image, ports and
    /// volumes. Activation state is excluded: an application observed mid
    /// transition is not restarted for that reason alone.
    pub fn converges_with(&self, other: &Application) -> bool {
        self.name == other.name
            && self.image == other.image
            && self.ports == other.ports
            && self.volumes == other.volumes
    }

    /// Dataset ids this application's volumes depend on
    pub fn dataset_dependencies(&self) -> impl Iterator<Item = DatasetId> + '_ {
        self.volumes.iter().filter_map(|v| v.dataset_id)
    }
}

/// The operator-declared target configuration
///
/// A single atomic version: updates replace the whole document, never patch
/// it in place. `version` increments on every replacement and exists purely
/// for logging and API visibility.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredConfiguration {
    /// Node → applications that should run there
    #[serde(default)]
    pub applications: BTreeMap<NodeId, BTreeSet<Application>>,
    /// Dataset identity → desired attributes
    #[serde(default)]
    pub datasets: BTreeMap<DatasetId, Dataset>,
    #[serde(default)]
    pub version: u64,
}

impl DesiredConfiguration {
    /// All nodes this configuration references: application hosts plus
    /// dataset primaries.
    pub fn node_set(&self) -> BTreeSet<NodeId> {
        let mut nodes: BTreeSet<NodeId> = self.applications.keys().copied().collect();
        nodes.extend(self.datasets.values().map(|d| d.primary));
        nodes
    }

    /// Validate the configuration at the boundary, before it can reach the
    /// convergence loop.
    ///
    /// Rejected: duplicate application names per node, duplicate internal or
    /// external ports per node, dataset ids that disagree with their map key,
    /// and volumes referencing datasets this configuration does not declare.
    pub fn validate(&self) -> Result<()> {
        for (id, dataset) in &self.datasets {
            if *id != dataset.dataset_id {
                return Err(Error::Config(format!(
                    "dataset keyed as {} declares id {}",
                    id, dataset.dataset_id
                )));
            }
        }

        for (node, applications) in &self.applications {
            let mut names = BTreeSet::new();
            let mut internal = BTreeSet::new();
            let mut external = BTreeSet::new();

            for app in applications {
                if !names.insert(app.name.as_str()) {
                    return Err(Error::Config(format!(
                        "application name {:?} declared twice on node {}",
                        app.name, node
                    )));
                }
                for port in &app.ports {
                    if !internal.insert(port.internal_port) {
                        return Err(Error::Config(format!(
                            "internal port {} used twice on node {}",
                            port.internal_port, node
                        )));
                    }
                    if !external.insert(port.external_port) {
                        return Err(Error::Config(format!(
                            "external port {} used twice on node {}",
                            port.external_port, node
                        )));
                    }
                }
                for dep in app.dataset_dependencies() {
                    if !self.datasets.contains_key(&dep) {
                        return Err(Error::Config(format!(
                            "application {:?} on node {} mounts unknown dataset {}",
                            app.name, node, dep
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// A dataset as observed attached to a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDataset {
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Observed state of one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    #[serde(default)]
    pub applications: BTreeSet<Application>,
    #[serde(default)]
    pub datasets: BTreeMap<DatasetId, AttachedDataset>,
}

/// An immutable capture of observed cluster state
///
/// A new snapshot is produced each observation cycle. Nodes that could not
/// be reached are absent from `nodes` and listed in `unreachable`; the diff
/// engine computes no changes for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualStateSnapshot {
    pub nodes: BTreeMap<NodeId, NodeState>,
    #[serde(default)]
    pub unreachable: BTreeSet<NodeId>,
    pub observed_at: DateTime<Utc>,
}

impl ActualStateSnapshot {
    pub fn empty() -> Self {
        ActualStateSnapshot {
            nodes: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            observed_at: Utc::now(),
        }
    }

    /// Locate a dataset: the node it is attached to plus its observed
    /// attributes. At most one node hosts a given dataset.
    pub fn locate_dataset(&self, id: DatasetId) -> Option<(NodeId, &AttachedDataset)> {
        self.nodes
            .iter()
            .find_map(|(node, state)| state.datasets.get(&id).map(|d| (*node, d)))
    }
}
