//! In-memory storage and container drivers
//!
//! Fully functional implementations over plain maps, used by the test suite
//! and by loopback deployments. Failure injection and artificial latency make
//! the executor's timeout and move-failure paths testable without a real
//! backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::{Application, AttachedDataset, DatasetId, NodeId};

use super::{ContainerDriver, DriverError, DriverResult, StorageDriver};

/// Operations that can be made to fail on demand
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureMode {
    Create,
    Destroy,
    Transfer,
    Attach,
    Resize,
    SetMetadata,
    ListDatasets,
    CreateContainer,
    StopContainer,
    ListContainers,
}

#[derive(Default)]
struct StorageState {
    /// node → attached volumes
    attached: HashMap<NodeId, BTreeMap<DatasetId, AttachedDataset>>,
    /// transfers completed but not yet attached: dataset → (origin, destination)
    staged: HashMap<DatasetId, (NodeId, NodeId)>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryStorageDriver {
    state: Mutex<StorageState>,
    failures: Mutex<HashSet<FailureMode>>,
    unreachable: Mutex<HashSet<NodeId>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStorageDriver {
    /// Make every subsequent call of the given kind fail
    pub async fn inject_failure(&self, mode: FailureMode) {
        self.failures.lock().await.insert(mode);
    }

    pub async fn clear_failure(&self, mode: FailureMode) {
        self.failures.lock().await.remove(&mode);
    }

    /// Make observation of a node fail
    pub async fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    /// Delay every call by the given duration
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    async fn check(&self, mode: FailureMode, node: NodeId) -> DriverResult<()> {
        let delay = *self.latency.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().await.contains(&node) {
            return Err(DriverError::Unreachable(node));
        }
        if self.failures.lock().await.contains(&mode) {
            return Err(DriverError::Backend(format!("injected {:?} failure", mode)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for MemoryStorageDriver {
    async fn create(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
        metadata: BTreeMap<String, String>,
    ) -> DriverResult<()> {
        self.check(FailureMode::Create, node).await?;
        let mut state = self.state.lock().await;
        let volumes = state.attached.entry(node).or_default();
        if volumes.contains_key(&dataset_id) {
            return Err(DriverError::AlreadyConverged);
        }
        volumes.insert(
            dataset_id,
            AttachedDataset {
                dataset_id,
                maximum_size,
                metadata,
            },
        );
        Ok(())
    }

    async fn destroy(&self, dataset_id: DatasetId, node: NodeId) -> DriverResult<()> {
        self.check(FailureMode::Destroy, node).await?;
        let mut state = self.state.lock().await;
        match state.attached.entry(node).or_default().remove(&dataset_id) {
            Some(_) => Ok(()),
            None => Err(DriverError::AlreadyConverged),
        }
    }

    async fn transfer(
        &self,
        dataset_id: DatasetId,
        from: NodeId,
        to: NodeId,
    ) -> DriverResult<()> {
        self.check(FailureMode::Transfer, from).await?;
        let mut state = self.state.lock().await;
        if !state
            .attached
            .get(&from)
            .is_some_and(|v| v.contains_key(&dataset_id))
        {
            return Err(DriverError::NotFound(format!(
                "dataset {} not attached on {}",
                dataset_id, from
            )));
        }
        state.staged.insert(dataset_id, (from, to));
        Ok(())
    }

    async fn attach(&self, dataset_id: DatasetId, node: NodeId) -> DriverResult<()> {
        self.check(FailureMode::Attach, node).await?;
        let mut state = self.state.lock().await;
        let (from, to) = match state.staged.remove(&dataset_id) {
            Some(staged) => staged,
            None => {
                return Err(DriverError::NotFound(format!(
                    "no transferred data for dataset {}",
                    dataset_id
                )))
            }
        };
        if to != node {
            state.staged.insert(dataset_id, (from, to));
            return Err(DriverError::Backend(format!(
                "dataset {} was transferred to {}, not {}",
                dataset_id, to, node
            )));
        }
        // Atomic handover: the origin keeps the data until this point.
        let volume = state
            .attached
            .entry(from)
            .or_default()
            .remove(&dataset_id)
            .ok_or_else(|| {
                DriverError::NotFound(format!("dataset {} vanished from {}", dataset_id, from))
            })?;
        state.attached.entry(to).or_default().insert(dataset_id, volume);
        Ok(())
    }

    async fn resize(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
    ) -> DriverResult<()> {
        self.check(FailureMode::Resize, node).await?;
        let mut state = self.state.lock().await;
        let volume = state
            .attached
            .entry(node)
            .or_default()
            .get_mut(&dataset_id)
            .ok_or_else(|| {
                DriverError::NotFound(format!("dataset {} not attached on {}", dataset_id, node))
            })?;
        if volume.maximum_size == maximum_size {
            return Err(DriverError::AlreadyConverged);
        }
        volume.maximum_size = maximum_size;
        Ok(())
    }

    async fn set_metadata(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        metadata: BTreeMap<String, String>,
    ) -> DriverResult<()> {
        self.check(FailureMode::SetMetadata, node).await?;
        let mut state = self.state.lock().await;
        let volume = state
            .attached
            .entry(node)
            .or_default()
            .get_mut(&dataset_id)
            .ok_or_else(|| {
                DriverError::NotFound(format!("dataset {} not attached on {}", dataset_id, node))
            })?;
        if volume.metadata == metadata {
            return Err(DriverError::AlreadyConverged);
        }
        volume.metadata = metadata;
        Ok(())
    }

    async fn list(&self, node: NodeId) -> DriverResult<Vec<AttachedDataset>> {
        self.check(FailureMode::ListDatasets, node).await?;
        let state = self.state.lock().await;
        Ok(state
            .attached
            .get(&node)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// In-memory container runtime
#[derive(Default)]
pub struct MemoryContainerDriver {
    running: Mutex<HashMap<NodeId, BTreeMap<String, Application>>>,
    failures: Mutex<HashSet<FailureMode>>,
    unreachable: Mutex<HashSet<NodeId>>,
}

impl MemoryContainerDriver {
    pub async fn inject_failure(&self, mode: FailureMode) {
        self.failures.lock().await.insert(mode);
    }

    pub async fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    async fn check(&self, mode: FailureMode, node: NodeId) -> DriverResult<()> {
        if self.unreachable.lock().await.contains(&node) {
            return Err(DriverError::Unreachable(node));
        }
        if self.failures.lock().await.contains(&mode) {
            return Err(DriverError::Backend(format!("injected {:?} failure", mode)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for MemoryContainerDriver {
    async fn create(&self, node: NodeId, application: &Application) -> DriverResult<()> {
        self.check(FailureMode::CreateContainer, node).await?;
        let mut running = self.running.lock().await;
        let units = running.entry(node).or_default();
        if units.contains_key(&application.name) {
            return Err(DriverError::AlreadyConverged);
        }
        units.insert(application.name.clone(), application.clone());
        Ok(())
    }

    async fn stop(&self, node: NodeId, name: &str) -> DriverResult<()> {
        self.check(FailureMode::StopContainer, node).await?;
        let mut running = self.running.lock().await;
        match running.entry(node).or_default().remove(name) {
            Some(_) => Ok(()),
            None => Err(DriverError::AlreadyConverged),
        }
    }

    async fn list(&self, node: NodeId) -> DriverResult<Vec<Application>> {
        self.check(FailureMode::ListContainers, node).await?;
        let running = self.running.lock().await;
        Ok(running
            .get(&node)
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default())
    }
}
