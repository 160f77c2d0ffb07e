//! Backend driver interfaces
//!
//! Storage backends and container runtimes are external collaborators behind
//! capability traits. New backends implement the trait and are selected by
//! configuration; the convergence core never names a concrete backend.

mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;

use crate::model::{Application, AttachedDataset, DatasetId, NodeId};

pub use memory::{FailureMode, MemoryContainerDriver, MemoryStorageDriver};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failures reported by backend drivers
///
/// `AlreadyConverged` is distinguishable from real failures so that an
/// idempotent retry of an already-applied change is skipped, not failed.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("already in desired state")]
    AlreadyConverged,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Volume lifecycle primitives of a storage backend
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Create a new volume for `dataset_id` on `node`
    async fn create(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
        metadata: BTreeMap<String, String>,
    ) -> DriverResult<()>;

    /// Destroy the volume backing `dataset_id` on `node`
    async fn destroy(&self, dataset_id: DatasetId, node: NodeId) -> DriverResult<()>;

    /// Copy a volume's data from `from` to `to` without attaching it there.
    /// The origin stays authoritative until a subsequent `attach` succeeds.
    async fn transfer(&self, dataset_id: DatasetId, from: NodeId, to: NodeId)
        -> DriverResult<()>;

    /// Attach a previously transferred volume on `node`, completing a move
    async fn attach(&self, dataset_id: DatasetId, node: NodeId) -> DriverResult<()>;

    /// Change the size bound of an existing volume
    async fn resize(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        maximum_size: Option<u64>,
    ) -> DriverResult<()>;

    /// Replace the bookkeeping metadata of an existing volume. Never touches
    /// volume data.
    async fn set_metadata(
        &self,
        dataset_id: DatasetId,
        node: NodeId,
        metadata: BTreeMap<String, String>,
    ) -> DriverResult<()>;

    /// Volumes currently attached on `node`
    async fn list(&self, node: NodeId) -> DriverResult<Vec<AttachedDataset>>;
}

/// Container lifecycle primitives of a container runtime
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and start a container for `application` on `node`
    async fn create(&self, node: NodeId, application: &Application) -> DriverResult<()>;

    /// Stop and remove the container named `name` on `node`
    async fn stop(&self, node: NodeId, name: &str) -> DriverResult<()>;

    /// Applications currently running on `node`, with their port and volume
    /// bindings
    async fn list(&self, node: NodeId) -> DriverResult<Vec<Application>>;
}

/// Backend selection, from the command line or environment
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// In-process drivers backed by plain maps; used for tests and loopback
    /// deployments
    Memory,
}

/// Build the driver pair for the selected backend
pub fn build(kind: BackendKind) -> (Arc<dyn StorageDriver>, Arc<dyn ContainerDriver>) {
    match kind {
        BackendKind::Memory => (
            Arc::new(MemoryStorageDriver::default()),
            Arc::new(MemoryContainerDriver::default()),
        ),
    }
}
