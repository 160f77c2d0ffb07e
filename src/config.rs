//! Configuration store
//!
//! Owns the single current [`DesiredConfiguration`]. The document is
//! immutable; every update builds a new version, validates it at the
//! boundary, and swaps the current pointer. Readers clone the `Arc` and can
//! keep diffing against a consistent document while a writer replaces it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Dataset, DatasetId, DesiredConfiguration, NodeId};

pub struct ConfigurationStore {
    current: RwLock<Arc<DesiredConfiguration>>,
    changed: Notify,
}

impl ConfigurationStore {
    /// Create a store around an already validated configuration
    pub fn new(initial: DesiredConfiguration) -> Result<Self> {
        initial.validate()?;
        Ok(ConfigurationStore {
            current: RwLock::new(Arc::new(initial)),
            changed: Notify::new(),
        })
    }

    /// The current configuration; never mutated in place
    pub fn current(&self) -> Arc<DesiredConfiguration> {
        self.current.read().expect("configuration lock poisoned").clone()
    }

    /// Wakes the convergence loop on configuration changes. `Notify`
    /// coalesces signals, so a burst of updates during an in-flight pass
    /// triggers exactly one more pass.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Replace the whole configuration, all-or-nothing
    pub fn replace(&self, next: DesiredConfiguration) -> Result<()> {
        self.mutate(move |config| {
            *config = next;
            Ok(())
        })
    }

    /// Add a dataset with a fresh identity; returns the stored attributes
    pub fn create_dataset(
        &self,
        primary: NodeId,
        maximum_size: Option<u64>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Dataset> {
        let dataset = Dataset {
            dataset_id: DatasetId::new_random(),
            maximum_size,
            primary,
            metadata,
            deleted: false,
        };
        let stored = dataset.clone();
        self.mutate(move |config| {
            config.datasets.insert(dataset.dataset_id, dataset);
            Ok(())
        })?;
        Ok(stored)
    }

    /// Update a dataset's primary (a move) and/or its maximum size. Returns
    /// the updated attributes; convergence happens asynchronously.
    pub fn update_dataset(
        &self,
        dataset_id: DatasetId,
        primary: Option<NodeId>,
        maximum_size: Option<Option<u64>>,
    ) -> Result<Dataset> {
        self.mutate(move |config| {
            let dataset = config
                .datasets
                .get_mut(&dataset_id)
                .ok_or(Error::DatasetNotFound(dataset_id))?;
            if dataset.deleted {
                return Err(Error::Config(format!(
                    "dataset {} is marked for deletion",
                    dataset_id
                )));
            }
            if let Some(primary) = primary {
                dataset.primary = primary;
            }
            if let Some(maximum_size) = maximum_size {
                dataset.maximum_size = maximum_size;
            }
            Ok(dataset.clone())
        })
    }

    /// Mark a dataset deleted. The tombstone stays in the configuration so
    /// repeated diffs keep proposing the removal until it has converged.
    pub fn delete_dataset(&self, dataset_id: DatasetId) -> Result<Dataset> {
        self.mutate(move |config| {
            let dataset = config
                .datasets
                .get_mut(&dataset_id)
                .ok_or(Error::DatasetNotFound(dataset_id))?;
            dataset.deleted = true;
            Ok(dataset.clone())
        })
    }

    /// Clone-modify-validate-swap under the writer lock. The swap happens
    /// only if both the closure and validation succeed; readers keep the
    /// previous document otherwise.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut DesiredConfiguration) -> Result<T>,
    ) -> Result<T> {
        let mut current = self.current.write().expect("configuration lock poisoned");
        let mut next = (**current).clone();
        let out = f(&mut next)?;
        next.version = current.version + 1;
        next.validate()?;
        info!(version = next.version, "desired configuration replaced");
        *current = Arc::new(next);
        drop(current);
        self.changed.notify_one();
        Ok(out)
    }
}

/// Load a desired configuration document from a YAML or JSON file
///
/// The file is parsed and validated here; a malformed document never reaches
/// the convergence loop.
pub fn load_configuration(path: &Path) -> Result<DesiredConfiguration> {
    let raw = std::fs::read_to_string(path)?;
    let config: DesiredConfiguration = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        _ => serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?,
    };
    config.validate()?;
    Ok(config)
}
