//! Data model for cluster convergence
//!
//! These types are shared by the configuration store, the state observer and
//! the diff engine. Both top-level documents, [`DesiredConfiguration`] and
//! [`ActualStateSnapshot`], are immutable once constructed and replaced
//! wholesale behind an `Arc`, so readers never observe a partially-updated
//! state.

mod types;


pub use types::{
    ActivationState, ActualStateSnapshot, Application, AttachedDataset, Dataset, DatasetId,
    DesiredConfiguration, NodeId, NodeState, PortMap, Volume,
};
