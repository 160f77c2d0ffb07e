//! Wire types for the REST API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Dataset, DatasetId, NodeId};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Current convergence loop phase
    pub phase: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Body of `POST /v1/configuration/datasets`
#[derive(Debug, Deserialize)]
pub struct DatasetCreateRequest {
    pub primary: NodeId,
    #[serde(default)]
    pub maximum_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Body of `POST /v1/configuration/datasets/{dataset_id}`
///
/// Changing `primary` requests a move; changing `maximum_size` a resize.
/// Convergence is asynchronous, poll the state listing to observe it.
#[derive(Debug, Deserialize)]
pub struct DatasetUpdateRequest {
    #[serde(default)]
    pub primary: Option<NodeId>,
    #[serde(default, with = "double_option")]
    pub maximum_size: Option<Option<u64>>,
}

/// Distinguishes "field absent" (keep the bound) from "field null" (clear it)
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(de).map(Some)
    }
}

/// A dataset's desired attributes as returned by configuration endpoints
#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    pub dataset_id: DatasetId,
    pub primary: NodeId,
    pub maximum_size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub deleted: bool,
}

impl From<Dataset> for DatasetResponse {
    fn from(dataset: Dataset) -> Self {
        DatasetResponse {
            dataset_id: dataset.dataset_id,
            primary: dataset.primary,
            maximum_size: dataset.maximum_size,
            metadata: dataset.metadata,
            deleted: dataset.deleted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DatasetListResponse {
    pub items: Vec<DatasetResponse>,
    pub total: usize,
}

/// A dataset as actually observed on a node
#[derive(Debug, Serialize)]
pub struct DatasetStateResponse {
    pub dataset_id: DatasetId,
    pub node: NodeId,
    pub maximum_size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct DatasetStateListResponse {
    pub items: Vec<DatasetStateResponse>,
    pub total: usize,
    /// When the snapshot these entries come from was taken
    pub observed_at: String,
}
