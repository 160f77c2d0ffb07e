//! Error types for the convergence operator

use crate::driver::DriverError;
use crate::model::DatasetId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type
///
/// Backend-facing failures (`Observation`, `Backend`) are contained within
/// the convergence cycle that produced them and retried on the next pass.
/// Only `Config` surfaces synchronously to API callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Actual state could not be collected from any node this cycle
    #[error("observation failed: {0}")]
    Observation(String),

    /// A change's precondition no longer held at execution time
    #[error("precondition no longer holds: {0}")]
    Precondition(String),

    /// A storage or container driver call failed or timed out
    #[error("backend failure: {0}")]
    Backend(#[from] DriverError),

    /// Malformed desired configuration, rejected at the boundary
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Referenced dataset does not exist in the desired configuration
    #[error("no such dataset: {0}")]
    DatasetNotFound(DatasetId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a subsequent convergence cycle can be expected to clear the error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Observation(_) | Error::Backend(_))
    }
}
