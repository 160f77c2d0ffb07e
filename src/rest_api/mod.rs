//! REST API surface
//!
//! Exposes dataset configuration and state listings over HTTP. Mutations are
//! recorded in the configuration store and converge asynchronously; there is
//! no push notification, clients poll.

mod dto;
mod handlers;
mod server;

use std::sync::Arc;

use crate::config::ConfigurationStore;
use crate::controller::ConvergenceLoop;
use crate::observer::StateObserver;

pub use dto::{
    DatasetCreateRequest, DatasetListResponse, DatasetResponse, DatasetStateListResponse,
    DatasetStateResponse, DatasetUpdateRequest, ErrorResponse, HealthResponse,
};
pub use server::{router, run_server};

/// Shared state for the HTTP handlers
pub struct ApiState {
    pub store: Arc<ConfigurationStore>,
    pub observer: Arc<StateObserver>,
    pub convergence: Arc<ConvergenceLoop>,
}
