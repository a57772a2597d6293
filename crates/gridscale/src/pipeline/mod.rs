//! Cloud Pipeline REST API, used to launch and stop worker runs.
mod client;
mod model;

pub use client::{ApiConfig, CloudPipelineClient};
pub use model::ApiError;
