//! The agent's HTTP resources.

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::service::ServiceState;

mod report;
mod status;

/// The error body returned with every non-`200` response.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    detail: String,
}

impl ApiErrorResponse {
    /// Creates an error body with the given message.
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// Creates an error body from an error's display representation.
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::with_detail(error.to_string())
    }
}

/// Builds the router over all resources.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .route("/report", post(report::handle))
        .route("/status", get(status::handle))
}
