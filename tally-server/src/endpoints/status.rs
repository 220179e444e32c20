//! Serves the agent's delivery status.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::endpoints::ApiErrorResponse;
use crate::service::ServiceState;
use crate::services::GetStatus;

/// `GET /status`: the current [`StatusSnapshot`](crate::services::StatusSnapshot).
pub async fn handle(State(state): State<ServiceState>) -> Response {
    match state.status_tracker().send(GetStatus).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiErrorResponse::with_detail("status tracker unavailable")),
        )
            .into_response(),
    }
}
