//! Handles usage report submissions.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use tally_metrics::{AcceptError, MetricReport};

use crate::endpoints::ApiErrorResponse;
use crate::service::ServiceState;
use crate::services::{AcceptReport, ReportError};

fn error_response(status: StatusCode, body: ApiErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

/// `POST /report`: feed one report into the aggregator.
///
/// `200` accepted and durable, `400` schema/type/range errors, `409`
/// overlapping time range (the client already reported it), `500` persistence
/// failure (retryable), `503` while shutting down.
pub async fn handle(
    State(state): State<ServiceState>,
    payload: Result<Json<MetricReport>, JsonRejection>,
) -> Response {
    let Json(report) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::with_detail(rejection.body_text()),
            )
        }
    };

    if state.is_shutting_down() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorResponse::with_detail("the agent is shutting down"),
        );
    }

    match state.aggregator().send(AcceptReport(report)).await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(error)) => {
            let status = match &error {
                ReportError::Rejected(AcceptError::OverlappingWindow { .. }) => {
                    StatusCode::CONFLICT
                }
                ReportError::Rejected(_) => StatusCode::BAD_REQUEST,
                ReportError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, ApiErrorResponse::from_error(&error))
        }
        Err(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorResponse::with_detail("the agent is shutting down"),
        ),
    }
}
