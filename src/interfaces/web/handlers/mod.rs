pub mod crons;
pub mod events;
pub mod jobs;
pub mod triggers;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::core::error::OrchestratorError;

/// `{"success": false, ...}` with the status code the error maps to.
pub(crate) fn failure(err: OrchestratorError) -> Response {
    let status = match &err {
        OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NotCancellable(_) => StatusCode::CONFLICT,
        OrchestratorError::BackendFailure(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Internal(e) => {
            error!("Internal error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "code": err.code(),
            "error": err.to_string(),
        })),
    )
        .into_response()
}

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    failure(OrchestratorError::InvalidInput(message.into()))
}
