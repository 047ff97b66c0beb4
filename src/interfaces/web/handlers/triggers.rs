use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::info;

use super::super::AppState;
use super::failure;
use crate::core::error::OrchestratorError;
use crate::core::triggers::{TriggerConfig, TriggerSummary};

pub async fn list_triggers_endpoint(State(state): State<AppState>) -> Response {
    match state.triggers.list().await {
        Ok(triggers) => {
            let triggers: Vec<TriggerSummary> = triggers.iter().map(TriggerSummary::from).collect();
            Json(serde_json::json!({ "success": true, "triggers": triggers })).into_response()
        }
        Err(e) => failure(OrchestratorError::Internal(e)),
    }
}

pub async fn create_trigger_endpoint(
    State(state): State<AppState>,
    Json(mut trigger): Json<TriggerConfig>,
) -> Response {
    trigger.name = trigger.name.trim().to_string();
    trigger.source = trigger.source.trim().to_lowercase();
    let name = trigger.name.clone();
    match state.triggers.add(trigger).await {
        Ok(()) => Json(serde_json::json!({ "success": true, "name": name })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn delete_trigger_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.triggers.remove(&name).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => failure(e),
    }
}

/// GitHub style `X-Hub-Signature-256: sha256=<hex>` first, then a bare
/// `X-Signature: <hex>`.
fn request_signature(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-signature"))
        .and_then(|v| v.to_str().ok())
}

pub async fn fire_trigger_endpoint(
    Path(source): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let source = source.to_lowercase();
    let report = match state
        .triggers
        .fire(&source, &body, request_signature(&headers))
        .await
    {
        Ok(report) => report,
        Err(e) => return failure(e),
    };

    if report.fired.is_empty() && report.rejected > 0 {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "error": "Signature verification failed"
            })),
        )
            .into_response();
    }

    info!(
        "Source '{}' fired {} trigger(s), {} rejected",
        source,
        report.fired.len(),
        report.rejected
    );
    Json(serde_json::json!({
        "success": true,
        "fired": report.fired,
        "rejected": report.rejected,
    }))
    .into_response()
}
