use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::super::AppState;
use super::{bad_request, failure};
use crate::core::error::OrchestratorError;
use crate::core::jobs::{JobOptions, JobStatus};

#[derive(Deserialize)]
pub struct CreateJobRequest {
    prompt: String,
    #[serde(flatten)]
    options: JobOptions,
}

pub async fn create_job_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Response {
    match state
        .orchestrator
        .create_job(&payload.prompt, payload.options)
        .await
    {
        Ok(job_id) => Json(serde_json::json!({ "success": true, "job_id": job_id })).into_response(),
        Err(e) => failure(e),
    }
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    page: Option<usize>,
    status: Option<String>,
}

pub async fn list_jobs_endpoint(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match JobStatus::from_status(raw) {
            Some(status) => Some(status),
            None => return bad_request(format!("unknown status '{}'", raw)),
        },
    };
    let page = query.page.unwrap_or(1).max(1);
    match state.orchestrator.get_jobs(page, status).await {
        Ok(jobs) => Json(serde_json::json!({
            "success": true,
            "page": page,
            "jobs": jobs,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

pub async fn job_counts_endpoint(State(state): State<AppState>) -> Response {
    match state.orchestrator.get_job_counts().await {
        Ok(counts) => {
            Json(serde_json::json!({ "success": true, "counts": counts })).into_response()
        }
        Err(e) => failure(e),
    }
}

pub async fn get_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.orchestrator.get_job(&job_id).await {
        Ok(Some(job)) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Ok(None) => failure(OrchestratorError::NotFound(format!("job {}", job_id))),
        Err(e) => failure(e),
    }
}

pub async fn cancel_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.orchestrator.cancel_job(&job_id).await {
        Ok(outcome) => {
            info!("Cancel requested for job {} via API", job_id);
            Json(serde_json::json!({
                "success": outcome.success,
                "message": outcome.message,
            }))
            .into_response()
        }
        Err(e) => failure(e),
    }
}

pub async fn retry_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.orchestrator.retry_job(&job_id).await {
        Ok(new_id) => Json(serde_json::json!({
            "success": true,
            "job_id": new_id,
            "retry_of": job_id,
        }))
        .into_response(),
        Err(e) => failure(e),
    }
}

pub async fn refresh_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.orchestrator.refresh_job(&job_id).await {
        Ok(job) => Json(serde_json::json!({ "success": true, "job": job })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn pool_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backends: Vec<&str> = state
        .orchestrator
        .backend_kinds()
        .iter()
        .map(|k| k.as_str())
        .collect();
    Json(serde_json::json!({
        "success": true,
        "pool": state.orchestrator.pool_status(),
        "workers": state.orchestrator.pool_workers(),
        "backends": backends,
    }))
}
