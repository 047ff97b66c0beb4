use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

use super::super::AppState;
use super::failure;
use crate::core::cron::{CronJobConfig, CronSchedule, validate_schedule};
use crate::core::error::OrchestratorError;

const DEFAULT_RUN_LIMIT: usize = 20;

pub async fn list_crons_endpoint(State(state): State<AppState>) -> Response {
    let entries = match state.scheduler.book().list().await {
        Ok(entries) => entries,
        Err(e) => return failure(OrchestratorError::Internal(e)),
    };
    let next_runs: HashMap<String, _> = state.scheduler.upcoming().await.into_iter().collect();

    let crons: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            let description = CronSchedule::parse(&entry.schedule)
                .map(|s| s.describe())
                .ok();
            serde_json::json!({
                "entry": entry,
                "valid": validate_schedule(&entry.schedule),
                "description": description,
                "next_run": next_runs.get(&entry.name).copied().flatten(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "timezone": state.scheduler.timezone().name(),
        "crons": crons,
    }))
    .into_response()
}

/// Every mutation is followed by a reload; a failed reload leaves the
/// previous table running and is only logged.
async fn reload_after_change(state: &AppState) {
    if let Err(e) = state.scheduler.reload_crons().await {
        warn!("Cron reload after change failed: {:#}", e);
    }
}

pub async fn create_cron_endpoint(
    State(state): State<AppState>,
    Json(entry): Json<CronJobConfig>,
) -> Response {
    let name = entry.name.clone();
    match state.scheduler.book().add(entry).await {
        Ok(()) => {
            reload_after_change(&state).await;
            Json(serde_json::json!({ "success": true, "name": name })).into_response()
        }
        Err(e) => failure(e),
    }
}

pub async fn update_cron_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Json(entry): Json<CronJobConfig>,
) -> Response {
    match state.scheduler.book().update(&name, entry).await {
        Ok(()) => {
            reload_after_change(&state).await;
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(e) => failure(e),
    }
}

pub async fn delete_cron_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.scheduler.book().remove(&name).await {
        Ok(()) => {
            reload_after_change(&state).await;
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(e) => failure(e),
    }
}

#[derive(Deserialize)]
pub struct RunsQuery {
    limit: Option<usize>,
}

pub async fn cron_runs_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, 500);
    match state.scheduler.runs(&name, limit).await {
        Ok(runs) => Json(serde_json::json!({ "success": true, "runs": runs })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn run_cron_endpoint(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.scheduler.run_now(&name).await {
        Ok(run) => Json(serde_json::json!({ "success": true, "run": run })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn reload_crons_endpoint(State(state): State<AppState>) -> Response {
    match state.scheduler.reload_crons().await {
        Ok(loaded) => {
            Json(serde_json::json!({ "success": true, "loaded": loaded })).into_response()
        }
        Err(e) => failure(OrchestratorError::Internal(e)),
    }
}
