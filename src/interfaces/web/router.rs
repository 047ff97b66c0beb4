use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{crons, events, jobs, triggers};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    let api_port = state.api_port;
    Router::new()
        .route(
            "/api/jobs",
            get(jobs::list_jobs_endpoint).post(jobs::create_job_endpoint),
        )
        .route("/api/jobs/counts", get(jobs::job_counts_endpoint))
        .route("/api/jobs/{id}", get(jobs::get_job_endpoint))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel_job_endpoint))
        .route("/api/jobs/{id}/retry", post(jobs::retry_job_endpoint))
        .route("/api/jobs/{id}/refresh", post(jobs::refresh_job_endpoint))
        .route("/api/pool", get(jobs::pool_endpoint))
        .route(
            "/api/crons",
            get(crons::list_crons_endpoint).post(crons::create_cron_endpoint),
        )
        .route("/api/crons/reload", post(crons::reload_crons_endpoint))
        .route(
            "/api/crons/{name}",
            put(crons::update_cron_endpoint).delete(crons::delete_cron_endpoint),
        )
        .route("/api/crons/{name}/runs", get(crons::cron_runs_endpoint))
        .route("/api/crons/{name}/run", post(crons::run_cron_endpoint))
        .route(
            "/api/triggers",
            get(triggers::list_triggers_endpoint).post(triggers::create_trigger_endpoint),
        )
        .route("/api/triggers/{source}", post(triggers::fire_trigger_endpoint))
        .route(
            "/api/triggers/by-name/{name}",
            delete(triggers::delete_trigger_endpoint),
        )
        .route(
            "/api/channels/{channel}/messages",
            post(events::channel_message_endpoint),
        )
        .route("/api/events", get(events::events_endpoint))
        .route("/api/logs", get(events::logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
