mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::cron::CronScheduler;
use crate::core::dispatch::Orchestrator;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::triggers::TriggerRegistry;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) scheduler: CronScheduler,
    pub(crate) triggers: Arc<TriggerRegistry>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

pub struct ApiServerConfig {
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: CronScheduler,
    pub triggers: Arc<TriggerRegistry>,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

/// The HTTP surface: JSON API, event stream and log stream.
pub struct ApiServer {
    state: AppState,
    api_host: String,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: AppState {
                orchestrator: config.orchestrator,
                scheduler: config.scheduler,
                triggers: config.triggers,
                log_tx: config.log_tx,
                api_port: config.api_port,
            },
            api_host: config.api_host,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.state.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", addr))?;
        let app = router::build_api_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        info!("API Server running at http://{addr}");
        self.handle = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        // Open SSE streams never end on their own, so don't wait for them.
        if let Some(handle) = self.handle.take()
            && tokio::time::timeout(std::time::Duration::from_secs(2), handle)
                .await
                .is_err()
        {
            tracing::warn!("API Server did not stop within 2s");
        }
        Ok(())
    }
}
