use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, info};

use crate::core::config::Config;
use crate::core::cron::{ActionRunner, CronBook, CronComponent, CronScheduler};
use crate::core::dispatch::{Orchestrator, OrchestratorComponent};
use crate::core::events::EventBus;
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::JobStore;
use crate::core::terminal::{self, GuideSection};
use crate::core::triggers::TriggerRegistry;
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging;

/// Build every component from configuration, run until Ctrl-C, then shut
/// down in reverse: API server, cron scheduler, then a drain of in-flight jobs.
pub async fn run_serve(data_dir: PathBuf, config: Config) -> Result<()> {
    let log_tx = logging::init(Level::INFO, false);
    info!("Starting jobrelay (data dir {})", data_dir.display());

    let store = Arc::new(JobStore::open(&data_dir).await?);
    let bus = Arc::new(EventBus::new(config.server.event_buffer));
    let orchestrator = Arc::new(Orchestrator::from_config(&config, &data_dir, store, bus));

    let actions = Arc::new(ActionRunner::new(
        orchestrator.clone(),
        data_dir.clone(),
        config.cron.command_timeout(),
        config.cron.tz()?,
    )?);
    let scheduler = CronScheduler::new(Arc::new(CronBook::in_data_dir(&data_dir)), actions.clone());
    let triggers = Arc::new(TriggerRegistry::in_data_dir(&data_dir, actions));
    let drain = config.dispatch.drain_timeout();

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(OrchestratorComponent::new(
        orchestrator.clone(),
        drain,
    ))));
    lifecycle.attach(Arc::new(Mutex::new(CronComponent::new(
        scheduler.clone(),
        drain,
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
        orchestrator: orchestrator.clone(),
        scheduler,
        triggers,
        log_tx,
        api_host: config.server.host.clone(),
        api_port: config.server.port,
    }))));

    lifecycle.start().await?;

    let backends: Vec<&str> = orchestrator
        .backend_kinds()
        .iter()
        .map(|k| k.as_str())
        .collect();
    let api_url = format!("http://{}:{}", config.server.host, config.server.port);
    terminal::print_banner();
    terminal::print_link("API", &api_url);
    terminal::print_link("Events", &format!("{}/api/events", api_url));
    if backends.is_empty() {
        terminal::print_warn("No execution backend is enabled; every job will fail.");
    }
    GuideSection::new("Runtime")
        .status(
            "Backends",
            &if backends.is_empty() {
                "none".to_string()
            } else {
                backends.join(" -> ")
            },
        )
        .status("Cron timezone", &config.cron.timezone)
        .blank()
        .text("Press Ctrl+C to stop.")
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    terminal::print_step("Shutting down, draining in-flight jobs...");
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
