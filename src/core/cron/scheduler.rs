use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::schedule::truncate_to_minute;
use super::{ActionContext, ActionRunner, CronBook, CronJobConfig, CronRun, CronSchedule};
use crate::core::error::{OrchestratorError, OrchestratorResult};
use crate::core::events::EventKind;
use crate::core::lifecycle::LifecycleComponent;

#[derive(Debug, Clone)]
struct CronEntry {
    config: CronJobConfig,
    schedule: CronSchedule,
}

#[derive(Default)]
struct SchedulerState {
    table: Arc<Vec<CronEntry>>,
    /// Minute each entry last fired in. Survives reloads.
    last_fired: HashMap<String, DateTime<Utc>>,
}

struct Inner {
    book: Arc<CronBook>,
    actions: Arc<ActionRunner>,
    tz: Tz,
    state: Mutex<SchedulerState>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

/// Evaluates cron entries once per minute and runs the matching actions.
///
/// The schedule table is only swapped while the state lock is held, and
/// evaluation holds the same lock, so a reload lands between ticks and never
/// during one.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl CronScheduler {
    pub fn new(book: Arc<CronBook>, actions: Arc<ActionRunner>) -> Self {
        let tz = actions.timezone();
        Self {
            inner: Arc::new(Inner {
                book,
                actions,
                tz,
                state: Mutex::new(SchedulerState::default()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                handle: StdMutex::new(None),
            }),
        }
    }

    pub fn book(&self) -> &Arc<CronBook> {
        &self.inner.book
    }

    pub fn timezone(&self) -> Tz {
        self.inner.tz
    }

    /// Re-read the cron book and swap in the new table. Returns how many
    /// entries were loaded, disabled ones included.
    pub async fn reload_crons(&self) -> Result<usize> {
        let configs = self.inner.book.list().await?;
        let mut seen = HashSet::new();
        let mut table = Vec::with_capacity(configs.len());
        for config in configs {
            if !seen.insert(config.name.clone()) {
                warn!("Duplicate cron name '{}' ignored, keeping the first", config.name);
                continue;
            }
            match CronSchedule::parse(&config.schedule) {
                Ok(schedule) => table.push(CronEntry { config, schedule }),
                Err(e) => warn!("Cron '{}' skipped: {}", config.name, e),
            }
        }

        let loaded = table.len();
        let mut state = self.inner.state.lock().await;
        state.last_fired.retain(|name, _| seen.contains(name));
        state.table = Arc::new(table);
        drop(state);

        info!(
            "Loaded {} cron entr{} from {}",
            loaded,
            if loaded == 1 { "y" } else { "ies" },
            self.inner.book.path().display()
        );
        Ok(loaded)
    }

    /// Names and next fire times of enabled entries.
    pub async fn upcoming(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        let table = self.inner.state.lock().await.table.clone();
        let now = Utc::now();
        table
            .iter()
            .filter(|e| e.config.enabled)
            .map(|e| {
                (
                    e.config.name.clone(),
                    e.schedule.next_after(now, &self.inner.tz),
                )
            })
            .collect()
    }

    /// Evaluate one minute. Every enabled entry whose schedule matches fires
    /// at most once for that minute; the actions run in the background.
    /// Returns the names that fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let minute = truncate_to_minute(now);
        let local = minute.with_timezone(&self.inner.tz);

        let mut state = self.inner.state.lock().await;
        let table = state.table.clone();
        let mut fired = Vec::new();
        for entry in table.iter() {
            if !entry.config.enabled || !entry.schedule.matches(&local) {
                continue;
            }
            if state.last_fired.get(&entry.config.name) == Some(&minute) {
                debug!("Cron '{}' already fired at {}", entry.config.name, minute);
                continue;
            }
            state.last_fired.insert(entry.config.name.clone(), minute);
            fired.push(entry.config.name.clone());

            let this = self.clone();
            let config = entry.config.clone();
            self.inner.tracker.spawn(async move {
                if let Err(e) = this.run_entry(&config).await {
                    error!("Cron '{}' could not record its run: {:#}", config.name, e);
                }
            });
        }
        fired
    }

    /// Fire one entry right away, whatever its schedule or enabled flag.
    pub async fn run_now(&self, name: &str) -> OrchestratorResult<CronRun> {
        let config = self
            .inner
            .book
            .get(name)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("cron {}", name)))?;
        Ok(self.run_entry(&config).await?)
    }

    /// Newest first.
    pub async fn runs(&self, name: &str, limit: usize) -> OrchestratorResult<Vec<CronRun>> {
        Ok(self
            .inner
            .actions
            .orchestrator()
            .store()
            .list_cron_runs(name, limit)
            .await?)
    }

    async fn run_entry(&self, config: &CronJobConfig) -> Result<CronRun> {
        let orchestrator = self.inner.actions.orchestrator();
        let mut run = orchestrator.store().start_cron_run(&config.name).await?;
        info!("Cron '{}' firing ({})", config.name, config.action.kind());

        let actions = self.inner.actions.clone();
        let action = config.action.clone();
        let ctx = ActionContext::cron(&config.name);
        let result = match tokio::spawn(async move { actions.run(&action, &ctx).await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("Action crashed: {}", e)),
        };
        if let Err(e) = &result {
            warn!("Cron '{}' failed: {:#}", config.name, e);
        }

        run.finalize(result.map_err(|e| format!("{:#}", e)));
        orchestrator.store().finish_cron_run(&run).await?;
        orchestrator.bus().publish(EventKind::CronRun(run.clone()));
        Ok(run)
    }

    /// Load the table and start ticking at every minute boundary.
    pub async fn start(&self) -> Result<()> {
        self.reload_crons().await?;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        if let Ok(mut slot) = self.inner.handle.lock()
            && let Some(previous) = slot.replace(handle)
        {
            previous.abort();
        }
        info!("Cron scheduler started (timezone {})", self.inner.tz);
        Ok(())
    }

    async fn run_loop(&self) {
        loop {
            let now = Utc::now();
            let next = truncate_to_minute(now) + chrono::Duration::minutes(1);
            let wait = (next - now).to_std().unwrap_or(Duration::from_millis(100));
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.tick(Utc::now()).await;
        }
        debug!("Cron loop exited");
    }

    /// Stop ticking and wait for running actions up to `drain`.
    pub async fn stop(&self, drain: Duration) -> bool {
        self.inner.shutdown.cancel();
        let handle = self.inner.handle.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.tracker.close();
        match tokio::time::timeout(drain, self.inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Cron actions still running after {:?}", drain);
                false
            }
        }
    }

    /// Wait for actions spawned by [`CronScheduler::tick`] without stopping.
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        while !self.inner.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Lifecycle wrapper so `serve` can start and drain the scheduler with the
/// other components.
pub struct CronComponent {
    scheduler: CronScheduler,
    drain: Duration,
}

impl CronComponent {
    pub fn new(scheduler: CronScheduler, drain: Duration) -> Self {
        Self { scheduler, drain }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for CronComponent {
    async fn on_start(&mut self) -> Result<()> {
        self.scheduler.start().await
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Stopping cron scheduler");
        self.scheduler.stop(self.drain).await;
        Ok(())
    }
}
