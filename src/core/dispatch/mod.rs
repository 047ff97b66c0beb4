//! The orchestration context: job submission, backend routing,
//! cancellation and retry.
//!
//! One `Orchestrator` is built at startup and shared by reference with the
//! cron scheduler, triggers and API handlers.

mod backend;

#[cfg(test)]
mod tests;

pub use backend::{Backend, BackendKind, CancelAck, Submission};

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::error::{OrchestratorError, OrchestratorResult};
use crate::core::events::{EventBus, EventKind};
use crate::core::jobs::{
    CANCELLED_BY_USER, Job, JobCounts, JobOptions, JobReporter, JobStatus,
};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::runners::{
    AgentExecutor, GitHubClient, LocalRunner, PoolStatus, RemoteRunner, ShellAgent, WarmPool,
    WorkerInfo,
};
use crate::core::store::{InsertOutcome, JobStore};

pub const NO_BACKEND_AVAILABLE: &str = "No execution backend available";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct Orchestrator {
    reporter: JobReporter,
    backends: Vec<Arc<dyn Backend>>,
    warm_pool: Option<Arc<WarmPool>>,
    remote: Option<Arc<RemoteRunner>>,
    prompt_preamble: Option<String>,
    page_size: usize,
    cancel_timeout: Duration,
    tracker: TaskTracker,
}

/// Assembles an [`Orchestrator`]. Backends are tried in the fixed order
/// warm, local, remote; any left unset is simply not offered jobs.
pub struct OrchestratorBuilder {
    reporter: JobReporter,
    tracker: TaskTracker,
    warm_pool: Option<Arc<WarmPool>>,
    local: Option<Arc<LocalRunner>>,
    remote: Option<Arc<RemoteRunner>>,
    prompt_preamble: Option<String>,
    page_size: usize,
    cancel_timeout: Duration,
}

impl OrchestratorBuilder {
    pub fn warm_pool(mut self, pool: Arc<WarmPool>) -> Self {
        self.warm_pool = Some(pool);
        self
    }

    pub fn local_runner(mut self, runner: Arc<LocalRunner>) -> Self {
        self.local = Some(runner);
        self
    }

    pub fn remote_runner(mut self, runner: Arc<RemoteRunner>) -> Self {
        self.remote = Some(runner);
        self
    }

    pub fn prompt_preamble(mut self, preamble: Option<String>) -> Self {
        self.prompt_preamble = preamble.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// How long a cancel waits on each backend before forcing the job closed.
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn build(self) -> Orchestrator {
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        if let Some(pool) = &self.warm_pool {
            backends.push(pool.clone());
        }
        if let Some(local) = &self.local {
            backends.push(local.clone());
        }
        if let Some(remote) = &self.remote {
            backends.push(remote.clone());
        }
        info!(
            "Dispatch order: [{}]",
            backends
                .iter()
                .map(|b| b.kind().as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Orchestrator {
            reporter: self.reporter,
            backends,
            warm_pool: self.warm_pool,
            remote: self.remote,
            prompt_preamble: self.prompt_preamble,
            page_size: self.page_size,
            cancel_timeout: self.cancel_timeout,
            tracker: self.tracker,
        }
    }
}

impl Orchestrator {
    pub fn builder(reporter: JobReporter, tracker: TaskTracker) -> OrchestratorBuilder {
        OrchestratorBuilder {
            reporter,
            tracker,
            warm_pool: None,
            local: None,
            remote: None,
            prompt_preamble: None,
            page_size: 25,
            cancel_timeout: Duration::from_secs(10),
        }
    }

    /// Wire every configured backend around the shell agent.
    pub fn from_config(
        config: &Config,
        data_dir: &Path,
        store: Arc<JobStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let reporter = JobReporter::new(store, bus);
        let tracker = TaskTracker::new();
        let executor: Arc<dyn AgentExecutor> = Arc::new(ShellAgent::new(
            config.agent.command.clone(),
            config.agent.warmup_command.clone(),
            data_dir.to_path_buf(),
        ));

        let mut builder = Self::builder(reporter.clone(), tracker.clone())
            .prompt_preamble(config.dispatch.prompt_preamble.clone())
            .page_size(config.dispatch.page_size)
            // A warm worker gets its full ack window before the bound kicks in.
            .cancel_timeout(
                config
                    .dispatch
                    .cancel_timeout()
                    .max(config.warm_pool.cancel_ack_timeout() + Duration::from_secs(1)),
            );

        if config.warm_pool.enabled && config.warm_pool.size > 0 {
            builder = builder.warm_pool(Arc::new(WarmPool::new(
                config.warm_pool.size,
                reporter.clone(),
                executor.clone(),
                tracker.clone(),
                config.warm_pool.cancel_ack_timeout(),
            )));
        }
        if config.local.enabled {
            builder = builder.local_runner(Arc::new(LocalRunner::new(
                reporter.clone(),
                executor,
                tracker.clone(),
                config.local.timeout(),
            )));
        }
        if config.remote.enabled {
            match GitHubClient::from_config(&config.remote) {
                Ok(client) => {
                    builder = builder.remote_runner(Arc::new(RemoteRunner::new(
                        reporter,
                        Arc::new(client),
                        tracker,
                    )));
                }
                Err(e) => warn!("Remote runner disabled: {:#}", e),
            }
        }
        builder.build()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.reporter.store()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.reporter.bus()
    }

    pub fn backend_kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// All zeros when the warm pool is disabled.
    pub fn pool_status(&self) -> PoolStatus {
        self.warm_pool
            .as_ref()
            .map(|p| p.status())
            .unwrap_or(PoolStatus {
                size: 0,
                available: 0,
                busy: 0,
            })
    }

    pub fn pool_workers(&self) -> Vec<WorkerInfo> {
        self.warm_pool
            .as_ref()
            .map(|p| p.workers())
            .unwrap_or_default()
    }

    /// Run every backend's startup preparation.
    pub async fn warm_up(&self) {
        for backend in &self.backends {
            backend.warm_up().await;
        }
    }

    /// Persist a job, announce it and hand it to the first backend that
    /// accepts it. Returns as soon as the job is handed off.
    pub async fn create_job(&self, prompt: &str, options: JobOptions) -> OrchestratorResult<String> {
        // Stored verbatim; whitespace only matters for the emptiness check.
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "prompt must not be empty".to_string(),
            ));
        }
        if let Some(external_id) = &options.external_id
            && external_id.trim().is_empty()
        {
            return Err(OrchestratorError::InvalidInput(
                "external_id must not be blank".to_string(),
            ));
        }

        let enriched = self
            .prompt_preamble
            .as_ref()
            .map(|preamble| format!("{}\n\n{}", preamble.trim(), prompt));
        let job = Job::new(prompt, enriched, &options);

        if let InsertOutcome::Duplicate(existing) = self.store().insert_job(&job).await? {
            info!(
                "Job with external id {:?} already exists as {}",
                job.external_id, existing
            );
            return Ok(existing);
        }

        info!("Job {} created (source: {})", job.id, job.source.as_str());
        self.bus().publish(EventKind::JobCreated(job.clone()));
        let job_id = job.id.clone();
        self.dispatch(job).await?;
        Ok(job_id)
    }

    async fn dispatch(&self, job: Job) -> Result<()> {
        let mut job = job;
        for backend in &self.backends {
            match backend.submit(job).await {
                Submission::Accepted => return Ok(()),
                Submission::Unavailable(returned) => job = returned,
            }
        }
        warn!("No backend accepted job {}", job.id);
        self.reporter.fail(&job.id, NO_BACKEND_AVAILABLE).await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> OrchestratorResult<Option<Job>> {
        Ok(self.store().get_job(job_id).await?)
    }

    /// `page` is 1-based; the page size comes from configuration.
    pub async fn get_jobs(
        &self,
        page: usize,
        status: Option<JobStatus>,
    ) -> OrchestratorResult<Vec<Job>> {
        Ok(self.store().list_jobs(page, self.page_size, status).await?)
    }

    pub async fn get_job_counts(&self) -> OrchestratorResult<JobCounts> {
        Ok(self.store().job_counts().await?)
    }

    /// Stop a job that has not finished.
    ///
    /// The owning backend gets a best-effort stop request; then the job is
    /// written `failed` with a compare-and-set, so a job that finished on its
    /// own in the meantime keeps its real outcome.
    pub async fn cancel_job(&self, job_id: &str) -> OrchestratorResult<CancelOutcome> {
        let job = self.require_job(job_id).await?;
        if job.is_terminal() {
            return Err(OrchestratorError::NotCancellable(job_id.to_string()));
        }

        // A job not yet started by anyone may be mid-claim on any backend.
        let owners: Vec<&Arc<dyn Backend>> = match self.backends.iter().find(|b| b.owns(&job)) {
            Some(owner) => vec![owner],
            None => self.backends.iter().collect(),
        };

        let mut message = None;
        for backend in owners {
            match tokio::time::timeout(self.cancel_timeout, backend.cancel(&job)).await {
                Ok(Ok(ack)) => info!(
                    "Cancel of job {} on {} backend: {:?}",
                    job_id,
                    backend.kind().as_str(),
                    ack
                ),
                Err(_) => {
                    warn!(
                        "Cancel of job {} on {} backend got no answer within {:?}",
                        job_id,
                        backend.kind().as_str(),
                        self.cancel_timeout
                    );
                    message = Some(format!(
                        "{} backend did not answer in time; job marked cancelled",
                        backend.kind().as_str()
                    ));
                }
                Ok(Err(e)) => {
                    warn!(
                        "Cancel of job {} on {} backend failed: {:#}",
                        job_id,
                        backend.kind().as_str(),
                        e
                    );
                    message = Some(format!(
                        "{} backend could not be reached; job marked cancelled",
                        backend.kind().as_str()
                    ));
                }
            }
        }

        if self.reporter.fail(job_id, CANCELLED_BY_USER).await? {
            return Ok(CancelOutcome {
                success: true,
                message,
            });
        }

        // Lost the race: someone else closed the job first.
        let current = self.require_job(job_id).await?;
        if current.error.as_deref() == Some(CANCELLED_BY_USER) {
            return Ok(CancelOutcome {
                success: true,
                message,
            });
        }
        Ok(CancelOutcome {
            success: false,
            message: Some(format!("Job already {}", current.status.as_str())),
        })
    }

    /// Submit a fresh job with the original prompt, source and chat id.
    /// The original record is never touched.
    pub async fn retry_job(&self, job_id: &str) -> OrchestratorResult<String> {
        let original = self.require_job(job_id).await?;
        let options = JobOptions {
            source: original.source,
            chat_id: original.chat_id.clone(),
            external_id: None,
        };
        let new_id = self.create_job(&original.prompt, options).await?;
        info!("Job {} retried as {}", job_id, new_id);
        Ok(new_id)
    }

    /// Pull remote run state into the job record. Jobs on other backends
    /// are returned unchanged.
    pub async fn refresh_job(&self, job_id: &str) -> OrchestratorResult<Job> {
        let job = self.require_job(job_id).await?;
        let Some(remote) = self.remote.as_ref().filter(|r| r.owns(&job)) else {
            return Ok(job);
        };
        remote
            .refresh(&job)
            .await
            .map_err(|e| OrchestratorError::BackendFailure(format!("{:#}", e)))
    }

    /// Stop accepting tracked work and wait for in-flight jobs. Returns
    /// false if the drain timed out.
    pub async fn shutdown(&self, drain: Duration) -> bool {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!("Draining {} in-flight job task(s)", in_flight);
        }
        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Drain timed out after {:?} with {} task(s) still running",
                    drain,
                    self.tracker.len()
                );
                false
            }
        }
    }

    async fn require_job(&self, job_id: &str) -> OrchestratorResult<Job> {
        self.store()
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))
    }
}

/// Lifecycle hook that warms workers at start and drains jobs at shutdown.
pub struct OrchestratorComponent {
    orchestrator: Arc<Orchestrator>,
    drain: Duration,
}

impl OrchestratorComponent {
    pub fn new(orchestrator: Arc<Orchestrator>, drain: Duration) -> Self {
        Self {
            orchestrator,
            drain,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for OrchestratorComponent {
    async fn on_init(&mut self) -> Result<()> {
        let kinds: Vec<&str> = self
            .orchestrator
            .backend_kinds()
            .iter()
            .map(|k| k.as_str())
            .collect();
        if kinds.is_empty() {
            warn!("No execution backend enabled; every job will fail");
        } else {
            info!("Execution backends: {}", kinds.join(" -> "));
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.orchestrator.warm_up().await;
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.orchestrator.shutdown(self.drain).await;
        Ok(())
    }
}
