//! Fixed-size pool of pre-warmed workers.
//!
//! The worker table is private to the pool and only changed by `claim` and
//! the release paths. Each claim bumps the slot's generation so that a late
//! release from an abandoned task can never free a slot that has since been
//! handed to another job.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::executor::{AgentExecutor, ExecutionSlot};
use crate::core::dispatch::{Backend, BackendKind, CancelAck, Submission};
use crate::core::events::{EventKind, HealthChange};
use crate::core::jobs::{CANCELLED_BY_USER, Job, JobReporter, RunnerType};

pub const WORKER_RELEASED: &str = "Worker released before the job finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub state: WorkerState,
    pub current_job_id: Option<String>,
}

struct WorkerSlot {
    id: usize,
    state: WorkerState,
    current_job_id: Option<String>,
    cancel: Option<CancellationToken>,
    ack: Option<oneshot::Receiver<()>>,
    generation: u64,
}

impl WorkerSlot {
    fn idle(id: usize) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            current_job_id: None,
            cancel: None,
            ack: None,
            generation: 0,
        }
    }

    fn clear(&mut self) {
        self.state = WorkerState::Idle;
        self.current_job_id = None;
        self.cancel = None;
        self.ack = None;
    }
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    saturated: bool,
}

impl PoolState {
    fn status(&self) -> PoolStatus {
        let busy = self
            .workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .count();
        PoolStatus {
            size: self.workers.len(),
            available: self.workers.len() - busy,
            busy,
        }
    }

    /// Flip the saturation flag when capacity crosses zero and say so.
    fn capacity_change(&mut self) -> Option<HealthChange> {
        let status = self.status();
        let saturated = status.available == 0;
        if saturated == self.saturated {
            return None;
        }
        self.saturated = saturated;
        Some(HealthChange {
            component: "warm_pool".to_string(),
            healthy: !saturated,
            detail: format!("{}/{} workers available", status.available, status.size),
        })
    }
}

/// A worker handed out by [`WarmPool::claim`].
pub struct ClaimedWorker {
    pub id: usize,
    generation: u64,
    cancel: CancellationToken,
    ack: oneshot::Sender<()>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    reporter: JobReporter,
    executor: Arc<dyn AgentExecutor>,
    tracker: TaskTracker,
    ack_timeout: Duration,
}

pub struct WarmPool {
    inner: Arc<PoolInner>,
}

impl WarmPool {
    pub fn new(
        size: usize,
        reporter: JobReporter,
        executor: Arc<dyn AgentExecutor>,
        tracker: TaskTracker,
        ack_timeout: Duration,
    ) -> Self {
        let workers = (0..size).map(WorkerSlot::idle).collect();
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    workers,
                    saturated: size == 0,
                }),
                reporter,
                executor,
                tracker,
                ack_timeout,
            }),
        }
    }

    /// Non-blocking: `None` when every worker is busy.
    pub fn claim(&self, job_id: &str) -> Option<ClaimedWorker> {
        self.inner.claim(job_id)
    }

    /// Return a worker to idle regardless of what it was doing. A job still
    /// open on it is failed so it cannot sit in `queued` forever.
    pub async fn release(&self, worker_id: usize) -> bool {
        let (job_id, health) = {
            let mut state = self.inner.lock();
            let Some(slot) = state.workers.iter_mut().find(|w| w.id == worker_id) else {
                return false;
            };
            if slot.state == WorkerState::Idle {
                return false;
            }
            if let Some(token) = slot.cancel.take() {
                token.cancel();
            }
            let job_id = slot.current_job_id.take();
            slot.clear();
            (job_id, state.capacity_change())
        };
        self.inner.announce(health);

        if let Some(job_id) = job_id
            && self.inner.reporter.fail_or_log(&job_id, WORKER_RELEASED).await
        {
            warn!("Job {} failed: warm worker {} was released", job_id, worker_id);
        }
        true
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.lock().status()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|w| WorkerInfo {
                id: w.id,
                state: w.state,
                current_job_id: w.current_job_id.clone(),
            })
            .collect()
    }

    /// Signal the worker running `job_id` and wait a bounded time for it to
    /// stop. Without an acknowledgement the worker is released and the job
    /// is written as cancelled here, so it can never stay `queued`.
    pub async fn cancel_job(&self, job_id: &str) -> CancelAck {
        let target = {
            let mut state = self.inner.lock();
            state
                .workers
                .iter_mut()
                .find(|w| w.state == WorkerState::Busy && w.current_job_id.as_deref() == Some(job_id))
                .map(|w| (w.id, w.generation, w.cancel.clone(), w.ack.take()))
        };
        let Some((worker_id, generation, token, ack)) = target else {
            return CancelAck::NotRunning;
        };

        if let Some(token) = token {
            token.cancel();
        }
        let acknowledged = match ack {
            Some(rx) => matches!(
                tokio::time::timeout(self.inner.ack_timeout, rx).await,
                Ok(Ok(()))
            ),
            None => false,
        };
        if acknowledged {
            return CancelAck::Acknowledged;
        }

        warn!(
            "Warm worker {} did not acknowledge cancel of job {} in {:?}; forcing release",
            worker_id, job_id, self.inner.ack_timeout
        );
        self.inner.release_claim(worker_id, generation);
        if let Err(e) = self.inner.reporter.fail(job_id, CANCELLED_BY_USER).await {
            error!("Failed to mark job {} cancelled: {}", job_id, e);
        }
        CancelAck::Forced
    }

    /// Run each worker's warm-up hook. A failing warm-up is logged and the
    /// worker stays in the pool.
    pub async fn warm_up_workers(&self) {
        let ids: Vec<usize> = self.inner.lock().workers.iter().map(|w| w.id).collect();
        let mut handles = Vec::new();
        for id in ids {
            let executor = self.inner.executor.clone();
            handles.push(tokio::spawn(async move { (id, executor.prepare(id).await) }));
        }
        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => warn!("Warm worker {} failed to prepare: {}", id, e),
                Err(e) => warn!("Warm-up task crashed: {}", e),
            }
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding this lock cannot leave a slot half-written,
        // so a poisoned table is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn announce(&self, health: Option<HealthChange>) {
        if let Some(change) = health {
            info!("Warm pool health: {}", change.detail);
            self.reporter.bus().publish(EventKind::HealthChanged(change));
        }
    }

    fn claim(&self, job_id: &str) -> Option<ClaimedWorker> {
        let (claimed, health) = {
            let mut state = self.lock();
            let slot = state
                .workers
                .iter_mut()
                .find(|w| w.state == WorkerState::Idle)?;
            let token = CancellationToken::new();
            let (tx, rx) = oneshot::channel();
            slot.state = WorkerState::Busy;
            slot.current_job_id = Some(job_id.to_string());
            slot.cancel = Some(token.clone());
            slot.ack = Some(rx);
            slot.generation += 1;
            let claimed = ClaimedWorker {
                id: slot.id,
                generation: slot.generation,
                cancel: token,
                ack: tx,
            };
            (claimed, state.capacity_change())
        };
        self.announce(health);
        Some(claimed)
    }

    /// Release only if the slot still belongs to this claim.
    fn release_claim(&self, worker_id: usize, generation: u64) -> bool {
        let health = {
            let mut state = self.lock();
            let Some(slot) = state
                .workers
                .iter_mut()
                .find(|w| w.id == worker_id && w.generation == generation)
            else {
                return false;
            };
            if slot.state == WorkerState::Idle {
                return false;
            }
            slot.clear();
            state.capacity_change()
        };
        self.announce(health);
        true
    }

    async fn run_on_worker(self: Arc<Self>, worker: ClaimedWorker, job: Job) {
        let _guard = ReleaseGuard {
            pool: self.clone(),
            worker_id: worker.id,
            generation: worker.generation,
        };
        let ClaimedWorker {
            id: worker_id,
            generation,
            cancel,
            ack,
        } = worker;

        match self.reporter.start(&job.id, Some(RunnerType::Warm)).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Job {} closed before warm worker {} started it", job.id, worker_id);
                self.release_claim(worker_id, generation);
                let _ = ack.send(());
                return;
            }
            Err(e) => {
                error!("Failed to start job {}: {}", job.id, e);
                self.reporter
                    .fail_or_log(&job.id, &format!("Failed to start job: {}", e))
                    .await;
                return;
            }
        }

        info!("Job {} running on warm worker {}", job.id, worker_id);
        let executor = self.executor.clone();
        let exec_job = job.clone();
        let exec_token = cancel.clone();
        let mut handle = tokio::spawn(async move {
            executor
                .execute(ExecutionSlot::Warm(worker_id), &exec_job, exec_token)
                .await
        });

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = cancel.cancelled() => None,
        };

        match joined {
            Some(joined) => self.record(worker_id, &job, &cancel, joined).await,
            None => {
                // Cancel requested: give the executor part of the ack window to
                // wind down, then stop waiting on it. The cancel path writes
                // the terminal status.
                let grace = self.ack_timeout / 2;
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!("Warm worker {} ignored cancel of job {}; aborting", worker_id, job.id);
                    handle.abort();
                }
            }
        }

        self.release_claim(worker_id, generation);
        let _ = ack.send(());
    }

    async fn record(
        &self,
        worker_id: usize,
        job: &Job,
        cancel: &CancellationToken,
        joined: std::result::Result<Result<crate::core::jobs::JobOutcome>, JoinError>,
    ) {
        let written = match joined {
            Ok(Ok(outcome)) => self.reporter.complete(&job.id, &outcome).await,
            Ok(Err(_)) if cancel.is_cancelled() => return,
            Ok(Err(e)) => self.reporter.fail(&job.id, &e.to_string()).await,
            Err(join_err) => {
                let message = crash_message(worker_id, join_err);
                error!("{} (job {})", message, job.id);
                self.reporter.fail(&job.id, &message).await
            }
        };
        if let Err(e) = written {
            error!("Failed to record result of job {}: {}", job.id, e);
        }
    }
}

fn crash_message(worker_id: usize, join_err: JoinError) -> String {
    if !join_err.is_panic() {
        return format!("Worker {} was aborted", worker_id);
    }
    let panic = join_err.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Worker {} crashed: {}", worker_id, detail)
}

/// Frees the slot if the worker task unwinds or is dropped before its
/// normal release.
struct ReleaseGuard {
    pool: Arc<PoolInner>,
    worker_id: usize,
    generation: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.pool.release_claim(self.worker_id, self.generation);
    }
}

#[async_trait]
impl Backend for WarmPool {
    fn kind(&self) -> BackendKind {
        BackendKind::Warm
    }

    fn owns(&self, job: &Job) -> bool {
        job.runner_type == Some(RunnerType::Warm)
    }

    async fn submit(&self, job: Job) -> Submission {
        let Some(worker) = self.claim(&job.id) else {
            return Submission::Unavailable(job);
        };
        let inner = self.inner.clone();
        self.inner.tracker.spawn(inner.run_on_worker(worker, job));
        Submission::Accepted
    }

    async fn cancel(&self, job: &Job) -> Result<CancelAck> {
        Ok(self.cancel_job(&job.id).await)
    }

    async fn warm_up(&self) {
        self.warm_up_workers().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::core::jobs::{JobOptions, JobSource, JobStatus};
    use crate::core::runners::testing::{FakeAgent, wait_for_status};
    use crate::core::store::JobStore;

    async fn setup(size: usize, agent: FakeAgent) -> (WarmPool, JobReporter) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(256));
        let reporter = JobReporter::new(store, bus);
        let pool = WarmPool::new(
            size,
            reporter.clone(),
            Arc::new(agent),
            TaskTracker::new(),
            Duration::from_millis(400),
        );
        (pool, reporter)
    }

    async fn new_job(reporter: &JobReporter) -> Job {
        let job = Job::new("task", None, &JobOptions::from_source(JobSource::Api));
        reporter.store().insert_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn claim_never_exceeds_size() {
        let (pool, _) = setup(2, FakeAgent::succeed("ok")).await;
        let a = pool.claim("a").unwrap();
        let _b = pool.claim("b").unwrap();
        assert!(pool.claim("c").is_none());
        assert_eq!(
            pool.status(),
            PoolStatus {
                size: 2,
                available: 0,
                busy: 2
            }
        );

        assert!(pool.release(a.id).await);
        assert!(!pool.release(a.id).await);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn completed_job_frees_worker() {
        let (pool, reporter) = setup(1, FakeAgent::succeed("line one\nall done")).await;
        let job = new_job(&reporter).await;
        assert!(matches!(pool.submit(job.clone()).await, Submission::Accepted));

        let done = wait_for_status(reporter.store(), &job.id, JobStatus::Completed).await;
        assert_eq!(done.runner_type, Some(RunnerType::Warm));
        assert_eq!(done.summary.as_deref(), Some("all done"));
        wait_for_idle(&pool).await;
    }

    #[tokio::test]
    async fn panicking_job_fails_and_frees_worker() {
        let (pool, reporter) = setup(1, FakeAgent::panic("exploded")).await;
        let job = new_job(&reporter).await;
        pool.submit(job.clone()).await;

        let failed = wait_for_status(reporter.store(), &job.id, JobStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("Worker 0 crashed: exploded"));
        wait_for_idle(&pool).await;

        // The pool keeps working after the crash.
        let next = new_job(&reporter).await;
        assert!(pool.claim(&next.id).is_some());
    }

    #[tokio::test]
    async fn cooperative_cancel_is_acknowledged() {
        let (pool, reporter) = setup(1, FakeAgent::wait_for_cancel()).await;
        let job = new_job(&reporter).await;
        pool.submit(job.clone()).await;
        wait_for_status(reporter.store(), &job.id, JobStatus::Queued).await;

        assert_eq!(pool.cancel_job(&job.id).await, CancelAck::Acknowledged);
        assert_eq!(pool.status().available, 1);
        // The cancel path, not the worker, writes the terminal status.
        let stored = reporter.store().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn stuck_worker_is_forced_free() {
        let (pool, reporter) = setup(1, FakeAgent::ignore_cancel()).await;
        let job = new_job(&reporter).await;
        pool.submit(job.clone()).await;
        wait_for_status(reporter.store(), &job.id, JobStatus::Queued).await;

        // The ack arrives once the grace period expires and the task is
        // aborted, or the pool forces the release itself.
        let ack = pool.cancel_job(&job.id).await;
        assert!(matches!(ack, CancelAck::Acknowledged | CancelAck::Forced));
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn releasing_a_busy_worker_fails_its_job() {
        let (pool, reporter) = setup(1, FakeAgent::wait_for_cancel()).await;
        let job = new_job(&reporter).await;
        pool.submit(job.clone()).await;
        wait_for_status(reporter.store(), &job.id, JobStatus::Queued).await;

        assert!(pool.release(0).await);
        let failed = wait_for_status(reporter.store(), &job.id, JobStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some(WORKER_RELEASED));
        assert!(failed.completed_at.is_some());
        assert_eq!(pool.status().available, 1);

        // The worker is reusable straight away.
        let next = new_job(&reporter).await;
        assert!(pool.claim(&next.id).is_some());
    }

    #[tokio::test]
    async fn saturation_is_announced_once() {
        let (pool, reporter) = setup(1, FakeAgent::succeed("ok")).await;
        let mut rx = reporter.bus().subscribe();
        let worker = pool.claim("a").unwrap();
        assert!(pool.claim("b").is_none());
        pool.release(worker.id).await;

        let mut health = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventKind::HealthChanged(change) = event.kind {
                health.push(change.healthy);
            }
        }
        assert_eq!(health, [false, true]);
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_is_not_running() {
        let (pool, _) = setup(1, FakeAgent::succeed("ok")).await;
        assert_eq!(pool.cancel_job("nope").await, CancelAck::NotRunning);
    }

    async fn wait_for_idle(pool: &WarmPool) {
        for _ in 0..200 {
            if pool.status().busy == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never returned to idle: {:?}", pool.workers());
    }
}
