use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::executor::{AgentExecutor, ExecutionSlot};
use crate::core::dispatch::{Backend, BackendKind, CancelAck, Submission};
use crate::core::jobs::{Job, JobReporter, RunnerType};

/// How long a cancelled run may take to wind down before it is abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// One transient execution unit per job. Concurrency is not limited here.
pub struct LocalRunner {
    reporter: JobReporter,
    executor: Arc<dyn AgentExecutor>,
    tracker: TaskTracker,
    timeout: Option<Duration>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LocalRunner {
    pub fn new(
        reporter: JobReporter,
        executor: Arc<dyn AgentExecutor>,
        tracker: TaskTracker,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            reporter,
            executor,
            tracker,
            timeout,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start `job` in the background.
    pub fn run(&self, job: Job) {
        let token = CancellationToken::new();
        lock(&self.running).insert(job.id.clone(), token.clone());

        let reporter = self.reporter.clone();
        let executor = self.executor.clone();
        let running = self.running.clone();
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            execute_local(&reporter, executor, &job, token, timeout).await;
            lock(&running).remove(&job.id);
        });
    }

    /// Stop the unit running `job_id`. Returns false if nothing is running.
    pub fn cancel_local_job(&self, job_id: &str) -> bool {
        match lock(&self.running).remove(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn execute_local(
    reporter: &JobReporter,
    executor: Arc<dyn AgentExecutor>,
    job: &Job,
    token: CancellationToken,
    timeout: Option<Duration>,
) {
    match reporter.start(&job.id, Some(RunnerType::Local)).await {
        Ok(true) => {}
        Ok(false) => {
            info!("Job {} closed before the local runner started it", job.id);
            return;
        }
        Err(e) => {
            error!("Failed to start job {}: {}", job.id, e);
            reporter
                .fail_or_log(&job.id, &format!("Failed to start job: {}", e))
                .await;
            return;
        }
    }

    info!("Job {} running locally", job.id);
    let exec_job = job.clone();
    let exec_token = token.clone();
    let mut handle = tokio::spawn(async move {
        executor
            .execute(ExecutionSlot::Local, &exec_job, exec_token)
            .await
    });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let written = tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(outcome)) => reporter.complete(&job.id, &outcome).await,
            Ok(Err(_)) if token.is_cancelled() => return,
            Ok(Err(e)) => reporter.fail(&job.id, &e.to_string()).await,
            Err(join_err) => {
                reporter
                    .fail(&job.id, &format!("Local run crashed: {}", join_err))
                    .await
            }
        },
        _ = token.cancelled() => {
            if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                warn!("Local run of job {} ignored cancel; aborting", job.id);
                handle.abort();
            }
            return;
        }
        _ = deadline => {
            token.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
            let limit = timeout.unwrap_or_default();
            reporter
                .fail(&job.id, &format!("Timed out after {:?}", limit))
                .await
        }
    };

    if let Err(e) = written {
        error!("Failed to record result of job {}: {}", job.id, e);
    }
}

#[async_trait]
impl Backend for LocalRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn owns(&self, job: &Job) -> bool {
        job.runner_type == Some(RunnerType::Local)
    }

    async fn submit(&self, job: Job) -> Submission {
        self.run(job);
        Submission::Accepted
    }

    async fn cancel(&self, job: &Job) -> Result<CancelAck> {
        Ok(if self.cancel_local_job(&job.id) {
            CancelAck::Acknowledged
        } else {
            CancelAck::NotRunning
        })
    }
}
