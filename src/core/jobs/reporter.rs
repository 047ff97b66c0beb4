use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Job, JobOutcome, JobStatus, RunnerType};
use crate::core::events::{EventBus, EventKind, Notification};
use crate::core::store::JobStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub branch: Option<String>,
    pub run_url: Option<String>,
    pub pr_url: Option<String>,
}

/// Writes job status to the store and announces each change on the bus.
///
/// Every status write is conditional on the job still being open, and an
/// event is published only when the write took effect. This is what keeps
/// per-job event order at `created -> updated* -> completed|failed`.
#[derive(Clone)]
pub struct JobReporter {
    store: Arc<JobStore>,
    bus: Arc<EventBus>,
}

impl JobReporter {
    pub fn new(store: Arc<JobStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// created -> queued. `Ok(false)` means the job was already closed and
    /// the caller must not run it.
    pub async fn start(&self, job_id: &str, runner: Option<RunnerType>) -> Result<bool> {
        if !self.store.mark_queued(job_id, runner).await? {
            return Ok(false);
        }
        if let Some(job) = self.store.get_job(job_id).await? {
            self.bus.publish(EventKind::JobUpdated(job));
        }
        Ok(true)
    }

    pub async fn record_remote(&self, job_id: &str, info: &RemoteInfo) -> Result<bool> {
        let written = self
            .store
            .update_remote(
                job_id,
                info.branch.as_deref(),
                info.run_url.as_deref(),
                info.pr_url.as_deref(),
            )
            .await?;
        if written && let Some(job) = self.store.get_job(job_id).await? {
            self.bus.publish(EventKind::JobUpdated(job));
        }
        Ok(written)
    }

    pub async fn complete(&self, job_id: &str, outcome: &JobOutcome) -> Result<bool> {
        self.finish(job_id, JobStatus::Completed, Some(outcome), None)
            .await
    }

    pub async fn fail(&self, job_id: &str, error: &str) -> Result<bool> {
        self.finish(job_id, JobStatus::Failed, None, Some(error))
            .await
    }

    /// `fail` for paths that have no caller to hand an error back to. A store
    /// error is logged and reported as "not written".
    pub async fn fail_or_log(&self, job_id: &str, error: &str) -> bool {
        match self.fail(job_id, error).await {
            Ok(written) => written,
            Err(e) => {
                error!("Failed to record failure of job {}: {:#}", job_id, e);
                false
            }
        }
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        outcome: Option<&JobOutcome>,
        error: Option<&str>,
    ) -> Result<bool> {
        if !self
            .store
            .finish_job(job_id, status, outcome, error)
            .await?
        {
            return Ok(false);
        }

        let Some(job) = self.store.get_job(job_id).await? else {
            warn!("Job {} vanished right after its terminal write", job_id);
            return Ok(true);
        };

        info!("Job {} -> {}", job_id, status.as_str());
        let notification = notification_for(&job);
        let kind = match status {
            JobStatus::Completed => EventKind::JobCompleted(job),
            _ => EventKind::JobFailed(job),
        };
        self.bus.publish(kind);
        self.bus.publish(EventKind::Notification(notification));
        Ok(true)
    }
}

fn notification_for(job: &Job) -> Notification {
    let (title, body) = match job.status {
        JobStatus::Completed => (
            "Job completed".to_string(),
            job.summary
                .clone()
                .unwrap_or_else(|| "Finished without a summary".to_string()),
        ),
        _ => (
            "Job failed".to_string(),
            job.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
        ),
    };
    Notification {
        title,
        body,
        job_id: Some(job.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{CANCELLED_BY_USER, JobOptions, JobSource};

    async fn setup() -> (JobReporter, Job) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(64));
        let job = Job::new("x", None, &JobOptions::from_source(JobSource::Api));
        store.insert_job(&job).await.unwrap();
        (JobReporter::new(store, bus), job)
    }

    #[tokio::test]
    async fn only_first_terminal_write_publishes() {
        let (reporter, job) = setup().await;
        let mut rx = reporter.bus().subscribe();

        assert!(reporter.start(&job.id, Some(RunnerType::Local)).await.unwrap());
        assert!(
            reporter
                .complete(&job.id, &JobOutcome::from_output("done"))
                .await
                .unwrap()
        );
        assert!(!reporter.fail(&job.id, CANCELLED_BY_USER).await.unwrap());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, ["job:updated", "job:completed", "notification"]);
    }

    #[tokio::test]
    async fn start_refuses_closed_job() {
        let (reporter, job) = setup().await;
        assert!(reporter.fail(&job.id, CANCELLED_BY_USER).await.unwrap());
        assert!(!reporter.start(&job.id, Some(RunnerType::Warm)).await.unwrap());

        let stored = reporter.store().get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.runner_type, None);
    }

    #[tokio::test]
    async fn fail_or_log_survives_a_broken_store() {
        let (reporter, job) = setup().await;
        assert!(reporter.fail_or_log(&job.id, "agent exited with 1").await);
        assert!(!reporter.fail_or_log(&job.id, "second failure").await);

        reporter.store().drop_jobs_table().await;
        assert!(reporter.fail(&job.id, "store gone").await.is_err());
        assert!(!reporter.fail_or_log(&job.id, "store gone").await);
    }

    #[tokio::test]
    async fn failure_notification_carries_error() {
        let (reporter, job) = setup().await;
        let mut rx = reporter.bus().subscribe();
        reporter.fail(&job.id, "agent exited with 3").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "job:failed");
        match rx.recv().await.unwrap().kind {
            EventKind::Notification(n) => {
                assert_eq!(n.title, "Job failed");
                assert_eq!(n.body, "agent exited with 3");
                assert_eq!(n.job_id.as_deref(), Some(job.id.as_str()));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
