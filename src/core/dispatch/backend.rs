use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::core::jobs::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Warm,
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Warm => "warm",
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

/// Result of offering a job to a backend.
#[derive(Debug)]
pub enum Submission {
    /// The backend owns the job from now on.
    Accepted,
    /// No capacity; the job is handed back for the next backend.
    Unavailable(Job),
}

/// How a backend answered a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// Execution was told to stop and confirmed it did.
    Acknowledged,
    /// Execution did not confirm in time; the backend already wrote the
    /// job as cancelled.
    Forced,
    /// Nothing was running for this job here.
    NotRunning,
}

/// An execution strategy the dispatcher can hand jobs to.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend executes (or executed) `job`.
    fn owns(&self, job: &Job) -> bool;

    /// Take ownership of `job` and start it off the calling path.
    async fn submit(&self, job: Job) -> Submission;

    /// Best-effort stop of `job`.
    async fn cancel(&self, job: &Job) -> Result<CancelAck>;

    /// One-time preparation at startup.
    async fn warm_up(&self) {}
}
