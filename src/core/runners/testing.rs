//! Fakes shared by runner and dispatcher tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::executor::{AgentExecutor, EXECUTION_CANCELLED, ExecutionSlot};
use super::github::{CiClient, WorkflowRun};
use crate::core::jobs::{Job, JobOutcome, JobStatus};
use crate::core::store::JobStore;

#[derive(Clone)]
enum Behavior {
    Succeed(String),
    Fail(String),
    Panic(String),
    WaitForCancel,
    IgnoreCancel,
    Sleep(Duration),
}

#[derive(Clone)]
pub struct FakeAgent {
    behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
}

impl FakeAgent {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeed(output: &str) -> Self {
        Self::with(Behavior::Succeed(output.to_string()))
    }

    pub fn fail(error: &str) -> Self {
        Self::with(Behavior::Fail(error.to_string()))
    }

    pub fn panic(message: &str) -> Self {
        Self::with(Behavior::Panic(message.to_string()))
    }

    pub fn wait_for_cancel() -> Self {
        Self::with(Behavior::WaitForCancel)
    }

    pub fn ignore_cancel() -> Self {
        Self::with(Behavior::IgnoreCancel)
    }

    pub fn sleep(duration: Duration) -> Self {
        Self::with(Behavior::Sleep(duration))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for FakeAgent {
    async fn execute(
        &self,
        _slot: ExecutionSlot,
        _job: &Job,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed(output) => Ok(JobOutcome::from_output(output)),
            Behavior::Fail(error) => Err(anyhow!(error.clone())),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                Err(anyhow!(EXECUTION_CANCELLED))
            }
            Behavior::IgnoreCancel => std::future::pending::<Result<JobOutcome>>().await,
            Behavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(JobOutcome::from_output("slept")),
                    _ = cancel.cancelled() => Err(anyhow!(EXECUTION_CANCELLED)),
                }
            }
        }
    }
}

/// Poll the store until `job_id` reaches `status` or give up after ~5s.
pub async fn wait_for_status(store: &JobStore, job_id: &str, status: JobStatus) -> Job {
    for _ in 0..500 {
        if let Some(job) = store.get_job(job_id).await.unwrap()
            && job.status == status
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", job_id, status);
}

/// In-memory CI host.
#[derive(Default)]
pub struct FakeCi {
    pub branches: Mutex<Vec<String>>,
    pub run: Mutex<Option<WorkflowRun>>,
    pub cancelled: Mutex<Vec<u64>>,
    pub fail_trigger: bool,
    pub fail_cancel: bool,
    /// Run lookups never return.
    pub hang_lookup: bool,
}

impl FakeCi {
    /// A CI host whose newest run is run 77 in `status`.
    pub fn with_run(status: &str, conclusion: Option<&str>) -> Self {
        Self {
            run: Mutex::new(Some(WorkflowRun {
                id: 77,
                status: status.to_string(),
                conclusion: conclusion.map(str::to_string),
                html_url: "https://ci.test/runs/77".to_string(),
            })),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CiClient for FakeCi {
    async fn create_branch(&self, branch: &str) -> Result<()> {
        self.branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn trigger(&self, _branch: &str, _job: &Job) -> Result<()> {
        if self.fail_trigger {
            anyhow::bail!("workflow not found");
        }
        Ok(())
    }

    async fn find_run_for_branch(&self, _branch: &str) -> Result<Option<WorkflowRun>> {
        if self.hang_lookup {
            std::future::pending::<()>().await;
        }
        Ok(self.run.lock().unwrap().clone())
    }

    async fn cancel_run(&self, run_id: u64) -> Result<()> {
        if self.fail_cancel {
            anyhow::bail!("connection reset by peer");
        }
        self.cancelled.lock().unwrap().push(run_id);
        Ok(())
    }

    async fn find_pull_request(&self, branch: &str) -> Result<Option<String>> {
        Ok(Some(format!("https://ci.test/pr/{}", branch)))
    }
}
