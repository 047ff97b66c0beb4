use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::github::{CiClient, WorkflowRun};
use crate::core::dispatch::{Backend, BackendKind, CancelAck, Submission};
use crate::core::jobs::{Job, JobOutcome, JobReporter, RemoteInfo};

/// Branch that correlates a job with its CI run.
pub fn branch_for(job_id: &str) -> String {
    format!("job/{}", job_id)
}

/// Runs jobs as CI workflow runs on a dedicated branch per job.
///
/// Nothing here polls continuously. Status moves only when `refresh` is
/// called or when something else writes the job record.
#[derive(Clone)]
pub struct RemoteRunner {
    reporter: JobReporter,
    client: Arc<dyn CiClient>,
    tracker: TaskTracker,
}

impl RemoteRunner {
    pub fn new(reporter: JobReporter, client: Arc<dyn CiClient>, tracker: TaskTracker) -> Self {
        Self {
            reporter,
            client,
            tracker,
        }
    }

    /// Record the branch on the job, create it and start the workflow.
    /// Returns the branch name. A job closed before dispatch is left alone.
    pub async fn dispatch(&self, job: &Job) -> Result<String> {
        dispatch_job(&self.reporter, self.client.as_ref(), job).await
    }

    pub async fn find_workflow_run_for_branch(&self, branch: &str) -> Result<Option<WorkflowRun>> {
        self.client.find_run_for_branch(branch).await
    }

    pub async fn cancel_workflow_run(&self, run_id: u64) -> Result<()> {
        self.client.cancel_run(run_id).await
    }

    /// Derive job status from the branch's newest run and write it back.
    pub async fn refresh(&self, job: &Job) -> Result<Job> {
        let Some(branch) = job.branch.as_deref() else {
            return Ok(job.clone());
        };
        if job.is_terminal() {
            return Ok(job.clone());
        }
        let Some(run) = self.find_workflow_run_for_branch(branch).await? else {
            return Ok(job.clone());
        };

        let pr_url = match self.client.find_pull_request(branch).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Pull request lookup for {} failed: {}", branch, e);
                None
            }
        };
        self.reporter
            .record_remote(
                &job.id,
                &RemoteInfo {
                    branch: None,
                    run_url: Some(run.html_url.clone()).filter(|u| !u.is_empty()),
                    pr_url,
                },
            )
            .await?;

        if run.is_finished() {
            let conclusion = run.conclusion.as_deref().unwrap_or("unknown");
            if conclusion == "success" {
                let outcome = JobOutcome {
                    summary: Some(format!("Workflow run {} succeeded", run.id)),
                    result: run.html_url.clone(),
                };
                self.reporter.complete(&job.id, &outcome).await?;
            } else {
                self.reporter
                    .fail(&job.id, &format!("Workflow run {} concluded: {}", run.id, conclusion))
                    .await?;
            }
        }

        Ok(self
            .reporter
            .store()
            .get_job(&job.id)
            .await?
            .unwrap_or_else(|| job.clone()))
    }
}

async fn dispatch_job(reporter: &JobReporter, client: &dyn CiClient, job: &Job) -> Result<String> {
    let branch = branch_for(&job.id);
    let info = RemoteInfo {
        branch: Some(branch.clone()),
        ..RemoteInfo::default()
    };
    if !reporter.record_remote(&job.id, &info).await? || !reporter.start(&job.id, None).await? {
        info!("Job {} closed before remote dispatch", job.id);
        return Ok(branch);
    }

    client.create_branch(&branch).await?;
    client.trigger(&branch, job).await?;
    info!("Job {} dispatched to CI on {}", job.id, branch);
    Ok(branch)
}

#[async_trait]
impl Backend for RemoteRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn owns(&self, job: &Job) -> bool {
        job.is_remote()
    }

    async fn submit(&self, job: Job) -> Submission {
        let runner = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = runner.dispatch(&job).await {
                error!("Remote dispatch of job {} failed: {:#}", job.id, e);
                runner
                    .reporter
                    .fail_or_log(&job.id, &format!("Remote dispatch failed: {}", e))
                    .await;
            }
        });
        Submission::Accepted
    }

    async fn cancel(&self, job: &Job) -> Result<CancelAck> {
        let Some(branch) = job.branch.as_deref() else {
            return Ok(CancelAck::NotRunning);
        };
        match self.find_workflow_run_for_branch(branch).await? {
            Some(run) if !run.is_finished() => {
                self.cancel_workflow_run(run.id).await?;
                Ok(CancelAck::Acknowledged)
            }
            _ => Ok(CancelAck::NotRunning),
        }
    }
}
