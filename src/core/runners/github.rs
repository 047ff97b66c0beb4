use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::info;

use crate::core::config::RemoteConfig;
use crate::core::jobs::Job;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowRun {
    pub id: u64,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: String,
    /// Set once `status` is `completed`: `success`, `failure`, `cancelled`, ...
    pub conclusion: Option<String>,
    pub html_url: String,
}

impl WorkflowRun {
    pub fn is_finished(&self) -> bool {
        self.status == "completed"
    }
}

/// The operations the remote runner needs from a CI host.
#[async_trait]
pub trait CiClient: Send + Sync {
    /// Create `branch` from the configured base branch head.
    async fn create_branch(&self, branch: &str) -> Result<()>;

    /// Commit the job file onto `branch` and start the workflow.
    async fn trigger(&self, branch: &str, job: &Job) -> Result<()>;

    /// Newest workflow run for `branch`, if any has started.
    async fn find_run_for_branch(&self, branch: &str) -> Result<Option<WorkflowRun>>;

    /// Ask the CI host to stop a run. Already-finished runs are not an error.
    async fn cancel_run(&self, run_id: u64) -> Result<()>;

    /// URL of a pull request opened from `branch`.
    async fn find_pull_request(&self, branch: &str) -> Result<Option<String>>;
}

/// GitHub REST implementation of [`CiClient`].
pub struct GitHubClient {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    base_branch: String,
    jobs_dir: String,
    workflow: Option<String>,
    token: String,
}

impl GitHubClient {
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("Remote runner needs a token in ${}", config.token_env))?;
        Self::new(config, token)
    }

    /// Every API call is bounded by `request_timeout_secs`.
    pub fn new(config: &RemoteConfig, token: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("jobrelay/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build GitHub client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            base_branch: config.base_branch.clone(),
            jobs_dir: config.jobs_dir.trim_matches('/').to_string(),
            workflow: config.workflow.clone(),
            token,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, self.owner, self.repo, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json(&self, url: String) -> Result<serde_json::Value> {
        let value = self
            .authed(self.client.get(&url))
            .send()
            .await
            .context("Failed to reach GitHub API")?
            .error_for_status()
            .with_context(|| format!("GitHub API error for {}", url))?
            .json()
            .await?;
        Ok(value)
    }
}

/// Markdown body committed to `<jobs_dir>/<job_id>/job.md`.
pub fn job_file_contents(job: &Job) -> String {
    format!(
        "# Job {}\n\nsource: {}\ncreated: {}\n\n{}\n",
        job.id,
        job.source.as_str(),
        job.created_at.to_rfc3339(),
        job.effective_prompt()
    )
}

#[async_trait]
impl CiClient for GitHubClient {
    async fn create_branch(&self, branch: &str) -> Result<()> {
        let base = self
            .get_json(self.repo_url(&format!("git/ref/heads/{}", self.base_branch)))
            .await?;
        let sha = base["object"]["sha"]
            .as_str()
            .context("Missing object.sha for base branch")?;

        self.authed(self.client.post(self.repo_url("git/refs")))
            .json(&serde_json::json!({
                "ref": format!("refs/heads/{}", branch),
                "sha": sha,
            }))
            .send()
            .await
            .context("Failed to reach GitHub API")?
            .error_for_status()
            .with_context(|| format!("Failed to create branch {}", branch))?;
        info!("Created branch {} from {}", branch, self.base_branch);
        Ok(())
    }

    async fn trigger(&self, branch: &str, job: &Job) -> Result<()> {
        let path = format!("{}/{}/job.md", self.jobs_dir, job.id);
        let content = base64::engine::general_purpose::STANDARD.encode(job_file_contents(job));
        self.authed(self.client.put(self.repo_url(&format!("contents/{}", path))))
            .json(&serde_json::json!({
                "message": format!("job: {}", job.id),
                "content": content,
                "branch": branch,
            }))
            .send()
            .await
            .context("Failed to reach GitHub API")?
            .error_for_status()
            .with_context(|| format!("Failed to commit {}", path))?;

        if let Some(workflow) = &self.workflow {
            self.authed(
                self.client
                    .post(self.repo_url(&format!("actions/workflows/{}/dispatches", workflow))),
            )
            .json(&serde_json::json!({
                "ref": branch,
                "inputs": { "job_id": job.id },
            }))
            .send()
            .await
            .context("Failed to reach GitHub API")?
            .error_for_status()
            .with_context(|| format!("Failed to dispatch workflow {}", workflow))?;
        }
        Ok(())
    }

    async fn find_run_for_branch(&self, branch: &str) -> Result<Option<WorkflowRun>> {
        let runs = self
            .get_json(self.repo_url(&format!("actions/runs?branch={}&per_page=1", branch)))
            .await?;
        let Some(run) = runs["workflow_runs"].as_array().and_then(|r| r.first()) else {
            return Ok(None);
        };
        Ok(Some(WorkflowRun {
            id: run["id"].as_u64().context("Missing run id")?,
            status: run["status"].as_str().unwrap_or("unknown").to_string(),
            conclusion: run["conclusion"].as_str().map(str::to_string),
            html_url: run["html_url"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn cancel_run(&self, run_id: u64) -> Result<()> {
        let response = self
            .authed(
                self.client
                    .post(self.repo_url(&format!("actions/runs/{}/cancel", run_id))),
            )
            .send()
            .await
            .context("Failed to reach GitHub API")?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // 409: the run already finished.
            status if status == StatusCode::CONFLICT => Ok(()),
            status => Err(anyhow!("Cancel of run {} returned {}", run_id, status)),
        }
    }

    async fn find_pull_request(&self, branch: &str) -> Result<Option<String>> {
        let pulls = self
            .get_json(self.repo_url(&format!(
                "pulls?head={}:{}&state=all&per_page=1",
                self.owner, branch
            )))
            .await?;
        Ok(pulls
            .as_array()
            .and_then(|p| p.first())
            .and_then(|p| p["html_url"].as_str())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{JobOptions, JobSource};

    #[test]
    fn job_file_carries_prompt_and_metadata() {
        let job = Job::new(
            "fix the flaky test",
            None,
            &JobOptions::from_source(JobSource::Trigger),
        );
        let body = job_file_contents(&job);
        assert!(body.starts_with(&format!("# Job {}", job.id)));
        assert!(body.contains("source: trigger"));
        assert!(body.trim_end().ends_with("fix the flaky test"));
    }

    #[test]
    fn run_is_finished_only_when_completed() {
        let mut run = WorkflowRun {
            id: 1,
            status: "in_progress".into(),
            conclusion: None,
            html_url: String::new(),
        };
        assert!(!run.is_finished());
        run.status = "completed".into();
        assert!(run.is_finished());
    }

    #[tokio::test]
    async fn stalled_api_call_fails_within_request_timeout() {
        use axum::Router;
        use axum::routing::get;
        use std::time::Duration;

        let app = Router::new().route(
            "/repos/{owner}/{repo}/actions/runs",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "{}"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = RemoteConfig {
            enabled: true,
            api_base: format!("http://{}", addr),
            owner: "acme".into(),
            repo: "widgets".into(),
            request_timeout_secs: 1,
            ..RemoteConfig::default()
        };
        let client = GitHubClient::new(&config, "token".into()).unwrap();
        let lookup = tokio::time::timeout(
            Duration::from_secs(10),
            client.find_run_for_branch("job/abc"),
        )
        .await
        .expect("GitHub call was not bounded");
        assert!(lookup.is_err());
    }
}
