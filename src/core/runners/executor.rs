use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::jobs::{Job, JobOutcome};
use crate::platform::{NativePlatform, Platform};

/// Error text an executor returns after honouring a cancellation.
pub const EXECUTION_CANCELLED: &str = "Execution cancelled";

const ERROR_TAIL_CHARS: usize = 2000;

/// Where a job executes: a pre-warmed worker or a one-off local unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionSlot {
    Warm(usize),
    Local,
}

/// Boundary to the agent that actually does the work. Runners own status
/// bookkeeping; an executor only turns a prompt into output.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Warm-up hook run once per warm worker before it takes jobs.
    async fn prepare(&self, _worker_id: usize) -> Result<()> {
        Ok(())
    }

    /// Run `job` to completion. Must return promptly once `cancel` fires.
    async fn execute(
        &self,
        slot: ExecutionSlot,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<JobOutcome>;
}

/// Runs the configured agent command through the platform shell.
///
/// The prompt is written to stdin and also exposed as `JOB_PROMPT`. Warm
/// workers reuse `workers/warm-<n>`; local runs get a scratch directory
/// under `runs/` that is removed afterwards.
pub struct ShellAgent {
    command: Option<String>,
    warmup_command: Option<String>,
    root: PathBuf,
}

impl ShellAgent {
    pub fn new(command: Option<String>, warmup_command: Option<String>, root: PathBuf) -> Self {
        Self {
            command,
            warmup_command,
            root,
        }
    }

    fn worker_dir(&self, worker_id: usize) -> PathBuf {
        self.root.join("workers").join(format!("warm-{}", worker_id))
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: &PathBuf,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let mut cmd = NativePlatform::shell_inline(command);
        cmd.current_dir(cwd)
            .env("JOB_ID", &job.id)
            .env("JOB_PROMPT", job.effective_prompt())
            .env("JOB_SOURCE", job.source.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = job.effective_prompt().to_string();
            tokio::spawn(async move {
                // Agents that never read stdin close the pipe early.
                let _ = stdin.write_all(prompt.as_bytes()).await;
            });
        }

        let stdout_reader = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill agent for job {}: {}", job.id, e);
                }
                return Err(anyhow!(EXECUTION_CANCELLED));
            }
        };

        let stdout = match stdout_reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(anyhow!("Agent exited with {}: {}", code, tail(detail)));
        }
        Ok(JobOutcome::from_output(&stdout))
    }
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= ERROR_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - ERROR_TAIL_CHARS).collect()
}

#[async_trait]
impl AgentExecutor for ShellAgent {
    async fn prepare(&self, worker_id: usize) -> Result<()> {
        let dir = self.worker_dir(worker_id);
        tokio::fs::create_dir_all(&dir).await?;
        let Some(warmup) = self.warmup_command.as_deref() else {
            return Ok(());
        };
        let output = NativePlatform::shell_inline(warmup)
            .current_dir(&dir)
            .env("WORKER_ID", worker_id.to_string())
            .output()
            .await?;
        if !output.status.success() {
            return Err(anyhow!(
                "Warm-up for worker {} failed: {}",
                worker_id,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        info!("Warm worker {} ready", worker_id);
        Ok(())
    }

    async fn execute(
        &self,
        slot: ExecutionSlot,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        let Some(command) = self.command.as_deref() else {
            return Err(anyhow!("No agent command configured ([agent] command)"));
        };

        match slot {
            ExecutionSlot::Warm(worker_id) => {
                let dir = self.worker_dir(worker_id);
                tokio::fs::create_dir_all(&dir).await?;
                self.run_command(command, &dir, job, &cancel).await
            }
            ExecutionSlot::Local => {
                let dir = self.root.join("runs").join(&job.id);
                tokio::fs::create_dir_all(&dir).await?;
                let result = self.run_command(command, &dir, job, &cancel).await;
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!("Failed to clean run dir {:?}: {}", dir, e);
                }
                result
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::jobs::{JobOptions, JobSource};
    use std::time::Duration;

    fn job(prompt: &str) -> Job {
        Job::new(prompt, None, &JobOptions::from_source(JobSource::Api))
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ShellAgent::new(Some("cat".into()), None, dir.path().to_path_buf());
        let outcome = agent
            .execute(ExecutionSlot::Local, &job("hello agent"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.result, "hello agent");
        assert_eq!(outcome.summary.as_deref(), Some("hello agent"));
        assert!(!dir.path().join("runs").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ShellAgent::new(
            Some("echo boom >&2; exit 3".into()),
            None,
            dir.path().to_path_buf(),
        );
        let err = agent
            .execute(ExecutionSlot::Warm(0), &job("x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Agent exited with 3: boom");
        assert!(dir.path().join("workers").join("warm-0").is_dir());
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ShellAgent::new(Some("sleep 30".into()), None, dir.path().to_path_buf());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = agent
            .execute(ExecutionSlot::Local, &job("x"), token)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), EXECUTION_CANCELLED);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_command_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ShellAgent::new(None, None, dir.path().to_path_buf());
        assert!(
            agent
                .execute(ExecutionSlot::Local, &job("x"), CancellationToken::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn warmup_runs_in_worker_dir() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ShellAgent::new(
            Some("cat".into()),
            Some("touch ready-$WORKER_ID".into()),
            dir.path().to_path_buf(),
        );
        agent.prepare(1).await.unwrap();
        assert!(dir.path().join("workers/warm-1/ready-1").exists());
    }
}
