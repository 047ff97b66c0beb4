use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use chrono_tz::Tz;
use reqwest::Method;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::CronAction;
use crate::core::dispatch::Orchestrator;
use crate::core::jobs::{JobOptions, JobSource};
use crate::platform::{NativePlatform, Platform};

const BODY_SNIPPET_CHARS: usize = 2000;

/// Who fired an action, for templating and job attribution.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub name: String,
    pub source: JobSource,
    /// Body of the external event for triggers.
    pub payload: Option<String>,
}

impl ActionContext {
    pub fn cron(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: JobSource::Cron,
            payload: None,
        }
    }

    pub fn trigger(name: &str, payload: String) -> Self {
        Self {
            name: name.to_string(),
            source: JobSource::Trigger,
            payload: Some(payload),
        }
    }
}

/// Executes cron and trigger actions. Webhook calls share the command
/// timeout, so every action finishes in bounded time.
pub struct ActionRunner {
    orchestrator: Arc<Orchestrator>,
    http: reqwest::Client,
    workdir: PathBuf,
    command_timeout: Duration,
    tz: Tz,
}

impl ActionRunner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        workdir: PathBuf,
        command_timeout: Duration,
        tz: Tz,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("jobrelay/", env!("CARGO_PKG_VERSION")))
            .timeout(command_timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            orchestrator,
            http,
            workdir,
            command_timeout,
            tz,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// `Ok` carries the action output, if any.
    pub async fn run(&self, action: &CronAction, ctx: &ActionContext) -> Result<Option<String>> {
        match action {
            CronAction::Agent { job } => {
                let prompt = self.render(job, ctx);
                let options = JobOptions::from_source(ctx.source);
                let id = self
                    .orchestrator
                    .create_job(&prompt, options)
                    .await?;
                info!("{} '{}' created job {}", ctx.source.as_str(), ctx.name, id);
                Ok(Some(format!("Created job {}", id)))
            }
            CronAction::Command { command } => self.run_command(&self.render(command, ctx)).await,
            CronAction::Webhook {
                url,
                method,
                headers,
                vars,
            } => self.call_webhook(url, method, headers, vars, ctx).await,
        }
    }

    /// Replace `{{name}}`, `{{datetime}}` and `{{payload}}`.
    pub fn render(&self, template: &str, ctx: &ActionContext) -> String {
        let now = Utc::now().with_timezone(&self.tz).to_rfc3339();
        template
            .replace("{{name}}", &ctx.name)
            .replace("{{datetime}}", &now)
            .replace("{{payload}}", ctx.payload.as_deref().unwrap_or_default())
    }

    async fn run_command(&self, command: &str) -> Result<Option<String>> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .with_context(|| format!("Cannot create {}", self.workdir.display()))?;
        let mut cmd = NativePlatform::shell_inline(command);
        cmd.current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(e).context("Failed to spawn command"),
            Err(_) => bail!("Command timed out after {:?}", self.command_timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(Some(stdout).filter(|s| !s.is_empty()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            bail!("Command failed with {}", output.status);
        }
        Err(anyhow!(stderr))
    }

    async fn call_webhook(
        &self,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
        vars: &BTreeMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<Option<String>> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| anyhow!("Invalid HTTP method '{}'", method))?;
        let vars: BTreeMap<&str, String> = vars
            .iter()
            .map(|(k, v)| (k.as_str(), self.render(v, ctx)))
            .collect();

        let mut request = self.http.request(method.clone(), self.render(url, ctx));
        for (name, value) in headers {
            request = request.header(name.as_str(), self.render(value, ctx));
        }
        request = if method == Method::GET {
            request.query(&vars)
        } else {
            request.json(&vars)
        };

        let response = request
            .send()
            .await
            .context("Webhook request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        let summary = format!("HTTP {} {}", status.as_u16(), snippet)
            .trim_end()
            .to_string();
        if status.is_success() {
            Ok(Some(summary))
        } else {
            Err(anyhow!(summary))
        }
    }
}
