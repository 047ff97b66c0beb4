//! Event-driven counterparts of cron entries. An external system posts to
//! `/api/triggers/{source}` and every enabled trigger registered for that
//! source runs its actions with the request body as `{{payload}}`.

use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::cron::{ActionContext, ActionRunner, CronAction, load_json_list, save_json_list};
use crate::core::error::{OrchestratorError, OrchestratorResult};

type HmacSha256 = Hmac<Sha256>;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    pub source: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub actions: Vec<CronAction>,
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.source.is_empty()
            || !self
                .source
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(
                "source must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            );
        }
        if self.actions.is_empty() {
            return Err("at least one action is required".to_string());
        }
        self.actions.iter().try_for_each(CronAction::validate)
    }

    fn requires_signature(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// What API listings show: the secret itself never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerSummary {
    pub name: String,
    pub source: String,
    pub enabled: bool,
    pub signed: bool,
    pub actions: Vec<CronAction>,
}

impl From<&TriggerConfig> for TriggerSummary {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            name: config.name.clone(),
            source: config.source.clone(),
            enabled: config.enabled,
            signed: config.requires_signature(),
            actions: config.actions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    pub action: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerFiring {
    pub trigger: String,
    pub actions: Vec<ActionReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct FireReport {
    pub fired: Vec<TriggerFiring>,
    /// Triggers skipped because the request signature did not verify.
    pub rejected: usize,
}

/// Check an HMAC-SHA256 hex signature over `body`. Accepts the bare hex
/// digest or the `sha256=` prefixed form.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, the value senders put in `X-Signature`.
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow::anyhow!("invalid HMAC key"))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Triggers kept in `triggers.json`.
pub struct TriggerRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
    actions: Arc<ActionRunner>,
}

impl TriggerRegistry {
    pub fn new(path: impl Into<PathBuf>, actions: Arc<ActionRunner>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            actions,
        }
    }

    pub fn in_data_dir(data_dir: &Path, actions: Arc<ActionRunner>) -> Self {
        Self::new(data_dir.join("triggers.json"), actions)
    }

    pub async fn list(&self) -> Result<Vec<TriggerConfig>> {
        load_json_list(&self.path).await
    }

    pub async fn add(&self, trigger: TriggerConfig) -> OrchestratorResult<()> {
        trigger.validate().map_err(OrchestratorError::InvalidInput)?;
        let _guard = self.write_lock.lock().await;
        let mut triggers = self.list().await?;
        if triggers.iter().any(|t| t.name == trigger.name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "trigger '{}' already exists",
                trigger.name
            )));
        }
        info!("Registered trigger '{}' for source '{}'", trigger.name, trigger.source);
        triggers.push(trigger);
        save_json_list(&self.path, &triggers).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> OrchestratorResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut triggers = self.list().await?;
        let before = triggers.len();
        triggers.retain(|t| t.name != name);
        if triggers.len() == before {
            return Err(OrchestratorError::NotFound(format!("trigger {}", name)));
        }
        save_json_list(&self.path, &triggers).await?;
        Ok(())
    }

    /// Run every enabled trigger registered for `source`. Signed triggers
    /// only run when `signature` verifies against their secret.
    pub async fn fire(
        &self,
        source: &str,
        body: &str,
        signature: Option<&str>,
    ) -> OrchestratorResult<FireReport> {
        let candidates: Vec<TriggerConfig> = self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.enabled && t.source == source)
            .collect();
        if candidates.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "no enabled trigger for source {}",
                source
            )));
        }

        let mut report = FireReport::default();
        for trigger in candidates {
            if let Some(secret) = trigger.secret.as_deref().filter(|s| !s.is_empty()) {
                let verified = signature.is_some_and(|sig| verify_signature(secret, body.as_bytes(), sig));
                if !verified {
                    warn!("Trigger '{}' rejected: signature verification failed", trigger.name);
                    report.rejected += 1;
                    continue;
                }
            }

            info!("Trigger '{}' fired by source '{}'", trigger.name, source);
            let ctx = ActionContext::trigger(&trigger.name, body.to_string());
            let mut actions = Vec::with_capacity(trigger.actions.len());
            for action in &trigger.actions {
                let result = self.actions.run(action, &ctx).await;
                if let Err(e) = &result {
                    warn!("Trigger '{}' {} action failed: {:#}", trigger.name, action.kind(), e);
                }
                actions.push(match result {
                    Ok(output) => ActionReport {
                        action: action.kind(),
                        success: true,
                        output,
                        error: None,
                    },
                    Err(error) => ActionReport {
                        action: action.kind(),
                        success: false,
                        output: None,
                        error: Some(format!("{:#}", error)),
                    },
                });
            }
            report.fired.push(TriggerFiring {
                trigger: trigger.name,
                actions,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::Orchestrator;
    use crate::core::events::EventBus;
    use crate::core::jobs::{JobReporter, JobSource};
    use crate::core::runners::LocalRunner;
    use crate::core::runners::testing::FakeAgent;
    use crate::core::store::JobStore;
    use std::time::Duration;
    use tokio_util::task::TaskTracker;

    fn registry(dir: &Path) -> (TriggerRegistry, Arc<Orchestrator>) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let reporter = JobReporter::new(store, Arc::new(EventBus::new(64)));
        let tracker = TaskTracker::new();
        let orchestrator = Arc::new(
            Orchestrator::builder(reporter.clone(), tracker.clone())
                .local_runner(Arc::new(LocalRunner::new(
                    reporter,
                    Arc::new(FakeAgent::succeed("triaged")),
                    tracker,
                    None,
                )))
                .build(),
        );
        let actions = Arc::new(ActionRunner::new(
            orchestrator.clone(),
            dir.to_path_buf(),
            Duration::from_secs(5),
            chrono_tz::UTC,
        )
        .unwrap());
        (TriggerRegistry::in_data_dir(dir, actions), orchestrator)
    }

    fn issue_trigger(secret: Option<&str>) -> TriggerConfig {
        TriggerConfig {
            name: "triage-issues".to_string(),
            source: "github".to_string(),
            enabled: true,
            secret: secret.map(str::to_string),
            actions: vec![CronAction::Agent {
                job: "Triage this issue: {{payload}}".to_string(),
            }],
        }
    }

    #[test]
    fn signatures_verify_in_both_header_forms() {
        let body = br#"{"action":"opened"}"#;
        let hex_sig = sign("s3cret", body).unwrap();
        assert!(verify_signature("s3cret", body, &hex_sig));
        assert!(verify_signature("s3cret", body, &format!("sha256={}", hex_sig)));
        assert!(!verify_signature("other", body, &hex_sig));
        assert!(!verify_signature("s3cret", b"tampered", &hex_sig));
        assert!(!verify_signature("s3cret", body, "not-hex"));
    }

    #[test]
    fn validation_rejects_bad_sources_and_empty_actions() {
        let mut trigger = issue_trigger(None);
        assert!(trigger.validate().is_ok());
        trigger.source = "git hub".to_string();
        assert!(trigger.validate().is_err());
        trigger.source = "github".to_string();
        trigger.actions.clear();
        assert!(trigger.validate().is_err());
    }

    #[tokio::test]
    async fn firing_creates_a_trigger_job_with_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, orchestrator) = registry(dir.path());
        registry.add(issue_trigger(None)).await.unwrap();

        let report = registry.fire("github", "issue #42", None).await.unwrap();
        assert_eq!(report.fired.len(), 1);
        assert!(report.fired[0].actions[0].success);

        let jobs = orchestrator.get_jobs(1, None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source, JobSource::Trigger);
        assert_eq!(jobs[0].prompt, "Triage this issue: issue #42");
    }

    #[tokio::test]
    async fn signed_trigger_needs_a_valid_signature() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, orchestrator) = registry(dir.path());
        registry.add(issue_trigger(Some("s3cret"))).await.unwrap();

        let report = registry.fire("github", "payload", None).await.unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.rejected, 1);
        let report = registry.fire("github", "payload", Some("sha256=00")).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert!(orchestrator.get_jobs(1, None).await.unwrap().is_empty());

        let sig = sign("s3cret", b"payload").unwrap();
        let report = registry.fire("github", "payload", Some(&sig)).await.unwrap();
        assert_eq!(report.fired.len(), 1);
        assert_eq!(orchestrator.get_jobs(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_actions_report_their_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path());
        registry
            .add(TriggerConfig {
                name: "sync-docs".to_string(),
                source: "docs".to_string(),
                enabled: true,
                secret: None,
                actions: vec![
                    CronAction::Command {
                        command: "echo quota exceeded >&2; exit 2".to_string(),
                    },
                    CronAction::Webhook {
                        url: "http://127.0.0.1:9/hook".to_string(),
                        method: "NOT A METHOD".to_string(),
                        headers: Default::default(),
                        vars: Default::default(),
                    },
                ],
            })
            .await
            .unwrap();

        let report = registry.fire("docs", "{}", None).await.unwrap();
        let actions = &report.fired[0].actions;
        assert!(!actions[0].success);
        assert_eq!(actions[0].error.as_deref(), Some("quota exceeded"));
        assert!(!actions[1].success);
        assert_eq!(
            actions[1].error.as_deref(),
            Some("Invalid HTTP method 'NOT A METHOD'")
        );
    }

    #[tokio::test]
    async fn unknown_source_and_duplicates_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(dir.path());
        registry.add(issue_trigger(None)).await.unwrap();

        assert!(matches!(
            registry.add(issue_trigger(None)).await,
            Err(OrchestratorError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.fire("jira", "{}", None).await,
            Err(OrchestratorError::NotFound(_))
        ));

        registry.remove("triage-issues").await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
        assert!(matches!(
            registry.remove("triage-issues").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
