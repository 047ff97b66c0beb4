//! Scheduled actions: entry types, schedule parsing, the JSON book they are
//! kept in, and the scheduler loop that fires them.

mod actions;
mod book;
mod schedule;
mod scheduler;


pub use actions::{ActionContext, ActionRunner};
pub use book::{CronBook, load_json_list, save_json_list};
pub use schedule::{CronSchedule, validate_schedule};
pub use scheduler::{CronComponent, CronScheduler};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "POST".to_string()
}

/// What a cron entry or trigger does when it fires. Exactly one payload
/// exists per variant, so a `command` entry can never carry a stray `job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronAction {
    Agent {
        job: String,
    },
    Command {
        command: String,
    },
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        vars: BTreeMap<String, String>,
    },
}

impl CronAction {
    pub fn kind(&self) -> &'static str {
        match self {
            CronAction::Agent { .. } => "agent",
            CronAction::Command { .. } => "command",
            CronAction::Webhook { .. } => "webhook",
        }
    }

    /// Reject actions whose payload is blank.
    pub fn validate(&self) -> Result<(), String> {
        let (field, value) = match self {
            CronAction::Agent { job } => ("job", job),
            CronAction::Command { command } => ("command", command),
            CronAction::Webhook { url, .. } => ("url", url),
        };
        if value.trim().is_empty() {
            return Err(format!("{} action requires a non-empty '{}'", self.kind(), field));
        }
        if let CronAction::Webhook { url, .. } = self
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(format!("webhook url must be http(s): {}", url));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub action: CronAction,
}

impl CronJobConfig {
    /// Checks everything an API mutation must check before the entry is
    /// saved: a name, a parseable schedule and a usable payload.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        CronSchedule::parse(&self.schedule).map_err(|e| e.to_string())?;
        self.action.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronRunStatus {
    Success,
    Failure,
}

impl CronRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CronRunStatus::Success => "success",
            CronRunStatus::Failure => "failure",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "success" => Some(CronRunStatus::Success),
            "failure" => Some(CronRunStatus::Failure),
            _ => None,
        }
    }
}

/// One historical firing of a cron entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CronRun {
    pub id: String,
    pub cron_name: String,
    pub status: CronRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl CronRun {
    pub fn finalize(&mut self, result: Result<Option<String>, String>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        match result {
            Ok(output) => {
                self.status = CronRunStatus::Success;
                self.output = output;
            }
            Err(error) => {
                self.status = CronRunStatus::Failure;
                self.error = Some(error);
            }
        }
    }
}
