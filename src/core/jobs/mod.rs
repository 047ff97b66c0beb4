mod reporter;

pub use reporter::{JobReporter, RemoteInfo};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error text written when a user cancels a job that has not finished.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

const SUMMARY_MAX_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "created" => Some(JobStatus::Created),
            "queued" => Some(JobStatus::Queued),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Allowed status moves. `created -> failed` covers cancellation and
/// dispatch failure before any runner picked the job up.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Created => matches!(to, JobStatus::Queued | JobStatus::Failed),
        JobStatus::Queued => matches!(to, JobStatus::Completed | JobStatus::Failed),
        JobStatus::Completed | JobStatus::Failed => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Chat,
    Cron,
    Trigger,
    #[default]
    Api,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::Chat => "chat",
            JobSource::Cron => "cron",
            JobSource::Trigger => "trigger",
            JobSource::Api => "api",
        }
    }

    pub fn from_source(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(JobSource::Chat),
            "cron" => Some(JobSource::Cron),
            "trigger" => Some(JobSource::Trigger),
            "api" => Some(JobSource::Api),
            _ => None,
        }
    }
}

/// Runner recorded on the job. Remote jobs leave this unset and are
/// recognised by their branch instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    Warm,
    Local,
}

impl RunnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerType::Warm => "warm",
            RunnerType::Local => "local",
        }
    }

    pub fn from_runner(value: &str) -> Option<Self> {
        match value {
            "warm" => Some(RunnerType::Warm),
            "local" => Some(RunnerType::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub prompt: String,
    pub enriched_prompt: Option<String>,
    pub status: JobStatus,
    pub source: JobSource,
    pub runner_type: Option<RunnerType>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub run_url: Option<String>,
    pub summary: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub chat_id: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(prompt: &str, enriched_prompt: Option<String>, options: &JobOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            enriched_prompt,
            status: JobStatus::Created,
            source: options.source,
            runner_type: None,
            branch: None,
            pr_url: None,
            run_url: None,
            summary: None,
            result: None,
            error: None,
            chat_id: options.chat_id.clone(),
            external_id: options.external_id.clone(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Text handed to the agent: the enriched prompt when one was produced.
    pub fn effective_prompt(&self) -> &str {
        self.enriched_prompt.as_deref().unwrap_or(&self.prompt)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_remote(&self) -> bool {
        self.runner_type.is_none() && self.branch.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub source: JobSource,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Caller-supplied idempotency key; a repeat submission returns the
    /// job already recorded under it.
    #[serde(default)]
    pub external_id: Option<String>,
}

impl JobOptions {
    pub fn from_source(source: JobSource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub created: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What a runner reports when execution finishes normally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub summary: Option<String>,
    pub result: String,
}

impl JobOutcome {
    /// Summary is the last non-empty output line, capped for list views.
    pub fn from_output(output: &str) -> Self {
        let summary = output
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.chars().take(SUMMARY_MAX_CHARS).collect::<String>());
        Self {
            summary,
            result: output.to_string(),
        }
    }
}
