//! In-process publish/subscribe hub.
//!
//! Built on a `tokio::sync::broadcast` channel: every subscriber sees events
//! in emission order, nothing is persisted, and a subscriber that falls more
//! than `capacity` events behind loses the oldest ones (reported as lag).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::cron::CronRun;
use crate::core::jobs::Job;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthChange {
    pub component: String,
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    #[serde(rename = "job:created")]
    JobCreated(Job),
    #[serde(rename = "job:updated")]
    JobUpdated(Job),
    #[serde(rename = "job:completed")]
    JobCompleted(Job),
    #[serde(rename = "job:failed")]
    JobFailed(Job),
    #[serde(rename = "cron:run")]
    CronRun(CronRun),
    #[serde(rename = "channel:message")]
    ChannelMessage(ChannelMessage),
    #[serde(rename = "notification")]
    Notification(Notification),
    #[serde(rename = "health:changed")]
    HealthChanged(HealthChange),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JobCreated(_) => "job:created",
            EventKind::JobUpdated(_) => "job:updated",
            EventKind::JobCompleted(_) => "job:completed",
            EventKind::JobFailed(_) => "job:failed",
            EventKind::CronRun(_) => "cron:run",
            EventKind::ChannelMessage(_) => "channel:message",
            EventKind::Notification(_) => "notification",
            EventKind::HealthChanged(_) => "health:changed",
        }
    }

    /// Job id carried by job events.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EventKind::JobCreated(job)
            | EventKind::JobUpdated(job)
            | EventKind::JobCompleted(job)
            | EventKind::JobFailed(job) => Some(&job.id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// JSON body of the event payload alone.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.kind)
            .ok()
            .and_then(|mut v| v.get_mut("payload").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Broadcast to every connected listener; returns how many received it.
    /// Having no listeners is not an error.
    pub fn publish(&self, kind: EventKind) -> usize {
        let name = kind.name();
        let job_id = kind.job_id().map(str::to_string);
        let event = Event {
            kind,
            timestamp: Utc::now(),
        };
        let delivered = self.tx.send(event).unwrap_or(0);
        match job_id {
            Some(id) => debug!("event {} for job {} delivered to {} listener(s)", name, id, delivered),
            None => debug!("event {} delivered to {} listener(s)", name, delivered),
        }
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
