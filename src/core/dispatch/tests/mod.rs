mod create_job;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use super::Orchestrator;
use crate::core::events::{Event, EventBus};
use crate::core::jobs::JobReporter;
use crate::core::runners::testing::{FakeAgent, FakeCi};
use crate::core::runners::{LocalRunner, RemoteRunner, WarmPool};
use crate::core::store::JobStore;

pub(super) struct Harness {
    pub orchestrator: Orchestrator,
    pub events: broadcast::Receiver<Event>,
}

#[derive(Default)]
pub(super) struct HarnessOptions {
    pub warm: Option<(usize, FakeAgent)>,
    pub local: Option<FakeAgent>,
    pub remote: Option<Arc<FakeCi>>,
    pub preamble: Option<String>,
    pub ack_timeout: Option<Duration>,
    pub cancel_timeout: Option<Duration>,
}

pub(super) fn harness(options: HarnessOptions) -> Harness {
    let store = Arc::new(JobStore::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new(1024));
    let events = bus.subscribe();
    let reporter = JobReporter::new(store, bus);
    let tracker = TaskTracker::new();

    let mut builder = Orchestrator::builder(reporter.clone(), tracker.clone())
        .prompt_preamble(options.preamble)
        .page_size(10);
    if let Some(timeout) = options.cancel_timeout {
        builder = builder.cancel_timeout(timeout);
    }
    if let Some((size, agent)) = options.warm {
        builder = builder.warm_pool(Arc::new(WarmPool::new(
            size,
            reporter.clone(),
            Arc::new(agent),
            tracker.clone(),
            options.ack_timeout.unwrap_or(Duration::from_secs(2)),
        )));
    }
    if let Some(agent) = options.local {
        builder = builder.local_runner(Arc::new(LocalRunner::new(
            reporter.clone(),
            Arc::new(agent),
            tracker.clone(),
            None,
        )));
    }
    if let Some(ci) = options.remote {
        builder = builder.remote_runner(Arc::new(RemoteRunner::new(reporter, ci, tracker)));
    }

    Harness {
        orchestrator: builder.build(),
        events,
    }
}

/// Drain whatever is buffered and return `(name, job_id)` for job events.
pub(super) fn job_events(rx: &mut broadcast::Receiver<Event>) -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Some(job_id) = event.kind.job_id() {
            out.push((event.name(), job_id.to_string()));
        }
    }
    out
}
