use std::sync::Arc;
use std::time::Duration;

use super::{HarnessOptions, harness, job_events};
use crate::core::dispatch::{BackendKind, NO_BACKEND_AVAILABLE};
use crate::core::error::OrchestratorError;
use crate::core::jobs::{JobOptions, JobSource, JobStatus, RunnerType};
use crate::core::runners::testing::{FakeAgent, FakeCi, wait_for_status};

fn chat() -> JobOptions {
    JobOptions::from_source(JobSource::Chat)
}

#[tokio::test]
async fn warm_worker_runs_job_with_one_created_and_one_completed_event() {
    let mut h = harness(HarnessOptions {
        warm: Some((1, FakeAgent::succeed("Read 12 files\nRepo is a CLI tool"))),
        local: Some(FakeAgent::fail("local should not run")),
        ..HarnessOptions::default()
    });

    let id = h
        .orchestrator
        .create_job("summarize repo", chat())
        .await
        .unwrap();
    let job = wait_for_status(h.orchestrator.store(), &id, JobStatus::Completed).await;
    assert_eq!(job.runner_type, Some(RunnerType::Warm));
    assert_eq!(job.summary.as_deref(), Some("Repo is a CLI tool"));
    assert_eq!(job.source, JobSource::Chat);
    assert!(job.completed_at.is_some());

    let events = job_events(&mut h.events);
    let names: Vec<&str> = events
        .iter()
        .filter(|(_, job_id)| *job_id == id)
        .map(|(name, _)| *name)
        .collect();
    assert_eq!(names.iter().filter(|n| **n == "job:created").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "job:completed").count(), 1);
    assert_eq!(names.first(), Some(&"job:created"));
    assert_eq!(names.last(), Some(&"job:completed"));
    assert!(!names.contains(&"job:failed"));
}

#[tokio::test]
async fn empty_prompt_is_rejected_and_nothing_is_persisted() {
    let h = harness(HarnessOptions {
        local: Some(FakeAgent::succeed("ok")),
        ..HarnessOptions::default()
    });
    let err = h.orchestrator.create_job("   \n", chat()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    assert_eq!(h.orchestrator.get_job_counts().await.unwrap().created, 0);
    assert!(h.orchestrator.get_jobs(1, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn busy_pool_falls_back_to_local() {
    let h = harness(HarnessOptions {
        warm: Some((1, FakeAgent::sleep(Duration::from_secs(30)))),
        local: Some(FakeAgent::succeed("local done")),
        ..HarnessOptions::default()
    });

    let first = h.orchestrator.create_job("one", chat()).await.unwrap();
    let second = h.orchestrator.create_job("two", chat()).await.unwrap();

    let first = wait_for_status(h.orchestrator.store(), &first, JobStatus::Queued).await;
    assert_eq!(first.runner_type, Some(RunnerType::Warm));
    let second = wait_for_status(h.orchestrator.store(), &second, JobStatus::Completed).await;
    assert_eq!(second.runner_type, Some(RunnerType::Local));
    assert_eq!(h.orchestrator.pool_status().busy, 1);
}

#[tokio::test]
async fn no_backend_fails_the_job() {
    let mut h = harness(HarnessOptions::default());
    assert!(h.orchestrator.backend_kinds().is_empty());

    let id = h.orchestrator.create_job("anything", chat()).await.unwrap();
    let job = h.orchestrator.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(NO_BACKEND_AVAILABLE));

    let names: Vec<&str> = job_events(&mut h.events).iter().map(|(n, _)| *n).collect();
    assert_eq!(names, ["job:created", "job:failed"]);
}

#[tokio::test]
async fn saturated_pool_without_local_goes_remote() {
    let ci = Arc::new(FakeCi::default());
    let h = harness(HarnessOptions {
        warm: Some((1, FakeAgent::sleep(Duration::from_secs(30)))),
        remote: Some(ci.clone()),
        ..HarnessOptions::default()
    });
    assert_eq!(
        h.orchestrator.backend_kinds(),
        [BackendKind::Warm, BackendKind::Remote]
    );

    h.orchestrator.create_job("warm one", chat()).await.unwrap();
    let id = h.orchestrator.create_job("remote one", chat()).await.unwrap();
    let job = wait_for_status(h.orchestrator.store(), &id, JobStatus::Queued).await;
    assert_eq!(job.runner_type, None);
    assert_eq!(job.branch, Some(format!("job/{}", id)));
    assert_eq!(ci.branches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn preamble_is_stored_as_enriched_prompt() {
    let h = harness(HarnessOptions {
        local: Some(FakeAgent::succeed("ok")),
        preamble: Some("Answer in one line.".to_string()),
        ..HarnessOptions::default()
    });
    let id = h
        .orchestrator
        .create_job("  list open issues  ", chat())
        .await
        .unwrap();
    let job = h.orchestrator.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.prompt, "  list open issues  ");
    assert_eq!(
        job.enriched_prompt.as_deref(),
        Some("Answer in one line.\n\n  list open issues  ")
    );
}

#[tokio::test]
async fn repeated_external_id_returns_the_first_job() {
    let agent = FakeAgent::succeed("ok");
    let h = harness(HarnessOptions {
        local: Some(agent.clone()),
        ..HarnessOptions::default()
    });
    let options = JobOptions {
        source: JobSource::Api,
        chat_id: None,
        external_id: Some("msg-1001".to_string()),
    };

    let first = h.orchestrator.create_job("deploy", options.clone()).await.unwrap();
    let second = h.orchestrator.create_job("deploy", options).await.unwrap();
    assert_eq!(first, second);

    wait_for_status(h.orchestrator.store(), &first, JobStatus::Completed).await;
    assert_eq!(agent.call_count(), 1);
    assert_eq!(h.orchestrator.get_jobs(1, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn busy_never_exceeds_pool_size() {
    let h = harness(HarnessOptions {
        warm: Some((2, FakeAgent::sleep(Duration::from_millis(200)))),
        ..HarnessOptions::default()
    });

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(h.orchestrator.create_job(&format!("job {}", i), chat()).await.unwrap());
        assert!(h.orchestrator.pool_status().busy <= 2);
    }

    let counts = h.orchestrator.get_job_counts().await.unwrap();
    assert_eq!(counts.failed, 4);
    for _ in 0..100 {
        assert!(h.orchestrator.pool_status().busy <= 2);
        if h.orchestrator.pool_status().busy == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.orchestrator.pool_status().available, 2);
    assert_eq!(h.orchestrator.get_job_counts().await.unwrap().completed, 2);
}
