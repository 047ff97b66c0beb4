use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use super::JobStore;
use crate::core::jobs::{Job, JobCounts, JobOutcome, JobStatus, RunnerType, can_transition};

const JOB_COLUMNS: &str = "id, prompt, enriched_prompt, status, source, runner_type, branch, pr_url, run_url,
     summary, result, error, chat_id, external_id, created_at, completed_at";

/// Non-terminal statuses, the only ones a runner may still write over.
const OPEN_STATUSES: &str = "('created', 'queued')";

/// SQL list of the statuses allowed to move into `target`.
fn statuses_leading_to(target: JobStatus) -> String {
    let from: Vec<String> = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Completed,
        JobStatus::Failed,
    ]
    .into_iter()
    .filter(|from| can_transition(*from, target))
    .map(|from| format!("'{}'", from.as_str()))
    .collect();
    format!("({})", from.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A job with the same external id already exists.
    Duplicate(String),
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        prompt: row.get(1)?,
        enriched_prompt: row.get(2)?,
        status: row.get(3)?,
        source: row.get(4)?,
        runner_type: row.get(5)?,
        branch: row.get(6)?,
        pr_url: row.get(7)?,
        run_url: row.get(8)?,
        summary: row.get(9)?,
        result: row.get(10)?,
        error: row.get(11)?,
        chat_id: row.get(12)?,
        external_id: row.get(13)?,
        created_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

impl JobStore {
    /// Insert a freshly created job. Lookup and insert share one lock, so
    /// two submissions carrying the same external id cannot both land.
    pub async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        let db = self.db.lock().await;
        if let Some(external_id) = job.external_id.as_deref() {
            let existing: Option<String> = db
                .query_row(
                    "SELECT id FROM jobs WHERE external_id = ?1",
                    params![external_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(InsertOutcome::Duplicate(id));
            }
        }

        db.execute(
            "INSERT INTO jobs (id, prompt, enriched_prompt, status, source, chat_id, external_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id,
                job.prompt,
                job.enriched_prompt,
                job.status,
                job.source,
                job.chat_id,
                job.external_id,
                job.created_at,
            ],
        )?;
        Ok(InsertOutcome::Inserted)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Newest first. `page` is 1-based.
    pub async fn list_jobs(
        &self,
        page: usize,
        page_size: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>> {
        let offset = (page.max(1) - 1) * page_size;
        let db = self.db.lock().await;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(
                    params![status, page_size as i64, offset as i64],
                    job_from_row,
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![page_size as i64, offset as i64], job_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            match status {
                JobStatus::Created => counts.created = count,
                JobStatus::Queued => counts.queued = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// created -> queued. Returns false when the job was no longer `created`
    /// (cancelled before a runner picked it up).
    pub async fn mark_queued(&self, job_id: &str, runner: Option<RunnerType>) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'queued', runner_type = ?2, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'created'",
            params![job_id, runner],
        )?;
        Ok(rows > 0)
    }

    /// Record remote correlation data on a job that is still open.
    pub async fn update_remote(
        &self,
        job_id: &str,
        branch: Option<&str>,
        run_url: Option<&str>,
        pr_url: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE jobs
                 SET branch = COALESCE(?2, branch), run_url = COALESCE(?3, run_url),
                     pr_url = COALESCE(?4, pr_url), updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status IN {}",
                OPEN_STATUSES
            ),
            params![job_id, branch, run_url, pr_url],
        )?;
        Ok(rows > 0)
    }

    /// Compare-and-set into a terminal status. Only the first writer wins;
    /// `completed_at` is therefore written exactly once.
    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        outcome: Option<&JobOutcome>,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let summary = outcome.and_then(|o| o.summary.as_deref());
        let result = outcome.map(|o| o.result.as_str());
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE jobs
                 SET status = ?2, summary = COALESCE(?3, summary), result = COALESCE(?4, result),
                     error = COALESCE(?5, error), completed_at = ?6, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1 AND status IN {}",
                statuses_leading_to(status)
            ),
            params![job_id, status, summary, result, error, Utc::now()],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{JobOptions, JobSource};

    fn job(prompt: &str) -> Job {
        Job::new(prompt, None, &JobOptions::from_source(JobSource::Chat))
    }

    #[tokio::test]
    async fn insert_then_get_returns_same_job() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job("summarize repo");
        assert_eq!(store.insert_job(&job).await.unwrap(), InsertOutcome::Inserted);

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.prompt, "summarize repo");
        assert_eq!(loaded.status, JobStatus::Created);
        assert_eq!(loaded.source, JobSource::Chat);
        assert_eq!(loaded.runner_type, None);
        assert!(store.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_external_id_returns_existing_job() {
        let store = JobStore::open_in_memory().unwrap();
        let options = JobOptions {
            external_id: Some("chat-42".to_string()),
            ..JobOptions::default()
        };
        let first = Job::new("one", None, &options);
        let second = Job::new("two", None, &options);
        assert_eq!(store.insert_job(&first).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_job(&second).await.unwrap(),
            InsertOutcome::Duplicate(first.id.clone())
        );
        assert!(store.get_job(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_queued_only_from_created() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job("x");
        store.insert_job(&job).await.unwrap();

        assert!(store.mark_queued(&job.id, Some(RunnerType::Warm)).await.unwrap());
        assert!(!store.mark_queued(&job.id, Some(RunnerType::Local)).await.unwrap());

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.runner_type, Some(RunnerType::Warm));
    }

    #[tokio::test]
    async fn finish_job_is_first_writer_wins() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job("x");
        store.insert_job(&job).await.unwrap();
        store.mark_queued(&job.id, None).await.unwrap();

        let outcome = JobOutcome::from_output("all good");
        assert!(
            store
                .finish_job(&job.id, JobStatus::Completed, Some(&outcome), None)
                .await
                .unwrap()
        );
        let completed_at = store
            .get_job(&job.id)
            .await
            .unwrap()
            .unwrap()
            .completed_at
            .unwrap();

        assert!(
            !store
                .finish_job(&job.id, JobStatus::Failed, None, Some("late"))
                .await
                .unwrap()
        );
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.summary.as_deref(), Some("all good"));
        assert_eq!(loaded.error, None);
        assert_eq!(loaded.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn unstarted_job_can_fail_but_not_complete() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job("x");
        store.insert_job(&job).await.unwrap();

        let outcome = JobOutcome::from_output("too early");
        assert!(
            !store
                .finish_job(&job.id, JobStatus::Completed, Some(&outcome), None)
                .await
                .unwrap()
        );
        assert!(
            store
                .finish_job(&job.id, JobStatus::Failed, None, Some("Cancelled by user"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn remote_fields_are_frozen_after_terminal() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job("x");
        store.insert_job(&job).await.unwrap();
        assert!(
            store
                .update_remote(&job.id, Some("job/abc"), None, None)
                .await
                .unwrap()
        );
        store
            .finish_job(&job.id, JobStatus::Failed, None, Some("boom"))
            .await
            .unwrap();
        assert!(
            !store
                .update_remote(&job.id, None, Some("https://ci/run/1"), None)
                .await
                .unwrap()
        );
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.branch.as_deref(), Some("job/abc"));
        assert_eq!(loaded.run_url, None);
    }

    #[tokio::test]
    async fn counts_and_pages_follow_status() {
        let store = JobStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = job(&format!("job {}", i));
            store.insert_job(&job).await.unwrap();
            ids.push(job.id);
        }
        store.mark_queued(&ids[0], None).await.unwrap();
        store
            .finish_job(&ids[1], JobStatus::Failed, None, Some("nope"))
            .await
            .unwrap();

        let counts = store.job_counts().await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                created: 3,
                queued: 1,
                completed: 0,
                failed: 1
            }
        );

        let page_one = store.list_jobs(1, 2, None).await.unwrap();
        let page_three = store.list_jobs(3, 2, None).await.unwrap();
        assert_eq!(page_one.len(), 2);
        assert_eq!(page_three.len(), 1);

        let failed = store.list_jobs(1, 10, Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, ids[1]);
    }
}
