use anyhow::Result;
use chrono::Utc;
use rusqlite::params;

use super::JobStore;
use crate::core::cron::{CronRun, CronRunStatus};

impl JobStore {
    /// Open a run record for a firing. Status starts as `success` and is
    /// flipped by [`JobStore::finish_cron_run`] if the action fails.
    pub async fn start_cron_run(&self, cron_name: &str) -> Result<CronRun> {
        let run = CronRun {
            id: uuid::Uuid::new_v4().to_string(),
            cron_name: cron_name.to_string(),
            status: CronRunStatus::Success,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
            output: None,
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO cron_runs (id, cron_name, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![run.id, run.cron_name, run.status, run.started_at],
        )?;
        Ok(run)
    }

    pub async fn finish_cron_run(&self, run: &CronRun) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE cron_runs SET status = ?2, completed_at = ?3, duration_ms = ?4, error = ?5, output = ?6
             WHERE id = ?1",
            params![
                run.id,
                run.status,
                run.completed_at,
                run.duration_ms,
                run.error,
                run.output
            ],
        )?;
        Ok(rows > 0)
    }

    /// Newest first.
    pub async fn list_cron_runs(&self, cron_name: &str, limit: usize) -> Result<Vec<CronRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, cron_name, status, started_at, completed_at, duration_ms, error, output
             FROM cron_runs WHERE cron_name = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cron_name, limit as i64], |row| {
            Ok(CronRun {
                id: row.get(0)?,
                cron_name: row.get(1)?,
                status: row.get(2)?,
                started_at: row.get(3)?,
                completed_at: row.get(4)?,
                duration_ms: row.get(5)?,
                error: row.get(6)?,
                output: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
