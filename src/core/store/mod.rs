mod cron_runs;
mod jobs;

pub use jobs::InsertOutcome;

use anyhow::Result;
use rusqlite::Connection;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::cron::CronRunStatus;
use crate::core::jobs::{JobSource, JobStatus, RunnerType};
use crate::platform::{NativePlatform, Platform};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        prompt TEXT NOT NULL,
        enriched_prompt TEXT,
        status TEXT NOT NULL,
        source TEXT NOT NULL,
        runner_type TEXT,
        branch TEXT,
        pr_url TEXT,
        run_url TEXT,
        summary TEXT,
        result TEXT,
        error TEXT,
        chat_id TEXT,
        external_id TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_external_id ON jobs(external_id) WHERE external_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_branch ON jobs(branch) WHERE branch IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS cron_runs (
        id TEXT PRIMARY KEY,
        cron_name TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        error TEXT,
        output TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_cron_runs_name_started ON cron_runs(cron_name, started_at)",
];

/// Durable record of every job and every cron firing.
pub struct JobStore {
    db: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join("jobrelay.db");
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        info!("Job store opened at {:?}", db_path);
        Self::from_connection(db)
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    #[cfg(test)]
    pub(crate) async fn drop_jobs_table(&self) {
        self.db
            .lock()
            .await
            .execute("DROP TABLE jobs", [])
            .unwrap();
    }

    fn from_connection(db: Connection) -> Result<Self> {
        for statement in SCHEMA {
            db.execute(statement, [])?;
        }
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

macro_rules! sql_text_enum {
    ($ty:ty, $parse:path) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                $parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unexpected value '{}'", text).into())
                })
            }
        }
    };
}

sql_text_enum!(JobStatus, JobStatus::from_status);
sql_text_enum!(JobSource, JobSource::from_source);
sql_text_enum!(RunnerType, RunnerType::from_runner);
sql_text_enum!(CronRunStatus, CronRunStatus::from_status);
