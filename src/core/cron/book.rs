use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::CronJobConfig;
use crate::core::error::{OrchestratorError, OrchestratorResult};

/// Read a JSON array file. A missing file is an empty list.
pub async fn load_json_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write a JSON array file through a temp file so readers never see a
/// half-written list.
pub async fn save_json_list<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string_pretty(items)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// The ordered list of cron entries kept in `crons.json`.
pub struct CronBook {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CronBook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("crons.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Result<Vec<CronJobConfig>> {
        load_json_list(&self.path).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<CronJobConfig>> {
        Ok(self.list().await?.into_iter().find(|c| c.name == name))
    }

    pub async fn add(&self, entry: CronJobConfig) -> OrchestratorResult<()> {
        entry.validate().map_err(OrchestratorError::InvalidInput)?;
        let _guard = self.write_lock.lock().await;
        let mut entries = self.list().await?;
        if entries.iter().any(|c| c.name == entry.name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "cron '{}' already exists",
                entry.name
            )));
        }
        entries.push(entry);
        save_json_list(&self.path, &entries).await?;
        Ok(())
    }

    /// Replace the entry called `name`, keeping its position. The entry may
    /// be renamed as long as the new name is free.
    pub async fn update(&self, name: &str, entry: CronJobConfig) -> OrchestratorResult<()> {
        entry.validate().map_err(OrchestratorError::InvalidInput)?;
        let _guard = self.write_lock.lock().await;
        let mut entries = self.list().await?;
        let Some(index) = entries.iter().position(|c| c.name == name) else {
            return Err(OrchestratorError::NotFound(format!("cron '{}'", name)));
        };
        if entry.name != name && entries.iter().any(|c| c.name == entry.name) {
            return Err(OrchestratorError::InvalidInput(format!(
                "cron '{}' already exists",
                entry.name
            )));
        }
        entries[index] = entry;
        save_json_list(&self.path, &entries).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> OrchestratorResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.list().await?;
        let before = entries.len();
        entries.retain(|c| c.name != name);
        if entries.len() == before {
            return Err(OrchestratorError::NotFound(format!("cron '{}'", name)));
        }
        save_json_list(&self.path, &entries).await?;
        Ok(())
    }
}
