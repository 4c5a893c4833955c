// src/report.rs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integrity::SyncError;
use crate::models::{DownloadTask, ErrorMode};
use crate::naming::sanitize_file_name;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptResult {
    Complete,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedSyncError {
    pub offset: u64,
    pub offset_mb: f64,
    pub packets: u64,
    /// Byte found where the sync byte belonged.
    pub found: String,
}

impl From<&SyncError> for ReportedSyncError {
    fn from(error: &SyncError) -> Self {
        Self {
            offset: error.offset,
            offset_mb: error.offset as f64 / BYTES_PER_MB,
            packets: error.packets,
            found: format!("0x{:02x}", error.found),
        }
    }
}

/// Sync-error report for one pull attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub receiver: String,
    pub recording_id: String,
    pub task_id: u64,
    pub attempt: u32,
    pub outcome: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Offset of the first sync error, in MiB.
    pub start_offset_mb: f64,
    pub bytes_transferred: u64,
    #[serde(default)]
    pub sync_errors: Vec<ReportedSyncError>,
}

impl SyncReport {
    pub fn new(
        task: &DownloadTask,
        attempt: u32,
        outcome: AttemptResult,
        error: Option<String>,
        bytes_transferred: u64,
        sync_errors: &[SyncError],
    ) -> Self {
        let start_offset_mb = sync_errors
            .first()
            .map(|e| e.offset as f64 / BYTES_PER_MB)
            .unwrap_or(0.0);
        Self {
            receiver: task.unit().to_string(),
            recording_id: task.recording.id.clone(),
            task_id: task.id,
            attempt,
            outcome,
            error,
            start_offset_mb,
            bytes_transferred,
            sync_errors: sync_errors.iter().map(ReportedSyncError::from).collect(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}.task{}.attempt{}.syncreport.toml",
            sanitize_file_name(&self.recording_id),
            self.task_id,
            self.attempt
        )
    }

    /// Writes the report into `dir` and returns its path.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let path = dir.join(self.file_name());
        let text = toml::to_string_pretty(self)?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, text).await?;
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self, ReportError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&text)?)
    }
}

/// Whether an attempt gets a report under `mode`. `first_written` tells
/// whether an earlier failed attempt of the task was already reported.
pub fn should_write(mode: ErrorMode, failed: bool, first_written: bool) -> bool {
    match mode {
        ErrorMode::None => false,
        ErrorMode::First => failed && !first_written,
        ErrorMode::All => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Recording, SourceLocator};
    use chrono::Utc;
    use tempfile::TempDir;

    fn task(dir: &Path) -> DownloadTask {
        let rec = Recording::new("3301", "Show", SourceLocator::Receiver { unit: "den".into(), url: "http://x/?id=3301".into() });
        DownloadTask::new(4, rec, dir.to_path_buf(), 3, ErrorMode::All, false, Utc::now())
    }

    #[test]
    fn error_mode_policy() {
        assert!(!should_write(ErrorMode::None, true, false));
        assert!(should_write(ErrorMode::First, true, false));
        assert!(!should_write(ErrorMode::First, true, true));
        assert!(!should_write(ErrorMode::First, false, false));
        assert!(should_write(ErrorMode::All, false, true));
    }

    #[tokio::test]
    async fn report_is_written_as_toml() {
        let dir = TempDir::new().unwrap();
        let task = task(dir.path());
        let errors = [
            SyncError { offset: 3 * 1024 * 1024, packets: 2, found: 0x00 },
            SyncError { offset: 5 * 1024 * 1024, packets: 1, found: 0x4e },
        ];
        let report = SyncReport::new(&task, 2, AttemptResult::Retrying, Some("stream corruption".into()), 9_000_000, &errors);
        let path = report.write(dir.path()).await.unwrap();

        assert_eq!(path, dir.path().join("3301.task4.attempt2.syncreport.toml"));
        let loaded = SyncReport::load(&path).await.unwrap();
        assert_eq!(loaded.receiver, "den");
        assert_eq!(loaded.start_offset_mb, 3.0);
        assert_eq!(loaded.sync_errors.len(), 2);
        assert_eq!(loaded.sync_errors[1].found, "0x4e");
    }
}
