// src/models.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::integrity::SyncError;

/// Identifier handed out by the download manager.
pub type TaskId = u64;

/// Unit name used for recordings that live on the local filesystem.
pub const LOCAL_UNIT: &str = "local";

/// Framing of the bytes pulled off a receiver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamKind {
    Ts,
    #[default]
    Ps,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Ts => "TS",
            StreamKind::Ps => "PS",
        }
    }

    /// File extension used once the stream has been decoded.
    pub fn extension(&self) -> &'static str {
        match self {
            StreamKind::Ts => "ts",
            StreamKind::Ps => "ps",
        }
    }
}

/// How the bytes of a recording are addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocator {
    Local { path: PathBuf },
    Receiver { unit: String, url: String },
}

impl SourceLocator {
    /// The unit whose worker pool pulls this source.
    pub fn unit(&self) -> &str {
        match self {
            SourceLocator::Local { .. } => LOCAL_UNIT,
            SourceLocator::Receiver { unit, .. } => unit,
        }
    }
}

/// An item available for transfer.
///
/// Optional fields are explicit; the naming templates define how each one
/// renders when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recording {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub episode_title: Option<String>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub date_recorded: Option<DateTime<Utc>>,
    #[serde(default)]
    pub original_air_date: Option<NaiveDate>,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    /// Presence selects the movie naming template.
    #[serde(default)]
    pub movie_year: Option<u16>,
    #[serde(default)]
    pub stream_kind: StreamKind,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub source: SourceLocator,
}

impl Recording {
    pub fn new(id: impl Into<String>, title: impl Into<String>, source: SourceLocator) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            episode_title: None,
            season: None,
            episode: None,
            date_recorded: None,
            original_air_date: None,
            callsign: None,
            channel: None,
            movie_year: None,
            stream_kind: StreamKind::default(),
            size_bytes: None,
            source,
        }
    }

    pub fn is_movie(&self) -> bool {
        self.movie_year.is_some()
    }

    pub fn unit(&self) -> &str {
        self.source.unit()
    }
}

/// Which attempts of a task produce a sync-error report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    #[default]
    None,
    First,
    All,
}

/// What a pull does when the transport stream loses sync.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Fail the attempt at the first sync error.
    Abort,
    /// Keep transferring to end-of-stream, then fail while verifying.
    #[default]
    Collect,
    /// Record the errors but keep the file.
    Ignore,
    /// Retry like `Collect`, keeping the attempt with the fewest bad
    /// packets. Later attempts stop once they are no better, and the kept
    /// file is finalized when every attempt failed.
    Best,
}

/// Lifecycle of a download task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Connecting,
    Transferring,
    Verifying,
    Decoding,
    Finalizing,
    Retrying,
    Complete,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

/// Failure taxonomy surfaced through task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    StreamCorruption,
    Decode,
    Config,
    Cancelled,
    Io,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// A sync error together with the attempt that saw it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSyncError {
    pub attempt: u32,
    pub offset: u64,
    pub packets: u64,
}

impl TaskSyncError {
    pub fn new(attempt: u32, error: &SyncError) -> Self {
        Self {
            attempt,
            offset: error.offset,
            packets: error.packets,
        }
    }
}

/// One requested pull, owned by the worker driving it.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: TaskId,
    pub recording: Recording,
    pub destination_dir: PathBuf,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub state: TaskState,
    pub error_mode: ErrorMode,
    /// Run the decode collaborator when the source is an encrypted container.
    pub decode: bool,
    pub sync_errors: Vec<TaskSyncError>,
    pub final_path: Option<PathBuf>,
}

impl DownloadTask {
    /// Creates a queued task. An unknown recording date becomes `now`, so
    /// the task's copy of the recording never changes afterwards.
    pub fn new(
        id: TaskId,
        mut recording: Recording,
        destination_dir: PathBuf,
        max_attempts: u32,
        error_mode: ErrorMode,
        decode: bool,
        now: DateTime<Utc>,
    ) -> Self {
        recording.date_recorded.get_or_insert(now);
        Self {
            id,
            recording,
            destination_dir,
            attempt_count: 0,
            max_attempts,
            state: TaskState::Queued,
            error_mode,
            decode,
            sync_errors: Vec::new(),
            final_path: None,
        }
    }

    pub fn unit(&self) -> &str {
        self.recording.unit()
    }

    /// Working file for one attempt, e.g. `<dest>/.7.attempt2.part`.
    /// Partial data never shares a name with a finished file.
    pub fn working_path(&self, attempt: u32) -> PathBuf {
        self.scratch_path(attempt, "part")
    }

    /// Output of the decode collaborator for one attempt.
    pub fn decoded_path(&self, attempt: u32) -> PathBuf {
        self.scratch_path(attempt, "decoded")
    }

    /// Least corrupt finished attempt so far, kept under `SyncPolicy::Best`.
    pub fn candidate_path(&self) -> PathBuf {
        self.destination_dir.join(format!(".{}.best.part", self.id))
    }

    fn scratch_path(&self, attempt: u32, suffix: &str) -> PathBuf {
        self.destination_dir
            .join(format!(".{}.attempt{}.{}", self.id, attempt, suffix))
    }

    pub fn destination(&self) -> &Path {
        &self.destination_dir
    }
}

/// Read-only view of a task for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub unit: String,
    pub recording_id: String,
    pub title: String,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_mode: ErrorMode,
    pub bytes_transferred: u64,
    pub sync_error_count: usize,
    pub last_error: Option<TaskFailure>,
    pub final_path: Option<PathBuf>,
}

impl TaskSnapshot {
    pub fn of(task: &DownloadTask) -> Self {
        Self {
            id: task.id,
            unit: task.unit().to_string(),
            recording_id: task.recording.id.clone(),
            title: task.recording.title.clone(),
            state: task.state,
            attempt_count: task.attempt_count,
            max_attempts: task.max_attempts,
            error_mode: task.error_mode,
            bytes_transferred: 0,
            sync_error_count: task.sync_errors.len(),
            last_error: None,
            final_path: task.final_path.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TaskState::Failed
            && self
                .last_error
                .as_ref()
                .is_some_and(|e| e.kind == ErrorKind::Cancelled)
    }
}
