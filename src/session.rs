// src/session.rs

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::Decoder;
use crate::integrity::{StreamValidator, SyncError};
use crate::models::{DownloadTask, ErrorKind, Recording, StreamKind, SyncPolicy, TaskId, TaskState};
use crate::naming::NamingResolver;
use crate::receiver::{SourceConnector, SourceStream};

/// Extension kept by pulls that are not decoded.
pub const CONTAINER_EXTENSION: &str = "tivo";
const MAX_NAME_SUFFIX: u32 = 1000;

/// Failure of one transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("stream corruption: {runs} sync error run(s), first at byte {first_offset}")]
    StreamCorruption { runs: usize, first_offset: u64 },
    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Connect(_) | TransferError::Timeout(_) => ErrorKind::Connect,
            TransferError::StreamCorruption { .. } | TransferError::SizeMismatch { .. } => {
                ErrorKind::StreamCorruption
            }
            TransferError::Decode(_) => ErrorKind::Decode,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Io(_) => ErrorKind::Io,
        }
    }

    /// Everything except a cancellation may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::Cancelled)
    }

    fn corruption(errors: &[SyncError]) -> Self {
        TransferError::StreamCorruption {
            runs: errors.len(),
            first_offset: errors.first().map(|e| e.offset).unwrap_or(0),
        }
    }
}

/// Direction of a transfer relative to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Serve,
    Pull,
}

/// Pull-side knobs shared by every attempt.
#[derive(Debug, Clone)]
pub struct PullSettings {
    pub sync_policy: SyncPolicy,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub save_metadata: bool,
    pub naming: Arc<NamingResolver>,
    pub decoder: Option<Arc<Decoder>>,
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            save_metadata: false,
            naming: Arc::new(NamingResolver::default()),
            decoder: None,
        }
    }
}

/// Receives state transitions from a running pull.
pub trait SessionObserver: Send + Sync {
    /// Records a transition. Returns `false` when the task is no longer
    /// live and the session must stop.
    fn state(&self, task: TaskId, state: TaskState) -> bool;
    fn progress(&self, task: TaskId, bytes: u64);
}

#[derive(Debug)]
pub struct AttemptOutcome {
    pub final_path: PathBuf,
    pub bytes: u64,
    pub sync_errors: Vec<SyncError>,
}

#[derive(Debug)]
pub struct AttemptFailure {
    pub error: TransferError,
    pub bytes: u64,
    pub sync_errors: Vec<SyncError>,
    /// Set when a corrupt attempt was kept under `SyncPolicy::Best`.
    pub candidate: Option<Candidate>,
}

/// A complete but corrupt attempt, parked at `DownloadTask::candidate_path`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub bad_packets: u64,
    pub bytes: u64,
    /// Whether the stream starts with a container header.
    pub container: bool,
}

fn bad_packets(errors: &[SyncError]) -> u64 {
    errors.iter().map(|e| e.packets).sum()
}

/// Drives one pull attempt from connect to the final rename.
pub struct TransferSession<'a> {
    task: &'a DownloadTask,
    attempt: u32,
    connector: &'a dyn SourceConnector,
    settings: &'a PullSettings,
    observer: &'a dyn SessionObserver,
    cancel: &'a CancellationToken,
    validator: StreamValidator,
    bytes: u64,
    best: Option<u64>,
    candidate: Option<Candidate>,
}

impl<'a> TransferSession<'a> {
    pub fn pull(
        task: &'a DownloadTask,
        attempt: u32,
        connector: &'a dyn SourceConnector,
        settings: &'a PullSettings,
        observer: &'a dyn SessionObserver,
        cancel: &'a CancellationToken,
    ) -> Self {
        let validator = match task.recording.stream_kind {
            StreamKind::Ts => StreamValidator::new(),
            StreamKind::Ps => StreamValidator::header_only(),
        };
        Self {
            task,
            attempt,
            connector,
            settings,
            observer,
            cancel,
            validator,
            bytes: 0,
            best: None,
            candidate: None,
        }
    }

    /// Under `SyncPolicy::Best`, stops the transfer as soon as it has as
    /// many bad packets as `best`.
    pub fn against(mut self, best: Option<&Candidate>) -> Self {
        self.best = best.map(|c| c.bad_packets);
        self
    }

    pub fn direction(&self) -> Direction {
        Direction::Pull
    }

    pub async fn run(mut self) -> Result<AttemptOutcome, AttemptFailure> {
        let result = self.drive().await;
        let sync_errors = self.validator.errors().to_vec();
        match result {
            Ok(final_path) => Ok(AttemptOutcome { final_path, bytes: self.bytes, sync_errors }),
            Err(error) => {
                self.discard().await;
                let candidate = self.candidate.take();
                Err(AttemptFailure { error, bytes: self.bytes, sync_errors, candidate })
            }
        }
    }

    /// Finalizes a kept candidate as the task's result, decoding it first
    /// when the task asks for that.
    pub async fn finalize(mut self, candidate: Candidate) -> Result<PathBuf, TransferError> {
        self.bytes = candidate.bytes;
        let result = self.conclude(candidate.path.clone(), candidate.container).await;
        if result.is_err() {
            remove_partial(&candidate.path).await;
            remove_partial(&self.task.decoded_path(self.attempt)).await;
        }
        result
    }

    fn enter(&self, state: TaskState) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() || !self.observer.state(self.task.id, state) {
            return Err(TransferError::Cancelled);
        }
        debug!(task_id = self.task.id, attempt = self.attempt, ?state, "pull state");
        Ok(())
    }

    async fn drive(&mut self) -> Result<PathBuf, TransferError> {
        let task = self.task;
        self.enter(TaskState::Connecting)?;
        let source = self.connect().await?;

        self.enter(TaskState::Transferring)?;
        fs::create_dir_all(task.destination()).await?;
        let working = task.working_path(self.attempt);
        self.transfer(source.body, &working).await?;
        self.validator.finish();

        self.enter(TaskState::Verifying)?;
        self.verify(source.content_length, &working).await?;

        let container = self.validator.header().is_some();
        self.conclude(working, container).await
    }

    async fn conclude(&mut self, working: PathBuf, container: bool) -> Result<PathBuf, TransferError> {
        let task = self.task;
        let (output, extension) = if task.decode && container {
            self.enter(TaskState::Decoding)?;
            let decoded = task.decoded_path(self.attempt);
            self.decode(&working, &decoded).await?;
            fs::remove_file(&working).await?;
            (decoded, task.recording.stream_kind.extension())
        } else if container {
            (working, CONTAINER_EXTENSION)
        } else {
            (working, task.recording.stream_kind.extension())
        };

        self.enter(TaskState::Finalizing)?;
        let stem = self.settings.naming.resolve(&task.recording);
        let final_path = place_without_clobber(&output, task.destination(), &stem, extension).await?;
        if self.settings.save_metadata {
            if let Err(e) = write_metadata(&final_path, &task.recording).await {
                warn!(task_id = task.id, error = %e, "could not write metadata sidecar");
            }
        }
        info!(task_id = task.id, attempt = self.attempt, bytes = self.bytes, path = %final_path.display(), "pull finished");
        Ok(final_path)
    }

    async fn connect(&self) -> Result<SourceStream, TransferError> {
        let open = tokio::time::timeout(self.settings.connect_timeout, self.connector.open(&self.task.recording));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            result = open => result.map_err(|_| TransferError::Timeout("connecting"))?,
        }
    }

    async fn transfer(&mut self, mut body: crate::receiver::ByteStream, working: &Path) -> Result<(), TransferError> {
        let mut file = BufWriter::new(File::create(working).await?);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = tokio::time::timeout(self.settings.read_timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(TransferError::Timeout("reading")),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            file.write_all(&chunk).await?;
            self.bytes += chunk.len() as u64;
            self.observer.progress(self.task.id, self.bytes);

            let new_runs = self.validator.feed(&chunk);
            let errors = self.validator.errors();
            if new_runs > 0 {
                if let Some(last) = errors.last() {
                    warn!(task_id = self.task.id, attempt = self.attempt, offset = last.offset, found = last.found, "transport stream lost sync");
                }
            }
            let stop = match self.settings.sync_policy {
                SyncPolicy::Abort => new_runs > 0,
                SyncPolicy::Best => !errors.is_empty() && self.best.is_some_and(|best| bad_packets(errors) >= best),
                SyncPolicy::Collect | SyncPolicy::Ignore => false,
            };
            if stop {
                file.flush().await?;
                return Err(TransferError::corruption(errors));
            }
        }
        file.flush().await?;
        file.into_inner().sync_all().await?;
        Ok(())
    }

    async fn verify(&mut self, expected: Option<u64>, working: &Path) -> Result<(), TransferError> {
        if let Some(expected) = expected {
            if expected != self.bytes {
                return Err(TransferError::SizeMismatch { expected, actual: self.bytes });
            }
        }
        let errors = self.validator.errors();
        if !errors.is_empty() {
            match self.settings.sync_policy {
                SyncPolicy::Ignore => {
                    warn!(task_id = self.task.id, runs = errors.len(), "keeping stream with sync errors");
                }
                SyncPolicy::Abort | SyncPolicy::Collect => return Err(TransferError::corruption(errors)),
                SyncPolicy::Best => {
                    // Reaching here means this attempt beat any earlier candidate.
                    let candidate = Candidate {
                        path: self.task.candidate_path(),
                        bad_packets: bad_packets(errors),
                        bytes: self.bytes,
                        container: self.validator.header().is_some(),
                    };
                    fs::rename(working, &candidate.path).await?;
                    info!(task_id = self.task.id, attempt = self.attempt, bad_packets = candidate.bad_packets, "kept attempt as best so far");
                    let error = TransferError::corruption(self.validator.errors());
                    self.candidate = Some(candidate);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    async fn decode(&self, input: &Path, output: &Path) -> Result<(), TransferError> {
        let decoder = self
            .settings
            .decoder
            .as_ref()
            .ok_or_else(|| TransferError::Decode("no decoder configured".into()))?;
        let unit = self.task.unit();
        let key = self
            .connector
            .media_access_key(unit)
            .ok_or_else(|| TransferError::Decode(format!("no media access key for unit '{unit}'")))?;
        decoder.decode(input, output, &key, self.cancel).await
    }

    async fn discard(&self) {
        for path in [self.task.working_path(self.attempt), self.task.decoded_path(self.attempt)] {
            remove_partial(&path).await;
        }
    }
}

/// Removes a scratch file, ignoring one that is already gone.
pub async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial file"),
    }
}

/// Moves `source` to `<dir>/<stem>.<ext>`, or `<stem> (N).<ext>` when that
/// name is taken. An existing file is never replaced.
pub async fn place_without_clobber(source: &Path, dir: &Path, stem: &str, extension: &str) -> Result<PathBuf, io::Error> {
    for n in 1..=MAX_NAME_SUFFIX {
        let name = if n == 1 {
            format!("{stem}.{extension}")
        } else {
            format!("{stem} ({n}).{extension}")
        };
        let candidate = dir.join(name);
        match fs::hard_link(source, &candidate).await {
            Ok(()) => {
                fs::remove_file(source).await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(_) => {
                // Filesystems without hard links fall back to a checked rename.
                if fs::try_exists(&candidate).await? {
                    continue;
                }
                fs::rename(source, &candidate).await?;
                return Ok(candidate);
            }
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free name for '{stem}'")))
}

/// Writes `<final>.txt` with `key : value` lines describing the recording.
pub async fn write_metadata(final_path: &Path, recording: &Recording) -> Result<PathBuf, io::Error> {
    let mut lines = vec![format!("title : {}", recording.title)];
    let mut push = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            lines.push(format!("{key} : {value}"));
        }
    };
    push("episodeTitle", recording.episode_title.clone());
    push("seasonNumber", recording.season.map(|s| s.to_string()));
    push("episodeNumber", recording.episode.map(|e| e.to_string()));
    push("movieYear", recording.movie_year.map(|y| y.to_string()));
    push("callsign", recording.callsign.clone());
    push("displayMajorNumber", recording.channel.clone());
    push("time", recording.date_recorded.map(|d| d.to_rfc3339()));
    push("originalAirDate", recording.original_air_date.map(|d| d.format("%Y-%m-%dT00:00:00Z").to_string()));

    let mut sidecar = final_path.as_os_str().to_owned();
    sidecar.push(".txt");
    let sidecar = PathBuf::from(sidecar);
    fs::write(&sidecar, lines.join("\n") + "\n").await?;
    Ok(sidecar)
}

/// State of a serve-direction transfer on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServeState {
    Active,
    Complete,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServeEntry {
    pub client: String,
    pub path: PathBuf,
    pub direction: Direction,
    pub state: ServeState,
    pub transcoding: bool,
    pub offset: u64,
    pub bytes_sent: u64,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

/// Serve-direction transfers, active and recently finished.
#[derive(Default)]
pub struct TransferBoard {
    entries: Mutex<HashMap<u64, ServeEntry>>,
    next_id: AtomicU64,
}

impl TransferBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new serve transfer. Entries that finished more than a
    /// day ago are pruned at the same time.
    pub fn begin(self: &Arc<Self>, client: &str, path: &Path, offset: u64, transcoding: bool) -> ServeSession {
        self.prune(chrono::Duration::days(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            id,
            ServeEntry {
                client: client.to_string(),
                path: path.to_path_buf(),
                direction: Direction::Serve,
                state: ServeState::Active,
                transcoding,
                offset,
                bytes_sent: 0,
                started: Utc::now(),
                ended: None,
            },
        );
        info!(client, path = %path.display(), offset, transcoding, "serve started");
        ServeSession { board: Arc::clone(self), id, bytes: 0, completed: false }
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state == ServeState::Active)
            .count()
    }

    pub fn snapshot(&self) -> Vec<ServeEntry> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.started);
        entries
    }

    pub fn prune(&self, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        self.entries
            .lock()
            .retain(|_, e| e.ended.map_or(true, |ended| ended > cutoff));
    }

    fn update(&self, id: u64, bytes: u64, finished: Option<ServeState>) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.bytes_sent = bytes;
            if let Some(state) = finished {
                entry.state = state;
                entry.ended = Some(Utc::now());
            }
        }
    }
}

/// One serve-direction transfer. Dropping it before [`complete`](Self::complete)
/// marks the transfer interrupted.
pub struct ServeSession {
    board: Arc<TransferBoard>,
    id: u64,
    bytes: u64,
    completed: bool,
}

impl ServeSession {
    pub fn direction(&self) -> Direction {
        Direction::Serve
    }

    pub fn record(&mut self, sent: usize) {
        self.bytes += sent as u64;
        self.board.update(self.id, self.bytes, None);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes
    }

    pub fn complete(mut self) {
        self.completed = true;
        self.board.update(self.id, self.bytes, Some(ServeState::Complete));
        info!(bytes = self.bytes, "serve finished");
    }
}

impl Drop for ServeSession {
    fn drop(&mut self) {
        if !self.completed {
            self.board.update(self.id, self.bytes, Some(ServeState::Interrupted));
            debug!(bytes = self.bytes, "serve interrupted");
        }
    }
}
