// src/manager.rs

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::{
    DownloadTask, ErrorKind, ErrorMode, Recording, TaskFailure, TaskId, TaskSnapshot, TaskState, TaskSyncError,
};
use crate::naming::NamingResolver;
use crate::queue::UnitQueue;
use crate::receiver::SourceConnector;
use crate::report::{should_write, AttemptResult, SyncReport};
use crate::session::{remove_partial, Candidate, PullSettings, SessionObserver, TransferError, TransferSession};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("task with ID {0} not found")]
    TaskNotFound(TaskId),
    #[error("invalid manager configuration: {0}")]
    Config(String),
    #[error("download manager is shutting down")]
    ShuttingDown,
}

/// Settings applied to every task unless a request overrides them.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub destination: PathBuf,
    pub max_attempts: u32,
    pub error_mode: ErrorMode,
    pub decode: bool,
    /// Worker count for units without an override.
    pub concurrency: usize,
    pub unit_concurrency: HashMap<String, usize>,
    pub retain_finished: bool,
    /// Pause between a failed attempt and the next one.
    pub retry_delay: Duration,
    pub pull: PullSettings,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("."),
            max_attempts: 3,
            error_mode: ErrorMode::default(),
            decode: false,
            concurrency: 1,
            unit_concurrency: HashMap::new(),
            retain_finished: false,
            retry_delay: Duration::from_secs(5),
            pull: PullSettings::default(),
        }
    }
}

/// One pull request. Unset fields fall back to [`ManagerOptions`].
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub recording: Recording,
    pub destination_dir: Option<PathBuf>,
    pub naming: Option<Arc<NamingResolver>>,
    pub error_mode: Option<ErrorMode>,
    pub decode: Option<bool>,
    pub max_attempts: Option<u32>,
}

impl PullRequest {
    pub fn new(recording: Recording) -> Self {
        Self {
            recording,
            destination_dir: None,
            naming: None,
            error_mode: None,
            decode: None,
            max_attempts: None,
        }
    }
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    cancel: CancellationToken,
    naming: Arc<NamingResolver>,
}

struct Inner {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    units: Mutex<HashMap<String, Arc<UnitQueue>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_task_id: AtomicU64,
    shutdown: CancellationToken,
    connector: Arc<dyn SourceConnector>,
    options: ManagerOptions,
}

/// Owns the per-unit worker pools and the task registry.
///
/// The registry lock only guards short metadata updates; transfers run on
/// worker tasks that own their `DownloadTask` exclusively.
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(connector: Arc<dyn SourceConnector>, options: ManagerOptions) -> Result<Self, ManagerError> {
        if options.max_attempts == 0 {
            return Err(ManagerError::Config("max_attempts must be at least 1".into()));
        }
        if options.concurrency == 0 || options.unit_concurrency.values().any(|&k| k == 0) {
            return Err(ManagerError::Config("concurrency must be at least 1".into()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                units: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                next_task_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                connector,
                options,
            }),
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Queues a pull and returns its id. Must be called from within a
    /// Tokio runtime; the first task for a unit starts that unit's workers.
    pub fn enqueue(
        &self,
        recording: Recording,
        destination_dir: PathBuf,
        naming: Arc<NamingResolver>,
        error_mode: ErrorMode,
    ) -> Result<TaskId, ManagerError> {
        let mut request = PullRequest::new(recording);
        request.destination_dir = Some(destination_dir);
        request.naming = Some(naming);
        request.error_mode = Some(error_mode);
        self.submit(request)
    }

    /// Queues a pull using the configured defaults for anything the
    /// request leaves unset.
    pub fn submit(&self, request: PullRequest) -> Result<TaskId, ManagerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }
        let options = &self.inner.options;
        let max_attempts = request.max_attempts.unwrap_or(options.max_attempts);
        if max_attempts == 0 {
            return Err(ManagerError::Config("max_attempts must be at least 1".into()));
        }
        let id = self.inner.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = DownloadTask::new(
            id,
            request.recording,
            request.destination_dir.unwrap_or_else(|| options.destination.clone()),
            max_attempts,
            request.error_mode.unwrap_or(options.error_mode),
            request.decode.unwrap_or(options.decode),
            Utc::now(),
        );
        let naming = request.naming.unwrap_or_else(|| options.pull.naming.clone());
        let unit = task.unit().to_string();

        self.inner.tasks.lock().insert(
            id,
            TaskEntry { snapshot: TaskSnapshot::of(&task), cancel: CancellationToken::new(), naming },
        );
        info!(task_id = id, unit = %unit, recording_id = %task.recording.id, "queued pull");
        self.unit_queue(&unit).push(task);
        Ok(id)
    }

    fn unit_queue(&self, unit: &str) -> Arc<UnitQueue> {
        let mut units = self.inner.units.lock();
        if let Some(queue) = units.get(unit) {
            return queue.clone();
        }
        let queue = Arc::new(UnitQueue::new());
        units.insert(unit.to_string(), queue.clone());

        let workers = self.inner.concurrency_for(unit);
        let mut handles = self.inner.workers.lock();
        for slot in 0..workers {
            let inner = self.inner.clone();
            let queue = queue.clone();
            let unit = unit.to_string();
            handles.push(tokio::spawn(async move {
                inner.worker(unit, slot, queue).await;
            }));
        }
        info!(unit, workers, "started unit worker pool");
        queue
    }

    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot, ManagerError> {
        self.inner
            .tasks
            .lock()
            .get(&id)
            .map(|e| e.snapshot.clone())
            .ok_or(ManagerError::TaskNotFound(id))
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<_> = self.inner.tasks.lock().values().map(|e| e.snapshot.clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Requests cancellation. A queued task fails immediately; a running
    /// one stops at its next state boundary.
    pub fn cancel(&self, id: TaskId) -> Result<(), ManagerError> {
        let unit = {
            let tasks = self.inner.tasks.lock();
            let entry = tasks.get(&id).ok_or(ManagerError::TaskNotFound(id))?;
            if entry.snapshot.state.is_terminal() {
                return Ok(());
            }
            entry.cancel.cancel();
            entry.snapshot.unit.clone()
        };
        info!(task_id = id, "cancel requested");

        let queue = self.inner.units.lock().get(&unit).cloned();
        if let Some(task) = queue.and_then(|q| q.remove(id)) {
            self.inner.finish(&task, TaskState::Failed, Some(cancelled()));
        }
        Ok(())
    }

    /// Drops a finished task from the registry unless finished tasks are
    /// retained. Returns whether it was evicted.
    pub fn acknowledge(&self, id: TaskId) -> Result<bool, ManagerError> {
        let mut tasks = self.inner.tasks.lock();
        let entry = tasks.get(&id).ok_or(ManagerError::TaskNotFound(id))?;
        if !entry.snapshot.state.is_terminal() || self.inner.options.retain_finished {
            return Ok(false);
        }
        tasks.remove(&id);
        Ok(true)
    }

    /// Number of tasks currently in `state`.
    pub fn count_in(&self, state: TaskState) -> usize {
        self.inner.tasks.lock().values().filter(|e| e.snapshot.state == state).count()
    }

    /// Stops accepting work and waits for workers to finish their current
    /// task.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker ended abnormally");
            }
        }
        info!("download manager stopped");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn cancelled() -> TaskFailure {
    TaskFailure { kind: ErrorKind::Cancelled, message: TransferError::Cancelled.to_string() }
}

impl Inner {
    fn concurrency_for(&self, unit: &str) -> usize {
        self.options
            .unit_concurrency
            .get(unit)
            .copied()
            .unwrap_or(self.options.concurrency)
    }

    async fn worker(self: Arc<Self>, unit: String, slot: usize, queue: Arc<UnitQueue>) {
        while let Some(task) = queue.pop(&self.shutdown).await {
            self.run_task(task).await;
        }
        info!(unit = %unit, slot, "worker stopped");
    }

    async fn run_task(&self, mut task: DownloadTask) {
        let Some((cancel, naming)) = self
            .tasks
            .lock()
            .get(&task.id)
            .map(|e| (e.cancel.clone(), e.naming.clone()))
        else {
            return;
        };
        let settings = PullSettings { naming, ..self.options.pull.clone() };
        let mut first_reported = false;
        let mut best: Option<Candidate> = None;

        loop {
            task.attempt_count += 1;
            let attempt = task.attempt_count;
            self.begin_attempt(task.id, attempt);

            let result = TransferSession::pull(&task, attempt, self.connector.as_ref(), &settings, self, &cancel)
                .against(best.as_ref())
                .run()
                .await;

            match result {
                Ok(outcome) => {
                    task.sync_errors
                        .extend(outcome.sync_errors.iter().map(|e| TaskSyncError::new(attempt, e)));
                    task.final_path = Some(outcome.final_path);
                    if let Some(candidate) = best.take() {
                        remove_partial(&candidate.path).await;
                    }
                    if should_write(task.error_mode, false, first_reported) {
                        let report = SyncReport::new(&task, attempt, AttemptResult::Complete, None, outcome.bytes, &outcome.sync_errors);
                        self.write_report(&task, report).await;
                    }
                    self.finish(&task, TaskState::Complete, None);
                    return;
                }
                Err(failure) => {
                    task.sync_errors
                        .extend(failure.sync_errors.iter().map(|e| TaskSyncError::new(attempt, e)));
                    let reason = TaskFailure { kind: failure.error.kind(), message: failure.error.to_string() };
                    if failure.candidate.is_some() {
                        best = failure.candidate;
                    }
                    if matches!(failure.error, TransferError::Cancelled) {
                        info!(task_id = task.id, attempt, "pull cancelled");
                        if let Some(candidate) = best.take() {
                            remove_partial(&candidate.path).await;
                        }
                        self.finish(&task, TaskState::Failed, Some(reason));
                        return;
                    }

                    let retry = failure.error.is_retryable() && attempt < task.max_attempts;
                    warn!(task_id = task.id, unit = %task.unit(), attempt, retry, error = %failure.error, "pull attempt failed");
                    if should_write(task.error_mode, true, first_reported) {
                        let outcome = if retry { AttemptResult::Retrying } else { AttemptResult::Failed };
                        let report = SyncReport::new(&task, attempt, outcome, Some(reason.message.clone()), failure.bytes, &failure.sync_errors);
                        self.write_report(&task, report).await;
                        first_reported = true;
                    }
                    self.record_error(task.id, reason.clone(), task.sync_errors.len());

                    if !retry {
                        match best.take() {
                            Some(candidate) => self.keep_best(&mut task, &settings, &cancel, candidate, reason).await,
                            None => self.finish(&task, TaskState::Failed, Some(reason)),
                        }
                        return;
                    }
                    if !self.state(task.id, TaskState::Retrying) || !self.pause(&cancel).await {
                        if let Some(candidate) = best.take() {
                            remove_partial(&candidate.path).await;
                        }
                        self.finish(&task, TaskState::Failed, Some(cancelled()));
                        return;
                    }
                }
            }
        }
    }

    /// Every attempt was corrupt: the least corrupt one becomes the result.
    async fn keep_best(
        &self,
        task: &mut DownloadTask,
        settings: &PullSettings,
        cancel: &CancellationToken,
        candidate: Candidate,
        reason: TaskFailure,
    ) {
        let bad_packets = candidate.bad_packets;
        let session = TransferSession::pull(task, task.attempt_count, self.connector.as_ref(), settings, self, cancel);
        match session.finalize(candidate).await {
            Ok(path) => {
                warn!(task_id = task.id, bad_packets, path = %path.display(), "kept least corrupt attempt");
                task.final_path = Some(path);
                self.finish(task, TaskState::Complete, None);
            }
            Err(TransferError::Cancelled) => self.finish(task, TaskState::Failed, Some(cancelled())),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "could not finalize best attempt");
                self.finish(task, TaskState::Failed, Some(reason));
            }
        }
    }

    /// Waits out the retry delay; `false` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.options.retry_delay) => true,
        }
    }

    async fn write_report(&self, task: &DownloadTask, report: SyncReport) {
        match report.write(task.destination()).await {
            Ok(path) => info!(task_id = task.id, attempt = report.attempt, path = %path.display(), "wrote sync report"),
            Err(e) => error!(task_id = task.id, error = %e, "could not write sync report"),
        }
    }

    fn begin_attempt(&self, id: TaskId, attempt: u32) {
        if let Some(entry) = self.tasks.lock().get_mut(&id) {
            entry.snapshot.attempt_count = attempt;
            entry.snapshot.bytes_transferred = 0;
        }
    }

    fn record_error(&self, id: TaskId, failure: TaskFailure, sync_error_count: usize) {
        if let Some(entry) = self.tasks.lock().get_mut(&id) {
            entry.snapshot.last_error = Some(failure);
            entry.snapshot.sync_error_count = sync_error_count;
        }
    }

    fn finish(&self, task: &DownloadTask, state: TaskState, failure: Option<TaskFailure>) {
        if let Some(entry) = self.tasks.lock().get_mut(&task.id) {
            let snapshot = &mut entry.snapshot;
            snapshot.state = state;
            snapshot.attempt_count = task.attempt_count;
            snapshot.sync_error_count = task.sync_errors.len();
            snapshot.final_path = task.final_path.clone();
            if failure.is_some() {
                snapshot.last_error = failure;
            }
        }
        match state {
            TaskState::Complete => info!(task_id = task.id, attempts = task.attempt_count, "task complete"),
            _ => warn!(task_id = task.id, attempts = task.attempt_count, ?state, "task finished without success"),
        }
    }
}

impl SessionObserver for Inner {
    fn state(&self, task: TaskId, state: TaskState) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&task) {
            Some(entry) if !entry.snapshot.state.is_terminal() && !entry.cancel.is_cancelled() => {
                entry.snapshot.state = state;
                true
            }
            _ => false,
        }
    }

    fn progress(&self, task: TaskId, bytes: u64) {
        if let Some(entry) = self.tasks.lock().get_mut(&task) {
            entry.snapshot.bytes_transferred = bytes;
        }
    }
}
