use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tempfile::TempDir;

use hmo_bridge::decode::{Decoder, DecoderConfig};
use hmo_bridge::integrity::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use hmo_bridge::manager::{DownloadManager, ManagerOptions, PullRequest};
use hmo_bridge::models::{ErrorKind, ErrorMode, Recording, SourceLocator, StreamKind, SyncPolicy, TaskId, TaskSnapshot, TaskState};
use hmo_bridge::naming::NamingResolver;
use hmo_bridge::receiver::{SourceConnector, SourceStream};
use hmo_bridge::report::SyncReport;
use hmo_bridge::session::{PullSettings, TransferError};

fn packets(count: usize, corrupt: &[usize]) -> Vec<u8> {
    let mut data = vec![0u8; count * TS_PACKET_SIZE];
    for i in 0..count {
        data[i * TS_PACKET_SIZE] = TS_SYNC_BYTE;
    }
    for &i in corrupt {
        data[i * TS_PACKET_SIZE] = 0x00;
    }
    data
}

/// Packets behind a 16-byte container header.
fn container(count: usize) -> Vec<u8> {
    let mut data = b"TiVo\x00\x04\x00\x20\x00\x00".to_vec();
    data.extend_from_slice(&16u32.to_be_bytes());
    data.extend_from_slice(&[0, 0]);
    data.extend(packets(count, &[]));
    data
}

/// Serves the bytes scripted for each successive open (the last script
/// repeats), in small chunks with an optional delay between them.
struct FakeReceiver {
    scripts: Vec<Vec<u8>>,
    chunk_delay: Duration,
    opened: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeReceiver {
    fn new(data: Vec<u8>, chunk_delay: Duration) -> Self {
        Self::scripted(vec![data], chunk_delay)
    }

    fn scripted(scripts: Vec<Vec<u8>>, chunk_delay: Duration) -> Self {
        Self {
            scripts,
            chunk_delay,
            opened: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceConnector for FakeReceiver {
    async fn open(&self, recording: &Recording) -> Result<SourceStream, TransferError> {
        let data = {
            let mut opened = self.opened.lock();
            let n = opened.len().min(self.scripts.len() - 1);
            opened.push(recording.id.clone());
            self.scripts[n].clone()
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // The guard lives as long as the body stream.
        let guard = ActiveGuard(self.active.clone());

        let delay = self.chunk_delay;
        let length = data.len() as u64;
        let chunks: Vec<Bytes> = data.chunks(TS_PACKET_SIZE * 2).map(Bytes::copy_from_slice).collect();
        let body = stream::unfold((chunks.into_iter(), guard), move |(mut chunks, guard)| async move {
            let chunk = chunks.next()?;
            tokio::time::sleep(delay).await;
            Some((Ok::<_, io::Error>(chunk), (chunks, guard)))
        })
        .boxed();
        Ok(SourceStream { content_length: Some(length), body })
    }

    fn media_access_key(&self, _unit: &str) -> Option<String> {
        Some("0000000000".into())
    }
}

fn recording(id: &str) -> Recording {
    let mut rec = Recording::new(
        id,
        format!("Show {id}"),
        SourceLocator::Receiver { unit: "den".into(), url: format!("http://den/download?id={id}") },
    );
    rec.stream_kind = StreamKind::Ts;
    rec
}

fn options(dir: &Path) -> ManagerOptions {
    ManagerOptions {
        destination: dir.to_path_buf(),
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
        pull: PullSettings {
            naming: Arc::new(NamingResolver::new("{title}", "{title}").unwrap()),
            ..PullSettings::default()
        },
        ..ManagerOptions::default()
    }
}

async fn wait_terminal(manager: &DownloadManager, id: TaskId) -> TaskSnapshot {
    for _ in 0..2000 {
        let snapshot = manager.status(id).unwrap();
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never finished");
}

fn report_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".syncreport.toml"))
        .count()
}

#[tokio::test]
async fn corrupt_stream_retries_and_reports_every_attempt() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(20, &[7]), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.error_mode = ErrorMode::All;
    let manager = DownloadManager::new(source.clone(), opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3301"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempt_count, 3);
    assert_eq!(snapshot.sync_error_count, 3);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::StreamCorruption));
    assert_eq!(source.opened.lock().len(), 3);
    assert_eq!(report_count(dir.path()), 3);

    let report = SyncReport::load(&dir.path().join(format!("3301.task{id}.attempt1.syncreport.toml")))
        .await
        .unwrap();
    assert_eq!(report.sync_errors.len(), 1);
    assert_eq!(report.sync_errors[0].offset, 7 * TS_PACKET_SIZE as u64);

    // No partial working files survive a failed task.
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(leftovers, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn first_error_mode_writes_a_single_report() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(20, &[3]), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.error_mode = ErrorMode::First;
    let manager = DownloadManager::new(source, opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3302"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempt_count, 3);
    assert_eq!(report_count(dir.path()), 1);
    assert!(dir.path().join(format!("3302.task{id}.attempt1.syncreport.toml")).exists());
    manager.shutdown().await;
}

#[tokio::test]
async fn ignore_policy_keeps_the_file() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(10, &[2]), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.pull.sync_policy = SyncPolicy::Ignore;
    let manager = DownloadManager::new(source, opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3303"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Complete);
    assert_eq!(snapshot.attempt_count, 1);
    assert_eq!(snapshot.sync_error_count, 1);
    assert_eq!(snapshot.final_path, Some(dir.path().join("Show 3303.ts")));
    manager.shutdown().await;
}

#[tokio::test]
async fn clean_pulls_of_the_same_name_do_not_clobber() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(4, &[]), Duration::ZERO));
    let manager = DownloadManager::new(source, options(dir.path())).unwrap();

    let first = manager.submit(PullRequest::new(recording("9"))).unwrap();
    let first = wait_terminal(&manager, first).await;
    let second = manager.submit(PullRequest::new(recording("9"))).unwrap();
    let second = wait_terminal(&manager, second).await;

    assert_eq!(first.final_path, Some(dir.path().join("Show 9.ts")));
    assert_eq!(second.final_path, Some(dir.path().join("Show 9 (2).ts")));
    manager.shutdown().await;
}

#[tokio::test]
async fn unit_concurrency_ceiling_is_respected() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(16, &[]), Duration::from_millis(5)));
    let mut opts = options(dir.path());
    opts.unit_concurrency = HashMap::from([("den".to_string(), 2)]);
    let manager = DownloadManager::new(source.clone(), opts).unwrap();

    let ids: Vec<_> = (0..5)
        .map(|i| manager.submit(PullRequest::new(recording(&format!("c{i}")))).unwrap())
        .collect();

    let mut saw_queued = false;
    loop {
        let transferring = manager.count_in(TaskState::Transferring);
        assert!(transferring <= 2, "{transferring} tasks transferring at once");
        saw_queued |= manager.count_in(TaskState::Queued) > 0;
        if ids.iter().all(|&id| manager.status(id).unwrap().state.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(saw_queued);
    assert!(source.peak.load(Ordering::SeqCst) <= 2);
    for id in ids {
        assert_eq!(manager.status(id).unwrap().state, TaskState::Complete);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn cancelled_queued_task_never_connects() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(packets(40, &[]), Duration::from_millis(10)));
    let manager = DownloadManager::new(source.clone(), options(dir.path())).unwrap();

    let running = manager.submit(PullRequest::new(recording("busy"))).unwrap();
    let queued = manager.submit(PullRequest::new(recording("waiting"))).unwrap();
    while manager.status(running).unwrap().state != TaskState::Transferring {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(manager.status(queued).unwrap().state, TaskState::Queued);

    manager.cancel(queued).unwrap();
    let snapshot = manager.status(queued).unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::Cancelled));

    manager.cancel(running).unwrap();
    let snapshot = wait_terminal(&manager, running).await;
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::Cancelled));

    assert_eq!(*source.opened.lock(), vec!["busy".to_string()]);
    manager.shutdown().await;
}

#[tokio::test]
async fn best_policy_keeps_the_least_corrupt_attempt() {
    let dir = TempDir::new().unwrap();
    let scripts = vec![packets(30, &[4, 9]), packets(30, &[12]), packets(30, &[1, 2, 3])];
    let source = Arc::new(FakeReceiver::scripted(scripts.clone(), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.pull.sync_policy = SyncPolicy::Best;
    let manager = DownloadManager::new(source.clone(), opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3304"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Complete);
    assert_eq!(snapshot.attempt_count, 3);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::StreamCorruption));
    let final_path = snapshot.final_path.unwrap();
    assert_eq!(final_path, dir.path().join("Show 3304.ts"));
    assert_eq!(std::fs::read(&final_path).unwrap(), scripts[1]);

    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(leftovers, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn best_policy_prefers_a_clean_retry() {
    let dir = TempDir::new().unwrap();
    let scripts = vec![packets(10, &[4]), packets(10, &[])];
    let source = Arc::new(FakeReceiver::scripted(scripts, Duration::ZERO));
    let mut opts = options(dir.path());
    opts.pull.sync_policy = SyncPolicy::Best;
    let manager = DownloadManager::new(source, opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3305"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Complete);
    assert_eq!(snapshot.attempt_count, 2);
    assert_eq!(std::fs::read(snapshot.final_path.unwrap()).unwrap(), packets(10, &[]));
    assert!(!dir.path().join(format!(".{id}.best.part")).exists());
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn failing_decoder_is_retried_then_fails() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(container(8), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.decode = true;
    opts.pull.decoder = Some(Arc::new(Decoder::new(DecoderConfig { program: "false".into(), args: vec![] })));
    let manager = DownloadManager::new(source.clone(), opts).unwrap();

    let id = manager.submit(PullRequest::new(recording("3306"))).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempt_count, 3);
    assert_eq!(snapshot.last_error.map(|e| e.kind), Some(ErrorKind::Decode));
    assert_eq!(source.opened.lock().len(), 3);
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn decoded_pull_is_named_for_its_stream_kind() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(FakeReceiver::new(container(8), Duration::ZERO));
    let mut opts = options(dir.path());
    opts.decode = true;
    opts.pull.decoder = Some(Arc::new(Decoder::new(DecoderConfig {
        program: "cp".into(),
        args: vec!["{input}".into(), "{output}".into()],
    })));
    let manager = DownloadManager::new(source, opts).unwrap();

    let mut rec = recording("3307");
    rec.stream_kind = StreamKind::Ps;
    let id = manager.submit(PullRequest::new(rec)).unwrap();
    let snapshot = wait_terminal(&manager, id).await;

    assert_eq!(snapshot.state, TaskState::Complete);
    assert_eq!(snapshot.final_path, Some(dir.path().join("Show 3307.ps")));
    manager.shutdown().await;
}
