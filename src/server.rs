// src/server.rs

use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::connect_info::{ConnectInfo, MockConnectInfo};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Extensions, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::cache::LruCache;
use crate::config::{Config, ShareConfig, TsMode};
use crate::integrity::{ContainerHeader, CONTAINER_PROBE_LEN};
use crate::manager::{DownloadManager, ManagerError, PullRequest};
use crate::models::{ErrorMode, Recording, SourceLocator, TaskId};
use crate::npl::{
    Container, Item, ItemDetails, ItemLinks, Link, NplError, MIME_FOLDER, MIME_TIVO_MPEG, MIME_TIVO_MPEG_TS,
    MIME_VIDEO_CONTAINER,
};
use crate::receiver::{ByteStream, ReceiverError, Sources};
use crate::session::{ServeSession, TransferBoard};
use crate::transcode::{
    decide, DecisionKey, DeviceProfile, FileFingerprint, OutputFormat, ProbeError, Prober, TranscodeDecision, Transcoder,
};

pub const SERVER_VERSION: &str = "2.1.0";
const INTERNAL_NAME: &str = "hmo-bridge";
const ORGANIZATION: &str = "hmo-bridge";
const DEFAULT_PAGE_SIZE: usize = 50;
const VIDEO_EXTENSIONS: &[&str] = &[
    "tivo", "mpg", "mpeg", "vob", "ts", "m2ts", "mts", "ps", "mp4", "m4v", "mkv", "avi", "wmv", "mov", "webm",
];

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Unauthorized.")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: Option<u64> },
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Npl(#[from] NplError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Forbidden => StatusCode::FORBIDDEN,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ServerError::Manager(ManagerError::TaskNotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Manager(ManagerError::Config(_)) => StatusCode::BAD_REQUEST,
            ServerError::Manager(ManagerError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Receiver(ReceiverError::UnknownUnit(_)) => StatusCode::NOT_FOUND,
            ServerError::Receiver(ReceiverError::Busy) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Receiver(_) => StatusCode::BAD_GATEWAY,
            ServerError::Probe(_) | ServerError::Npl(_) | ServerError::Io(_) => {
                warn!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let ServerError::RangeNotSatisfiable { size: Some(size) } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Serve-side state shared by every request.
pub struct MediaServer {
    shares: Vec<ShareConfig>,
    allowed_clients: Vec<String>,
    ts_mode: TsMode,
    decisions: LruCache<DecisionKey, TranscodeDecision>,
    prober: Prober,
    transcoder: Transcoder,
    board: Arc<TransferBoard>,
    manager: Arc<DownloadManager>,
    sources: Arc<Sources>,
}

impl MediaServer {
    pub fn new(config: &Config, manager: Arc<DownloadManager>, sources: Arc<Sources>) -> Self {
        Self {
            shares: config.shares.clone(),
            allowed_clients: config.server.allowed_clients.clone(),
            ts_mode: config.server.ts,
            decisions: LruCache::from_config(config.server.decision_cache_capacity),
            prober: Prober::new(&config.server.ffprobe),
            transcoder: Transcoder::new(&config.server.ffmpeg),
            board: Arc::new(TransferBoard::new()),
            manager,
            sources,
        }
    }

    pub fn board(&self) -> &Arc<TransferBoard> {
        &self.board
    }

    pub fn decisions(&self) -> &LruCache<DecisionKey, TranscodeDecision> {
        &self.decisions
    }

    /// Drops every cached decision for `path`, for use after the file changed.
    pub async fn invalidate(&self, path: &FsPath) {
        let file = FileFingerprint::of(path).await;
        self.decisions.retain(|key, _| key.file != file);
    }

    fn is_allowed(&self, client: Option<&str>) -> bool {
        if self.allowed_clients.is_empty() {
            return true;
        }
        client.is_some_and(|ip| self.allowed_clients.iter().any(|prefix| ip.starts_with(prefix.as_str())))
    }

    fn ts_output(&self, profile: DeviceProfile) -> bool {
        self.ts_mode != TsMode::Off && profile.supports_ts()
    }

    fn share(&self, name: &str) -> ServerResult<&ShareConfig> {
        self.shares
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ServerError::NotFound(format!("share {name}")))
    }

    /// Maps `share/relative` to a path under the share root.
    fn local_path(&self, share: &str, relative: &str) -> ServerResult<PathBuf> {
        let root = &self.share(share)?.path;
        let mut path = root.clone();
        for component in FsPath::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ServerError::BadRequest("parent references are not allowed".into()))
                }
            }
        }
        Ok(path)
    }

    /// Local pulls may only read files that are already shared.
    async fn check_pull_source(&self, source: &SourceLocator) -> ServerResult<()> {
        let SourceLocator::Local { path } = source else {
            return Ok(());
        };
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ServerError::BadRequest("parent references are not allowed".into()));
        }
        let Ok(path) = tokio::fs::canonicalize(path).await else {
            return Err(ServerError::Forbidden);
        };
        for share in &self.shares {
            if let Ok(root) = tokio::fs::canonicalize(&share.path).await {
                if path.starts_with(&root) {
                    return Ok(());
                }
            }
        }
        warn!(path = %path.display(), "refused pull of an unshared local file");
        Err(ServerError::Forbidden)
    }

    /// Decides pass-through vs. transcode, memoized per file, profile and
    /// output framing.
    pub async fn decision(&self, path: &FsPath, profile: DeviceProfile, output: OutputFormat) -> ServerResult<TranscodeDecision> {
        let key = DecisionKey { file: FileFingerprint::of(path).await, profile, output };
        let decision = self
            .decisions
            .get_or_compute_async(key, || async {
                let info = self.prober.probe(path).await?;
                Ok::<_, ProbeError>(decide(&info, profile, output))
            })
            .await?;
        Ok(decision)
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/TiVoConnect", get(tivo_connect))
            .route("/api/pulls", get(list_pulls).post(create_pull))
            .route("/api/pulls/{id}", get(pull_status).delete(cancel_pull))
            .route("/api/pulls/{id}/ack", post(acknowledge_pull))
            .route("/api/receivers/{unit}/now-playing", get(now_playing))
            .route("/{share}/{*path}", get(serve_file))
            .layer(middleware::from_fn_with_state(self.clone(), allow_clients))
            .with_state(self)
    }
}

fn client_address(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .or_else(|| extensions.get::<MockConnectInfo<SocketAddr>>().map(|info| info.0))
}

async fn allow_clients(State(server): State<Arc<MediaServer>>, request: Request, next: Next) -> Response {
    let client = client_address(request.extensions()).map(|addr| addr.ip().to_string());
    if !server.is_allowed(client.as_deref()) {
        warn!(client = client.as_deref().unwrap_or("unknown"), "rejected client");
        return ServerError::Forbidden.into_response();
    }
    next.run(request).await
}

fn device_profile(headers: &HeaderMap) -> DeviceProfile {
    headers
        .get("tsn")
        .and_then(|v| v.to_str().ok())
        .map(DeviceProfile::from_tsn)
        .unwrap_or(DeviceProfile::StandardDefinition)
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

fn to_xml<T: Serialize>(value: &T) -> ServerResult<String> {
    let body = quick_xml::se::to_string(value).map_err(|e| NplError::Xml(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}"))
}

#[derive(Serialize)]
#[serde(rename = "TiVoServer")]
struct ServerInfo {
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "InternalName")]
    internal_name: &'static str,
    #[serde(rename = "InternalVersion")]
    internal_version: &'static str,
    #[serde(rename = "Organization")]
    organization: &'static str,
    #[serde(rename = "Comment")]
    comment: &'static str,
}

#[derive(Serialize)]
#[serde(rename = "TiVoFormats")]
struct Formats {
    #[serde(rename = "Format")]
    formats: Vec<Format>,
}

#[derive(Serialize)]
struct Format {
    #[serde(rename = "ContentType")]
    content_type: &'static str,
    #[serde(rename = "Description")]
    description: &'static str,
}

async fn tivo_connect(
    State(server): State<Arc<MediaServer>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    let command = query.get("Command").map(String::as_str).unwrap_or_default();
    debug!(command, "protocol command");
    match command {
        "QueryServer" => Ok(xml_response(to_xml(&ServerInfo {
            version: SERVER_VERSION,
            internal_name: INTERNAL_NAME,
            internal_version: SERVER_VERSION,
            organization: ORGANIZATION,
            comment: "",
        })?)),
        "QueryFormats" => {
            let mut formats = vec![Format { content_type: MIME_TIVO_MPEG, description: "" }];
            if server.ts_output(device_profile(&headers)) {
                formats.push(Format { content_type: MIME_TIVO_MPEG_TS, description: "" });
            }
            Ok(xml_response(to_xml(&Formats { formats })?))
        }
        "QueryContainer" => query_container(&server, &query, &headers).await,
        "GetActiveTransferCount" => Ok(Json(json!({ "count": server.board.active_count() })).into_response()),
        "GetTransferStatus" => Ok(Json(server.board.snapshot()).into_response()),
        "FlushServer" | "ResetServer" => {
            server.decisions.clear();
            info!(command, "flushed decision cache");
            Ok(StatusCode::OK.into_response())
        }
        other => Err(ServerError::NotFound(format!("unknown command {other:?}"))),
    }
}

/// Url path for `segments`, percent-encoded.
fn encoded_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut url = match Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return "/".to_string(),
    };
    if let Ok(mut path) = url.path_segments_mut() {
        path.clear().extend(segments);
    }
    url.path().to_string()
}

fn container_link(container: &str) -> String {
    let mut url = match Url::parse("http://localhost/TiVoConnect") {
        Ok(url) => url,
        Err(_) => return "/TiVoConnect".to_string(),
    };
    url.query_pairs_mut()
        .append_pair("Command", "QueryContainer")
        .append_pair("Container", container);
    format!("{}?{}", url.path(), url.query().unwrap_or_default())
}

fn paging(query: &HashMap<String, String>, total: usize) -> (usize, usize) {
    let start = query
        .get("AnchorOffset")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0)
        .min(total);
    let count = query
        .get("ItemCount")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|n| n.unsigned_abs() as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    (start, count)
}

struct Entry {
    name: String,
    path: PathBuf,
    is_dir: bool,
    size: u64,
    modified: i64,
}

async fn list_dir(dir: &FsPath) -> ServerResult<Vec<Entry>> {
    let mut read = tokio::fs::read_dir(dir)
        .await
        .map_err(|_| ServerError::NotFound(dir.display().to_string()))?;
    let mut entries = Vec::new();
    while let Some(entry) = read.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata().await?;
        let is_video = FsPath::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !meta.is_dir() && !is_video {
            continue;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        entries.push(Entry { name, path: entry.path(), is_dir: meta.is_dir(), size: meta.len(), modified });
    }
    // Folders first, then by name.
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase())));
    Ok(entries)
}

async fn read_probe(path: &FsPath) -> Option<ContainerHeader> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut probe = [0u8; CONTAINER_PROBE_LEN];
    file.read_exact(&mut probe).await.ok()?;
    ContainerHeader::parse(&probe)
}

async fn query_container(server: &MediaServer, query: &HashMap<String, String>, headers: &HeaderMap) -> ServerResult<Response> {
    let container = query.get("Container").map(|c| c.trim_matches('/')).unwrap_or_default();
    if container.is_empty() {
        let items = server
            .shares
            .iter()
            .map(|share| Item {
                details: ItemDetails {
                    title: share.name.clone(),
                    content_type: Some(MIME_VIDEO_CONTAINER.to_string()),
                    source_format: Some(MIME_FOLDER.to_string()),
                    ..ItemDetails::default()
                },
                links: Some(ItemLinks {
                    content: Some(Link {
                        url: container_link(&share.name),
                        content_type: Some(MIME_VIDEO_CONTAINER.to_string()),
                    }),
                }),
            })
            .collect::<Vec<_>>();
        let total = items.len() as u32;
        let page = Container::page(INTERNAL_NAME, MIME_FOLDER, items, 0, total);
        return Ok(xml_response(page.to_xml()?));
    }

    let (share, relative) = container.split_once('/').unwrap_or((container, ""));
    let dir = server.local_path(share, relative)?;
    let entries = list_dir(&dir).await?;
    let (start, count) = paging(query, entries.len());
    let profile = device_profile(headers);

    let mut items = Vec::new();
    for entry in entries.iter().skip(start).take(count) {
        let mut segments: Vec<&str> = vec![share];
        segments.extend(relative.split('/').filter(|s| !s.is_empty()));
        segments.push(&entry.name);
        if entry.is_dir {
            items.push(Item {
                details: ItemDetails {
                    title: entry.name.clone(),
                    content_type: Some(MIME_VIDEO_CONTAINER.to_string()),
                    source_format: Some(MIME_FOLDER.to_string()),
                    ..ItemDetails::default()
                },
                links: Some(ItemLinks {
                    content: Some(Link {
                        url: container_link(&segments.join("/")),
                        content_type: Some(MIME_VIDEO_CONTAINER.to_string()),
                    }),
                }),
            });
            continue;
        }
        let header = read_probe(&entry.path).await;
        let ts = server.ts_output(profile)
            && match header {
                Some(h) => h.transport_stream,
                None => server.ts_mode == TsMode::On,
            };
        let mime = if ts { MIME_TIVO_MPEG_TS } else { MIME_TIVO_MPEG };
        let source_format = if header.is_some() { MIME_TIVO_MPEG } else { "video/mpeg" };
        let title = FsPath::new(&entry.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.name.clone());
        items.push(Item {
            details: ItemDetails {
                title,
                content_type: Some(mime.to_string()),
                source_format: Some(source_format.to_string()),
                source_size: Some(entry.size.to_string()),
                capture_date: Some(format!("0x{:X}", entry.modified)),
                ..ItemDetails::default()
            },
            links: Some(ItemLinks {
                content: Some(Link { url: encoded_path(segments.iter().copied()), content_type: Some(mime.to_string()) }),
            }),
        });
    }
    let title = container.rsplit('/').next().unwrap_or(container);
    let page = Container::page(title, MIME_VIDEO_CONTAINER, items, start as u32, entries.len() as u32);
    Ok(xml_response(page.to_xml()?))
}

/// Parses `bytes=START-[END]`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Byte stream that reports progress to the transfer board and marks the
/// session complete once the body is exhausted.
struct BoardStream {
    body: ByteStream,
    session: Option<ServeSession>,
}

impl Stream for BoardStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.body.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                let sent = chunk.len();
                if let Some(session) = self.session.as_mut() {
                    session.record(sent);
                }
            }
            Poll::Ready(None) => {
                if let Some(session) = self.session.take() {
                    session.complete();
                }
            }
            _ => {}
        }
        polled
    }
}

async fn serve_file(
    State(server): State<Arc<MediaServer>>,
    Path((share, relative)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> ServerResult<Response> {
    let path = server.local_path(&share, &relative)?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ServerError::NotFound(format!("{share}/{relative}")))?;
    if !meta.is_file() {
        return Err(ServerError::NotFound(format!("{share}/{relative}")));
    }
    let headers = request.headers();
    let client = client_address(request.extensions())
        .map(|a| a.ip().to_string())
        .or_else(|| headers.get("tsn").and_then(|v| v.to_str().ok()).map(String::from))
        .unwrap_or_else(|| "unknown".to_string());
    let profile = device_profile(headers);
    let wants_ts = query.get("Format").is_some_and(|f| f == MIME_TIVO_MPEG_TS);
    let output = if wants_ts && server.ts_output(profile) { OutputFormat::TransportStream } else { OutputFormat::ProgramStream };
    let mime = match output {
        OutputFormat::TransportStream => MIME_TIVO_MPEG_TS,
        OutputFormat::ProgramStream => MIME_TIVO_MPEG,
    };
    let range = match headers.get(header::RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(parse_range)
                .ok_or_else(|| ServerError::BadRequest("malformed Range header".into()))?,
        ),
        None => None,
    };

    // Receiver container files go out untouched.
    let decision = match read_probe(&path).await {
        Some(_) => TranscodeDecision::PassThrough,
        None => server.decision(&path, profile, output).await?,
    };

    match decision {
        TranscodeDecision::PassThrough => {
            let size = meta.len();
            let (start, end) = match range {
                Some((start, end)) => (start, end.unwrap_or(size.saturating_sub(1)).min(size.saturating_sub(1))),
                None => (0, size.saturating_sub(1)),
            };
            if range.is_some() && (start >= size || start > end) {
                return Err(ServerError::RangeNotSatisfiable { size: Some(size) });
            }
            let length = if size == 0 { 0 } else { end - start + 1 };
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let body = ReaderStream::new(file.take(length)).boxed();
            let session = server.board.begin(&client, &path, start, false);
            let stream = BoardStream { body, session: Some(session) };

            let mut response = Response::builder()
                .status(if range.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK })
                .header(header::CONTENT_TYPE, mime)
                .header(header::CONTENT_LENGTH, length)
                .header(header::ACCEPT_RANGES, "bytes");
            if range.is_some() {
                response = response.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
            }
            response
                .body(Body::from_stream(stream))
                .map_err(|e| ServerError::Io(std::io::Error::other(e)))
        }
        TranscodeDecision::Transcode { options } => {
            // Transcoded output cannot be seeked into.
            if range.is_some_and(|(start, _)| start > 0) {
                return Err(ServerError::RangeNotSatisfiable { size: None });
            }
            let body = server.transcoder.spawn(&path, &options)?.boxed();
            let session = server.board.begin(&client, &path, 0, true);
            let stream = BoardStream { body, session: Some(session) };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .body(Body::from_stream(stream))
                .map_err(|e| ServerError::Io(std::io::Error::other(e)))
        }
    }
}

/// Pull request accepted by the JSON API. The destination is always the
/// configured pull directory.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullBody {
    pub recording: Recording,
    #[serde(default)]
    pub decode: Option<bool>,
    #[serde(default)]
    pub error_mode: Option<ErrorMode>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

async fn list_pulls(State(server): State<Arc<MediaServer>>) -> Response {
    Json(server.manager.list()).into_response()
}

async fn create_pull(State(server): State<Arc<MediaServer>>, Json(body): Json<PullBody>) -> ServerResult<Response> {
    server.check_pull_source(&body.recording.source).await?;
    let mut request = PullRequest::new(body.recording);
    request.decode = body.decode;
    request.error_mode = body.error_mode;
    request.max_attempts = body.max_attempts;
    let id = server.manager.submit(request)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

async fn pull_status(State(server): State<Arc<MediaServer>>, Path(id): Path<TaskId>) -> ServerResult<Response> {
    Ok(Json(server.manager.status(id)?).into_response())
}

async fn cancel_pull(State(server): State<Arc<MediaServer>>, Path(id): Path<TaskId>) -> ServerResult<Response> {
    server.manager.cancel(id)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn acknowledge_pull(State(server): State<Arc<MediaServer>>, Path(id): Path<TaskId>) -> ServerResult<Response> {
    let evicted = server.manager.acknowledge(id)?;
    Ok(Json(json!({ "evicted": evicted })).into_response())
}

async fn now_playing(State(server): State<Arc<MediaServer>>, Path(unit): Path<String>) -> ServerResult<Response> {
    let client = server.sources.receiver(&unit)?;
    let recordings = client.now_playing().await?;
    Ok(Json(recordings).into_response())
}
