// src/receiver.rs

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, COOKIE, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::models::{Recording, SourceLocator, StreamKind};
use crate::npl::{Container, NplError, MIME_TIVO_MPEG_TS};
use crate::session::TransferError;

/// Receivers answer with this session cookie.
const SESSION_COOKIE: &str = "sid=ADEADDA7EDEBAC1E";
const AUTH_USER: &str = "tivo";
const PAGE_SIZE: u32 = 50;

pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// An opened source: the body and, when announced, its length.
pub struct SourceStream {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Opens the bytes of a recording.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn open(&self, recording: &Recording) -> Result<SourceStream, TransferError>;

    /// Key material for the decode collaborator.
    fn media_access_key(&self, _unit: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("receiver is busy")]
    Busy,
    #[error("receiver rejected the credentials")]
    Unauthorized,
    #[error("receiver answered {0}")]
    Status(StatusCode),
    #[error("bad receiver url: {0}")]
    Url(String),
    #[error(transparent)]
    Npl(#[from] NplError),
    #[error("unknown receiver unit '{0}'")]
    UnknownUnit(String),
}

impl From<ReceiverError> for TransferError {
    fn from(error: ReceiverError) -> Self {
        match error {
            ReceiverError::Http(e) if e.is_timeout() => TransferError::Timeout("connecting"),
            other => TransferError::Connect(other.to_string()),
        }
    }
}

/// Parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Digest")?.trim();
        let mut values = HashMap::new();
        for (key, value) in split_params(params) {
            values.insert(key.to_ascii_lowercase(), value);
        }
        Some(Self {
            realm: values.remove("realm")?,
            nonce: values.remove("nonce")?,
            // Only `auth` is supported among offered qop values.
            qop: values
                .remove("qop")
                .filter(|q| q.split(',').any(|v| v.trim() == "auth"))
                .map(|_| "auth".to_string()),
            opaque: values.remove("opaque"),
        })
    }

    /// Builds the `Authorization` header value for one request.
    pub fn authorization(&self, user: &str, password: &str, method: &str, uri: &str, nc: u32, cnonce: &str) -> String {
        let ha1 = md5_hex(&format!("{user}:{}:{password}", self.realm));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let nc = format!("{nc:08x}");
        let mut header = format!(
            "Digest username=\"{user}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\"",
            self.realm, self.nonce
        );
        match &self.qop {
            Some(qop) => {
                let response = md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}", self.nonce));
                header.push_str(&format!(", response=\"{response}\", qop={qop}, nc={nc}, cnonce=\"{cnonce}\""));
            }
            None => {
                let response = md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce));
                header.push_str(&format!(", response=\"{response}\""));
            }
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str(", algorithm=MD5");
        header
    }
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Splits `a="x, y", b=z` into pairs, honouring quotes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        pairs.push((key, value));
    }
    pairs
}

/// HTTP client for one receiver unit.
pub struct ReceiverClient {
    config: ReceiverConfig,
    http: Client,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
    stream_kind: StreamKind,
}

impl ReceiverClient {
    pub fn new(config: ReceiverConfig, connect_timeout: Duration, stream_kind: StreamKind) -> Result<Self, ReceiverError> {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static(SESSION_COOKIE));
        if let Ok(tsn) = HeaderValue::from_str(&config.tsn) {
            headers.insert("tsn", tsn);
        }
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            // Receivers present self-signed certificates.
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            config,
            http,
            challenge: Mutex::new(None),
            nonce_count: AtomicU32::new(0),
            stream_kind,
        })
    }

    pub fn unit(&self) -> &str {
        &self.config.id
    }

    pub fn media_access_key(&self) -> &str {
        &self.config.media_access_key
    }

    fn now_playing_url(&self, offset: u32) -> Result<Url, ReceiverError> {
        let mut url = Url::parse(&format!("https://{}:{}/TiVoConnect", self.config.address, self.config.port))
            .map_err(|e| ReceiverError::Url(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("Command", "QueryContainer")
            .append_pair("Container", "/NowPlaying")
            .append_pair("Recurse", "Yes")
            .append_pair("ItemCount", &PAGE_SIZE.to_string())
            .append_pair("AnchorOffset", &offset.to_string());
        Ok(url)
    }

    /// Download url for a recording, selecting the transport-stream
    /// framing when asked for.
    pub fn content_url(url: &str, stream_kind: StreamKind) -> Result<Url, ReceiverError> {
        let mut url = Url::parse(url).map_err(|e| ReceiverError::Url(e.to_string()))?;
        if stream_kind == StreamKind::Ts {
            url.query_pairs_mut().append_pair("Format", MIME_TIVO_MPEG_TS);
        }
        Ok(url)
    }

    /// Issues an authenticated GET, answering one digest challenge.
    async fn get(&self, url: Url) -> Result<reqwest::Response, ReceiverError> {
        for _ in 0..2 {
            let mut request = self.http.get(url.clone());
            if let Some(auth) = self.authorization(&url) {
                request = request.header(AUTHORIZATION, auth);
            }
            let response = request.send().await?;
            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    let challenge = response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(DigestChallenge::parse)
                        .ok_or(ReceiverError::Unauthorized)?;
                    debug!(unit = %self.config.id, realm = %challenge.realm, "digest challenge");
                    *self.challenge.lock() = Some(challenge);
                }
                StatusCode::SERVICE_UNAVAILABLE => return Err(ReceiverError::Busy),
                status if status.is_success() => return Ok(response),
                status => return Err(ReceiverError::Status(status)),
            }
        }
        Err(ReceiverError::Unauthorized)
    }

    fn authorization(&self, url: &Url) -> Option<String> {
        let challenge = self.challenge.lock().clone()?;
        let nc = self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut uri = url.path().to_string();
        if let Some(query) = url.query() {
            uri.push('?');
            uri.push_str(query);
        }
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        let cnonce = md5_hex(&format!("{seed}:{nc}"))[..16].to_string();
        Some(challenge.authorization(AUTH_USER, &self.config.media_access_key, "GET", &uri, nc, &cnonce))
    }

    /// Fetches the whole now playing list, one page at a time.
    pub async fn now_playing(&self) -> Result<Vec<Recording>, ReceiverError> {
        let mut recordings = Vec::new();
        let mut offset = 0;
        loop {
            let url = self.now_playing_url(offset)?;
            let body = self.get(url.clone()).await?.text().await?;
            let page = Container::parse(&body)?;
            if page.items.is_empty() {
                break;
            }
            let received = if page.item_count > 0 { page.item_count } else { page.items.len() as u32 };
            recordings.extend(page.recordings(&self.config.id, &url, self.stream_kind));
            offset += received;
            debug!(unit = %self.config.id, offset, total = page.total_items(), "now playing page");
            if offset >= page.total_items() {
                break;
            }
        }
        info!(unit = %self.config.id, count = recordings.len(), "fetched now playing list");
        Ok(recordings)
    }

    pub async fn open_url(&self, url: &str, stream_kind: StreamKind) -> Result<SourceStream, ReceiverError> {
        let url = Self::content_url(url, stream_kind)?;
        let response = self.get(url).await?;
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)).boxed();
        Ok(SourceStream { content_length, body })
    }
}

/// Opens recordings stored on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSource;

impl LocalSource {
    pub async fn open_path(path: &std::path::Path) -> Result<SourceStream, TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::Connect(format!("{}: {e}", path.display())))?;
        let content_length = Some(file.metadata().await?.len());
        Ok(SourceStream { content_length, body: ReaderStream::new(file).boxed() })
    }
}

#[async_trait]
impl SourceConnector for LocalSource {
    async fn open(&self, recording: &Recording) -> Result<SourceStream, TransferError> {
        match &recording.source {
            SourceLocator::Local { path } => Self::open_path(path).await,
            SourceLocator::Receiver { unit, .. } => Err(ReceiverError::UnknownUnit(unit.clone()).into()),
        }
    }
}

/// Routes each recording to the local filesystem or its receiver.
#[derive(Default)]
pub struct Sources {
    receivers: HashMap<String, Arc<ReceiverClient>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, client: ReceiverClient) {
        self.receivers.insert(client.unit().to_string(), Arc::new(client));
    }

    pub fn receiver(&self, unit: &str) -> Result<Arc<ReceiverClient>, ReceiverError> {
        self.receivers
            .get(unit)
            .cloned()
            .ok_or_else(|| ReceiverError::UnknownUnit(unit.to_string()))
    }

    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.receivers.keys().map(String::as_str)
    }
}

#[async_trait]
impl SourceConnector for Sources {
    async fn open(&self, recording: &Recording) -> Result<SourceStream, TransferError> {
        match &recording.source {
            SourceLocator::Local { path } => LocalSource::open_path(path).await,
            SourceLocator::Receiver { unit, url } => {
                let client = self.receiver(unit)?;
                client.open_url(url, recording.stream_kind).await.map_err(|e| {
                    warn!(unit = %unit, error = %e, "receiver request failed");
                    TransferError::from(e)
                })
            }
        }
    }

    fn media_access_key(&self, unit: &str) -> Option<String> {
        self.receivers
            .get(unit)
            .map(|r| r.media_access_key().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let header = r#"Digest realm="TiVo DVR", nonce="5AB1C3", qop="auth,auth-int", opaque="xyz""#;
        let challenge = DigestChallenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "TiVo DVR");
        assert_eq!(challenge.nonce, "5AB1C3");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(DigestChallenge::parse("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn digest_response_matches_rfc_2617_example() {
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            qop: Some("auth".into()),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
        };
        let header = challenge.authorization("Mufasa", "Circle Of Life", "GET", "/dir/index.html", 1, "0a4f113b");
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("nc=00000001"));
    }

    #[test]
    fn ts_pulls_request_the_ts_format() {
        let url = ReceiverClient::content_url("http://10.0.0.9/download/a.TiVo?id=1", StreamKind::Ts).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.9/download/a.TiVo?id=1&Format=video%2Fx-tivo-mpeg-ts");
        let url = ReceiverClient::content_url("http://10.0.0.9/download/a.TiVo?id=1", StreamKind::Ps).unwrap();
        assert!(!url.as_str().contains("Format"));
    }

    #[test]
    fn receiver_errors_map_to_connect_failures() {
        let error: TransferError = ReceiverError::Busy.into();
        assert!(matches!(error, TransferError::Connect(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn local_source_reports_file_length() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.ts");
        tokio::fs::write(&path, vec![0x47u8; 376]).await.unwrap();
        let rec = Recording::new("a", "A", SourceLocator::Local { path });
        let mut source = LocalSource.open(&rec).await.unwrap();
        assert_eq!(source.content_length, Some(376));
        let mut total = 0;
        while let Some(chunk) = source.body.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 376);
    }
}
