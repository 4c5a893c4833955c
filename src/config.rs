// src/config.rs

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::decode::{Decoder, DecoderConfig};
use crate::manager::ManagerOptions;
use crate::models::{ErrorMode, StreamKind, SyncPolicy};
use crate::naming::{NamingResolver, TemplateError, DEFAULT_EPISODE_TEMPLATE, DEFAULT_MOVIE_TEMPLATE};
use crate::receiver::{ReceiverClient, ReceiverError, Sources};
use crate::session::PullSettings;

pub const DEFAULT_PORT: u16 = 9032;
pub const RECEIVER_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("bad naming template: {0}")]
    Template(#[from] TemplateError),
}

impl From<ReceiverError> for ConfigError {
    fn from(e: ReceiverError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Whether transport-stream output is offered to devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TsMode {
    /// Only to devices whose profile supports it.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Entries kept in the transcode decision cache. Zero or less disables it.
    pub decision_cache_capacity: i64,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Client address prefixes allowed to connect. Empty allows everyone.
    pub allowed_clients: Vec<String>,
    pub ts: TsMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            decision_cache_capacity: 256,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            allowed_clients: Vec::new(),
            ts: TsMode::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TogoConfig {
    pub path: PathBuf,
    pub max_attempts: u32,
    pub error_mode: ErrorMode,
    pub sync_policy: SyncPolicy,
    pub concurrency: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub decode: bool,
    pub save_metadata: bool,
    /// Pull transport streams instead of program streams.
    pub ts_format: bool,
    pub retain_finished: bool,
    pub decoder: Option<DecoderConfig>,
}

impl Default for TogoConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            max_attempts: 3,
            error_mode: ErrorMode::None,
            sync_policy: SyncPolicy::Collect,
            concurrency: 1,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            retry_delay_secs: 5,
            decode: false,
            save_metadata: false,
            ts_format: false,
            retain_finished: false,
            decoder: None,
        }
    }
}

impl TogoConfig {
    pub fn stream_kind(&self) -> StreamKind {
        if self.ts_format {
            StreamKind::Ts
        } else {
            StreamKind::Ps
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub movie: String,
    pub episode: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self { movie: DEFAULT_MOVIE_TEMPLATE.to_string(), episode: DEFAULT_EPISODE_TEMPLATE.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default = "default_receiver_port")]
    pub port: u16,
    #[serde(default)]
    pub tsn: String,
    pub media_access_key: String,
    /// Overrides `togo.concurrency` for this unit.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

fn default_receiver_port() -> u16 {
    RECEIVER_PORT
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub shares: Vec<ShareConfig>,
    pub togo: TogoConfig,
    pub naming: NamingConfig,
    pub receivers: Vec<ReceiverConfig>,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    /// Parses and validates a config document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.togo.max_attempts == 0 {
            return Err(ConfigError::Invalid("togo.max_attempts must be at least 1".into()));
        }
        if self.togo.concurrency == 0 {
            return Err(ConfigError::Invalid("togo.concurrency must be at least 1".into()));
        }
        if self.togo.decode && self.togo.decoder.is_none() {
            return Err(ConfigError::Invalid("togo.decode needs a [togo.decoder] table".into()));
        }
        let mut share_names = HashSet::new();
        for share in &self.shares {
            if share.name.is_empty() || share.name.contains('/') {
                return Err(ConfigError::Invalid(format!("bad share name {:?}", share.name)));
            }
            if !share_names.insert(share.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate share {:?}", share.name)));
            }
        }
        let mut unit_ids = HashSet::new();
        for receiver in &self.receivers {
            if receiver.id.is_empty() || receiver.id == crate::models::LOCAL_UNIT {
                return Err(ConfigError::Invalid(format!("bad receiver id {:?}", receiver.id)));
            }
            if !unit_ids.insert(receiver.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate receiver {:?}", receiver.id)));
            }
            if receiver.concurrency == Some(0) {
                return Err(ConfigError::Invalid(format!("receiver {:?} concurrency must be at least 1", receiver.id)));
            }
            if receiver.media_access_key.is_empty() {
                warn!(unit = %receiver.id, "receiver has no media access key");
            }
        }
        self.naming_resolver()?;
        Ok(())
    }

    pub fn naming_resolver(&self) -> Result<NamingResolver, TemplateError> {
        NamingResolver::new(&self.naming.movie, &self.naming.episode)
    }

    pub fn manager_options(&self) -> Result<ManagerOptions, ConfigError> {
        let togo = &self.togo;
        let pull = PullSettings {
            sync_policy: togo.sync_policy,
            connect_timeout: Duration::from_secs(togo.connect_timeout_secs),
            read_timeout: Duration::from_secs(togo.read_timeout_secs),
            save_metadata: togo.save_metadata,
            naming: Arc::new(self.naming_resolver()?),
            decoder: togo.decoder.clone().map(|d| Arc::new(Decoder::new(d))),
        };
        Ok(ManagerOptions {
            destination: togo.path.clone(),
            max_attempts: togo.max_attempts,
            error_mode: togo.error_mode,
            decode: togo.decode,
            concurrency: togo.concurrency,
            unit_concurrency: self
                .receivers
                .iter()
                .filter_map(|r| r.concurrency.map(|k| (r.id.clone(), k)))
                .collect(),
            retain_finished: togo.retain_finished,
            retry_delay: Duration::from_secs(togo.retry_delay_secs),
            pull,
        })
    }

    /// One client per configured receiver.
    pub fn sources(&self) -> Result<Sources, ConfigError> {
        let mut sources = Sources::new();
        let timeout = Duration::from_secs(self.togo.connect_timeout_secs);
        for receiver in &self.receivers {
            sources.add(ReceiverClient::new(receiver.clone(), timeout, self.togo.stream_kind())?);
        }
        Ok(sources)
    }

    pub fn share(&self, name: &str) -> Option<&ShareConfig> {
        self.shares.iter().find(|s| s.name == name)
    }
}
