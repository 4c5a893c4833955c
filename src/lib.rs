pub mod cache;
pub mod config;
pub mod decode;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod naming;
pub mod npl;
pub mod queue;
pub mod receiver;
pub mod report;
pub mod server;
pub mod session;
pub mod transcode;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::cache::LruCache;
    pub use crate::config::{Config, ConfigError};
    pub use crate::integrity::{StreamValidator, SyncError};
    pub use crate::manager::{DownloadManager, ManagerError, ManagerOptions, PullRequest};
    pub use crate::models::{DownloadTask, ErrorMode, Recording, SourceLocator, StreamKind, TaskSnapshot, TaskState};
    pub use crate::naming::NamingResolver;
    pub use crate::receiver::{SourceConnector, Sources};
    pub use crate::server::MediaServer;
    pub use crate::transcode::{DeviceProfile, OutputFormat, TranscodeDecision};
}
