// src/transcode.rs

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const MAX_VIDEO_BITRATE_KBPS: u32 = 30_000;
pub const AUDIO_BITRATE_KBPS: u32 = 448;
/// Aspect ratio above which a source counts as widescreen.
const WIDESCREEN_THRESHOLD: f64 = 1.5;
const STANDARD_ASPECT: f64 = 4.0 / 3.0;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not run prober: {0}")]
    Spawn(#[from] io::Error),
    #[error("prober failed: {0}")]
    Failed(String),
    #[error("unreadable probe output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed set of device capability profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    StandardDefinition,
    HighDefinition,
    HighDefinitionTs,
    UltraHighDefinition,
}

impl DeviceProfile {
    /// Derives the profile from a device serial number.
    pub fn from_tsn(tsn: &str) -> Self {
        let tsn: String = tsn.chars().filter(|c| *c != '-').collect::<String>().to_ascii_uppercase();
        let prefix = tsn.get(..3).unwrap_or("");
        let first = tsn.chars().next().unwrap_or('0');
        if prefix == "849" || prefix == "8F9" {
            DeviceProfile::UltraHighDefinition
        } else if first >= '7' || prefix == "663" {
            DeviceProfile::HighDefinitionTs
        } else if first >= '6' && prefix != "649" {
            DeviceProfile::HighDefinition
        } else {
            DeviceProfile::StandardDefinition
        }
    }

    pub fn max_width(self) -> u32 {
        match self {
            DeviceProfile::StandardDefinition => 544,
            DeviceProfile::HighDefinition | DeviceProfile::HighDefinitionTs => 1920,
            DeviceProfile::UltraHighDefinition => 3840,
        }
    }

    pub fn max_height(self) -> u32 {
        match self {
            DeviceProfile::StandardDefinition => 480,
            DeviceProfile::HighDefinition | DeviceProfile::HighDefinitionTs => 1080,
            DeviceProfile::UltraHighDefinition => 2160,
        }
    }

    pub fn video_bitrate_kbps(self) -> u32 {
        match self {
            DeviceProfile::StandardDefinition => 4096,
            DeviceProfile::HighDefinition | DeviceProfile::HighDefinitionTs => 16384,
            DeviceProfile::UltraHighDefinition => MAX_VIDEO_BITRATE_KBPS,
        }
    }

    pub fn buffer_kbps(self) -> u32 {
        match self {
            DeviceProfile::StandardDefinition => 1024,
            DeviceProfile::HighDefinition | DeviceProfile::HighDefinitionTs => 4096,
            DeviceProfile::UltraHighDefinition => 8192,
        }
    }

    pub fn supports_ts(self) -> bool {
        matches!(self, DeviceProfile::HighDefinitionTs | DeviceProfile::UltraHighDefinition)
    }

    /// Standard-definition devices show widescreen sources letterboxed.
    pub fn letterboxes_widescreen(self) -> bool {
        self == DeviceProfile::StandardDefinition
    }
}

/// Framing of the bytes sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    ProgramStream,
    TransportStream,
}

impl OutputFormat {
    fn muxer(self) -> &'static str {
        match self {
            OutputFormat::ProgramStream => "vob",
            OutputFormat::TransportStream => "mpegts",
        }
    }
}

/// What the prober found out about a source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    /// Display aspect ratio, width over height.
    pub aspect: Option<f64>,
    pub duration_secs: Option<f64>,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    display_aspect_ratio: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

impl SourceInfo {
    /// Parses `ffprobe -print_format json -show_format -show_streams` output.
    pub fn from_probe_json(json: &str) -> Result<Self, ProbeError> {
        let output: ProbeOutput = serde_json::from_str(json)?;
        let video = output.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"));
        let audio = output.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"));
        let format = output.format.as_ref();

        let width = video.and_then(|v| v.width);
        let height = video.and_then(|v| v.height);
        let aspect = video
            .and_then(|v| v.display_aspect_ratio.as_deref())
            .and_then(parse_ratio)
            .or_else(|| match (width, height) {
                (Some(w), Some(h)) if h > 0 => Some(f64::from(w) / f64::from(h)),
                _ => None,
            });
        let bitrate_kbps = video
            .and_then(|v| v.bit_rate.as_deref())
            .or_else(|| format.and_then(|f| f.bit_rate.as_deref()))
            .and_then(|b| b.parse::<u64>().ok())
            .map(|bps| (bps / 1000) as u32);

        Ok(Self {
            container: format.and_then(|f| f.format_name.clone()).unwrap_or_default(),
            video_codec: video.and_then(|v| v.codec_name.clone()),
            audio_codec: audio.and_then(|a| a.codec_name.clone()),
            width,
            height,
            bitrate_kbps,
            aspect,
            duration_secs: format.and_then(|f| f.duration.as_deref()).and_then(|d| d.parse().ok()),
        })
    }

    fn is_widescreen(&self) -> bool {
        self.aspect.is_some_and(|a| a > WIDESCREEN_THRESHOLD)
    }

    fn has_container(&self, name: &str) -> bool {
        self.container.split(',').any(|c| c == name)
    }
}

fn parse_ratio(value: &str) -> Option<f64> {
    let (w, h) = value.split_once(':')?;
    let (w, h): (f64, f64) = (w.parse().ok()?, h.parse().ok()?);
    (w > 0.0 && h > 0.0).then_some(w / h)
}

/// Runs the media prober.
#[derive(Debug, Clone)]
pub struct Prober {
    program: PathBuf,
}

impl Prober {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub async fn probe(&self, path: &Path) -> Result<SourceInfo, ProbeError> {
        let output = Command::new(&self.program)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProbeError::Failed(format!("{} exited with {}", self.program.display(), output.status)));
        }
        SourceInfo::from_probe_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Pass-through or transcode, with the transcoder options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TranscodeDecision {
    PassThrough,
    Transcode { options: Vec<String> },
}

impl TranscodeDecision {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, TranscodeDecision::PassThrough)
    }
}

/// Identity of a source file for decision caching. Only the path is
/// hashed, so a changed file needs an explicit invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileFingerprint(String);

impl FileFingerprint {
    /// Fingerprint of the canonical path. A path that cannot be resolved is
    /// hashed as given.
    pub async fn of(path: &Path) -> Self {
        let canonical = tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub file: FileFingerprint,
    pub profile: DeviceProfile,
    pub output: OutputFormat,
}

/// Decides whether `info` can go to a `profile` device unchanged, and if
/// not, which transcoder options produce something it can play.
pub fn decide(info: &SourceInfo, profile: DeviceProfile, output: OutputFormat) -> TranscodeDecision {
    let container_ok = match output {
        OutputFormat::ProgramStream => info.has_container("mpeg"),
        OutputFormat::TransportStream => info.has_container("mpegts"),
    };
    let video_ok = video_compatible(info, profile, output);
    let audio_ok = audio_compatible(info, output);
    if container_ok && video_ok && audio_ok {
        return TranscodeDecision::PassThrough;
    }

    let mut options = Vec::new();
    if video_ok {
        options.extend(["-c:v", "copy"].map(String::from));
    } else {
        options.extend([
            "-c:v".to_string(),
            "mpeg2video".to_string(),
            "-b:v".to_string(),
            format!("{}k", profile.video_bitrate_kbps()),
            "-maxrate".to_string(),
            format!("{MAX_VIDEO_BITRATE_KBPS}k"),
            "-bufsize".to_string(),
            format!("{}k", profile.buffer_kbps()),
        ]);
        if let Some(filter) = video_filter(info, profile) {
            options.extend(["-vf".to_string(), filter]);
        }
    }
    if audio_ok {
        options.extend(["-c:a", "copy"].map(String::from));
    } else {
        options.extend(["-c:a".to_string(), "ac3".to_string(), "-b:a".to_string(), format!("{AUDIO_BITRATE_KBPS}k")]);
    }
    options.extend(["-f".to_string(), output.muxer().to_string()]);
    TranscodeDecision::Transcode { options }
}

fn video_compatible(info: &SourceInfo, profile: DeviceProfile, output: OutputFormat) -> bool {
    let codec_ok = match info.video_codec.as_deref() {
        Some("mpeg2video") => true,
        Some("h264") => output == OutputFormat::TransportStream && profile.supports_ts(),
        Some("hevc") => output == OutputFormat::TransportStream && profile == DeviceProfile::UltraHighDefinition,
        _ => false,
    };
    let size_ok = match (info.width, info.height) {
        (Some(w), Some(h)) => w <= profile.max_width() && h <= profile.max_height(),
        _ => false,
    };
    let bitrate_ok = info.bitrate_kbps.map_or(true, |b| b <= MAX_VIDEO_BITRATE_KBPS);
    let letterbox = profile.letterboxes_widescreen() && info.is_widescreen();
    codec_ok && size_ok && bitrate_ok && !letterbox
}

fn audio_compatible(info: &SourceInfo, output: OutputFormat) -> bool {
    match info.audio_codec.as_deref() {
        None | Some("ac3") | Some("mp2") => true,
        Some("aac") => output == OutputFormat::TransportStream,
        _ => false,
    }
}

fn even(value: f64) -> u32 {
    ((value / 2.0).round() as u32 * 2).max(2)
}

/// Scaling, and for standard-definition devices the letterbox padding.
fn video_filter(info: &SourceInfo, profile: DeviceProfile) -> Option<String> {
    let (max_w, max_h) = (profile.max_width(), profile.max_height());
    if profile.letterboxes_widescreen() && info.is_widescreen() {
        let aspect = info.aspect.unwrap_or(16.0 / 9.0);
        let active = even(f64::from(max_h) * STANDARD_ASPECT / aspect);
        let top = (max_h - active.min(max_h)) / 2;
        return Some(format!("scale={max_w}:{active},pad={max_w}:{max_h}:0:{top}"));
    }
    let (w, h) = (info.width?, info.height?);
    if w <= max_w && h <= max_h {
        return None;
    }
    let scale = (f64::from(max_w) / f64::from(w)).min(f64::from(max_h) / f64::from(h));
    Some(format!("scale={}:{}", even(f64::from(w) * scale), even(f64::from(h) * scale)))
}

/// Starts the transcoding collaborator on demand.
#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Command-line for one transcode, writing to standard output.
    pub fn arguments(input: &Path, options: &[String]) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i"].map(String::from).to_vec();
        args.push(input.to_string_lossy().into_owned());
        args.extend(options.iter().cloned());
        args.push("-".to_string());
        args
    }

    pub fn spawn(&self, input: &Path, options: &[String]) -> io::Result<TranscodeStream> {
        let args = Self::arguments(input, options);
        debug!(program = %self.program.display(), ?args, "starting transcoder");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transcoder has no stdout"))?;
        Ok(TranscodeStream { _child: child, output: ReaderStream::new(stdout) })
    }
}

/// Transcoder output. Dropping the stream kills the process.
pub struct TranscodeStream {
    _child: Child,
    output: ReaderStream<ChildStdout>,
}

impl Stream for TranscodeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.output).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(container: &str, video: &str, audio: &str, w: u32, h: u32) -> SourceInfo {
        SourceInfo {
            container: container.into(),
            video_codec: Some(video.into()),
            audio_codec: Some(audio.into()),
            width: Some(w),
            height: Some(h),
            bitrate_kbps: Some(8000),
            aspect: Some(f64::from(w) / f64::from(h)),
            duration_secs: Some(60.0),
        }
    }

    #[test]
    fn profiles_follow_serial_prefix() {
        assert_eq!(DeviceProfile::from_tsn("849-0001-0000-0000"), DeviceProfile::UltraHighDefinition);
        assert_eq!(DeviceProfile::from_tsn("8f90001"), DeviceProfile::UltraHighDefinition);
        assert_eq!(DeviceProfile::from_tsn("7460001"), DeviceProfile::HighDefinitionTs);
        assert_eq!(DeviceProfile::from_tsn("6630001"), DeviceProfile::HighDefinitionTs);
        assert_eq!(DeviceProfile::from_tsn("6520001"), DeviceProfile::HighDefinition);
        assert_eq!(DeviceProfile::from_tsn("6490001"), DeviceProfile::StandardDefinition);
        assert_eq!(DeviceProfile::from_tsn("5400001"), DeviceProfile::StandardDefinition);
        assert_eq!(DeviceProfile::from_tsn(""), DeviceProfile::StandardDefinition);
    }

    #[test]
    fn compatible_mpeg2_passes_through() {
        let src = info("mpeg", "mpeg2video", "ac3", 1920, 1080);
        assert!(decide(&src, DeviceProfile::HighDefinition, OutputFormat::ProgramStream).is_pass_through());
    }

    #[test]
    fn h264_passes_through_only_as_ts_on_capable_devices() {
        let src = info("mpegts", "h264", "ac3", 1280, 720);
        assert!(decide(&src, DeviceProfile::HighDefinitionTs, OutputFormat::TransportStream).is_pass_through());
        assert!(!decide(&src, DeviceProfile::HighDefinition, OutputFormat::ProgramStream).is_pass_through());
    }

    #[test]
    fn oversized_source_is_scaled_and_audio_copied() {
        let src = info("matroska,webm", "h264", "ac3", 3840, 2160);
        let TranscodeDecision::Transcode { options } =
            decide(&src, DeviceProfile::HighDefinition, OutputFormat::ProgramStream)
        else {
            panic!("expected a transcode");
        };
        let joined = options.join(" ");
        assert!(joined.contains("-c:v mpeg2video -b:v 16384k -maxrate 30000k -bufsize 4096k"));
        assert!(joined.contains("-vf scale=1920:1080"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.ends_with("-f vob"));
    }

    #[test]
    fn widescreen_is_letterboxed_for_sd() {
        let src = info("mpeg", "mpeg2video", "mp2", 720, 405);
        let TranscodeDecision::Transcode { options } =
            decide(&src, DeviceProfile::StandardDefinition, OutputFormat::ProgramStream)
        else {
            panic!("expected a transcode");
        };
        assert!(options.contains(&"scale=544:360,pad=544:480:0:60".to_string()));
        assert!(options.contains(&"4096k".to_string()));
    }

    #[test]
    fn parses_probe_json() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720, "display_aspect_ratio": "16:9"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "42.5", "bit_rate": "2500000"}
        }"#;
        let parsed = SourceInfo::from_probe_json(json).unwrap();
        assert_eq!(parsed.video_codec.as_deref(), Some("h264"));
        assert_eq!(parsed.audio_codec.as_deref(), Some("aac"));
        assert_eq!((parsed.width, parsed.height), (Some(1280), Some(720)));
        assert_eq!(parsed.bitrate_kbps, Some(2500));
        assert!((parsed.aspect.unwrap() - 16.0 / 9.0).abs() < 1e-9);
        assert_eq!(parsed.duration_secs, Some(42.5));
    }

    #[tokio::test]
    async fn fingerprint_is_stable_per_path() {
        let a = FileFingerprint::of(Path::new("/videos/a.mkv")).await;
        assert_eq!(a, FileFingerprint::of(Path::new("/videos/a.mkv")).await);
        assert_ne!(a, FileFingerprint::of(Path::new("/videos/b.mkv")).await);
        assert_eq!(a.as_str().len(), 64);
    }

    #[tokio::test]
    async fn fingerprint_resolves_existing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.mkv"), b"x").await.unwrap();
        let direct = FileFingerprint::of(&dir.path().join("a.mkv")).await;
        let roundabout = FileFingerprint::of(&dir.path().join("sub/../a.mkv")).await;
        assert_eq!(direct, roundabout);
    }

    #[test]
    fn transcoder_writes_to_stdout() {
        let args = Transcoder::arguments(Path::new("/v/a.mkv"), &["-f".into(), "vob".into()]);
        assert_eq!(args, vec!["-hide_banner", "-loglevel", "error", "-i", "/v/a.mkv", "-f", "vob", "-"]);
    }
}
