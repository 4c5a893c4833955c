// src/decode.rs

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::TransferError;

/// How the external decoder is started. Arguments may contain `{mak}`,
/// `{input}` and `{output}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub program: PathBuf,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_args() -> Vec<String> {
    ["-m", "{mak}", "-o", "{output}", "{input}"].map(String::from).to_vec()
}

impl DecoderConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: default_args() }
    }
}

/// Runs the decode collaborator on a finished container file.
#[derive(Debug, Clone)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    fn arguments(&self, input: &Path, output: &Path, key: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{mak}", key)
                    .replace("{input}", &input)
                    .replace("{output}", &output)
            })
            .collect()
    }

    /// Decodes `input` into `output`. Any non-zero exit, or a missing
    /// output file, fails the attempt.
    pub async fn decode(&self, input: &Path, output: &Path, key: &str, cancel: &CancellationToken) -> Result<(), TransferError> {
        let program = self.config.program.display().to_string();
        debug!(%program, input = %input.display(), "starting decoder");
        let child = Command::new(&self.config.program)
            .args(self.arguments(input, output, key))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::Decode(format!("could not start {program}: {e}")))?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            result = child.wait_with_output() => result,
        };
        let finished = result.map_err(|e| TransferError::Decode(format!("{program}: {e}")))?;
        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr);
            let detail = stderr.lines().last().unwrap_or_default().trim().to_string();
            return Err(TransferError::Decode(format!("{program} exited with {}: {detail}", finished.status)));
        }
        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => {
                info!(%program, output = %output.display(), bytes = meta.len(), "decoded");
                Ok(())
            }
            _ => Err(TransferError::Decode(format!("{program} produced no output"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let decoder = Decoder::new(DecoderConfig::new("tivodecode"));
        let args = decoder.arguments(Path::new("/in/a.part"), Path::new("/out/a.ts"), "0123456789");
        assert_eq!(args, vec!["-m", "0123456789", "-o", "/out/a.ts", "/in/a.part"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_decode_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoder = Decoder::new(DecoderConfig { program: "false".into(), args: vec![] });
        let err = decoder
            .decode(&dir.path().join("in"), &dir.path().join("out"), "k", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copying_decoder_succeeds() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        tokio::fs::write(&input, b"payload").await.unwrap();
        let decoder = Decoder::new(DecoderConfig { program: "cp".into(), args: vec!["{input}".into(), "{output}".into()] });
        decoder.decode(&input, &output, "k", &CancellationToken::new()).await.unwrap();
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn missing_program_is_a_decode_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoder = Decoder::new(DecoderConfig::new("/nonexistent/decoder-binary"));
        let err = decoder
            .decode(&dir.path().join("in"), &dir.path().join("out"), "k", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }
}
