//! Subprocess encoder.
//!
//! Runs `<encoder> encode --input <file> --output <dir> --progress-json`
//! and follows the JSON events it prints on stdout.

use super::{EncodeError, EncodeEvent, EncodeRequest, Encoder};
use crate::config::Config;
use crate::tool::run_tool;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Builds the encoder invocation for one request.
pub fn build_encode_command(binary: &str, request: &EncodeRequest) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("encode");
    cmd.arg("--input").arg(&request.input);
    cmd.arg("--output").arg(&request.output_dir);
    cmd.arg("--progress-json");

    if !request.audio_tracks.is_empty() {
        cmd.arg("--audio-tracks").arg(request.audio_tracks.join(","));
    }

    cmd
}

#[derive(Debug, Clone)]
pub struct CommandEncoder {
    binary: String,
    timeout: Option<Duration>,
}

impl CommandEncoder {
    pub fn new(binary: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.encoder.binary.clone(), config.encode_timeout())
    }
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_event: &mut (dyn FnMut(EncodeEvent) + Send),
    ) -> Result<PathBuf, EncodeError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let cmd = build_encode_command(&self.binary, request);
        info!(input = %request.input.display(), "Encoding");

        let mut output_file: Option<PathBuf> = None;
        run_tool(cmd, self.timeout, |line| match EncodeEvent::parse(line) {
            Some(event) => {
                if let EncodeEvent::Completed { output_file: path, .. } = &event {
                    output_file = Some(path.clone());
                }
                on_event(event);
            }
            None => debug!(line, "encoder output"),
        })
        .await?;

        let output = output_file.ok_or_else(|| EncodeError::NoOutput(request.input.clone()))?;
        let len = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if len == 0 {
            return Err(EncodeError::InvalidOutput(output));
        }

        info!(output = %output.display(), bytes = len, "Encode complete");
        Ok(output)
    }
}
