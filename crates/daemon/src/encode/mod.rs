//! Encoding stage.
//!
//! The encoder is an external program that reports progress as one JSON
//! event per line. [`Encoder`] is the seam the workflow talks to;
//! [`CommandEncoder`] is the subprocess implementation.

pub mod command;

pub use command::{build_encode_command, CommandEncoder};

use crate::tool::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Progress events emitted by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncodeEvent {
    Initialization {
        message: String,
        #[serde(default)]
        input_file: Option<PathBuf>,
    },
    StageProgress {
        stage: String,
        percent: f32,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        eta_seconds: Option<u64>,
    },
    EncodingProgress {
        percent: f32,
        #[serde(default)]
        speed: Option<f32>,
        #[serde(default)]
        fps: Option<f32>,
        #[serde(default)]
        eta_seconds: Option<u64>,
    },
    Completed {
        #[serde(default)]
        message: Option<String>,
        output_file: PathBuf,
        #[serde(default)]
        size_reduction_percent: Option<f32>,
    },
}

impl EncodeEvent {
    /// Parses one line of encoder output. Non-event lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Completion of the encode in percent, for the events that carry one.
    pub fn percent(&self) -> Option<f32> {
        match self {
            EncodeEvent::StageProgress { percent, .. }
            | EncodeEvent::EncodingProgress { percent, .. } => Some(percent.clamp(0.0, 100.0)),
            EncodeEvent::Completed { .. } => Some(100.0),
            EncodeEvent::Initialization { .. } => None,
        }
    }

    /// Short human readable description.
    pub fn describe(&self) -> String {
        match self {
            EncodeEvent::Initialization { message, .. } => message.clone(),
            EncodeEvent::StageProgress { stage, message, .. } => match message {
                Some(message) => format!("{}: {}", stage, message),
                None => stage.clone(),
            },
            EncodeEvent::EncodingProgress { percent, fps, .. } => match fps {
                Some(fps) => format!("Encoding {:.1}% ({:.1} fps)", percent, fps),
                None => format!("Encoding {:.1}%", percent),
            },
            EncodeEvent::Completed {
                size_reduction_percent,
                ..
            } => match size_reduction_percent {
                Some(saved) => format!("Encoding complete ({:.1}% smaller)", saved),
                None => "Encoding complete".to_string(),
            },
        }
    }
}

/// One file to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Audio track ids to keep. Empty keeps the encoder's default choice.
    pub audio_tracks: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The encoder exited cleanly without reporting an output file.
    #[error("encoder finished without producing output for {0}")]
    NoOutput(PathBuf),

    #[error("encoded file {0} is missing or empty")]
    InvalidOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encodes `request.input`, reporting every event to `on_event`, and
    /// returns the encoded file.
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_event: &mut (dyn FnMut(EncodeEvent) + Send),
    ) -> Result<PathBuf, EncodeError>;
}
