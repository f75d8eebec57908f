//! Disc ripper driver.
//!
//! Wraps `makemkvcon` in robot mode: an info scan to enumerate titles, one
//! `mkv` run per selected title, and the drive's eject command. Every run is
//! bounded by a timeout from the configuration.

use super::model::{DiscType, Title};
use super::robot::{parse_line, parse_robot_output, RobotLine, MSG_SAVE_FAILED};
use crate::config::Config;
use crate::tool::{program_name, run_tool, ToolError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors from driving the disc.
#[derive(Debug, Error)]
pub enum DiscError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The disc was read but did not yield usable content.
    #[error("media error: {0}")]
    Media(String),

    /// The drive misbehaved (missing device, eject failure).
    #[error("drive error: {0}")]
    Hardware(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of an info scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscScan {
    pub disc_type: DiscType,
    pub disc_name: Option<String>,
    pub volume_name: Option<String>,
    pub titles: Vec<Title>,
}

/// Progress reported while a title is being ripped.
#[derive(Debug, Clone, PartialEq)]
pub struct RipProgress {
    /// Completion of the current title, 0.0 to 100.0.
    pub percent: f32,
    pub message: Option<String>,
}

#[async_trait]
pub trait DiscRipper: Send + Sync {
    /// Enumerates the titles on the disc in `device`.
    async fn scan_disc(&self, device: &str) -> Result<DiscScan, DiscError>;

    async fn scan(&self, device: &str) -> Result<Vec<Title>, DiscError> {
        Ok(self.scan_disc(device).await?.titles)
    }

    /// Rips one title into `output_dir` and returns the produced file.
    async fn rip(
        &self,
        device: &str,
        title: &Title,
        output_dir: &Path,
        progress: &mut (dyn FnMut(RipProgress) + Send),
    ) -> Result<PathBuf, DiscError>;

    async fn eject(&self, device: &str) -> Result<(), DiscError>;
}

/// Binaries and timeouts used by [`MakemkvRipper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipperSettings {
    pub binary: String,
    pub scan_timeout: Duration,
    pub rip_timeout: Duration,
    pub eject_binary: String,
    pub eject_timeout: Duration,
}

impl RipperSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.makemkv.binary.clone(),
            scan_timeout: config.scan_timeout(),
            rip_timeout: config.rip_timeout(),
            eject_binary: config.drive.eject_binary.clone(),
            eject_timeout: config.eject_timeout(),
        }
    }
}

/// [`DiscRipper`] backed by `makemkvcon`.
#[derive(Debug, Clone)]
pub struct MakemkvRipper {
    settings: RipperSettings,
}

impl MakemkvRipper {
    pub fn new(settings: RipperSettings) -> Self {
        Self { settings }
    }

    /// `makemkvcon info --noscan --robot dev:<device>`
    pub fn build_info_command(&self, device: &str) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("info")
            .arg("--noscan")
            .arg("--robot")
            .arg(format!("dev:{}", device));
        cmd
    }

    /// `makemkvcon mkv --noscan --robot dev:<device> <title> <work_dir>`
    pub fn build_rip_command(&self, device: &str, title_id: &str, work_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("mkv")
            .arg("--noscan")
            .arg("--robot")
            .arg(format!("dev:{}", device))
            .arg(title_id)
            .arg(work_dir);
        cmd
    }

    pub fn build_eject_command(&self, device: &str) -> Command {
        let mut cmd = Command::new(&self.settings.eject_binary);
        cmd.arg(device);
        cmd
    }
}

#[async_trait]
impl DiscRipper for MakemkvRipper {
    async fn scan_disc(&self, device: &str) -> Result<DiscScan, DiscError> {
        let cmd = self.build_info_command(device);
        let tool = program_name(&cmd);
        info!(device, "Scanning disc");

        let output = run_tool(cmd, Some(self.settings.scan_timeout), |_| {}).await?;
        let scan = parse_robot_output(&output.stdout_text());

        for msg in &scan.messages {
            debug!(device, code = msg.code, message = %msg.message, "makemkv message");
        }

        if scan.titles.is_empty() {
            return Err(ToolError::EmptyOutput {
                tool,
                detail: "no titles found on disc".to_string(),
                stderr: output.stderr,
            }
            .into());
        }

        info!(
            device,
            disc_type = %scan.disc_type,
            titles = scan.titles.len(),
            "Disc scan complete"
        );

        Ok(DiscScan {
            disc_type: scan.disc_type,
            disc_name: scan.disc_name,
            volume_name: scan.volume_name,
            titles: scan.titles,
        })
    }

    async fn rip(
        &self,
        device: &str,
        title: &Title,
        output_dir: &Path,
        progress: &mut (dyn FnMut(RipProgress) + Send),
    ) -> Result<PathBuf, DiscError> {
        let work_dir = output_dir.join(format!(".rip-title-{}", title.id));
        if work_dir.exists() {
            tokio::fs::remove_dir_all(&work_dir).await?;
        }
        tokio::fs::create_dir_all(&work_dir).await?;

        let cmd = self.build_rip_command(device, &title.id, &work_dir);
        let tool = program_name(&cmd);
        info!(device, title_id = %title.id, work_dir = %work_dir.display(), "Ripping title");

        let mut monitor = RipMonitor::default();
        let result = run_tool(cmd, Some(self.settings.rip_timeout), |line| {
            if let Some(update) = monitor.observe(line) {
                progress(update);
            }
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = e.tool(), title_id = %title.id, stderr = e.stderr(), "Rip command failed");
                remove_partial(&work_dir).await;
                return Err(e.into());
            }
        };

        if let Some(message) = monitor.failure {
            remove_partial(&work_dir).await;
            return Err(ToolError::Reported {
                tool,
                message,
                stderr: output.stderr,
            }
            .into());
        }

        let finished = finalize_rip(&work_dir, output_dir, title);
        remove_partial(&work_dir).await;
        let path = finished?;

        info!(title_id = %title.id, path = %path.display(), "Title ripped");
        Ok(path)
    }

    async fn eject(&self, device: &str) -> Result<(), DiscError> {
        let cmd = self.build_eject_command(device);
        run_tool(cmd, Some(self.settings.eject_timeout), |_| {})
            .await
            .map_err(|e| DiscError::Hardware(format!("eject {}: {}", device, e)))?;
        info!(device, "Disc ejected");
        Ok(())
    }
}

/// Tracks progress and failure messages in a rip's robot output.
#[derive(Debug, Default)]
pub(crate) struct RipMonitor {
    failure: Option<String>,
    last_percent: f32,
}

impl RipMonitor {
    pub(crate) fn observe(&mut self, line: &str) -> Option<RipProgress> {
        match parse_line(line)? {
            RobotLine::Progress { total, max, .. } => {
                let percent = progress_percent(total, max)?;
                // PRGV restarts for each internal pass; keep the reported value monotonic.
                if percent < self.last_percent {
                    return None;
                }
                self.last_percent = percent;
                Some(RipProgress {
                    percent,
                    message: None,
                })
            }
            RobotLine::Message(msg) if msg.code == MSG_SAVE_FAILED => {
                warn!(code = msg.code, message = %msg.message, "makemkv reported a failed save");
                self.failure = Some(msg.message);
                None
            }
            RobotLine::Message(msg) => Some(RipProgress {
                percent: self.last_percent,
                message: Some(msg.message),
            }),
            _ => None,
        }
    }
}

/// PRGV total over max as a percentage, `None` when max is zero.
pub(crate) fn progress_percent(total: u64, max: u64) -> Option<f32> {
    if max == 0 {
        return None;
    }
    Some(((total as f64 / max as f64) * 100.0).clamp(0.0, 100.0) as f32)
}

/// Largest `.mkv` below `work_dir`.
fn find_ripped_file(work_dir: &Path) -> Option<(PathBuf, u64)> {
    WalkDir::new(work_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("mkv"))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let len = entry.metadata().ok()?.len();
            Some((entry.into_path(), len))
        })
        .max_by_key(|(_, len)| *len)
}

/// Moves the ripped file out of the work dir under its sanitized name.
pub(crate) fn finalize_rip(
    work_dir: &Path,
    output_dir: &Path,
    title: &Title,
) -> Result<PathBuf, DiscError> {
    let (produced, len) = find_ripped_file(work_dir).ok_or_else(|| {
        DiscError::Media(format!("no output file produced for title {}", title.id))
    })?;
    if len == 0 {
        return Err(DiscError::Media(format!(
            "output file for title {} is empty",
            title.id
        )));
    }

    let base = sanitize_filename(&title.display_name(), &title.id);
    let mut target = output_dir.join(format!("{}.mkv", base));
    if target.exists() {
        target = output_dir.join(format!("{} [{}].mkv", base, title.id));
    }

    std::fs::rename(&produced, &target)?;
    Ok(target)
}

async fn remove_partial(work_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %work_dir.display(), error = %e, "Failed to remove partial rip output");
        }
    }
}

const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turns a title name into a safe file stem.
///
/// Falls back to `title_<id>` when nothing usable remains.
pub fn sanitize_filename(name: &str, title_id: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev: Option<char> = None;

    for c in name.chars() {
        if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
            continue;
        }
        let c = if c.is_whitespace() { ' ' } else { c };
        if prev == Some(c) && (c == ' ' || c.is_ascii_punctuation()) {
            continue;
        }
        out.push(c);
        prev = Some(c);
    }

    let trimmed = out.trim_matches(|c: char| c.is_whitespace() || matches!(c, '.' | '-' | '_'));
    if trimmed.is_empty() {
        format!("title_{}", title_id)
    } else {
        trimmed.to_string()
    }
}
