//! Startup checks.
//!
//! Verifies that the external tools the daemon drives can be found and that
//! its working directories exist before any worker starts.

use crate::config::Config;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {binary} was not found; is it installed and in PATH?")]
    ToolUnavailable { tool: &'static str, binary: String },

    #[error("cannot prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolves `binary` the way a shell would: paths are checked directly,
/// bare names are searched for in `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if binary.is_empty() {
        return None;
    }

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|full| is_executable(full))
}

pub fn check_tool_available(tool: &'static str, binary: &str) -> Result<PathBuf, StartupError> {
    resolve_binary(binary).ok_or_else(|| StartupError::ToolUnavailable {
        tool,
        binary: binary.to_string(),
    })
}

/// Creates the staging, library and state directories.
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    for dir in [
        &cfg.paths.staging_dir,
        &cfg.paths.library_dir,
        &cfg.paths.state_dir,
    ] {
        fs::create_dir_all(dir).map_err(|source| StartupError::Directory {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Runs every tool check: MakeMKV, the encoder, and `eject` when
/// auto-eject is on.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let makemkv = check_tool_available("MakeMKV", &cfg.makemkv.binary)?;
    info!(path = %makemkv.display(), "Found makemkvcon");

    let encoder = check_tool_available("encoder", &cfg.encoder.binary)?;
    info!(path = %encoder.display(), "Found encoder");

    if cfg.drive.auto_eject {
        let eject = check_tool_available("eject", &cfg.drive.eject_binary)?;
        info!(path = %eject.display(), "Found eject");
    }

    Ok(())
}
