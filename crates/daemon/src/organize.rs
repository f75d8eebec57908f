//! Filing encoded files into the media library.
//!
//! Movies land in `<library>/<movies_dir>/Title (Year)/Title (Year).mkv`,
//! episodes in `<library>/<tv_dir>/Show (Year)/Season NN/Show - SxxEyy.mkv`.

use crate::config::Config;
use crate::disc::sanitize_filename;
use crate::identify::{MediaInfo, MediaType};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("source file does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("library file already exists: {0}")]
    TargetExists(PathBuf),

    #[error("failed to move {from} into the library: {source}")]
    MoveFailed {
        from: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("library refresh failed: {0}")]
    Refresh(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Organizer: Send + Sync {
    /// Moves `source` to its library location and returns the final path.
    async fn organize(&self, source: &Path, info: &MediaInfo) -> Result<PathBuf, OrganizeError>;

    /// Files a bonus feature next to its main title.
    async fn organize_extra(&self, source: &Path, info: &MediaInfo) -> Result<PathBuf, OrganizeError>;

    /// Asks the library server to pick up new files.
    async fn refresh_library(&self, media_type: MediaType) -> Result<(), OrganizeError>;
}

/// Notifies a library server (Plex and friends) about new content.
#[async_trait]
pub trait LibraryRefresher: Send + Sync {
    async fn refresh(&self, media_type: MediaType) -> Result<(), OrganizeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefresher;

#[async_trait]
impl LibraryRefresher for NoopRefresher {
    async fn refresh(&self, _media_type: MediaType) -> Result<(), OrganizeError> {
        Ok(())
    }
}

/// [`Organizer`] writing into a directory tree.
pub struct LibraryOrganizer {
    library_dir: PathBuf,
    movies_dir: String,
    tv_dir: String,
    overwrite: bool,
    refresher: Arc<dyn LibraryRefresher>,
}

impl LibraryOrganizer {
    pub fn new(
        library_dir: impl Into<PathBuf>,
        movies_dir: impl Into<String>,
        tv_dir: impl Into<String>,
        overwrite: bool,
    ) -> Self {
        Self {
            library_dir: library_dir.into(),
            movies_dir: movies_dir.into(),
            tv_dir: tv_dir.into(),
            overwrite,
            refresher: Arc::new(NoopRefresher),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.paths.library_dir.clone(),
            config.library.movies_dir.clone(),
            config.library.tv_dir.clone(),
            config.library.overwrite_existing,
        )
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn LibraryRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    /// Folder holding a movie or a show.
    pub fn content_dir(&self, info: &MediaInfo) -> PathBuf {
        let category = match info.media_type {
            MediaType::Movie => &self.movies_dir,
            MediaType::Tv => &self.tv_dir,
        };
        self.library_dir
            .join(category)
            .join(clean_name(&info.display_title(), info))
    }

    /// Full library path for `info` with the given file extension.
    pub fn target_path(&self, info: &MediaInfo, extension: &str) -> PathBuf {
        let display = info.display_title();
        match info.media_type {
            MediaType::Movie => self
                .content_dir(info)
                .join(format!("{}.{}", clean_name(&display, info), extension)),
            MediaType::Tv => {
                let season = info.season.unwrap_or(1);
                let mut name = format!("{} - S{:02}", info.title, season);
                if let Some(episode) = info.episode {
                    name.push_str(&format!("E{:02}", episode));
                }
                if let Some(episode_title) = info.episode_title.as_deref().filter(|t| !t.trim().is_empty()) {
                    name.push_str(" - ");
                    name.push_str(episode_title);
                }
                self.content_dir(info)
                    .join(format!("Season {:02}", season))
                    .join(format!("{}.{}", clean_name(&name, info), extension))
            }
        }
    }

    async fn place(&self, source: &Path, target: PathBuf) -> Result<PathBuf, OrganizeError> {
        if !source.exists() {
            return Err(OrganizeError::MissingSource(source.to_path_buf()));
        }
        if target.exists() {
            if !self.overwrite {
                return Err(OrganizeError::TargetExists(target));
            }
            warn!(path = %target.display(), "Overwriting existing library file");
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        move_file(source, &target).await?;
        info!(from = %source.display(), to = %target.display(), "Filed into library");
        Ok(target)
    }
}

fn clean_name(name: &str, info: &MediaInfo) -> String {
    sanitize_filename(name, &info.tmdb_id.to_string())
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("mkv")
}

/// Moves a file, falling back to copy and delete across filesystems.
async fn move_file(source: &Path, target: &Path) -> Result<(), OrganizeError> {
    if tokio::fs::rename(source, target).await.is_ok() {
        return Ok(());
    }

    if let Err(e) = tokio::fs::copy(source, target).await {
        let _ = tokio::fs::remove_file(target).await;
        return Err(OrganizeError::MoveFailed {
            from: source.to_path_buf(),
            source: e,
        });
    }
    tokio::fs::remove_file(source)
        .await
        .map_err(|e| OrganizeError::MoveFailed {
            from: source.to_path_buf(),
            source: e,
        })
}

#[async_trait]
impl Organizer for LibraryOrganizer {
    async fn organize(&self, source: &Path, info: &MediaInfo) -> Result<PathBuf, OrganizeError> {
        let target = self.target_path(info, extension_of(source));
        self.place(source, target).await
    }

    async fn organize_extra(&self, source: &Path, info: &MediaInfo) -> Result<PathBuf, OrganizeError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| OrganizeError::MissingSource(source.to_path_buf()))?;
        let target = self.content_dir(info).join("Extras").join(file_name);
        self.place(source, target).await
    }

    async fn refresh_library(&self, media_type: MediaType) -> Result<(), OrganizeError> {
        self.refresher.refresh(media_type).await
    }
}
