//! Persistent work queue.
//!
//! Every disc becomes a [`QueueItem`] stored as `{item_id}.json` in the state
//! directory. Writes go to a temp file first and are renamed into place, so a
//! crash never leaves a half-written record behind.
//!
//! Store calls are synchronous. Records are small and the mutex is held only
//! for a read or an atomic rename. The status server and the workers' queue
//! scans go through [`QueueStore::run_blocking`]. Stage code and the disc
//! monitor touch a single record at a time and call the store directly.

use crate::disc::DiscInfo;
use crate::identify::MediaInfo;
use crate::rip_spec::RipSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Where an item is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Ripping,
    Ripped,
    Identifying,
    Identified,
    Encoding,
    Encoded,
    Organizing,
    Completed,
    /// Needs a person to confirm the identification.
    Review,
    Failed,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Ripping => "ripping",
            QueueStatus::Ripped => "ripped",
            QueueStatus::Identifying => "identifying",
            QueueStatus::Identified => "identified",
            QueueStatus::Encoding => "encoding",
            QueueStatus::Encoded => "encoded",
            QueueStatus::Organizing => "organizing",
            QueueStatus::Completed => "completed",
            QueueStatus::Review => "review",
            QueueStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 11] = [
        QueueStatus::Pending,
        QueueStatus::Ripping,
        QueueStatus::Ripped,
        QueueStatus::Identifying,
        QueueStatus::Identified,
        QueueStatus::Encoding,
        QueueStatus::Encoded,
        QueueStatus::Organizing,
        QueueStatus::Completed,
        QueueStatus::Review,
        QueueStatus::Failed,
    ];

    /// A stage is actively running. Items left here by a crash are stuck.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            QueueStatus::Ripping
                | QueueStatus::Identifying
                | QueueStatus::Encoding
                | QueueStatus::Organizing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    /// Whether the workflow may move an item from `self` to `next`.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        match (self, next) {
            (Pending, Ripping)
            | (Ripping, Ripped)
            | (Ripped, Identifying)
            | (Identifying, Identified)
            | (Identifying, Review)
            | (Identified, Encoding)
            | (Encoding, Encoded)
            | (Encoded, Organizing)
            | (Organizing, Completed) => true,
            (Review | Failed, Pending) => true,
            (from, Pending) if from.is_in_flight() => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Count of items per status. Every status is present.
pub type QueueStats = BTreeMap<QueueStatus, usize>;

/// One disc's progress through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub item_id: u64,
    pub disc_title: String,
    /// Drive the disc was inserted in.
    #[serde(default)]
    pub device: String,
    /// Raw volume label, kept verbatim so discs of one set stay distinct.
    #[serde(default)]
    pub disc_label: String,
    pub status: QueueStatus,
    #[serde(default)]
    pub progress_stage: String,
    #[serde(default)]
    pub progress_percent: f32,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub media_info: Option<MediaInfo>,
    #[serde(default)]
    pub ripped_file: Option<PathBuf>,
    #[serde(default)]
    pub encoded_file: Option<PathBuf>,
    #[serde(default)]
    pub final_file: Option<PathBuf>,
    /// JSON snapshot of the item's [`RipSpec`].
    #[serde(default)]
    pub rip_spec_data: Option<String>,
    /// Unix timestamp (milliseconds).
    pub created_at: i64,
    /// Unix timestamp (milliseconds).
    pub updated_at: i64,
}

impl QueueItem {
    fn new(item_id: u64, disc_title: &str) -> Self {
        let now = current_timestamp_ms();
        Self {
            item_id,
            disc_title: disc_title.to_string(),
            device: String::new(),
            disc_label: String::new(),
            status: QueueStatus::Pending,
            progress_stage: String::new(),
            progress_percent: 0.0,
            progress_message: None,
            error_message: None,
            media_info: None,
            ripped_file: None,
            encoded_file: None,
            final_file: None,
            rip_spec_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same drive and same raw label.
    pub fn matches_disc(&self, disc: &DiscInfo) -> bool {
        self.device == disc.device && self.disc_label == disc.label
    }

    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn set_progress(&mut self, stage: &str, percent: f32, message: Option<String>) {
        self.progress_stage = stage.to_string();
        self.progress_percent = percent.clamp(0.0, 100.0);
        self.progress_message = message;
        self.touch();
    }

    /// Marks the item failed. The status change is not validated here.
    pub fn fail(&mut self, reason: &str) {
        self.status = QueueStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.touch();
    }

    pub fn rip_spec(&self) -> Result<Option<RipSpec>, serde_json::Error> {
        self.rip_spec_data
            .as_deref()
            .map(RipSpec::from_json)
            .transpose()
    }

    pub fn set_rip_spec(&mut self, spec: &RipSpec) -> Result<(), serde_json::Error> {
        self.rip_spec_data = Some(spec.to_json()?);
        Ok(())
    }
}

fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("queue serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue item {0} not found")]
    NotFound(u64),

    #[error("queue item {item_id} is {status} and cannot be requeued")]
    NotRequeueable { item_id: u64, status: QueueStatus },

    #[error("queue task failed: {0}")]
    Task(String),
}

/// File-backed queue store, shared by the monitor and every worker.
#[derive(Debug)]
pub struct QueueStore {
    state_dir: PathBuf,
    next_id: Mutex<u64>,
}

impl QueueStore {
    /// Opens (creating if needed) the store in `state_dir`.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;

        let max_id = fs::read_dir(&state_dir)?
            .filter_map(Result::ok)
            .filter_map(|entry| item_id_from_path(&entry.path()))
            .max()
            .unwrap_or(0);

        Ok(Self {
            state_dir,
            next_id: Mutex::new(max_id + 1),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.next_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn item_path(&self, item_id: u64) -> PathBuf {
        self.state_dir.join(format!("{}.json", item_id))
    }

    fn write_item(&self, item: &QueueItem) -> Result<(), QueueError> {
        let path = self.item_path(item.item_id);
        let tmp = self.state_dir.join(format!("{}.json.tmp", item.item_id));
        let json = serde_json::to_string_pretty(item)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_item(path: &Path) -> Result<QueueItem, QueueError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Creates a Pending item with a fresh id.
    pub fn add(&self, disc_title: &str) -> Result<QueueItem, QueueError> {
        self.insert(disc_title, None)
    }

    /// Creates a Pending item for `disc` with its rip spec already attached.
    pub fn add_disc(&self, disc_title: &str, disc: &DiscInfo) -> Result<QueueItem, QueueError> {
        self.insert(disc_title, Some(disc))
    }

    fn insert(&self, disc_title: &str, disc: Option<&DiscInfo>) -> Result<QueueItem, QueueError> {
        let mut next_id = self.lock();
        let mut item = QueueItem::new(*next_id, disc_title);
        if let Some(disc) = disc {
            item.device = disc.device.clone();
            item.disc_label = disc.label.clone();
            item.set_rip_spec(&RipSpec::new(item.item_id, disc.clone()))?;
        }
        self.write_item(&item)?;
        *next_id += 1;
        info!(
            item_id = item.item_id,
            disc_title,
            device = %item.device,
            label = %item.disc_label,
            "Queued disc"
        );
        Ok(item)
    }

    /// Replaces the stored record with `item`.
    pub fn update(&self, item: &QueueItem) -> Result<(), QueueError> {
        let _guard = self.lock();
        if !self.item_path(item.item_id).exists() {
            return Err(QueueError::NotFound(item.item_id));
        }
        self.write_item(item)
    }

    pub fn get(&self, item_id: u64) -> Result<Option<QueueItem>, QueueError> {
        let _guard = self.lock();
        let path = self.item_path(item_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_item(&path).map(Some)
    }

    /// Every readable item in ascending id order.
    pub fn all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let _guard = self.lock();
        self.load_all()
    }

    fn load_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut items = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if item_id_from_path(&path).is_none() {
                continue;
            }
            match Self::read_item(&path) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable queue item"),
            }
        }
        items.sort_by_key(|item| item.item_id);
        Ok(items)
    }

    /// Items with `status`, oldest first.
    pub fn get_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|item| item.status == status)
            .collect())
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats: QueueStats = QueueStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for item in self.all()? {
            *stats.entry(item.status).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Returns items interrupted mid-stage to Pending. Run once at startup,
    /// before any worker picks up work.
    pub fn reset_stuck_processing_items(&self) -> Result<usize, QueueError> {
        let _guard = self.lock();
        let mut reset = 0;
        for mut item in self.load_all()? {
            if !item.status.is_in_flight() {
                continue;
            }
            info!(item_id = item.item_id, status = %item.status, "Resetting interrupted item");
            item.status = QueueStatus::Pending;
            item.set_progress("Reset after restart", 0.0, None);
            self.write_item(&item)?;
            reset += 1;
        }
        Ok(reset)
    }

    /// Whether a not yet finished item exists for this disc.
    pub fn has_active_item_for_disc(&self, disc: &DiscInfo) -> Result<bool, QueueError> {
        Ok(self
            .all()?
            .iter()
            .any(|item| item.matches_disc(disc) && !item.status.is_terminal()))
    }

    /// Newest item recorded for this disc, whatever its status.
    pub fn latest_item_for_disc(&self, disc: &DiscInfo) -> Result<Option<QueueItem>, QueueError> {
        Ok(self
            .all()?
            .into_iter()
            .rev()
            .find(|item| item.matches_disc(disc)))
    }

    /// Runs a store call on the blocking pool.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&QueueStore) -> Result<T, QueueError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))?
    }

    /// Sends a Review or Failed item back to Pending.
    pub fn requeue(&self, item_id: u64) -> Result<QueueItem, QueueError> {
        let _guard = self.lock();
        let path = self.item_path(item_id);
        if !path.exists() {
            return Err(QueueError::NotFound(item_id));
        }
        let mut item = Self::read_item(&path)?;
        if !matches!(item.status, QueueStatus::Review | QueueStatus::Failed) {
            return Err(QueueError::NotRequeueable {
                item_id,
                status: item.status,
            });
        }

        item.status = QueueStatus::Pending;
        item.error_message = None;
        item.set_progress("Requeued", 0.0, None);
        self.write_item(&item)?;
        info!(item_id, "Requeued item");
        Ok(item)
    }
}

fn item_id_from_path(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
