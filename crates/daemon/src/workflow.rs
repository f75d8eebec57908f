//! Workflow orchestrator.
//!
//! Moves queue items through `rip -> identify -> encode -> organize`. Each
//! call to [`Workflow::advance`] runs one stage. Status changes go through
//! [`Workflow::transition`], which validates them and persists the item
//! before the stage's collaborator is called, so a crash always leaves the
//! store describing the stage that was running.

use crate::config::{Config, SelectionConfig};
use crate::disc::{
    parse_label_hints, ContentType, DiscError, DiscInfo, DiscRipper, DiscScan, DiscType,
    RipProgress, TitleRole, TitleSelector,
};
use crate::encode::{EncodeError, EncodeEvent, EncodeRequest, Encoder};
use crate::identify::{
    Identification, IdentifyError, IdentifyRequest, Identifier, MediaInfo, MediaType,
};
use crate::organize::{OrganizeError, Organizer};
use crate::queue::{QueueError, QueueItem, QueueStatus, QueueStore};
use crate::rip_spec::{DiscAnalysis, RipSpec, SelectedTitle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const RIP_BAND: (f32, f32) = (0.0, 40.0);
const IDENTIFY_BAND: (f32, f32) = (40.0, 45.0);
const ENCODE_BAND: (f32, f32) = (45.0, 90.0);
const ORGANIZE_BAND: (f32, f32) = (90.0, 100.0);

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("item {item_id} cannot move from {from} to {to}")]
    InvalidTransition {
        item_id: u64,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("rip failed: {0}")]
    Disc(#[from] DiscError),

    #[error("identification failed: {0}")]
    Identify(#[from] IdentifyError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("organize failed: {0}")]
    Organize(#[from] OrganizeError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("corrupt rip spec: {0}")]
    RipSpec(#[from] serde_json::Error),

    /// The drive holds a different disc than the one the item was queued for.
    #[error("disc mismatch: item was queued for \"{expected}\" but the drive holds \"{found}\"")]
    DiscMismatch { expected: String, found: String },

    /// A stage could not start or finish for a reason of its own.
    #[error("{0}")]
    Stage(String),
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Drive used when an item carries no disc snapshot.
    pub device: String,
    pub staging_dir: PathBuf,
    pub confidence_threshold: f32,
    pub selection: SelectionConfig,
    pub auto_eject: bool,
}

impl WorkflowSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device: config.drive.device.clone(),
            staging_dir: config.paths.staging_dir.clone(),
            confidence_threshold: config.identification.confidence_threshold,
            selection: config.selection.clone(),
            auto_eject: config.drive.auto_eject,
        }
    }
}

/// Persists throttled progress for one slice of the overall percentage.
struct ProgressReporter<'a> {
    store: &'a QueueStore,
    item: &'a mut QueueItem,
    stage: &'static str,
    start: f32,
    end: f32,
    last_saved: f32,
}

impl<'a> ProgressReporter<'a> {
    fn new(
        store: &'a QueueStore,
        item: &'a mut QueueItem,
        stage: &'static str,
        (start, end): (f32, f32),
    ) -> Self {
        let last_saved = item.progress_percent;
        Self {
            store,
            item,
            stage,
            start,
            end,
            last_saved,
        }
    }

    /// Slice `index` of `count` equal parts of `band`.
    fn for_part(
        store: &'a QueueStore,
        item: &'a mut QueueItem,
        stage: &'static str,
        band: (f32, f32),
        index: usize,
        count: usize,
    ) -> Self {
        let width = (band.1 - band.0) / count.max(1) as f32;
        let start = band.0 + width * index as f32;
        Self::new(store, item, stage, (start, start + width))
    }

    fn report(&mut self, percent: f32, message: Option<String>) {
        let overall = self.start + (self.end - self.start) * percent.clamp(0.0, 100.0) / 100.0;
        let overall = overall.max(self.item.progress_percent);
        let message_changed = message.is_some() && message != self.item.progress_message;
        if overall - self.last_saved < 1.0 && !message_changed {
            return;
        }

        let message = message.or_else(|| self.item.progress_message.clone());
        self.item.set_progress(self.stage, overall, message);
        self.last_saved = overall;
        if let Err(e) = self.store.update(self.item) {
            warn!(item_id = self.item.item_id, error = %e, "Failed to persist progress");
        }
    }
}

pub struct Workflow {
    store: Arc<QueueStore>,
    ripper: Arc<dyn DiscRipper>,
    identifier: Arc<dyn Identifier>,
    encoder: Arc<dyn Encoder>,
    organizer: Arc<dyn Organizer>,
    selector: TitleSelector,
    settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(
        store: Arc<QueueStore>,
        ripper: Arc<dyn DiscRipper>,
        identifier: Arc<dyn Identifier>,
        encoder: Arc<dyn Encoder>,
        organizer: Arc<dyn Organizer>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store,
            ripper,
            identifier,
            encoder,
            organizer,
            selector: TitleSelector::new(settings.selection.clone()),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    /// Validates and persists a status change.
    ///
    /// Invalid transitions leave both `item` and the store untouched.
    pub fn transition(
        &self,
        item: &mut QueueItem,
        to: QueueStatus,
        percent: f32,
        message: Option<String>,
    ) -> Result<(), WorkflowError> {
        let from = item.status;
        if !from.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                item_id: item.item_id,
                from,
                to,
            });
        }

        item.status = to;
        let percent = if to == QueueStatus::Pending {
            0.0
        } else {
            percent.max(item.progress_percent)
        };
        item.set_progress(&to.to_string(), percent, message);
        self.store.update(item)?;
        info!(item_id = item.item_id, from = %from, to = %to, "Item status changed");
        Ok(())
    }

    /// Runs the stage that follows the item's current status.
    ///
    /// Never fails: stage errors are recorded on the item as Failed.
    pub async fn advance(&self, mut item: QueueItem) -> QueueItem {
        let result = match item.status {
            QueueStatus::Pending => self.rip(&mut item).await,
            QueueStatus::Ripped => self.identify(&mut item).await,
            QueueStatus::Identified => self.encode(&mut item).await,
            QueueStatus::Encoded => self.organize(&mut item).await,
            status => {
                debug!(item_id = item.item_id, status = %status, "Nothing to advance");
                return item;
            }
        };

        match result {
            Ok(()) => {}
            Err(e @ WorkflowError::InvalidTransition { .. }) => {
                error!(item_id = item.item_id, error = %e, "Rejected status change");
            }
            Err(e) => self.record_failure(&mut item, &e),
        }
        item
    }

    /// Advances until the item completes, needs review or fails.
    pub async fn run_to_rest(&self, mut item: QueueItem) -> QueueItem {
        loop {
            let before = item.status;
            if matches!(
                before,
                QueueStatus::Completed | QueueStatus::Review | QueueStatus::Failed
            ) {
                return item;
            }
            item = self.advance(item).await;
            if item.status == before {
                return item;
            }
        }
    }

    fn record_failure(&self, item: &mut QueueItem, e: &WorkflowError) {
        error!(item_id = item.item_id, status = %item.status, error = %e, "Stage failed");
        let message = e.to_string();
        item.error_message = Some(message.clone());
        if let Err(te) = self.transition(item, QueueStatus::Failed, 0.0, Some(message)) {
            error!(item_id = item.item_id, error = %te, "Could not record failure");
        }
    }

    fn load_spec(item: &QueueItem) -> Result<RipSpec, WorkflowError> {
        item.rip_spec()?
            .ok_or_else(|| WorkflowError::Stage(format!("item {} has no rip spec", item.item_id)))
    }

    fn save_spec(&self, item: &mut QueueItem, spec: &RipSpec) -> Result<(), WorkflowError> {
        item.set_rip_spec(spec)?;
        item.touch();
        self.store.update(item)?;
        Ok(())
    }

    fn item_dir(&self, item: &QueueItem, kind: &str) -> PathBuf {
        self.settings
            .staging_dir
            .join(format!("item-{}", item.item_id))
            .join(kind)
    }

    async fn rip(&self, item: &mut QueueItem) -> Result<(), WorkflowError> {
        let mut spec = match item.rip_spec()? {
            Some(spec) => spec,
            None => RipSpec::new(
                item.item_id,
                DiscInfo {
                    device: self.settings.device.clone(),
                    disc_type: DiscType::Unknown,
                    label: item.disc_label.clone(),
                },
            ),
        };
        let device = spec.disc.device.clone();

        self.transition(item, QueueStatus::Ripping, RIP_BAND.0, Some("Scanning disc".to_string()))?;

        let scan = self.ripper.scan_disc(&device).await?;
        check_same_disc(&spec.disc.label, &scan)?;
        if spec.disc.disc_type == DiscType::Unknown {
            spec.disc.disc_type = scan.disc_type;
        }
        spec.titles = scan.titles;

        let label = parse_label_hints(&spec.disc.label);
        let guessed = self.selector.guess_content_type(&spec.titles);
        let content_type = if label.season.is_some() && !guessed.is_episodic() {
            ContentType::TvEpisode
        } else {
            guessed
        };

        let selection = self.selector.select(&spec.titles, content_type);
        info!(
            item_id = item.item_id,
            content_type = %content_type,
            titles = spec.titles.len(),
            selected = selection.titles.len(),
            "Disc analyzed"
        );
        if selection.is_empty() {
            return Err(WorkflowError::Stage(format!(
                "no titles on the disc matched the {} selection rules",
                content_type
            )));
        }

        spec.selected = selection
            .titles
            .iter()
            .map(|choice| {
                let mut selected = SelectedTitle::new(&choice.title_id, choice.role, choice.episode_offset);
                if let Some(title) = spec.title(&choice.title_id) {
                    selected.audio = self.selector.select_audio(title);
                    debug!(
                        item_id = item.item_id,
                        title_id = %title.id,
                        role = ?choice.role,
                        video = title.video_tracks().len(),
                        audio = title.audio_tracks().len(),
                        english_audio = title.all_english_audio_tracks().len(),
                        subtitles = title.subtitle_tracks().len(),
                        kept_audio = selected.audio.kept.len(),
                        "Title selected"
                    );
                }
                selected
            })
            .collect();
        spec.analysis = Some(DiscAnalysis {
            content_type,
            main_title: selection.main_title,
            label,
        });
        self.save_spec(item, &spec)?;

        let rip_dir = self.item_dir(item, "rips");
        tokio::fs::create_dir_all(&rip_dir).await.map_err(DiscError::Io)?;

        let count = spec.selected.len();
        for index in 0..count {
            let title_id = spec.selected[index].title_id.clone();
            let title = spec
                .title(&title_id)
                .cloned()
                .ok_or_else(|| WorkflowError::Stage(format!("title {} vanished from the scan", title_id)))?;

            let path = {
                let mut reporter =
                    ProgressReporter::for_part(&self.store, item, "ripping", RIP_BAND, index, count);
                reporter.report(0.0, Some(format!("Ripping {}", title.display_name())));
                let mut on_progress = |p: RipProgress| reporter.report(p.percent, p.message);
                self.ripper
                    .rip(&device, &title, &rip_dir, &mut on_progress)
                    .await?
            };

            spec.selected[index].ripped_file = Some(path);
            self.save_spec(item, &spec)?;
        }

        if !spec.all_ripped() {
            return Err(WorkflowError::Stage("not every selected title was ripped".to_string()));
        }
        item.ripped_file = spec.primary().and_then(|s| s.ripped_file.clone());

        if self.settings.auto_eject {
            if let Err(e) = self.ripper.eject(&device).await {
                warn!(item_id = item.item_id, device = %device, error = %e, "Eject failed");
            }
        }

        self.transition(item, QueueStatus::Ripped, RIP_BAND.1, Some("Rip complete".to_string()))
    }

    async fn identify(&self, item: &mut QueueItem) -> Result<(), WorkflowError> {
        let mut spec = Self::load_spec(item)?;
        self.transition(
            item,
            QueueStatus::Identifying,
            IDENTIFY_BAND.0,
            Some("Identifying content".to_string()),
        )?;

        let request = identify_request(item, &spec);
        info!(item_id = item.item_id, title = %request.title, "Identifying");
        let result = self.identifier.identify(&request).await?;

        let threshold = self.settings.confidence_threshold;
        match result {
            Identification::Found(info) if info.confidence >= threshold => {
                let message = format!("Identified as {}", info.display_title());
                spec.media_info = Some(info.clone());
                item.media_info = Some(info);
                self.save_spec(item, &spec)?;
                self.transition(item, QueueStatus::Identified, IDENTIFY_BAND.1, Some(message))
            }
            Identification::Found(info) | Identification::LowConfidence(info) => {
                let message = format!(
                    "Low confidence match {} ({:.2}), needs review",
                    info.display_title(),
                    info.confidence
                );
                item.media_info = Some(info);
                self.transition(item, QueueStatus::Review, IDENTIFY_BAND.1, Some(message))
            }
            Identification::NotFound => self.transition(
                item,
                QueueStatus::Review,
                IDENTIFY_BAND.1,
                Some(format!("No match for \"{}\", needs review", request.title)),
            ),
        }
    }

    async fn encode(&self, item: &mut QueueItem) -> Result<(), WorkflowError> {
        let mut spec = Self::load_spec(item)?;
        self.transition(item, QueueStatus::Encoding, ENCODE_BAND.0, Some("Encoding".to_string()))?;

        let output_dir = self.item_dir(item, "encoded");
        let count = spec.selected.len();
        for index in 0..count {
            if spec.selected[index].encoded_file.is_some() {
                continue;
            }
            let selected = &spec.selected[index];
            let input = selected.ripped_file.clone().ok_or_else(|| {
                WorkflowError::Stage(format!("title {} was never ripped", selected.title_id))
            })?;
            let request = EncodeRequest {
                input,
                output_dir: output_dir.clone(),
                audio_tracks: selected.audio.kept.clone(),
            };

            let path = {
                let mut reporter =
                    ProgressReporter::for_part(&self.store, item, "encoding", ENCODE_BAND, index, count);
                let mut on_event = |event: EncodeEvent| {
                    let percent = event.percent().unwrap_or(0.0);
                    reporter.report(percent, Some(event.describe()));
                };
                self.encoder.encode(&request, &mut on_event).await?
            };

            spec.selected[index].encoded_file = Some(path);
            self.save_spec(item, &spec)?;
        }

        if !spec.all_encoded() {
            return Err(WorkflowError::Stage("not every selected title was encoded".to_string()));
        }
        item.encoded_file = spec.primary().and_then(|s| s.encoded_file.clone());
        self.transition(item, QueueStatus::Encoded, ENCODE_BAND.1, Some("Encode complete".to_string()))
    }

    async fn organize(&self, item: &mut QueueItem) -> Result<(), WorkflowError> {
        let mut spec = Self::load_spec(item)?;
        let info = item
            .media_info
            .clone()
            .or_else(|| spec.media_info.clone())
            .ok_or_else(|| WorkflowError::Stage("item has not been identified".to_string()))?;

        self.transition(
            item,
            QueueStatus::Organizing,
            ORGANIZE_BAND.0,
            Some("Moving into library".to_string()),
        )?;

        let season_hint = spec.analysis.as_ref().and_then(|a| a.label.season);
        let count = spec.selected.len();
        for index in 0..count {
            if spec.selected[index].final_file.is_some() {
                continue;
            }
            let selected = spec.selected[index].clone();
            let source = selected.encoded_file.clone().ok_or_else(|| {
                WorkflowError::Stage(format!("title {} was never encoded", selected.title_id))
            })?;

            let final_path = match selected.role {
                TitleRole::Extra | TitleRole::Alternate => {
                    self.organizer.organize_extra(&source, &info).await?
                }
                TitleRole::Main => self.organizer.organize(&source, &info).await?,
                TitleRole::Episode => {
                    let episode = episode_info(&info, &selected, season_hint);
                    self.organizer.organize(&source, &episode).await?
                }
            };

            spec.selected[index].final_file = Some(final_path);
            self.save_spec(item, &spec)?;

            let mut reporter =
                ProgressReporter::for_part(&self.store, item, "organizing", ORGANIZE_BAND, index, count);
            reporter.report(100.0, None);
        }

        if !spec.all_organized() {
            return Err(WorkflowError::Stage("no titles were moved into the library".to_string()));
        }
        item.final_file = spec.primary().and_then(|s| s.final_file.clone());

        if let Err(e) = self.organizer.refresh_library(info.media_type).await {
            warn!(item_id = item.item_id, error = %e, "Library refresh failed");
        }
        remove_staging(&self.settings.staging_dir.join(format!("item-{}", item.item_id))).await;

        let message = format!("Added {} to the library", info.display_title());
        self.transition(item, QueueStatus::Completed, ORGANIZE_BAND.1, Some(message))
    }
}

/// Lowercase alphanumerics only, so `Heat_1995` and `HEAT 1995` compare equal.
fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Fails when the scanned disc is not the one the item was queued for.
///
/// The volume name is compared with the queued label. Scans that only carry
/// a disc name are also accepted when it matches the title parsed from the
/// label. Unlabelled items and scans without names pass.
fn check_same_disc(expected: &str, scan: &DiscScan) -> Result<(), WorkflowError> {
    let wanted = normalize_label(expected);
    if wanted.is_empty() {
        return Ok(());
    }
    let found = match (&scan.volume_name, &scan.disc_name) {
        (Some(volume), _) if !volume.trim().is_empty() => volume,
        (_, Some(name)) if !name.trim().is_empty() => name,
        _ => return Ok(()),
    };

    let found_key = normalize_label(found);
    let title_key = normalize_label(&parse_label_hints(expected).title);
    if found_key == wanted || (!title_key.is_empty() && found_key == title_key) {
        return Ok(());
    }

    Err(WorkflowError::DiscMismatch {
        expected: expected.to_string(),
        found: found.clone(),
    })
}

fn identify_request(item: &QueueItem, spec: &RipSpec) -> IdentifyRequest {
    let label = spec.analysis.as_ref().map(|a| &a.label);
    let title = label
        .map(|l| l.title.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| item.disc_title.clone());
    let media_type = spec.content_type().map(|c| {
        if c.is_episodic() {
            MediaType::Tv
        } else {
            MediaType::Movie
        }
    });

    IdentifyRequest {
        title,
        media_type,
        season: label.and_then(|l| l.season),
    }
}

/// Metadata for one episode of a multi-episode disc.
///
/// The lookup identifies the disc's first episode; later titles count up
/// from it and lose the episode name.
fn episode_info(info: &MediaInfo, selected: &SelectedTitle, season_hint: Option<u32>) -> MediaInfo {
    let offset = selected.episode_offset.unwrap_or(0);
    let mut episode = info.clone();
    episode.media_type = MediaType::Tv;
    episode.season = info.season.or(season_hint);
    episode.episode = Some(info.episode.unwrap_or(1) + offset);
    if offset > 0 {
        episode.episode_title = None;
    }
    episode
}

async fn remove_staging(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Failed to clean staging directory");
        }
    }
}
