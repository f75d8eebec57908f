//! The record carried from stage to stage for one disc.
//!
//! A `RipSpec` is serialized into its queue item after every stage, so a
//! restarted daemon picks up with the same titles, selection and paths.

use crate::disc::{AudioSelection, ContentType, DiscInfo, LabelHints, Title, TitleRole};
use crate::identify::MediaInfo;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What the rip stage concluded about the disc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscAnalysis {
    pub content_type: ContentType,
    /// Longest title on the disc.
    pub main_title: Option<String>,
    pub label: LabelHints,
}

/// A title picked for ripping and the files produced for it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTitle {
    pub title_id: String,
    pub role: TitleRole,
    pub episode_offset: Option<u32>,
    pub audio: AudioSelection,
    #[serde(default)]
    pub ripped_file: Option<PathBuf>,
    #[serde(default)]
    pub encoded_file: Option<PathBuf>,
    #[serde(default)]
    pub final_file: Option<PathBuf>,
}

impl SelectedTitle {
    pub fn new(title_id: impl Into<String>, role: TitleRole, episode_offset: Option<u32>) -> Self {
        Self {
            title_id: title_id.into(),
            role,
            episode_offset,
            audio: AudioSelection::default(),
            ripped_file: None,
            encoded_file: None,
            final_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RipSpec {
    pub item_id: u64,
    pub disc: DiscInfo,
    #[serde(default)]
    pub titles: Vec<Title>,
    #[serde(default)]
    pub analysis: Option<DiscAnalysis>,
    #[serde(default)]
    pub selected: Vec<SelectedTitle>,
    #[serde(default)]
    pub media_info: Option<MediaInfo>,
}

impl RipSpec {
    pub fn new(item_id: u64, disc: DiscInfo) -> Self {
        Self {
            item_id,
            disc,
            titles: Vec::new(),
            analysis: None,
            selected: Vec::new(),
            media_info: None,
        }
    }

    pub fn title(&self, id: &str) -> Option<&Title> {
        self.titles.iter().find(|t| t.id == id)
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.analysis.as_ref().map(|a| a.content_type)
    }

    /// The selected title that represents the disc: the feature, or the
    /// first episode.
    pub fn primary(&self) -> Option<&SelectedTitle> {
        self.selected
            .iter()
            .find(|s| matches!(s.role, TitleRole::Main | TitleRole::Episode))
            .or_else(|| self.selected.first())
    }

    pub fn all_ripped(&self) -> bool {
        !self.selected.is_empty() && self.selected.iter().all(|s| s.ripped_file.is_some())
    }

    pub fn all_encoded(&self) -> bool {
        !self.selected.is_empty() && self.selected.iter().all(|s| s.encoded_file.is_some())
    }

    pub fn all_organized(&self) -> bool {
        !self.selected.is_empty() && self.selected.iter().all(|s| s.final_file.is_some())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::model::fixtures;
    use crate::disc::DiscType;

    fn disc() -> DiscInfo {
        DiscInfo {
            device: "/dev/sr0".to_string(),
            disc_type: DiscType::BluRay,
            label: "SHOW_NAME_S2_D1".to_string(),
        }
    }

    #[test]
    fn test_primary_prefers_non_extra() {
        let mut spec = RipSpec::new(1, disc());
        assert!(spec.primary().is_none());

        spec.selected.push(SelectedTitle::new("4", TitleRole::Extra, None));
        assert_eq!(spec.primary().unwrap().title_id, "4");

        spec.selected.push(SelectedTitle::new("2", TitleRole::Alternate, None));
        assert_eq!(spec.primary().unwrap().title_id, "4");

        spec.selected.push(SelectedTitle::new("0", TitleRole::Main, None));
        assert_eq!(spec.primary().unwrap().title_id, "0");
    }

    #[test]
    fn test_stage_completion_requires_every_title() {
        let mut spec = RipSpec::new(1, disc());
        assert!(!spec.all_ripped());

        spec.selected.push(SelectedTitle::new("0", TitleRole::Episode, Some(0)));
        spec.selected.push(SelectedTitle::new("1", TitleRole::Episode, Some(1)));
        spec.selected[0].ripped_file = Some(PathBuf::from("/staging/a.mkv"));
        assert!(!spec.all_ripped());

        spec.selected[1].ripped_file = Some(PathBuf::from("/staging/b.mkv"));
        assert!(spec.all_ripped());
        assert!(!spec.all_encoded());
    }

    #[test]
    fn test_json_survives_restart() {
        let mut spec = RipSpec::new(7, disc());
        spec.titles = vec![fixtures::title("0", 2700), fixtures::title("1", 2650)];
        spec.analysis = Some(DiscAnalysis {
            content_type: ContentType::TvEpisode,
            main_title: Some("0".to_string()),
            label: crate::disc::parse_label_hints("SHOW_NAME_S2_D1"),
        });
        spec.selected.push(SelectedTitle::new("0", TitleRole::Episode, Some(0)));

        let restored = RipSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(restored, spec);
        assert_eq!(restored.title("1").unwrap().duration, 2650);
        assert_eq!(restored.content_type(), Some(ContentType::TvEpisode));
    }

    #[test]
    fn test_older_records_without_selection_load() {
        let json = r#"{"item_id":3,"disc":{"device":"/dev/sr0","disc_type":"dvd","label":"MOVIE"}}"#;
        let spec = RipSpec::from_json(json).unwrap();
        assert!(spec.titles.is_empty());
        assert!(spec.analysis.is_none());
        assert!(spec.selected.is_empty());
    }
}
