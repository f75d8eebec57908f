//! Typed records describing a disc's playable content.
//!
//! Titles and tracks are built once per scan from the ripper's robot output
//! and never mutated afterwards. Every query here returns references into the
//! title in original track order.

use serde::{Deserialize, Serialize};

/// Kind of stream carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
}

impl TrackType {
    /// Maps the ripper's human readable stream type label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "video" => Some(TrackType::Video),
            "audio" => Some(TrackType::Audio),
            "subtitles" | "subtitle" => Some(TrackType::Subtitle),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
            TrackType::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// One stream within a title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Stream id, unique within its title.
    pub id: String,
    pub track_type: TrackType,
    pub codec: String,
    /// Free-form language code or name ("eng", "English", "fr").
    pub language: String,
    /// Duration in seconds.
    pub duration: u64,
    /// Size in bytes.
    pub size: u64,
    /// Descriptive label, e.g. "Director's Commentary". May be empty.
    pub title: String,
    pub is_default: bool,
}

impl Track {
    pub fn is_audio(&self) -> bool {
        self.track_type == TrackType::Audio
    }

    /// English detection is a case-insensitive "en" prefix on the language.
    pub fn is_english(&self) -> bool {
        self.language
            .get(..2)
            .map(|prefix| prefix.eq_ignore_ascii_case("en"))
            .unwrap_or(false)
    }

    pub fn is_commentary(&self) -> bool {
        self.title.to_lowercase().contains("commentary")
    }
}

/// One candidate piece of content on a disc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    /// Title id, unique within a scan.
    pub id: String,
    /// Duration in seconds.
    pub duration: u64,
    /// Size in bytes.
    pub size: u64,
    pub chapters: u32,
    pub tracks: Vec<Track>,
    /// Name reported by the ripper, if any. See [`Title::display_name`].
    pub name: Option<String>,
}

impl Title {
    /// Name used for filenames and logs, `"Title {id}"` when the disc has none.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Title {}", self.id),
        }
    }

    fn tracks_of(&self, track_type: TrackType) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.track_type == track_type)
            .collect()
    }

    pub fn video_tracks(&self) -> Vec<&Track> {
        self.tracks_of(TrackType::Video)
    }

    pub fn audio_tracks(&self) -> Vec<&Track> {
        self.tracks_of(TrackType::Audio)
    }

    pub fn subtitle_tracks(&self) -> Vec<&Track> {
        self.tracks_of(TrackType::Subtitle)
    }

    /// Audio tracks whose language starts with "en".
    pub fn english_audio_tracks(&self) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_audio() && t.is_english())
            .collect()
    }

    /// Audio tracks labelled as commentary.
    pub fn commentary_tracks(&self) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_audio() && t.is_commentary())
            .collect()
    }

    /// Audio tracks that are not commentary.
    pub fn main_audio_tracks(&self) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_audio() && !t.is_commentary())
            .collect()
    }

    /// Every English audio track, main and commentary, in disc order.
    pub fn all_english_audio_tracks(&self) -> Vec<&Track> {
        self.english_audio_tracks()
    }
}

/// Physical media type of a disc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscType {
    Dvd,
    BluRay,
    #[default]
    Unknown,
}

impl DiscType {
    /// Interprets the ripper's disc type description ("DVD disc", "Blu-ray disc").
    pub fn from_description(description: &str) -> Self {
        let lower = description.to_lowercase();
        if lower.contains("blu-ray") || lower.contains("bluray") || lower.contains("bd-rom") {
            DiscType::BluRay
        } else if lower.contains("dvd") {
            DiscType::Dvd
        } else {
            DiscType::Unknown
        }
    }
}

impl std::fmt::Display for DiscType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscType::Dvd => write!(f, "dvd"),
            DiscType::BluRay => write!(f, "blu-ray"),
            DiscType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Snapshot of an inserted disc taken at detection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscInfo {
    pub device: String,
    pub disc_type: DiscType,
    /// Volume label as reported by the drive.
    pub label: String,
}
