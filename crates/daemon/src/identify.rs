//! Content identification contract.
//!
//! The lookup service itself lives outside the daemon. The workflow only
//! needs the request it sends and the three outcomes it can get back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Tv,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Tv => write!(f, "tv"),
        }
    }
}

/// Metadata for identified content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub year: Option<u16>,
    pub media_type: MediaType,
    pub tmdb_id: u64,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub genres: Vec<String>,
    /// Runtime in minutes.
    #[serde(default)]
    pub runtime: Option<u32>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub episode_title: Option<String>,
    /// Match confidence in `[0, 1]`.
    pub confidence: f32,
}

impl MediaInfo {
    /// `"Title (Year)"`, or just the title when the year is unknown.
    pub fn display_title(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

/// What the workflow knows about a disc before identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyRequest {
    pub title: String,
    pub media_type: Option<MediaType>,
    pub season: Option<u32>,
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    Found(MediaInfo),
    /// A candidate exists but the provider does not trust it.
    LowConfidence(MediaInfo),
    NotFound,
}

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("identification service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid identification response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(&self, request: &IdentifyRequest) -> Result<Identification, IdentifyError>;
}

/// Identifier used when no lookup service is configured.
///
/// Every disc ends up in review so a person can fill in the metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIdentifier;

#[async_trait]
impl Identifier for NullIdentifier {
    async fn identify(&self, request: &IdentifyRequest) -> Result<Identification, IdentifyError> {
        info!(title = %request.title, "No identification service configured");
        Ok(Identification::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movie(year: Option<u16>) -> MediaInfo {
        MediaInfo {
            title: "Heat".to_string(),
            year,
            media_type: MediaType::Movie,
            tmdb_id: 949,
            overview: String::new(),
            genres: vec!["Crime".to_string()],
            runtime: Some(170),
            season: None,
            episode: None,
            episode_title: None,
            confidence: 0.93,
        }
    }

    #[test]
    fn test_display_title() {
        assert_eq!(movie(Some(1995)).display_title(), "Heat (1995)");
        assert_eq!(movie(None).display_title(), "Heat");
    }

    #[test]
    fn test_media_info_optional_fields_default() {
        let json = r#"{"title":"Heat","year":1995,"media_type":"movie","tmdb_id":949,"confidence":0.8}"#;
        let info: MediaInfo = serde_json::from_str(json).expect("should parse");
        assert_eq!(info.media_type, MediaType::Movie);
        assert!(info.genres.is_empty());
        assert!(info.episode.is_none());
    }

    #[tokio::test]
    async fn test_null_identifier_finds_nothing() {
        let request = IdentifyRequest {
            title: "Unknown Disc".to_string(),
            media_type: None,
            season: None,
        };
        let result = NullIdentifier.identify(&request).await.unwrap();
        assert_eq!(result, Identification::NotFound);
    }
}
