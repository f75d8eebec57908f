//! Heuristics deciding which titles on a disc are real content.
//!
//! Discs carry menus, trailers, duplicate angles and "play all" titles next to
//! the feature or episodes. Selection works purely on durations, the
//! configured thresholds and the content type, so the same scan always
//! yields the same choice.

use crate::config::SelectionConfig;
use crate::disc::model::{Title, Track};
use serde::{Deserialize, Serialize};

/// What kind of content a disc is believed to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Movie,
    TvEpisode,
    Cartoon,
}

impl ContentType {
    pub fn is_episodic(self) -> bool {
        matches!(self, ContentType::TvEpisode | ContentType::Cartoon)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Movie => write!(f, "movie"),
            ContentType::TvEpisode => write!(f, "tv_episode"),
            ContentType::Cartoon => write!(f, "cartoon"),
        }
    }
}

/// Why a title was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleRole {
    Main,
    Episode,
    /// Another feature-length title of a movie disc, such as a second cut.
    Alternate,
    Extra,
}

/// One title chosen for ripping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleChoice {
    pub title_id: String,
    pub role: TitleRole,
    /// Position among the episodes on this disc, starting at 0.
    pub episode_offset: Option<u32>,
}

/// Result of running selection over a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleSelection {
    pub content_type: ContentType,
    /// Longest title on the disc, if any.
    pub main_title: Option<String>,
    pub titles: Vec<TitleChoice>,
}

impl TitleSelection {
    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

/// Audio tracks to carry into the output file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSelection {
    /// Track ids kept, in disc order.
    pub kept: Vec<String>,
    /// Commentary track ids dropped from the output.
    pub discarded_commentary: Vec<String>,
}

/// Returns the longest title. Ties go to the first one encountered.
pub fn select_main_title(titles: &[Title]) -> Option<&Title> {
    let mut best: Option<&Title> = None;
    for title in titles {
        match best {
            Some(current) if title.duration <= current.duration => {}
            _ => best = Some(title),
        }
    }
    best
}

/// Applies [`SelectionConfig`] thresholds to scanned titles.
#[derive(Debug, Clone)]
pub struct TitleSelector {
    config: SelectionConfig,
}

impl TitleSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Picks the titles to rip for the given content type.
    pub fn select(&self, titles: &[Title], content_type: ContentType) -> TitleSelection {
        let main_title = select_main_title(titles).map(|t| t.id.clone());
        let chosen = match content_type {
            ContentType::Movie => self.select_movie(titles),
            ContentType::TvEpisode => self.select_episodes(
                titles,
                self.config.tv_episode_min_duration,
                self.config.tv_episode_max_duration,
            ),
            ContentType::Cartoon => self.select_episodes(
                titles,
                self.config.cartoon_min_duration,
                self.config.cartoon_max_duration,
            ),
        };

        TitleSelection {
            content_type,
            main_title,
            titles: chosen,
        }
    }

    /// Every title reaching `movie_min_duration`: the longest as the main
    /// feature, the rest as alternates. Playlists repeating the main feature
    /// (same length and size) are skipped. Short extras follow if enabled.
    fn select_movie(&self, titles: &[Title]) -> Vec<TitleChoice> {
        let Some(main) = select_main_title(titles) else {
            return Vec::new();
        };

        let min_secs = minutes(self.config.movie_min_duration);
        let long_enough =
            main.duration >= min_secs || (self.config.allow_short_content && main.duration > 0);
        if !long_enough {
            return Vec::new();
        }

        let mut chosen = vec![TitleChoice {
            title_id: main.id.clone(),
            role: TitleRole::Main,
            episode_offset: None,
        }];

        let mut seen = vec![(main.duration, main.size)];
        for title in titles {
            if title.id == main.id || title.duration < min_secs {
                continue;
            }
            if title.size > 0 && seen.contains(&(title.duration, title.size)) {
                continue;
            }
            seen.push((title.duration, title.size));
            chosen.push(TitleChoice {
                title_id: title.id.clone(),
                role: TitleRole::Alternate,
                episode_offset: None,
            });
        }

        if self.config.include_extras {
            let max_extra = minutes(self.config.max_extras_duration);
            chosen.extend(
                titles
                    .iter()
                    .filter(|t| t.id != main.id && t.duration > 0 && t.duration < max_extra)
                    .map(|t| TitleChoice {
                        title_id: t.id.clone(),
                        role: TitleRole::Extra,
                        episode_offset: None,
                    }),
            );
        }

        chosen
    }

    fn select_episodes(&self, titles: &[Title], min_minutes: u32, max_minutes: u32) -> Vec<TitleChoice> {
        let lower = if self.config.allow_short_content {
            1
        } else {
            minutes(min_minutes)
        };
        let upper = minutes(max_minutes);

        let mut seen: Vec<(u64, u64)> = Vec::new();
        let mut chosen = Vec::new();
        for title in titles {
            if title.duration < lower || title.duration > upper {
                continue;
            }
            // Same episode exposed twice (angles, alternate playlists).
            if title.size > 0 && seen.contains(&(title.duration, title.size)) {
                continue;
            }
            seen.push((title.duration, title.size));
            chosen.push(TitleChoice {
                title_id: title.id.clone(),
                role: TitleRole::Episode,
                episode_offset: Some(chosen.len() as u32),
            });
        }
        chosen
    }

    /// Chooses which audio tracks of a title end up in the output file.
    pub fn select_audio(&self, title: &Title) -> AudioSelection {
        let main = title.main_audio_tracks();
        let english_main: Vec<&Track> = title
            .english_audio_tracks()
            .into_iter()
            .filter(|t| !t.is_commentary())
            .collect();

        let mut kept_ids: Vec<&str> = if self.config.include_all_english_audio && !english_main.is_empty() {
            english_main.iter().map(|t| t.id.as_str()).collect()
        } else {
            english_main
                .first()
                .or(main.first())
                .map(|t| vec![t.id.as_str()])
                .unwrap_or_default()
        };

        let commentary = title.commentary_tracks();
        let mut discarded_commentary = Vec::new();
        if self.config.include_commentary_tracks {
            kept_ids.extend(commentary.iter().map(|t| t.id.as_str()));
        } else {
            discarded_commentary = commentary.iter().map(|t| t.id.clone()).collect();
        }

        AudioSelection {
            kept: title
                .audio_tracks()
                .into_iter()
                .filter(|t| kept_ids.contains(&t.id.as_str()))
                .map(|t| t.id.clone())
                .collect(),
            discarded_commentary,
        }
    }

    /// Guesses the content type from the shape of the title list.
    pub fn guess_content_type(&self, titles: &[Title]) -> ContentType {
        let Some(main) = select_main_title(titles) else {
            return ContentType::Movie;
        };

        let in_band = |min: u32, max: u32| {
            titles
                .iter()
                .filter(|t| t.duration >= minutes(min).max(1) && t.duration <= minutes(max))
                .count()
        };
        let tv_count = in_band(
            self.config.tv_episode_min_duration,
            self.config.tv_episode_max_duration,
        );
        let cartoon_count = in_band(
            self.config.cartoon_min_duration,
            self.config.cartoon_max_duration,
        );
        let is_feature_length = main.duration >= minutes(self.config.movie_min_duration);

        if tv_count >= 3 {
            ContentType::TvEpisode
        } else if cartoon_count >= 4 && tv_count == 0 && !is_feature_length {
            ContentType::Cartoon
        } else if is_feature_length {
            ContentType::Movie
        } else if tv_count >= 1 {
            ContentType::TvEpisode
        } else if cartoon_count >= 1 {
            ContentType::Cartoon
        } else {
            ContentType::Movie
        }
    }
}

fn minutes(value: u32) -> u64 {
    u64::from(value) * 60
}

/// Hints recovered from a disc's volume label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelHints {
    /// Human readable title, e.g. "Show Name" for `SHOW_NAME_S2_D1`.
    pub title: String,
    pub season: Option<u32>,
    pub disc: Option<u32>,
}

const LABEL_NOISE: &[&str] = &["WS", "FS", "WIDESCREEN", "FULLSCREEN", "BLURAY", "BD", "DVD", "UHD"];

fn numbered(token: &str, prefixes: &[&str]) -> Option<u32> {
    prefixes.iter().find_map(|prefix| {
        let rest = token.strip_prefix(prefix)?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    })
}

/// Splits a volume label into a readable title plus season/disc numbers.
pub fn parse_label_hints(label: &str) -> LabelHints {
    let tokens: Vec<String> = label
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_uppercase())
        .collect();

    let mut season = None;
    let mut disc = None;
    let mut words = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        let next_number = tokens.get(i + 1).and_then(|n| n.parse::<u32>().ok());

        if let Some(n) = numbered(token, &["SEASON", "S"]) {
            season = Some(n);
        } else if token == "SEASON" && next_number.is_some() {
            season = next_number;
            i += 1;
        } else if let Some(n) = numbered(token, &["DISC", "DISK", "D"]) {
            disc = Some(n);
        } else if (token == "DISC" || token == "DISK") && next_number.is_some() {
            disc = next_number;
            i += 1;
        } else if !LABEL_NOISE.contains(&token) {
            words.push(title_case(token));
        }
        i += 1;
    }

    LabelHints {
        title: words.join(" "),
        season,
        disc,
    }
}

fn title_case(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
