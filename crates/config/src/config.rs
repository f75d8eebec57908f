//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A setting is present but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem locations used by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Scratch space for rips and encodes
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Root of the media library that finished files are filed into
    #[serde(default = "default_library_dir")]
    pub library_dir: PathBuf,
    /// Directory holding one JSON record per queue item
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/spindle/staging")
}

fn default_library_dir() -> PathBuf {
    PathBuf::from("/media/library")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/spindle/queue")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            library_dir: default_library_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Optical drive settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriveConfig {
    /// Device path of the optical drive (e.g. /dev/sr0)
    #[serde(default = "default_device")]
    pub device: String,
    /// Seconds between disc detection polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Eject the disc once ripping finishes
    #[serde(default = "default_auto_eject")]
    pub auto_eject: bool,
    /// Binary used to eject the tray
    #[serde(default = "default_eject_binary")]
    pub eject_binary: String,
    #[serde(default = "default_eject_timeout_secs")]
    pub eject_timeout_secs: u64,
}

fn default_device() -> String {
    "/dev/sr0".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_auto_eject() -> bool {
    true
}

fn default_eject_binary() -> String {
    "eject".to_string()
}

fn default_eject_timeout_secs() -> u64 {
    30
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            poll_interval_secs: default_poll_interval_secs(),
            auto_eject: default_auto_eject(),
            eject_binary: default_eject_binary(),
            eject_timeout_secs: default_eject_timeout_secs(),
        }
    }
}

/// MakeMKV invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MakemkvConfig {
    /// makemkvcon binary name or path
    #[serde(default = "default_makemkv_binary")]
    pub binary: String,
    /// Timeout for the read-only info scan
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Timeout for extracting a single title
    #[serde(default = "default_rip_timeout_secs")]
    pub rip_timeout_secs: u64,
}

fn default_makemkv_binary() -> String {
    "makemkvcon".to_string()
}

fn default_scan_timeout_secs() -> u64 {
    300
}

fn default_rip_timeout_secs() -> u64 {
    3 * 60 * 60
}

impl Default for MakemkvConfig {
    fn default() -> Self {
        Self {
            binary: default_makemkv_binary(),
            scan_timeout_secs: default_scan_timeout_secs(),
            rip_timeout_secs: default_rip_timeout_secs(),
        }
    }
}

/// Thresholds for choosing which titles on a disc are worth ripping.
///
/// Durations are in minutes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConfig {
    #[serde(default = "default_movie_min_duration")]
    pub movie_min_duration: u32,
    #[serde(default = "default_max_extras_duration")]
    pub max_extras_duration: u32,
    #[serde(default = "default_tv_episode_min_duration")]
    pub tv_episode_min_duration: u32,
    #[serde(default = "default_tv_episode_max_duration")]
    pub tv_episode_max_duration: u32,
    #[serde(default = "default_cartoon_min_duration")]
    pub cartoon_min_duration: u32,
    #[serde(default = "default_cartoon_max_duration")]
    pub cartoon_max_duration: u32,
    /// Relax minimum durations (shorts and bonus discs)
    #[serde(default)]
    pub allow_short_content: bool,
    /// Rip short extras alongside a movie's main feature
    #[serde(default)]
    pub include_extras: bool,
    /// Keep every English audio track instead of only the primary one
    #[serde(default)]
    pub include_all_english_audio: bool,
    /// Keep commentary tracks in the output file
    #[serde(default)]
    pub include_commentary_tracks: bool,
}

fn default_movie_min_duration() -> u32 {
    60
}

fn default_max_extras_duration() -> u32 {
    15
}

fn default_tv_episode_min_duration() -> u32 {
    18
}

fn default_tv_episode_max_duration() -> u32 {
    70
}

fn default_cartoon_min_duration() -> u32 {
    2
}

fn default_cartoon_max_duration() -> u32 {
    15
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            movie_min_duration: default_movie_min_duration(),
            max_extras_duration: default_max_extras_duration(),
            tv_episode_min_duration: default_tv_episode_min_duration(),
            tv_episode_max_duration: default_tv_episode_max_duration(),
            cartoon_min_duration: default_cartoon_min_duration(),
            cartoon_max_duration: default_cartoon_max_duration(),
            allow_short_content: false,
            include_extras: false,
            include_all_english_audio: false,
            include_commentary_tracks: false,
        }
    }
}

/// Metadata identification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentificationConfig {
    /// Matches below this confidence (0.0-1.0) are sent to review
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Encoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// Hard timeout for one encode (0 = no timeout)
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_encoder_binary() -> String {
    "drapto".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            timeout_secs: 0,
        }
    }
}

/// Library layout settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    #[serde(default = "default_movies_dir")]
    pub movies_dir: String,
    #[serde(default = "default_tv_dir")]
    pub tv_dir: String,
    /// Replace files that already exist at the destination
    #[serde(default)]
    pub overwrite_existing: bool,
}

fn default_movies_dir() -> String {
    "Movies".to_string()
}

fn default_tv_dir() -> String {
    "TV Shows".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            movies_dir: default_movies_dir(),
            tv_dir: default_tv_dir(),
            overwrite_existing: false,
        }
    }
}

/// Status HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_status_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    #[serde(default)]
    pub makemkv: MakemkvConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub identification: IdentificationConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - SPINDLE_OPTICAL_DRIVE -> drive.device
    /// - SPINDLE_STAGING_DIR -> paths.staging_dir
    /// - SPINDLE_LIBRARY_DIR -> paths.library_dir
    /// - SPINDLE_STATE_DIR -> paths.state_dir
    /// - SPINDLE_CONFIDENCE_THRESHOLD -> identification.confidence_threshold
    /// - SPINDLE_MAKEMKV_BINARY -> makemkv.binary
    /// - SPINDLE_ENCODER_BINARY -> encoder.binary
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SPINDLE_OPTICAL_DRIVE") {
            if !val.is_empty() {
                self.drive.device = val;
            }
        }

        if let Ok(val) = env::var("SPINDLE_STAGING_DIR") {
            if !val.is_empty() {
                self.paths.staging_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SPINDLE_LIBRARY_DIR") {
            if !val.is_empty() {
                self.paths.library_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SPINDLE_STATE_DIR") {
            if !val.is_empty() {
                self.paths.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SPINDLE_CONFIDENCE_THRESHOLD") {
            if let Ok(threshold) = val.parse::<f32>() {
                self.identification.confidence_threshold = threshold;
            }
        }

        if let Ok(val) = env::var("SPINDLE_MAKEMKV_BINARY") {
            if !val.is_empty() {
                self.makemkv.binary = val;
            }
        }

        if let Ok(val) = env::var("SPINDLE_ENCODER_BINARY") {
            if !val.is_empty() {
                self.encoder.binary = val;
            }
        }
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// Called once at startup so a bad value fails fast instead of halfway
    /// through a rip.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drive.device.trim().is_empty() {
            return Err(invalid("drive.device must not be empty"));
        }
        if self.makemkv.binary.trim().is_empty() {
            return Err(invalid("makemkv.binary must not be empty"));
        }
        if self.encoder.binary.trim().is_empty() {
            return Err(invalid("encoder.binary must not be empty"));
        }
        if self.drive.poll_interval_secs == 0 {
            return Err(invalid("drive.poll_interval_secs must be greater than 0"));
        }
        if self.drive.eject_timeout_secs == 0 {
            return Err(invalid("drive.eject_timeout_secs must be greater than 0"));
        }
        if self.makemkv.scan_timeout_secs == 0 || self.makemkv.rip_timeout_secs == 0 {
            return Err(invalid("makemkv timeouts must be greater than 0"));
        }

        let threshold = self.identification.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(format!(
                "identification.confidence_threshold must be within 0.0-1.0, got {}",
                threshold
            )));
        }

        let sel = &self.selection;
        if sel.tv_episode_min_duration > sel.tv_episode_max_duration {
            return Err(invalid(format!(
                "selection.tv_episode_min_duration ({}) exceeds tv_episode_max_duration ({})",
                sel.tv_episode_min_duration, sel.tv_episode_max_duration
            )));
        }
        if sel.cartoon_min_duration > sel.cartoon_max_duration {
            return Err(invalid(format!(
                "selection.cartoon_min_duration ({}) exceeds cartoon_max_duration ({})",
                sel.cartoon_min_duration, sel.cartoon_max_duration
            )));
        }

        if self.library.movies_dir.trim().is_empty() || self.library.tv_dir.trim().is_empty() {
            return Err(invalid("library category directories must not be empty"));
        }

        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.makemkv.scan_timeout_secs)
    }

    pub fn rip_timeout(&self) -> Duration {
        Duration::from_secs(self.makemkv.rip_timeout_secs)
    }

    pub fn eject_timeout(&self) -> Duration {
        Duration::from_secs(self.drive.eject_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.drive.poll_interval_secs)
    }

    /// Encoder timeout, `None` when encodes may run indefinitely
    pub fn encode_timeout(&self) -> Option<Duration> {
        match self.encoder.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}
