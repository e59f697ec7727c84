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
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// Stability gate timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilityConfig {
    /// How often to sample the file size while waiting (default 200 ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long the size must remain unchanged before the file counts as stable (default 500 ms)
    #[serde(default = "default_stable_for_ms")]
    pub stable_for_ms: u64,
    /// Ceiling after which we proceed anyway (default 30 s)
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_stable_for_ms() -> u64 {
    500
}

fn default_max_wait_secs() -> u64 {
    30
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stable_for_ms: default_stable_for_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stable_for(&self) -> Duration {
        Duration::from_millis(self.stable_for_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Dispatch deduplication window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupeConfig {
    /// Window during which repeated dispatches for the same path are suppressed (default 2 s)
    #[serde(default = "default_dedupe_window_ms")]
    pub window_ms: u64,
    /// Entry count at which expired entries are swept from the window map
    #[serde(default = "default_sweep_threshold")]
    pub sweep_threshold: usize,
}

fn default_dedupe_window_ms() -> u64 {
    2000
}

fn default_sweep_threshold() -> usize {
    1024
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window_ms: default_dedupe_window_ms(),
            sweep_threshold: default_sweep_threshold(),
        }
    }
}

impl DedupeConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-converter-class semaphore capacities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolsConfig {
    /// Concurrent video thumbnail extractions (default 5)
    #[serde(default = "default_video_pool")]
    pub video: usize,
    /// Concurrent HEIC conversions (default 100)
    #[serde(default = "default_heic_pool")]
    pub heic: usize,
    /// Concurrent GIF decodes (default 5)
    #[serde(default = "default_gif_pool")]
    pub gif: usize,
}

fn default_video_pool() -> usize {
    5
}

fn default_heic_pool() -> usize {
    100
}

fn default_gif_pool() -> usize {
    5
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            video: default_video_pool(),
            heic: default_heic_pool(),
            gif: default_gif_pool(),
        }
    }
}

/// Transformation engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformConfig {
    /// Target width for converted images in pixels (default 500)
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    /// JPEG encode quality (default 85)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Hard cap on the RGBA intermediate buffer (width x height x 4, default 50 MB)
    #[serde(default = "default_max_pixel_buffer_bytes")]
    pub max_pixel_buffer_bytes: u64,
    /// Deadline for a single heic-converter invocation (default 30 s)
    #[serde(default = "default_heic_deadline_secs")]
    pub heic_deadline_secs: u64,
    /// Deadline for a single ffmpeg frame extraction (default 60 s)
    #[serde(default = "default_video_deadline_secs")]
    pub video_deadline_secs: u64,
    /// Deadline for a single ffprobe invocation (default 10 s)
    #[serde(default = "default_probe_deadline_secs")]
    pub probe_deadline_secs: u64,
    /// Only transform media files; leave every other file untouched (default true)
    #[serde(default = "default_media_only")]
    pub media_only: bool,
    /// In administrative mode, truncate unsupported files instead of deleting them
    #[serde(default = "default_truncate_unknown")]
    pub truncate_unknown: bool,
    /// Directory of bundled tool binaries, searched before the executable directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libraries_dir: Option<PathBuf>,
}

fn default_target_width() -> u32 {
    500
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_pixel_buffer_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_heic_deadline_secs() -> u64 {
    30
}

fn default_video_deadline_secs() -> u64 {
    60
}

fn default_probe_deadline_secs() -> u64 {
    10
}

fn default_media_only() -> bool {
    true
}

fn default_truncate_unknown() -> bool {
    true
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            target_width: default_target_width(),
            jpeg_quality: default_jpeg_quality(),
            max_pixel_buffer_bytes: default_max_pixel_buffer_bytes(),
            heic_deadline_secs: default_heic_deadline_secs(),
            video_deadline_secs: default_video_deadline_secs(),
            probe_deadline_secs: default_probe_deadline_secs(),
            media_only: default_media_only(),
            truncate_unknown: default_truncate_unknown(),
            libraries_dir: None,
        }
    }
}

impl TransformConfig {
    pub fn heic_deadline(&self) -> Duration {
        Duration::from_secs(self.heic_deadline_secs)
    }

    pub fn video_deadline(&self) -> Duration {
        Duration::from_secs(self.video_deadline_secs)
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }
}

/// Watch adapter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Interval between rescan sweeps of the watched tree (default 30 s)
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Per-directory cooldown between rescans (default 60 s)
    #[serde(default = "default_rescan_cooldown_secs")]
    pub rescan_cooldown_secs: u64,
}

fn default_rescan_interval_secs() -> u64 {
    30
}

fn default_rescan_cooldown_secs() -> u64 {
    60
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval_secs(),
            rescan_cooldown_secs: default_rescan_cooldown_secs(),
        }
    }
}

impl WatchConfig {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn rescan_cooldown(&self) -> Duration {
        Duration::from_secs(self.rescan_cooldown_secs)
    }
}

/// Extraction subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractorConfig {
    /// Overall ceiling on one extraction run (default 24 h)
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    /// Arguments passed to the extraction tool ahead of the backup destination
    #[serde(default = "default_extractor_args")]
    pub args: Vec<String>,
}

fn default_run_deadline_secs() -> u64 {
    24 * 60 * 60
}

fn default_extractor_args() -> Vec<String> {
    [
        "--domain",
        "*SMS*",
        "--domain",
        "*sms*",
        "--domain",
        "*AddressBook*",
        "--domain",
        "*WhatsApp*",
        "--domain",
        "*whatsapp*",
        "--domain",
        "*ChatStorage.sqlite*",
        "--domain",
        "*Message/Media/*",
        "backup",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            run_deadline_secs: default_run_deadline_secs(),
            args: default_extractor_args(),
        }
    }
}

impl ExtractorConfig {
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
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
    /// Overrides the following values if environment variables are set:
    /// - BT_TARGET_WIDTH -> transform.target_width
    /// - BT_JPEG_QUALITY -> transform.jpeg_quality
    /// - BT_VIDEO_POOL -> pools.video
    /// - BT_HEIC_POOL -> pools.heic
    /// - BT_GIF_POOL -> pools.gif
    /// - BT_RUN_DEADLINE_SECS -> extractor.run_deadline_secs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BT_TARGET_WIDTH") {
            if let Ok(width) = val.parse::<u32>() {
                self.transform.target_width = width;
            }
        }

        if let Ok(val) = env::var("BT_JPEG_QUALITY") {
            if let Ok(quality) = val.parse::<u8>() {
                self.transform.jpeg_quality = quality;
            }
        }

        if let Ok(val) = env::var("BT_VIDEO_POOL") {
            if let Ok(cap) = val.parse::<usize>() {
                self.pools.video = cap;
            }
        }

        if let Ok(val) = env::var("BT_HEIC_POOL") {
            if let Ok(cap) = val.parse::<usize>() {
                self.pools.heic = cap;
            }
        }

        if let Ok(val) = env::var("BT_GIF_POOL") {
            if let Ok(cap) = val.parse::<usize>() {
                self.pools.gif = cap;
            }
        }

        if let Ok(val) = env::var("BT_RUN_DEADLINE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.extractor.run_deadline_secs = secs;
            }
        }
    }

    /// Load configuration from a file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
