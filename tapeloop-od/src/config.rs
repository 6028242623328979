//! Configuration for tapeloop-od
//!
//! Bootstrap configuration comes from a TOML file; every field has a
//! built-in default so an absent file is a valid configuration. Command-line
//! flags and environment variables override the file (see `main.rs`).

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tapeloop_common::config::LoggingConfig;

/// Complete daemon configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Root folder for database, captures and library (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address of the operational HTTP surface
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5780".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// JSON feed of liked tracks; discovery polling is disabled when unset
    #[serde(default)]
    pub feed_url: Option<String>,

    #[serde(default = "default_discovery_poll_secs")]
    pub poll_interval_secs: u64,

    /// Only tracks liked after this instant are considered
    #[serde(default = "default_cutoff")]
    pub cutoff: DateTime<Utc>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            feed_url: None,
            poll_interval_secs: default_discovery_poll_secs(),
            cutoff: default_cutoff(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_discovery_poll_secs() -> u64 {
    60
}

fn default_cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    /// Outbound notifications are POSTed here; logged only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Senders whose replies count; empty accepts any sender
    #[serde(default)]
    pub authorized_senders: Vec<String>,

    #[serde(default = "default_affirmative")]
    pub affirmative: Vec<String>,

    #[serde(default = "default_negative")]
    pub negative: Vec<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            authorized_senders: Vec::new(),
            affirmative: default_affirmative(),
            negative: default_negative(),
        }
    }
}

fn default_affirmative() -> Vec<String> {
    ["yes", "y", "approve", "\u{2705}"].iter().map(|s| s.to_string()).collect()
}

fn default_negative() -> Vec<String> {
    ["no", "n", "reject", "skip", "\u{274c}"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Total recording attempts before a track is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Added to the advertised duration to form the safety timeout
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Safety timeout used when the advertised duration is unknown
    #[serde(default = "default_unknown_duration_secs")]
    pub unknown_duration_secs: u64,

    /// Starts playback; `{track_id}` is substituted
    #[serde(default)]
    pub playback_command: Option<String>,

    /// Starts capture; `{output}`, `{silence_db}`, `{silence_secs}` are substituted.
    /// The process exiting on its own is the end-of-track signal.
    #[serde(default)]
    pub capture_command: Option<String>,

    /// Capture considered silent below this level
    #[serde(default = "default_silence_threshold_db")]
    pub silence_threshold_db: f32,

    /// Silence must last this long to end the track
    #[serde(default = "default_silence_duration_secs")]
    pub silence_duration_secs: f32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            grace_secs: default_grace_secs(),
            unknown_duration_secs: default_unknown_duration_secs(),
            playback_command: None,
            capture_command: None,
            silence_threshold_db: default_silence_threshold_db(),
            silence_duration_secs: default_silence_duration_secs(),
        }
    }
}

impl RecordingConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn unknown_duration(&self) -> Duration {
        Duration::from_secs(self.unknown_duration_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_grace_secs() -> u64 {
    10
}

fn default_unknown_duration_secs() -> u64 {
    15 * 60
}

fn default_silence_threshold_db() -> f32 {
    -50.0
}

fn default_silence_duration_secs() -> f32 {
    3.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Encoder invocation; `{input}`, `{output}`, `{bitrate}` are substituted
    #[serde(default = "default_encode_command")]
    pub encode_command: String,

    /// Failed encode/tag attempts before a track is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_bitrate")]
    pub bitrate: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encode_command: default_encode_command(),
            max_attempts: default_max_attempts(),
            bitrate: default_bitrate(),
        }
    }
}

fn default_encode_command() -> String {
    "ffmpeg -nostdin -loglevel error -y -i {input} -ar 44100 -ac 2 -b:a {bitrate} {output}"
        .to_string()
}

fn default_bitrate() -> String {
    "192k".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Directories whose subdirectories are treated as mounted volumes
    #[serde(default = "default_volume_roots")]
    pub volume_roots: Vec<PathBuf>,

    #[serde(default = "default_volume_poll_secs")]
    pub volume_poll_secs: u64,

    /// Existing folders searched (in order) on a freshly attached device
    #[serde(default = "default_music_folder_names")]
    pub music_folder_names: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            volume_roots: default_volume_roots(),
            volume_poll_secs: default_volume_poll_secs(),
            music_folder_names: default_music_folder_names(),
        }
    }
}

impl SyncConfig {
    pub fn volume_poll_interval(&self) -> Duration {
        Duration::from_secs(self.volume_poll_secs.max(1))
    }
}

fn default_volume_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/media"), PathBuf::from("/mnt")]
}

fn default_volume_poll_secs() -> u64 {
    5
}

fn default_music_folder_names() -> Vec<String> {
    ["Music", "MUSIC", "music", "Mp3", "MP3", "Songs"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the retry/backlog tick
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Attempt count at which a single retry warning is sent
    #[serde(default = "default_retry_notify_threshold")]
    pub retry_notify_threshold: u32,

    /// Wait before retrying a failed recording or encode/tag; doubles with
    /// each further attempt
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            retry_notify_threshold: default_retry_notify_threshold(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

fn default_tick_secs() -> u64 {
    30
}

fn default_retry_notify_threshold() -> u32 {
    2
}

fn default_retry_backoff_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Only treat the device as online while joined to this network
    #[serde(default)]
    pub target_ssid: Option<String>,

    #[serde(default = "default_probe_secs")]
    pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            target_ssid: None,
            probe_interval_secs: default_probe_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

fn default_probe_secs() -> u64 {
    15
}
