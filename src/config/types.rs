use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub origin: OriginConfig,

    #[serde(default)]
    pub streamers: Vec<StreamerConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub r2: Option<R2Config>,

    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingConfig {
    /// Root directory for recordings; one subdirectory per broadcaster
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Failed attempts smaller than this many bytes are deleted
    #[serde(default = "default_min_viable_bytes")]
    pub min_viable_bytes: u64,

    /// Maximum file name length (without extension), in characters
    #[serde(default = "default_filename_max_chars")]
    pub filename_max_chars: usize,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./file")
}
fn default_min_viable_bytes() -> u64 {
    1024
}
fn default_filename_max_chars() -> usize {
    castrec_common::paths::DEFAULT_MAX_STEM_CHARS
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            min_viable_bytes: default_min_viable_bytes(),
            filename_max_chars: default_filename_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OriginConfig {
    /// Stream status endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Base URL of broadcaster pages; also sent as the WebSocket Origin
    #[serde(default = "default_page_base_url")]
    pub page_base_url: String,

    /// Cookie used for the authenticated retry on protected streams
    #[serde(default)]
    pub cookie: Option<String>,
}

fn default_api_endpoint() -> String {
    "https://twitcasting.tv/streamserver.php".to_string()
}
fn default_page_base_url() -> String {
    "https://twitcasting.tv".to_string()
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            page_base_url: default_page_base_url(),
            cookie: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamerConfig {
    pub screen_id: String,

    /// Cron expression; required in croned mode
    #[serde(default)]
    pub schedule: Option<String>,

    /// Video codec arguments passed to ffmpeg after `-c:v`
    #[serde(default)]
    pub encode_option: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_jitter_min")]
    pub jitter_min_secs: u64,

    #[serde(default = "default_jitter_max")]
    pub jitter_max_secs: u64,

    /// Time given to in-flight writes after an interrupt
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

fn default_jitter_min() -> u64 {
    1
}
fn default_jitter_max() -> u64 {
    10
}
fn default_grace_period() -> u64 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_min_secs: default_jitter_min(),
            jitter_max_secs: default_jitter_max(),
            grace_period_secs: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct R2Config {
    #[serde(default)]
    pub enabled: bool,

    /// S3-compatible endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Prepended to each uploaded file name
    #[serde(default)]
    pub key_prefix: String,
}

fn default_region() -> String {
    "auto".to_string()
}

impl Default for R2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            bucket: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: default_region(),
            key_prefix: String::new(),
        }
    }
}

impl R2Config {
    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.endpoint.trim().is_empty() {
            missing.push("endpoint");
        }
        if self.bucket.trim().is_empty() {
            missing.push("bucket");
        }
        if self.access_key_id.trim().is_empty() {
            missing.push("access_key_id");
        }
        if self.secret_access_key.trim().is_empty() {
            missing.push("secret_access_key");
        }
        missing
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,
}

fn default_transcode_timeout() -> u64 {
    castrec_av::transcode::DEFAULT_TRANSCODE_TIMEOUT.as_secs()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            transcode_timeout_secs: default_transcode_timeout(),
        }
    }
}
