use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use stagecast_sfu::SfuConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub recording: RecordingConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest control-channel message accepted, in bytes
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory holding staging and final files
    pub uploads_dir: PathBuf,
    /// URL prefix under which final files are served
    pub public_prefix: String,
    /// Output container (mp4, mkv, ...)
    pub container: String,
    pub encoder_program: String,
    /// Grace given to the encoder after a stop request before it is killed
    pub stop_timeout_secs: u64,
    /// Keep the previous recording of a room when a new one finalizes
    pub keep_previous: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("./uploads"),
            public_prefix: "/uploads".to_string(),
            container: "mp4".to_string(),
            encoder_program: "ffmpeg".to_string(),
            stop_timeout_secs: 10,
            keep_previous: false,
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Ingest base URL; the destination key is appended as the last segment
    pub ingest_url: String,
    pub encoder_program: String,
    pub stop_timeout_secs: u64,
    /// Pull URL of a room's live feed, `{room}` is replaced by the room id
    pub live_source_template: Option<String>,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
    pub placeholder_fps: u32,
    pub video_bitrate_kbps: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingest_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            encoder_program: "ffmpeg".to_string(),
            stop_timeout_secs: 5,
            live_source_template: None,
            placeholder_width: 1280,
            placeholder_height: 720,
            placeholder_fps: 30,
            video_bitrate_kbps: 2500,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        // STAGECAST_SERVER__PORT, STAGECAST_SFU__PRODUCER_GRACE_PERIOD_SECS, ...
        builder = builder.add_source(
            Environment::with_prefix("STAGECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Resolve the config file (explicit path, then `./config.yaml`) and load it
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            return Self::from_file(path);
        }
        let cwd = Path::new("config.yaml");
        if cwd.exists() {
            Self::from_file(cwd)
        } else {
            Self::from_env()
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.max_message_bytes < 1024 {
            errors.push("server.max_message_bytes must be at least 1024".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        let recording = &self.recording;
        if recording.container.is_empty()
            || !recording.container.chars().all(|c| c.is_ascii_alphanumeric())
        {
            errors.push(format!(
                "recording.container must be a plain extension such as mp4, got \"{}\"",
                recording.container
            ));
        }
        if recording.encoder_program.is_empty() {
            errors.push("recording.encoder_program must not be empty".to_string());
        }
        if recording.stop_timeout_secs == 0 {
            errors.push("recording.stop_timeout_secs must be positive".to_string());
        }
        if !recording.public_prefix.starts_with('/') {
            errors.push("recording.public_prefix must start with '/'".to_string());
        }

        let relay = &self.relay;
        if !(relay.ingest_url.starts_with("rtmp://") || relay.ingest_url.starts_with("rtmps://")) {
            errors.push("relay.ingest_url must be an rtmp:// or rtmps:// URL".to_string());
        }
        if relay.encoder_program.is_empty() {
            errors.push("relay.encoder_program must not be empty".to_string());
        }
        if relay.stop_timeout_secs == 0 {
            errors.push("relay.stop_timeout_secs must be positive".to_string());
        }
        if let Some(template) = &relay.live_source_template {
            if !template.contains("{room}") {
                errors.push("relay.live_source_template must contain {room}".to_string());
            }
        }
        if relay.placeholder_width == 0
            || relay.placeholder_height == 0
            || relay.placeholder_width % 2 != 0
            || relay.placeholder_height % 2 != 0
        {
            errors.push("relay placeholder dimensions must be even and non-zero".to_string());
        }
        if relay.placeholder_fps == 0 {
            errors.push("relay.placeholder_fps must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
