//! Configuration management for duet.
//!
//! The configuration lives in a single TOML file. Detector settings are
//! always written out in full so the file shows every value the silence
//! detector runs with.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::APP_NAME;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_WELCOME: &str = "Welcome! I'm your podcast assistant, ready to analyze documents, \
discuss topics, or answer questions. Upload a file, type a query, or join the conversation by voice.";

/// Settings for end-of-turn detection.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DetectorConfig {
    /// How often the live signal is sampled (milliseconds)
    pub sample_interval_ms: u64,

    /// Loudness in dBFS below which a sample counts as silent
    pub silence_db_threshold: f32,

    /// Continuous silence required before the recording stops (milliseconds)
    pub silence_duration_ms: u64,

    /// Hard cap on a single recording (milliseconds)
    pub max_duration_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 500,
            silence_db_threshold: -50.0,
            silence_duration_ms: 5000,
            max_duration_ms: 120_000,
        }
    }
}

impl DetectorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Core configuration structure for the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base URL of the backend serving `/process-text` and `/process-file`
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// WebSocket URL of the voice-turn channel
    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    /// Timeout for text and file submissions (in seconds)
    #[serde(
        default = "default_request_timeout",
        skip_serializing_if = "is_default_request_timeout"
    )]
    pub request_timeout_secs: u64,

    /// How long to wait for the voice channel handshake (in seconds)
    #[serde(
        default = "default_connect_timeout",
        skip_serializing_if = "is_default_connect_timeout"
    )]
    pub connect_timeout_secs: u64,

    /// Open the voice channel as soon as the application starts
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub connect_on_start: bool,

    /// Agent message shown when a conversation starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,

    /// End-of-turn detection
    #[serde(default)]
    pub detector: DetectorConfig,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_channel_url() -> String {
    DEFAULT_CHANNEL_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn default_request_timeout() -> u64 {
    30
}

fn is_default_request_timeout(v: &u64) -> bool {
    *v == default_request_timeout()
}

fn default_connect_timeout() -> u64 {
    10
}

fn is_default_connect_timeout(v: &u64) -> bool {
    *v == default_connect_timeout()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            channel_url: default_channel_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            connect_on_start: true,
            welcome_message: None,
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Get the request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get the welcome message, falling back to the built-in greeting
    pub fn welcome_message(&self) -> &str {
        self.welcome_message.as_deref().unwrap_or(DEFAULT_WELCOME)
    }
}

/// Manages loading and saving configuration files.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager with the default configuration directory.
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// Creates a new ConfigManager with a specified configuration directory.
    pub fn with_config_dir<P: AsRef<std::path::Path>>(dir: P) -> Self {
        let config_path = dir.as_ref().join(format!("{}.toml", APP_NAME));
        Self { config_path }
    }

    /// Returns the default path to the configuration file.
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to retrieve configuration directory")?;
        Ok(config_dir.join(APP_NAME).join(format!("{}.toml", APP_NAME)))
    }

    /// Loads the configuration from the config file or returns default.
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config file at {:?}", self.config_path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file at {:?}", self.config_path))?;

        let detector = &config.detector;
        if detector.silence_duration_ms >= detector.max_duration_ms {
            warn!(
                silence_duration_ms = detector.silence_duration_ms,
                max_duration_ms = detector.max_duration_ms,
                "Silence duration is not shorter than the maximum recording length; \
                 recordings will only ever end on the safety timer."
            );
        }

        Ok(config)
    }

    /// Saves the configuration to the config file.
    pub fn save(&self, config: &Config) -> Result<()> {
        let config_dir = self
            .config_path
            .parent()
            .with_context(|| format!("Failed to get parent directory of {:?}", self.config_path))?;

        fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory at {:?}", config_dir))?;

        let serialized =
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write config file at {:?}", self.config_path))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    pub fn config_path(&self) -> &std::path::Path {
        &self.config_path
    }
}
