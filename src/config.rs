//! Configuration types for the live voice session.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LiveError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Remote session settings.
    pub session: SessionConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Outbound (microphone) sample rate in Hz.
    pub input_sample_rate: u32,
    /// Inbound (speaker) sample rate in Hz.
    pub output_sample_rate: u32,
    /// Samples per outbound frame. Constant for the lifetime of a session.
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Captured frames buffered between the audio thread and the session loop.
    pub frame_channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            input_device: None,
            output_device: None,
            frame_channel_capacity: 64,
        }
    }
}

/// Remote live session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the bidirectional streaming service.
    pub endpoint: String,
    /// Model resource name sent in the setup message.
    pub model: String,
    /// Prebuilt synthetic voice for replies.
    pub voice_name: String,
    /// Persona instruction sent once at setup.
    pub system_instruction: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    /// Upper bound on connect + setup handshake, in seconds.
    pub connect_timeout_secs: u64,
    /// Outbound frames buffered ahead of the socket writer.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: concat!(
                "wss://generativelanguage.googleapis.com/ws/",
                "google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent",
            )
            .to_owned(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_owned(),
            voice_name: "Zephyr".to_owned(),
            system_instruction: concat!(
                "You are Echo, interacting via a live audio stream. ",
                "You are a calm, supportive mentor in Project Kairos.",
            )
            .to_owned(),
            api_key_env: "GEMINI_API_KEY".to_owned(),
            api_key: None,
            connect_timeout_secs: 15,
            outbound_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Resolve the API key: inline value first, then the configured env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for daily-rolling log files (None = stderr only).
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "kairos_live=info".to_owned(),
            log_dir: None,
        }
    }
}

impl LiveConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LiveError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| LiveError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/kairos/live.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("kairos").join("live.toml")
        } else if let Some(config) = dirs::config_dir() {
            config.join("kairos").join("live.toml")
        } else {
            PathBuf::from("/tmp/kairos-config/live.toml")
        }
    }

    /// Check values the audio path cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(LiveError::Config("sample rates must be non-zero".into()));
        }
        if self.audio.frame_size == 0 {
            return Err(LiveError::Config("audio.frame_size must be non-zero".into()));
        }
        if self.audio.frame_channel_capacity == 0 || self.session.outbound_capacity == 0 {
            return Err(LiveError::Config("channel capacities must be non-zero".into()));
        }
        if self.session.endpoint.is_empty() {
            return Err(LiveError::Config("session.endpoint is empty".into()));
        }
        Ok(())
    }
}
