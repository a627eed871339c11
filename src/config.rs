//! Tunables for a voice connection.
//!
//! Durations are stored in milliseconds so a config file stays readable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GATEWAY_VERSION: u8 = 4;
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Where the warm-up silence sent before real audio comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SilencePreamble {
    #[default]
    Builtin,
    /// A length-prefixed frame file.
    File(PathBuf),
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub gateway_version: u8,
    pub frame_duration_ms: u64,
    pub samples_per_frame: u32,
    pub pacing_poll_ms: u64,
    pub batch_frames: u32,
    pub batch_wait_ms: u64,
    pub handshake_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub resume_timeout_ms: u64,
    pub public_ip_url: String,
    pub silence_preamble: SilencePreamble,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            gateway_version: DEFAULT_GATEWAY_VERSION,
            frame_duration_ms: 20,
            samples_per_frame: voicecore::packet::SAMPLES_PER_FRAME,
            pacing_poll_ms: 1,
            batch_frames: 5,
            batch_wait_ms: 5,
            handshake_timeout_ms: 10_000,
            join_timeout_ms: 10_000,
            resume_timeout_ms: 5_000,
            public_ip_url: DEFAULT_PUBLIC_IP_URL.to_string(),
            silence_preamble: SilencePreamble::Builtin,
        }
    }
}

impl VoiceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    /// Never zero, so the pacing loop always yields.
    pub fn pacing_poll(&self) -> Duration {
        Duration::from_millis(self.pacing_poll_ms.max(1))
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms)
    }
}
