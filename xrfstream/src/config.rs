//! Streamer configuration.
//!
//! Loaded from a JSON file; every field has a default so partial files are fine.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::publisher::PayloadMode;
use crate::serializer::PayloadFormat;

pub const DEFAULT_ENDPOINT: &str = "tcp://*:43434";
pub const DEFAULT_TOPIC: &str = "XRF-Counts";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("send_counts and send_spectra are mutually exclusive")]
    ConflictingModes,
    #[error("neither send_counts nor send_spectra is set")]
    NoMode,
    #[error("queue_capacity must be at least 1")]
    ZeroCapacity,
    #[error("topic must not be empty")]
    EmptyTopic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub send_counts: bool,
    pub send_spectra: bool,
    pub transport_enabled: bool,
    pub endpoint: String,
    pub topic: String,
    pub format: PayloadFormat,
    /// Finished records waiting for the sender thread.
    pub queue_capacity: usize,
    pub linger_ms: i32,
    pub send_hwm: i32,
    pub shutdown_timeout_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            send_counts: true,
            send_spectra: false,
            transport_enabled: true,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            format: PayloadFormat::Bincode,
            queue_capacity: 64,
            linger_ms: 1000,
            send_hwm: 1000,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl StreamerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: StreamerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.payload_mode()?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(())
    }

    pub fn payload_mode(&self) -> Result<PayloadMode, ConfigError> {
        match (self.send_counts, self.send_spectra) {
            (true, false) => Ok(PayloadMode::Counts),
            (false, true) => Ok(PayloadMode::Spectra),
            (true, true) => Err(ConfigError::ConflictingModes),
            (false, false) => Err(ConfigError::NoMode),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
