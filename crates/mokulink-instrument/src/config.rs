//! Session tuning, loadable from JSON.
//!
//! Every field has a default, so a partial document such as
//! `{"commit_timeout_ms": 2000}` is valid. Durations are written in
//! milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MokuError, Result};

/// Highest sample rate, in samples per second, at which the device can log
/// to its own storage.
pub const DEFAULT_DATALOG_RATE_THRESHOLD: f64 = 100e3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// How long a commit may wait for the transport and the device
    /// acknowledgement.
    #[serde(rename = "commit_timeout_ms", with = "millis")]
    pub commit_timeout: Duration,
    /// How long the frame worker waits for one frame before yielding the
    /// transport.
    #[serde(rename = "frame_poll_interval_ms", with = "millis")]
    pub frame_poll_interval: Duration,
    /// Frames kept for delivery; older ones are dropped first.
    pub frame_buffer_length: usize,
    /// Stage and commit instrument defaults on attach.
    pub apply_defaults: bool,
    /// Read the device registers into the shadow on attach.
    pub sync_on_attach: bool,
    pub datalog_rate_threshold: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(5),
            frame_poll_interval: Duration::from_millis(50),
            frame_buffer_length: 4,
            apply_defaults: true,
            sync_on_attach: true,
            datalog_rate_threshold: DEFAULT_DATALOG_RATE_THRESHOLD,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MokuError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MokuError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.commit_timeout.is_zero() {
            return Err(MokuError::Config("commit timeout must be positive".into()));
        }
        if self.frame_poll_interval.is_zero() {
            return Err(MokuError::Config("frame poll interval must be positive".into()));
        }
        if self.frame_buffer_length == 0 {
            return Err(MokuError::Config("frame buffer length must be at least 1".into()));
        }
        if !(self.datalog_rate_threshold > 0.0) {
            return Err(MokuError::Config(format!(
                "datalog rate threshold {} must be positive",
                self.datalog_rate_threshold
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
