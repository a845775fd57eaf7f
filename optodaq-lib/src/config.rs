use crate::constants::{
    DEFAULT_BAUD_RATE, DEFAULT_COMMAND_TIMEOUT, DEFAULT_FRAME_SAMPLES, DEFAULT_POLL_INTERVAL,
};
use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session settings. Every field has a default, so a TOML file only needs
/// to name what it changes.
///
/// ```toml
/// port = "/dev/ttyACM0"
/// command_timeout_ms = 750
/// oversampling = 2
/// frequency_hz = 20000.0
/// autogain = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub port: String,
    pub baud_rate: u32,
    pub command_timeout_ms: u64,
    /// Samples requested per ReadFrame
    pub frame_samples: u16,
    /// Sleep between empty frames
    pub poll_interval_ms: u64,
    /// Initial oversampling index applied at connect
    pub oversampling: u8,
    /// Initial sampling frequency applied at connect
    pub frequency_hz: f64,
    pub autogain: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            oversampling: 0,
            frequency_hz: 1_000.0,
            autogain: false,
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) { "COM3" } else { "/dev/ttyACM0" }
}

impl SessionConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_frame_samples(mut self, frame_samples: u16) -> Self {
        self.frame_samples = frame_samples;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_rate(mut self, oversampling: u8, frequency_hz: f64) -> Self {
        self.oversampling = oversampling;
        self.frequency_hz = frequency_hz;
        self
    }

    pub fn with_autogain(mut self, enabled: bool) -> Self {
        self.autogain = enabled;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings that can never work. The rate pair is checked at connect.
    pub fn validate(&self) -> Result<(), DaqError> {
        if self.baud_rate == 0 {
            return Err(DaqError::InvalidArgument("baud rate must be non-zero".to_string()));
        }
        if self.command_timeout_ms == 0 {
            return Err(DaqError::InvalidArgument("command timeout must be non-zero".to_string()));
        }
        if self.frame_samples == 0 {
            return Err(DaqError::InvalidArgument("frame_samples must be at least 1".to_string()));
        }
        Ok(())
    }
}
