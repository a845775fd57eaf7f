//! Configuration rules checked before anything reaches the wire.

use crate::calibration::GainIndex;
use crate::constants::{MAX_FREQUENCY_HZ, MAX_OVERSAMPLING_INDEX};
use crate::error::DaqError;
use crate::state::FrontEndKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Oversampling index, 0 (no internal averaging) to 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Oversampling(u8);

impl Oversampling {
    pub fn new(index: u8) -> Result<Self, DaqError> {
        if index > MAX_OVERSAMPLING_INDEX {
            return Err(DaqError::out_of_range(
                "oversampling index",
                index,
                0,
                MAX_OVERSAMPLING_INDEX as i64,
            ));
        }
        Ok(Self(index))
    }

    pub fn all() -> impl Iterator<Item = Oversampling> {
        (0..=MAX_OVERSAMPLING_INDEX).map(Oversampling)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Highest sampling frequency the device supports at this index.
    pub fn max_frequency_hz(self) -> f64 {
        MAX_FREQUENCY_HZ[self.0 as usize]
    }
}

impl TryFrom<u8> for Oversampling {
    type Error = DaqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Oversampling::new(value)
    }
}

impl From<Oversampling> for u8 {
    fn from(os: Oversampling) -> Self {
        os.0
    }
}

impl fmt::Display for Oversampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OS{}", self.0)
    }
}

/// An (oversampling, frequency) pair that satisfies the rate table.
///
/// `adjusted` is set when the requested frequency was clamped to the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSetting {
    pub oversampling: Oversampling,
    pub frequency_hz: f64,
    pub adjusted: bool,
}

pub fn validate_oversampling_frequency(os: u8, frequency_hz: f64) -> Result<RateSetting, DaqError> {
    let oversampling = Oversampling::new(os)?;
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(DaqError::InvalidArgument(format!(
            "sampling frequency must be a positive number of Hz, got {}",
            frequency_hz
        )));
    }
    // Sent to the device in whole millihertz
    if (frequency_hz * 1_000.0).round() < 1.0 {
        return Err(DaqError::InvalidArgument(format!(
            "sampling frequency {} Hz is below the 1 mHz resolution",
            frequency_hz
        )));
    }

    let ceiling = oversampling.max_frequency_hz();
    if frequency_hz > ceiling {
        Ok(RateSetting {
            oversampling,
            frequency_hz: ceiling,
            adjusted: true,
        })
    } else {
        Ok(RateSetting {
            oversampling,
            frequency_hz,
            adjusted: false,
        })
    }
}

/// Check a gain-set request against the front end and its channel count.
pub fn validate_gain(front_end: FrontEndKind, channels: usize, channel: usize, gain: u8) -> Result<GainIndex, DaqError> {
    validate_linear_channel(front_end, channels, channel, "gain control")?;
    GainIndex::new(gain)
}

/// Check that `channel` names a LINEAR channel. Used by every gain/zero call.
pub fn validate_linear_channel(
    front_end: FrontEndKind,
    channels: usize,
    channel: usize,
    operation: &'static str,
) -> Result<(), DaqError> {
    if front_end == FrontEndKind::Log {
        return Err(DaqError::Unsupported { operation, front_end });
    }
    validate_channel(channels, channel)
}

pub fn validate_channel(channels: usize, channel: usize) -> Result<(), DaqError> {
    if channel >= channels {
        return Err(DaqError::out_of_range(
            "channel",
            channel as i64,
            0,
            channels as i64 - 1,
        ));
    }
    Ok(())
}
