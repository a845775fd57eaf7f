//! Session state cached from the device at connect time.

use crate::adc::RawReading;
use crate::calibration::{self, CalibrationTable, GainIndex, Unit};
use crate::error::DaqError;
use crate::validate::{Oversampling, RateSetting, validate_channel};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum FrontEndKind {
    #[strum(to_string = "LINEAR")]
    Linear,
    #[strum(to_string = "LOG")]
    Log,
}

impl TryFrom<u8> for FrontEndKind {
    type Error = DaqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrontEndKind::Linear),
            1 => Ok(FrontEndKind::Log),
            other => Err(DaqError::Malformed(format!("unknown front-end type {}", other))),
        }
    }
}

impl From<FrontEndKind> for u8 {
    fn from(kind: FrontEndKind) -> Self {
        match kind {
            FrontEndKind::Linear => 0,
            FrontEndKind::Log => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub description: String,
    pub front_end: FrontEndKind,
    pub channels: usize,
}

/// Gain and zero of one LINEAR channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub gain: GainIndex,
    pub factory_zero: i32,
    pub soft_zero: Option<f64>,
}

impl ChannelConfig {
    /// Zero offset in ADC codes: the soft zero when set, otherwise the factory zero.
    pub fn active_zero(&self) -> f64 {
        self.soft_zero.unwrap_or(self.factory_zero as f64)
    }
}

/// Front-end specific calibration data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrontEnd {
    Linear { channels: Vec<ChannelConfig> },
    Log { table: CalibrationTable },
}

impl FrontEnd {
    pub fn kind(&self) -> FrontEndKind {
        match self {
            FrontEnd::Linear { .. } => FrontEndKind::Linear,
            FrontEnd::Log { .. } => FrontEndKind::Log,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub oversampling: Oversampling,
    pub frequency_hz: f64,
}

impl From<RateSetting> for AcquisitionConfig {
    fn from(setting: RateSetting) -> Self {
        Self {
            oversampling: setting.oversampling,
            frequency_hz: setting.frequency_hz,
        }
    }
}

/// Everything the session knows about the device.
///
/// Mutation goes through the `pub(crate)` setters below, which the session
/// only calls after validation and a successful device round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    identity: DeviceIdentity,
    front_end: FrontEnd,
    acquisition: AcquisitionConfig,
}

impl DeviceState {
    pub fn new(identity: DeviceIdentity, front_end: FrontEnd, acquisition: AcquisitionConfig) -> Result<Self, DaqError> {
        if identity.front_end != front_end.kind() {
            return Err(DaqError::Malformed(format!(
                "identity reports {} but calibration data is {}",
                identity.front_end,
                front_end.kind()
            )));
        }
        if let FrontEnd::Linear { channels } = &front_end {
            if channels.len() != identity.channels {
                return Err(DaqError::Malformed(format!(
                    "{} channel configs for a {}-channel device",
                    channels.len(),
                    identity.channels
                )));
            }
        }
        Ok(Self {
            identity,
            front_end,
            acquisition,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn front_end(&self) -> &FrontEnd {
        &self.front_end
    }

    pub fn front_end_kind(&self) -> FrontEndKind {
        self.identity.front_end
    }

    pub fn channels(&self) -> usize {
        self.identity.channels
    }

    pub fn acquisition(&self) -> AcquisitionConfig {
        self.acquisition
    }

    pub fn oversampling(&self) -> Oversampling {
        self.acquisition.oversampling
    }

    pub fn frequency_hz(&self) -> f64 {
        self.acquisition.frequency_hz
    }

    pub fn channel_config(&self, channel: usize) -> Result<&ChannelConfig, DaqError> {
        match &self.front_end {
            FrontEnd::Linear { channels } => {
                validate_channel(channels.len(), channel)?;
                Ok(&channels[channel])
            }
            FrontEnd::Log { .. } => Err(DaqError::Unsupported {
                operation: "channel configuration",
                front_end: FrontEndKind::Log,
            }),
        }
    }

    pub fn gain(&self, channel: usize) -> Result<GainIndex, DaqError> {
        Ok(self.channel_config(channel)?.gain)
    }

    pub fn zero(&self, channel: usize) -> Result<f64, DaqError> {
        Ok(self.channel_config(channel)?.active_zero())
    }

    pub fn calibration_table(&self) -> Option<&CalibrationTable> {
        match &self.front_end {
            FrontEnd::Log { table } => Some(table),
            FrontEnd::Linear { .. } => None,
        }
    }

    fn channel_config_mut(&mut self, channel: usize, operation: &'static str) -> Result<&mut ChannelConfig, DaqError> {
        match &mut self.front_end {
            FrontEnd::Linear { channels } => {
                validate_channel(channels.len(), channel)?;
                Ok(&mut channels[channel])
            }
            FrontEnd::Log { .. } => Err(DaqError::Unsupported {
                operation,
                front_end: FrontEndKind::Log,
            }),
        }
    }

    pub(crate) fn set_gain(&mut self, channel: usize, gain: GainIndex) -> Result<(), DaqError> {
        self.channel_config_mut(channel, "gain control")?.gain = gain;
        Ok(())
    }

    pub(crate) fn set_soft_zero(&mut self, channel: usize, zero: Option<f64>) -> Result<(), DaqError> {
        self.channel_config_mut(channel, "zeroing")?.soft_zero = zero;
        Ok(())
    }

    pub(crate) fn set_acquisition(&mut self, setting: RateSetting) {
        self.acquisition = setting.into();
    }

    /// Convert an ADC code (possibly an average) on `channel` captured at
    /// `gain` into `unit`. `gain` is ignored on the LOG front end.
    pub fn convert_code(&self, channel: usize, code: f64, gain: u8, unit: Unit) -> Result<f64, DaqError> {
        validate_channel(self.channels(), channel)?;
        match &self.front_end {
            FrontEnd::Linear { channels } => {
                let mv = calibration::code_to_mv(code, channels[channel].active_zero());
                match unit {
                    Unit::Millivolts => Ok(mv),
                    Unit::Watts => Ok(calibration::mv_to_w(mv, GainIndex::new(gain)?)),
                }
            }
            FrontEnd::Log { table } => {
                let v = calibration::code_to_v(code);
                match unit {
                    Unit::Millivolts => Ok(v * 1_000.0),
                    Unit::Watts => Ok(table.v_to_w(v)),
                }
            }
        }
    }

    /// Convert every channel of one sample.
    pub fn convert_readings(&self, readings: &[RawReading], unit: Unit) -> Result<Vec<f64>, DaqError> {
        readings
            .iter()
            .enumerate()
            .map(|(channel, r)| self.convert_code(channel, r.code as f64, r.gain, unit))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPoint;
    use crate::constants::{ADC_FULL_SCALE_CODE, ADC_REFERENCE_MV};

    fn linear_state() -> DeviceState {
        let config = ChannelConfig {
            gain: GainIndex::new(0).unwrap(),
            factory_zero: 100,
            soft_zero: None,
        };
        DeviceState::new(
            DeviceIdentity {
                description: "PDA-2 test".to_string(),
                front_end: FrontEndKind::Linear,
                channels: 2,
            },
            FrontEnd::Linear {
                channels: vec![config; 2],
            },
            AcquisitionConfig {
                oversampling: Oversampling::new(0).unwrap(),
                frequency_hz: 1_000.0,
            },
        )
        .unwrap()
    }

    fn log_state() -> DeviceState {
        let table = CalibrationTable::new(
            0.2,
            vec![
                CalibrationPoint { volts: 0.2, watts: 1e-6 },
                CalibrationPoint { volts: 2.0, watts: 1e-2 },
            ],
        )
        .unwrap();
        DeviceState::new(
            DeviceIdentity {
                description: "PDL-1 test".to_string(),
                front_end: FrontEndKind::Log,
                channels: 1,
            },
            FrontEnd::Log { table },
            AcquisitionConfig {
                oversampling: Oversampling::new(2).unwrap(),
                frequency_hz: 500.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_soft_zero_overrides_factory_zero() {
        let mut state = linear_state();
        assert_eq!(state.zero(0).unwrap(), 100.0);
        state.set_soft_zero(0, Some(-42.5)).unwrap();
        assert_eq!(state.zero(0).unwrap(), -42.5);
        assert_eq!(state.zero(1).unwrap(), 100.0);
        state.set_soft_zero(0, None).unwrap();
        assert_eq!(state.zero(0).unwrap(), 100.0);
    }

    #[test]
    fn test_gain_change_keeps_zero() {
        let mut state = linear_state();
        state.set_soft_zero(1, Some(350.0)).unwrap();
        state.set_gain(1, GainIndex::new(6).unwrap()).unwrap();
        assert_eq!(state.zero(1).unwrap(), 350.0);
        assert_eq!(state.convert_code(1, 350.0, 6, Unit::Watts).unwrap(), 0.0);
    }

    #[test]
    fn test_log_state_rejects_channel_mutation() {
        let mut state = log_state();
        assert!(matches!(
            state.set_gain(0, GainIndex::new(1).unwrap()),
            Err(DaqError::Unsupported { front_end: FrontEndKind::Log, .. })
        ));
        assert!(matches!(state.set_soft_zero(0, Some(1.0)), Err(DaqError::Unsupported { .. })));
        assert!(matches!(state.gain(0), Err(DaqError::Unsupported { .. })));
    }

    #[test]
    fn test_convert_linear() {
        let state = linear_state();
        let code = ADC_FULL_SCALE_CODE + 100.0;
        let mv = state.convert_code(0, code, 0, Unit::Millivolts).unwrap();
        assert!((mv - ADC_REFERENCE_MV).abs() < 1e-9);
        let w = state.convert_code(0, code, 0, Unit::Watts).unwrap();
        assert!((w - 5e-3).abs() < 1e-12);
        assert!(matches!(
            state.convert_code(0, code, 9, Unit::Watts),
            Err(DaqError::OutOfRange { .. })
        ));
        assert!(matches!(
            state.convert_code(2, code, 0, Unit::Watts),
            Err(DaqError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_convert_log_ignores_gain() {
        let state = log_state();
        let below = crate::calibration::v_to_code(0.1);
        assert_eq!(state.convert_code(0, below, 0, Unit::Watts).unwrap(), 0.0);
        let top = crate::calibration::v_to_code(2.0);
        let w_a = state.convert_code(0, top, 0, Unit::Watts).unwrap();
        let w_b = state.convert_code(0, top, 5, Unit::Watts).unwrap();
        assert_eq!(w_a, w_b);
        assert!((w_a - 1e-2).abs() < 1e-9);
        let mv = state.convert_code(0, top, 0, Unit::Millivolts).unwrap();
        assert!((mv - 2_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_state_rejects_inconsistent_front_end() {
        let linear = linear_state();
        let log = log_state();
        let mixed = DeviceState::new(
            linear.identity().clone(),
            log.front_end().clone(),
            linear.acquisition(),
        );
        assert!(matches!(mixed, Err(DaqError::Malformed(_))));
    }
}
