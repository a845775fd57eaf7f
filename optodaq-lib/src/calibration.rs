//! Conversion from raw ADC codes to physical units.
//!
//! The LINEAR front end subtracts a per-channel zero (in ADC codes) and scales
//! by the transimpedance of the active gain stage. The LOG front end has no
//! zero or gain: codes map to volts, then volts to watts through the factory
//! lookup table, with a deadband below which power reads as zero.

use crate::constants::{
    ADC_FULL_SCALE_CODE, ADC_REFERENCE_MV, AUTOGAIN_HIGH_FRACTION, AUTOGAIN_LOW_FRACTION, CODE_TO_MV, CODE_TO_V,
    GAIN_VOLTAGE_DIVIDER, MAX_GAIN_INDEX, TRANSIMPEDANCE_OHMS,
};
use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{F32, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Unit a measurement is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    #[strum(to_string = "mV")]
    Millivolts,
    #[strum(to_string = "W")]
    Watts,
}

/// A validated LINEAR gain stage, 0 (1 kΩ) to 7 (10 MΩ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GainIndex(u8);

impl GainIndex {
    pub const MIN: GainIndex = GainIndex(0);
    pub const MAX: GainIndex = GainIndex(MAX_GAIN_INDEX);

    pub fn new(index: u8) -> Result<Self, DaqError> {
        if index > MAX_GAIN_INDEX {
            return Err(DaqError::out_of_range("gain index", index, 0, MAX_GAIN_INDEX as i64));
        }
        Ok(Self(index))
    }

    pub fn all() -> impl Iterator<Item = GainIndex> {
        (0..=MAX_GAIN_INDEX).map(GainIndex)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn transimpedance_ohms(self) -> f64 {
        TRANSIMPEDANCE_OHMS[self.0 as usize]
    }

    /// Next more sensitive stage (higher transimpedance), if any.
    pub fn step_up(self) -> Option<GainIndex> {
        (self.0 < MAX_GAIN_INDEX).then(|| GainIndex(self.0 + 1))
    }

    /// Next less sensitive stage (lower transimpedance), if any.
    pub fn step_down(self) -> Option<GainIndex> {
        self.0.checked_sub(1).map(GainIndex)
    }
}

impl TryFrom<u8> for GainIndex {
    type Error = DaqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        GainIndex::new(value)
    }
}

impl From<GainIndex> for u8 {
    fn from(gain: GainIndex) -> Self {
        gain.0
    }
}

impl fmt::Display for GainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ohms = self.transimpedance_ohms();
        if ohms >= 1e6 {
            write!(f, "G{} ({} MΩ)", self.0, ohms / 1e6)
        } else {
            write!(f, "G{} ({} kΩ)", self.0, ohms / 1e3)
        }
    }
}

// LINEAR path

/// Zero-corrected millivolts for a (possibly averaged) ADC code.
pub fn code_to_mv(code: f64, zero: f64) -> f64 {
    (code - zero) * CODE_TO_MV
}

pub fn mv_to_code(mv: f64, zero: f64) -> f64 {
    mv / CODE_TO_MV + zero
}

pub fn mv_to_w(mv: f64, gain: GainIndex) -> f64 {
    mv / gain.transimpedance_ohms() / GAIN_VOLTAGE_DIVIDER
}

pub fn w_to_mv(w: f64, gain: GainIndex) -> f64 {
    w * gain.transimpedance_ohms() * GAIN_VOLTAGE_DIVIDER
}

/// Optical power that drives the ADC to full scale at `gain`.
pub fn full_scale_power_w(gain: GainIndex) -> f64 {
    mv_to_w(ADC_REFERENCE_MV, gain)
}

// LOG path

pub fn code_to_v(code: f64) -> f64 {
    code * CODE_TO_V
}

pub fn v_to_code(v: f64) -> f64 {
    v / CODE_TO_V
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CalibrationHeaderRaw {
    pub deadband_v: F32,
    pub count: U16,
    pub reserved: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CalibrationPointRaw {
    pub volts: F32,
    pub watts: F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub volts: f64,
    pub watts: f64,
}

/// Factory voltage→power table of a LOG front end.
///
/// Voltages are strictly increasing and powers never decrease, so the
/// interpolated mapping is monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    deadband_v: f64,
    points: Vec<CalibrationPoint>,
}

impl CalibrationTable {
    pub fn new(deadband_v: f64, points: Vec<CalibrationPoint>) -> Result<Self, DaqError> {
        if points.is_empty() {
            return Err(DaqError::Malformed("calibration table is empty".to_string()));
        }
        if !deadband_v.is_finite() {
            return Err(DaqError::Malformed(format!("calibration deadband {} is not finite", deadband_v)));
        }
        if let Some(bad) = points.iter().find(|p| !p.volts.is_finite() || !p.watts.is_finite()) {
            return Err(DaqError::Malformed(format!("non-finite calibration point {:?}", bad)));
        }
        for pair in points.windows(2) {
            if pair[1].volts <= pair[0].volts {
                return Err(DaqError::Malformed(format!(
                    "calibration voltages not strictly increasing at {} V",
                    pair[1].volts
                )));
            }
            if pair[1].watts < pair[0].watts {
                return Err(DaqError::Malformed(format!(
                    "calibration power decreases at {} V",
                    pair[1].volts
                )));
            }
        }
        Ok(Self { deadband_v, points })
    }

    /// Parse a QueryCalibration payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DaqError> {
        let (header, body) = CalibrationHeaderRaw::ref_from_prefix(bytes)
            .map_err(|_| DaqError::Malformed("calibration payload shorter than its header".to_string()))?;
        let count = header.count.get() as usize;
        let raw_points = <[CalibrationPointRaw]>::ref_from_bytes(body)
            .map_err(|_| DaqError::Malformed("calibration points are truncated".to_string()))?;
        if raw_points.len() != count {
            return Err(DaqError::Malformed(format!(
                "calibration header declares {} points, payload holds {}",
                count,
                raw_points.len()
            )));
        }
        let points = raw_points
            .iter()
            .map(|p| CalibrationPoint {
                volts: p.volts.get() as f64,
                watts: p.watts.get() as f64,
            })
            .collect();
        Self::new(header.deadband_v.get() as f64, points)
    }

    /// Serialize to a QueryCalibration payload. Used by simulators and tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = CalibrationHeaderRaw {
            deadband_v: F32::new(self.deadband_v as f32),
            count: U16::new(self.points.len() as u16),
            reserved: U16::new(0),
        };
        let mut out = header.as_bytes().to_vec();
        for p in &self.points {
            let raw = CalibrationPointRaw {
                volts: F32::new(p.volts as f32),
                watts: F32::new(p.watts as f32),
            };
            out.extend_from_slice(raw.as_bytes());
        }
        out
    }

    pub fn deadband_v(&self) -> f64 {
        self.deadband_v
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Piecewise-linear lookup, clamped to the first and last entries.
    /// NaN in, NaN out.
    pub fn interpolate(&self, v: f64) -> f64 {
        if v.is_nan() {
            return f64::NAN;
        }
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if v <= first.volts {
            return first.watts;
        }
        if v >= last.volts {
            return last.watts;
        }
        // First entry with volts > v; the one before it brackets from below.
        let upper = self.points.partition_point(|p| p.volts <= v);
        let lo = self.points[upper - 1];
        let hi = self.points[upper];
        let t = (v - lo.volts) / (hi.volts - lo.volts);
        lo.watts + t * (hi.watts - lo.watts)
    }

    pub fn v_to_w(&self, v: f64) -> f64 {
        if v < self.deadband_v { 0.0 } else { self.interpolate(v) }
    }
}

/// Autogain decision for one probe reading.
///
/// Returns the stage to switch to, or `None` when the reading sits inside the
/// target band or the table has no further stage in the needed direction.
pub fn autogain_step(code: f64, zero: f64, gain: GainIndex) -> Option<GainIndex> {
    let fraction = (code - zero).abs() / ADC_FULL_SCALE_CODE;
    if fraction > AUTOGAIN_HIGH_FRACTION {
        gain.step_down()
    } else if fraction < AUTOGAIN_LOW_FRACTION {
        gain.step_up()
    } else {
        None
    }
}
