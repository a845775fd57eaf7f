use crate::constants::{CHANNEL_READING_SIZE, DATA_FRAME_HEADER_SIZE, FRAME_FLAG_END};
use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use zerocopy::byteorder::little_endian::{I16, I32, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// One channel's conversion as sent by the device (5 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ChannelReadingRaw {
    /// Signed ADC code
    pub code: I32,
    /// Gain index active when the conversion was taken (0 on LOG front ends)
    pub gain: u8,
}

/// Header in front of the samples of a bulk frame (5 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DataFrameHeaderRaw {
    pub sequence: U16,
    pub count: U16,
    pub flags: u8,
}

/// Environmental sensor block (4 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EnvironmentRaw {
    /// Board temperature, 0.01 °C
    pub temperature_centi_c: I16,
    /// Relative humidity, 0.01 %RH
    pub humidity_centi_pct: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    pub code: i32,
    pub gain: u8,
}

impl From<ChannelReadingRaw> for RawReading {
    fn from(raw: ChannelReadingRaw) -> Self {
        Self {
            code: raw.code.get(),
            gain: raw.gain,
        }
    }
}

impl From<RawReading> for ChannelReadingRaw {
    fn from(reading: RawReading) -> Self {
        Self {
            code: I32::new(reading.code),
            gain: reading.gain,
        }
    }
}

/// One reading per channel taken at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Zero-based capture index within the run
    pub index: u64,
    pub readings: Vec<RawReading>,
}

impl Sample {
    pub fn channels(&self) -> usize {
        self.readings.len()
    }

    pub fn code(&self, channel: usize) -> Option<i32> {
        self.readings.get(channel).map(|r| r.code)
    }

    pub fn gain(&self, channel: usize) -> Option<u8> {
        self.readings.get(channel).map(|r| r.gain)
    }
}

/// Parse a run of back-to-back channel readings.
pub fn parse_readings(bytes: &[u8]) -> Result<Vec<RawReading>, DaqError> {
    if bytes.len() % CHANNEL_READING_SIZE != 0 {
        return Err(DaqError::Malformed(format!(
            "reading block size {} is not a multiple of {}",
            bytes.len(),
            CHANNEL_READING_SIZE
        )));
    }
    let raw = <[ChannelReadingRaw]>::ref_from_bytes(bytes)
        .map_err(|_| DaqError::Malformed("Failed to parse channel readings".to_string()))?;
    Ok(raw.iter().map(|r| RawReading::from(*r)).collect())
}

/// Serialize channel readings to their wire layout.
pub fn encode_readings(readings: &[RawReading]) -> Vec<u8> {
    let mut out = Vec::with_capacity(readings.len() * CHANNEL_READING_SIZE);
    for reading in readings {
        out.extend_from_slice(ChannelReadingRaw::from(*reading).as_bytes());
    }
    out
}

/// One bulk frame: up to `frame_samples` samples from a running acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub sequence: u16,
    pub finished: bool,
    /// Readings per sample, channel-major within each sample
    pub samples: Vec<Vec<RawReading>>,
}

impl DataFrame {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Parse a ReadFrame payload. Any framing violation is a transfer error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DaqError> {
        let (header, body) = DataFrameHeaderRaw::ref_from_prefix(bytes).map_err(|_| {
            DaqError::Transfer(format!(
                "frame payload of {} bytes is shorter than its {}-byte header",
                bytes.len(),
                DATA_FRAME_HEADER_SIZE
            ))
        })?;

        let count = header.count.get() as usize;
        let finished = header.flags & FRAME_FLAG_END != 0;
        let sequence = header.sequence.get();

        if count == 0 {
            if !body.is_empty() {
                return Err(DaqError::Transfer(format!(
                    "empty frame carries {} stray bytes",
                    body.len()
                )));
            }
            return Ok(Self {
                sequence,
                finished,
                samples: Vec::new(),
            });
        }

        let per_sample = body.len() / count;
        if per_sample == 0 || body.len() % count != 0 || per_sample % CHANNEL_READING_SIZE != 0 {
            return Err(DaqError::Transfer(format!(
                "frame body of {} bytes does not hold {} whole samples",
                body.len(),
                count
            )));
        }

        let samples = body
            .chunks_exact(per_sample)
            .map(|chunk| parse_readings(chunk).map_err(|e| DaqError::Transfer(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sequence,
            finished,
            samples,
        })
    }

    /// Serialize to a ReadFrame payload. Used by simulators and tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = DataFrameHeaderRaw {
            sequence: U16::new(self.sequence),
            count: U16::new(self.samples.len() as u16),
            flags: if self.finished { FRAME_FLAG_END } else { 0 },
        };
        let mut out = header.as_bytes().to_vec();
        for sample in &self.samples {
            out.extend_from_slice(&encode_readings(sample));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

impl From<EnvironmentRaw> for EnvironmentReading {
    fn from(raw: EnvironmentRaw) -> Self {
        Self {
            temperature_c: raw.temperature_centi_c.get() as f64 / 100.0,
            humidity_pct: raw.humidity_centi_pct.get() as f64 / 100.0,
        }
    }
}

impl From<EnvironmentReading> for EnvironmentRaw {
    fn from(reading: EnvironmentReading) -> Self {
        Self {
            temperature_centi_c: I16::new((reading.temperature_c * 100.0).round() as i16),
            humidity_centi_pct: U16::new((reading.humidity_pct * 100.0).round() as u16),
        }
    }
}

impl fmt::Display for EnvironmentReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Temp: {:.2} °C, Humidity: {:.2} %RH", self.temperature_c, self.humidity_pct)
    }
}
