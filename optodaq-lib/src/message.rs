use crate::adc::{DataFrame, EnvironmentRaw, EnvironmentReading, RawReading, parse_readings};
use crate::calibration::CalibrationTable;
use crate::error::DaqError;
use crate::packet::{CommandType, RawPacket};
use crate::state::FrontEndKind;
use bytes::Bytes;
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::I32;

/// Edge an armed trigger waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    #[default]
    Rising,
    Falling,
}

impl From<TriggerEdge> for u8 {
    fn from(edge: TriggerEdge) -> Self {
        match edge {
            TriggerEdge::Rising => 0,
            TriggerEdge::Falling => 1,
        }
    }
}

impl TryFrom<u8> for TriggerEdge {
    type Error = DaqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TriggerEdge::Rising),
            1 => Ok(TriggerEdge::Falling),
            other => Err(DaqError::Malformed(format!("unknown trigger edge {}", other))),
        }
    }
}

/// Host-to-device commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Identify,
    QueryFrontEnd,
    QueryFactoryZeros,
    QueryCalibration,
    SetGain { channel: u8, gain: u8 },
    GetGain { channel: u8 },
    SetOversampling { index: u8 },
    SetFrequency { millihertz: u32 },
    ReadRaw,
    ArmTimer { sample_count: u32 },
    ArmTrigger { sample_count: u32, edge: TriggerEdge },
    StartAcquisition,
    StopAcquisition,
    ReadFrame { max_samples: u16 },
    ReadEnvironment,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Identify => CommandType::Identify,
            Command::QueryFrontEnd => CommandType::QueryFrontEnd,
            Command::QueryFactoryZeros => CommandType::QueryFactoryZeros,
            Command::QueryCalibration => CommandType::QueryCalibration,
            Command::SetGain { .. } => CommandType::SetGain,
            Command::GetGain { .. } => CommandType::GetGain,
            Command::SetOversampling { .. } => CommandType::SetOversampling,
            Command::SetFrequency { .. } => CommandType::SetFrequency,
            Command::ReadRaw => CommandType::ReadRaw,
            Command::ArmTimer { .. } => CommandType::ArmTimer,
            Command::ArmTrigger { .. } => CommandType::ArmTrigger,
            Command::StartAcquisition => CommandType::StartAcquisition,
            Command::StopAcquisition => CommandType::StopAcquisition,
            Command::ReadFrame { .. } => CommandType::ReadFrame,
            Command::ReadEnvironment => CommandType::ReadEnvironment,
        }
    }

    pub fn payload(&self) -> Bytes {
        match *self {
            Command::SetGain { channel, gain } => Bytes::copy_from_slice(&[channel, gain]),
            Command::GetGain { channel } => Bytes::copy_from_slice(&[channel]),
            Command::SetOversampling { index } => Bytes::copy_from_slice(&[index]),
            Command::SetFrequency { millihertz } => Bytes::copy_from_slice(&millihertz.to_le_bytes()),
            Command::ArmTimer { sample_count } => Bytes::copy_from_slice(&sample_count.to_le_bytes()),
            Command::ArmTrigger { sample_count, edge } => {
                let mut payload = sample_count.to_le_bytes().to_vec();
                payload.push(edge.into());
                Bytes::from(payload)
            }
            Command::ReadFrame { max_samples } => Bytes::copy_from_slice(&max_samples.to_le_bytes()),
            _ => Bytes::new(),
        }
    }

    pub fn to_raw_packet(&self) -> RawPacket {
        RawPacket::request(self.command_type(), self.payload())
    }
}

impl TryFrom<RawPacket> for Command {
    type Error = DaqError;

    /// Decode a request as the device sees it. Used by simulators and tests.
    fn try_from(packet: RawPacket) -> Result<Self, Self::Error> {
        let p = packet.payload.as_ref();
        let need = |n: usize| -> Result<(), DaqError> {
            if p.len() != n {
                return Err(DaqError::Malformed(format!(
                    "{:?} request carries {} payload bytes, expected {}",
                    packet.command(),
                    p.len(),
                    n
                )));
            }
            Ok(())
        };

        let command = match packet.command() {
            CommandType::Identify => Command::Identify,
            CommandType::QueryFrontEnd => Command::QueryFrontEnd,
            CommandType::QueryFactoryZeros => Command::QueryFactoryZeros,
            CommandType::QueryCalibration => Command::QueryCalibration,
            CommandType::SetGain => {
                need(2)?;
                Command::SetGain {
                    channel: p[0],
                    gain: p[1],
                }
            }
            CommandType::GetGain => {
                need(1)?;
                Command::GetGain { channel: p[0] }
            }
            CommandType::SetOversampling => {
                need(1)?;
                Command::SetOversampling { index: p[0] }
            }
            CommandType::SetFrequency => {
                need(4)?;
                Command::SetFrequency {
                    millihertz: u32::from_le_bytes(p.try_into()?),
                }
            }
            CommandType::ReadRaw => Command::ReadRaw,
            CommandType::ArmTimer => {
                need(4)?;
                Command::ArmTimer {
                    sample_count: u32::from_le_bytes(p.try_into()?),
                }
            }
            CommandType::ArmTrigger => {
                need(5)?;
                Command::ArmTrigger {
                    sample_count: u32::from_le_bytes(p[..4].try_into()?),
                    edge: TriggerEdge::try_from(p[4])?,
                }
            }
            CommandType::StartAcquisition => Command::StartAcquisition,
            CommandType::StopAcquisition => Command::StopAcquisition,
            CommandType::ReadFrame => {
                need(2)?;
                Command::ReadFrame {
                    max_samples: u16::from_le_bytes(p.try_into()?),
                }
            }
            CommandType::ReadEnvironment => Command::ReadEnvironment,
            CommandType::Unknown(code) => {
                return Err(DaqError::Malformed(format!("unknown command 0x{:02x}", code)));
            }
        };
        Ok(command)
    }
}

/// Device-to-host replies, decoded according to the command they answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack,
    Identity(String),
    FrontEnd { kind: FrontEndKind, channels: usize },
    FactoryZeros(Vec<i32>),
    Calibration(CalibrationTable),
    Gain(u8),
    Reading(Vec<RawReading>),
    Frame(DataFrame),
    Environment(EnvironmentReading),
}

impl Response {
    /// Decode the payload of a successful reply to `command`.
    pub fn decode(command: CommandType, payload: &[u8]) -> Result<Self, DaqError> {
        let response = match command {
            CommandType::Identify => Response::Identity(
                std::str::from_utf8(payload)
                    .map_err(|_| DaqError::Malformed("identity is not valid UTF-8".to_string()))?
                    .trim_end_matches('\0')
                    .trim()
                    .to_string(),
            ),
            CommandType::QueryFrontEnd => {
                expect_len(command, payload, 2)?;
                let channels = payload[1] as usize;
                if channels == 0 {
                    return Err(DaqError::Malformed("device reports zero channels".to_string()));
                }
                Response::FrontEnd {
                    kind: FrontEndKind::try_from(payload[0])?,
                    channels,
                }
            }
            CommandType::QueryFactoryZeros => {
                let zeros = <[I32]>::ref_from_bytes(payload).map_err(|_| {
                    DaqError::Malformed(format!("factory zero table of {} bytes is not whole i32s", payload.len()))
                })?;
                Response::FactoryZeros(zeros.iter().map(|z| z.get()).collect())
            }
            CommandType::QueryCalibration => Response::Calibration(CalibrationTable::from_bytes(payload)?),
            CommandType::GetGain => {
                expect_len(command, payload, 1)?;
                Response::Gain(payload[0])
            }
            CommandType::ReadRaw => {
                let readings = parse_readings(payload)?;
                if readings.is_empty() {
                    return Err(DaqError::Malformed("raw read returned no channels".to_string()));
                }
                Response::Reading(readings)
            }
            CommandType::ReadFrame => Response::Frame(DataFrame::from_bytes(payload)?),
            CommandType::ReadEnvironment => {
                let raw = EnvironmentRaw::read_from_bytes(payload).map_err(|_| {
                    DaqError::Malformed(format!("environment block of {} bytes, expected 4", payload.len()))
                })?;
                Response::Environment(EnvironmentReading::from(raw))
            }
            CommandType::SetGain
            | CommandType::SetOversampling
            | CommandType::SetFrequency
            | CommandType::ArmTimer
            | CommandType::ArmTrigger
            | CommandType::StartAcquisition
            | CommandType::StopAcquisition => {
                expect_len(command, payload, 0)?;
                Response::Ack
            }
            CommandType::Unknown(code) => {
                return Err(DaqError::Malformed(format!("reply to unknown command 0x{:02x}", code)));
            }
        };
        Ok(response)
    }
}

fn expect_len(command: CommandType, payload: &[u8], expected: usize) -> Result<(), DaqError> {
    if payload.len() != expected {
        return Err(DaqError::Malformed(format!(
            "{:?} reply carries {} bytes, expected {}",
            command,
            payload.len(),
            expected
        )));
    }
    Ok(())
}
