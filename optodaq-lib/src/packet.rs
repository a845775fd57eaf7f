use crate::constants::{CHECKSUM_SIZE, FRAME_OVERHEAD, HEADER_SIZE, MAX_PAYLOAD_SIZE, SYNC_BYTE};
use crate::error::DaqError;
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};

#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub command: B7,
    pub response: bool,
    pub status: u8,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum CommandType {
    // 0 is reserved
    Identify = 0x01,
    QueryFrontEnd = 0x02,
    QueryFactoryZeros = 0x03,
    QueryCalibration = 0x04,
    SetGain = 0x05,
    GetGain = 0x06,
    SetOversampling = 0x07,
    SetFrequency = 0x08,
    ReadRaw = 0x09,
    ArmTimer = 0x0A,
    ArmTrigger = 0x0B,
    StartAcquisition = 0x0C,
    StopAcquisition = 0x0D,
    ReadFrame = 0x0E,
    ReadEnvironment = 0x0F,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One frame as it travels over the wire, without interpretation of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl RawPacket {
    /// Build a host-to-device request.
    pub fn request(command: CommandType, payload: Bytes) -> Self {
        let header = FrameHeader::new()
            .with_command(command.into())
            .with_response(false)
            .with_status(0)
            .with_length(payload.len() as u16);
        Self { header, payload }
    }

    /// Build a device-to-host reply. Used by simulators and tests.
    pub fn reply(command: CommandType, status: u8, payload: Bytes) -> Self {
        let header = FrameHeader::new()
            .with_command(command.into())
            .with_response(true)
            .with_status(status)
            .with_length(payload.len() as u16);
        Self { header, payload }
    }

    pub fn command(&self) -> CommandType {
        CommandType::from_primitive(self.header.command())
    }

    pub fn is_response(&self) -> bool {
        self.header.response()
    }

    pub fn status(&self) -> u8 {
        self.header.status()
    }

    /// Serialize to wire bytes: sync, header, payload, checksum.
    pub fn encode(&self) -> Bytes {
        let header_bytes = self.header.into_bytes();
        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + self.payload.len());
        buf.put_u8(SYNC_BYTE);
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        buf.put_u8(checksum(&header_bytes, &self.payload));
        buf.freeze()
    }
}

/// Byte that makes the wrapping sum of header, payload and checksum zero.
pub fn checksum(header: &[u8], payload: &[u8]) -> u8 {
    let sum = header
        .iter()
        .chain(payload.iter())
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Decode the header that follows the sync byte, rejecting oversize lengths.
pub fn parse_header(bytes: [u8; HEADER_SIZE]) -> Result<FrameHeader, DaqError> {
    let header = FrameHeader::from_bytes(bytes);
    if header.length() as usize > MAX_PAYLOAD_SIZE {
        return Err(DaqError::Malformed(format!(
            "declared payload length {} exceeds {}",
            header.length(),
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(header)
}

impl TryFrom<Bytes> for RawPacket {
    type Error = DaqError;

    fn try_from(mut bytes: Bytes) -> Result<Self, Self::Error> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(DaqError::Malformed(format!(
                "frame too short: {} bytes, need at least {}",
                bytes.len(),
                FRAME_OVERHEAD
            )));
        }

        let sync = bytes[0];
        if sync != SYNC_BYTE {
            return Err(DaqError::Malformed(format!("bad sync byte 0x{:02x}", sync)));
        }
        let _ = bytes.split_to(1);

        let header_bytes: [u8; HEADER_SIZE] = bytes.split_to(HEADER_SIZE).as_ref().try_into()?;
        let header = parse_header(header_bytes)?;

        let expected = header.length() as usize + CHECKSUM_SIZE;
        if bytes.len() != expected {
            return Err(DaqError::Malformed(format!(
                "frame body is {} bytes, header declares {}",
                bytes.len(),
                expected
            )));
        }

        let payload = bytes.split_to(header.length() as usize);
        let received = bytes[0];
        let computed = checksum(&header_bytes, &payload);
        if received != computed {
            return Err(DaqError::Malformed(format!(
                "checksum mismatch: got 0x{:02x}, computed 0x{:02x}",
                received, computed
            )));
        }

        Ok(RawPacket { header, payload })
    }
}
