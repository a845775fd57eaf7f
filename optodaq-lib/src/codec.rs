use crate::constants::{CHECKSUM_SIZE, HEADER_SIZE, SYNC_BYTE};
use crate::error::DaqError;
use crate::message::{Command, Response};
use crate::packet::{RawPacket, parse_header};
use crate::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// One request, one reply, bounded by a fixed timeout. No retries.
#[derive(Debug)]
pub struct Codec {
    transport: Transport,
    timeout: Duration,
}

impl Codec {
    pub fn new(transport: Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send `command` and decode its reply.
    pub async fn transact(&mut self, command: &Command) -> Result<Response, DaqError> {
        let discarded = self.transport.drain().await;
        if discarded > 0 {
            warn!("Discarded {} stale bytes before {:?}", discarded, command.command_type());
        }

        let request = command.to_raw_packet();
        let wire = request.encode();
        debug!("TX {:?}: {}", command.command_type(), hex::encode(&wire));
        self.transport.write(&wire).await?;

        let reply = self.read_packet().await?;
        debug!(
            "RX {:?} status {}: {}",
            reply.command(),
            reply.status(),
            hex::encode(&reply.payload)
        );

        if !reply.is_response() {
            return Err(DaqError::Malformed(format!(
                "reply to {:?} does not carry the response flag",
                command.command_type()
            )));
        }
        if reply.command() != command.command_type() {
            return Err(DaqError::Malformed(format!(
                "sent {:?}, device answered {:?}",
                command.command_type(),
                reply.command()
            )));
        }
        if reply.status() != 0 {
            return Err(DaqError::Device {
                code: reply.status(),
                message: String::from_utf8_lossy(&reply.payload).trim_end_matches('\0').to_string(),
            });
        }

        Response::decode(reply.command(), &reply.payload)
    }

    /// Read one frame, skipping any noise in front of the sync byte.
    async fn read_packet(&mut self) -> Result<RawPacket, DaqError> {
        let deadline = Instant::now() + self.timeout;

        let mut byte = [0u8; 1];
        let mut skipped = 0usize;
        loop {
            self.transport.read_exact(&mut byte, deadline, self.timeout).await?;
            if byte[0] == SYNC_BYTE {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            trace!("Skipped {} bytes before sync", skipped);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.transport.read_exact(&mut header_bytes, deadline, self.timeout).await?;
        let header = parse_header(header_bytes)?;

        let mut rest = vec![0u8; header.length() as usize + CHECKSUM_SIZE];
        self.transport.read_exact(&mut rest, deadline, self.timeout).await?;

        let mut frame = BytesMut::with_capacity(1 + HEADER_SIZE + rest.len());
        frame.put_u8(SYNC_BYTE);
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&rest);
        RawPacket::try_from(Bytes::from(frame))
    }

    pub async fn close(self) -> Result<(), DaqError> {
        self.transport.close().await
    }
}
