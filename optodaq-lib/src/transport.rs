//! Byte-stream transport to the instrument.
//!
//! A serial port opened through `tokio-serial`, or any in-memory stream that
//! implements the async I/O traits (tests use `tokio::io::duplex`).

use crate::error::DaqError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

/// Anything that can stand in for a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

pub type DynSerial = Box<dyn SerialPortIO>;

pub struct Transport {
    port: DynSerial,
    name: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Transport {
    /// Open a serial port at 8N1 without flow control.
    pub async fn open(path: &str, baud_rate: u32) -> Result<Self, DaqError> {
        use tokio_serial::SerialPortBuilderExt;

        info!("Opening serial port {} at {} baud", path, baud_rate);
        let path_owned = path.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| DaqError::Connection {
            port: path.to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| DaqError::Connection {
            port: path.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::from_stream(stream, path))
    }

    /// Wrap an already-open stream.
    pub fn from_stream(stream: impl SerialPortIO + 'static, name: impl Into<String>) -> Self {
        Self {
            port: Box::new(stream),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), DaqError> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Fill `buf` completely or fail once `deadline` passes.
    ///
    /// `timeout` is only used to label the resulting `Timeout` error.
    pub async fn read_exact(&mut self, buf: &mut [u8], deadline: Instant, timeout: Duration) -> Result<(), DaqError> {
        match timeout_at(deadline, self.port.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DaqError::Io(e)),
            Err(_) => Err(DaqError::Timeout(timeout)),
        }
    }

    /// Read whatever arrives first, up to `buf.len()` bytes.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, DaqError> {
        match tokio::time::timeout(timeout, self.port.read(buf)).await {
            Ok(Ok(0)) => Err(DaqError::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(DaqError::Io(e)),
            Err(_) => Err(DaqError::Timeout(timeout)),
        }
    }

    /// Discard bytes that are already buffered, without waiting for more.
    pub async fn drain(&mut self) -> usize {
        let mut discard = [0u8; 256];
        let mut total = 0usize;
        loop {
            match tokio::time::timeout(Duration::ZERO, self.port.read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if total > 0 {
            debug!("Drained {} stale bytes from {}", total, self.name);
        }
        total
    }

    pub async fn close(mut self) -> Result<(), DaqError> {
        info!("Closing {}", self.name);
        self.port.shutdown().await?;
        Ok(())
    }
}
