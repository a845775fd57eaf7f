use crate::state::FrontEndKind;
use std::array::TryFromSliceError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The primary error type for the `optodaq` library.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Could not open serial port {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No response from device within {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Bulk transfer failed: {0}")]
    Transfer(String),

    #[error("Device reported error {code}: {message}")]
    Device { code: u8, message: String },

    #[error("{operation} is not supported on a {front_end} front end")]
    Unsupported {
        operation: &'static str,
        front_end: FrontEndKind,
    },

    #[error("{what} {value} out of range ({min}..={max})")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Acquisition in progress, stop it before issuing commands")]
    Busy,

    #[error("No trigger edge within {0:?}")]
    TriggerTimeout(Duration),
}

impl DaqError {
    /// Whether a caller may reasonably retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DaqError::Timeout(_))
    }

    pub(crate) fn out_of_range(what: &'static str, value: impl Into<i64>, min: i64, max: i64) -> Self {
        DaqError::OutOfRange {
            what,
            value: value.into(),
            min,
            max,
        }
    }
}

impl From<TryFromSliceError> for DaqError {
    fn from(_: TryFromSliceError) -> Self {
        DaqError::Malformed("Failed to convert slice to array".to_string())
    }
}
