pub mod acquisition;
pub mod adc;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod message;
pub mod packet;
pub mod state;
pub mod transport;
pub mod validate;

// Re-export the session and the types most callers need
pub use acquisition::{
    AcquisitionBuffer, AcquisitionStatus, CancelToken, ControllerState, RunLimit, RunMode, SnapshotResult,
    TriggerConfig,
};
pub use calibration::{GainIndex, Unit};
pub use config::SessionConfig;
pub use device::OptoDaq;
pub use error::DaqError;
pub use message::TriggerEdge;
pub use state::{DeviceState, FrontEndKind};
pub use transport::Transport;
pub use validate::{Oversampling, RateSetting};
