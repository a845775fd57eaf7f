// Protocol and calibration constants

use std::time::Duration;

/// First byte of every frame on the wire
pub const SYNC_BYTE: u8 = 0xA5;

/// Size of the frame header following the sync byte (4 bytes)
pub const HEADER_SIZE: usize = 4;

/// Size of the trailing checksum (1 byte)
pub const CHECKSUM_SIZE: usize = 1;

/// Bytes on the wire around the payload: sync + header + checksum
pub const FRAME_OVERHEAD: usize = 1 + HEADER_SIZE + CHECKSUM_SIZE;

/// Largest payload either side may declare
pub const MAX_PAYLOAD_SIZE: usize = 4096;

/// Size of one channel reading on the wire (i32 code + u8 gain)
pub const CHANNEL_READING_SIZE: usize = 5;

/// Size of the bulk frame header (sequence, count, flags)
pub const DATA_FRAME_HEADER_SIZE: usize = 5;

/// Bulk frame flag: the device finished the armed run
pub const FRAME_FLAG_END: u8 = 0x01;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default per-command response timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Default sleep between empty bulk frames
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default number of samples requested per bulk frame
pub const DEFAULT_FRAME_SAMPLES: u16 = 64;

/// ADC code at positive full scale (24-bit bipolar converter)
pub const ADC_FULL_SCALE_CODE: f64 = 8_388_608.0;

/// ADC reference in millivolts
pub const ADC_REFERENCE_MV: f64 = 2_500.0;

/// Millivolts per ADC code on the LINEAR front end
pub const CODE_TO_MV: f64 = ADC_REFERENCE_MV / ADC_FULL_SCALE_CODE;

/// Volts per ADC code on the LOG front end
pub const CODE_TO_V: f64 = ADC_REFERENCE_MV / 1_000.0 / ADC_FULL_SCALE_CODE;

/// Transimpedance in ohms for each LINEAR gain index
pub const TRANSIMPEDANCE_OHMS: [f64; 8] = [1e3, 5e3, 1e4, 5e4, 1e5, 5e5, 1e6, 1e7];

/// mV to V (1000) times the nominal photodiode responsivity (0.5 A/W)
pub const GAIN_VOLTAGE_DIVIDER: f64 = 500.0;

/// Highest valid gain index
pub const MAX_GAIN_INDEX: u8 = 7;

/// Maximum sampling frequency in Hz for each oversampling index
pub const MAX_FREQUENCY_HZ: [f64; 7] = [100_000.0, 100_000.0, 50_000.0, 25_000.0, 12_500.0, 6_250.0, 3_125.0];

/// Highest valid oversampling index
pub const MAX_OVERSAMPLING_INDEX: u8 = 6;

/// Autogain steps to a lower transimpedance above this fraction of full scale
pub const AUTOGAIN_HIGH_FRACTION: f64 = 0.90;

/// Autogain steps to a higher transimpedance below this fraction of full scale
pub const AUTOGAIN_LOW_FRACTION: f64 = 0.02;
