//! Building blocks of the acquisition controller: run state, limits,
//! cancellation, frame reassembly and the result buffers.

use crate::adc::{DataFrame, Sample};
use crate::calibration::{GainIndex, Unit};
use crate::error::DaqError;
use crate::message::TriggerEdge;
use crate::validate::Oversampling;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RunMode {
    Snapshot,
    FreeRunning,
    Triggered,
}

/// `Idle → Configuring → Running → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Configuring,
    Running(RunMode),
}

impl ControllerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ControllerState::Running(_))
    }
}

/// When a free-running or triggered run stops on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunLimit {
    Samples(u32),
    Duration(Duration),
}

impl RunLimit {
    /// Number of samples to request at `frequency_hz`.
    pub fn sample_count(&self, frequency_hz: f64) -> Result<u32, DaqError> {
        let count = match *self {
            RunLimit::Samples(n) => n,
            RunLimit::Duration(d) => {
                let samples = (frequency_hz * d.as_secs_f64()).ceil();
                if samples > u32::MAX as f64 {
                    return Err(DaqError::InvalidArgument(format!(
                        "{:?} at {} Hz exceeds {} samples",
                        d,
                        frequency_hz,
                        u32::MAX
                    )));
                }
                samples as u32
            }
        };
        if count == 0 {
            return Err(DaqError::InvalidArgument("run limit of zero samples".to_string()));
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    pub edge: TriggerEdge,
    /// How long to wait for the first sample after arming
    pub timeout: Duration,
}

/// Cooperative cancellation handle. Clones share one flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum AcquisitionStatus {
    /// The requested number of samples was collected
    Complete,
    /// The run ended early: codec timeout or device-side end of run
    Incomplete,
    /// The caller cancelled the run
    Cancelled,
}

/// Samples collected by one free-running or triggered run, in capture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionBuffer {
    pub mode: RunMode,
    pub status: AcquisitionStatus,
    pub started_at: DateTime<Utc>,
    pub oversampling: Oversampling,
    pub frequency_hz: f64,
    pub channels: usize,
    pub requested: u32,
    pub samples: Vec<Sample>,
}

impl AcquisitionBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.status == AcquisitionStatus::Complete
    }

    /// Capture time of sample `index` relative to the start of the run.
    pub fn offset_seconds(&self, index: u64) -> f64 {
        index as f64 / self.frequency_hz
    }

    /// Raw codes of one channel across the run.
    pub fn channel_codes(&self, channel: usize) -> impl Iterator<Item = i32> + '_ {
        self.samples.iter().filter_map(move |s| s.code(channel))
    }
}

/// Averaged reading of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: usize,
    pub mean_code: f64,
    pub value: f64,
    /// Gain used for the reads; `None` on a LOG front end
    pub gain: Option<GainIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub unit: Unit,
    pub reads: u32,
    pub channels: Vec<ChannelSnapshot>,
}

impl SnapshotResult {
    pub fn value(&self, channel: usize) -> Option<f64> {
        self.channels.get(channel).map(|c| c.value)
    }
}

/// What a frame did to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// Nothing ready on the device yet
    Empty,
    /// Samples appended, more expected
    Continue,
    /// The requested count has been reached
    Complete,
    /// The device ended the run before the requested count
    Finished,
}

/// Reassembles bulk frames into one contiguous, gap-free buffer.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    requested: u32,
    expected_sequence: u16,
    samples: Vec<Sample>,
}

impl FrameAssembler {
    pub fn new(channels: usize, requested: u32) -> Self {
        Self {
            channels,
            requested,
            expected_sequence: 0,
            samples: Vec::with_capacity(requested.min(1 << 16) as usize),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn remaining(&self) -> u32 {
        self.requested.saturating_sub(self.samples.len() as u32)
    }

    pub fn push(&mut self, frame: DataFrame) -> Result<FrameProgress, DaqError> {
        if frame.is_empty() {
            return Ok(if frame.finished {
                FrameProgress::Finished
            } else {
                FrameProgress::Empty
            });
        }

        if frame.sequence != self.expected_sequence {
            return Err(DaqError::Transfer(format!(
                "frame {} out of sequence, expected {}",
                frame.sequence, self.expected_sequence
            )));
        }
        if let Some(bad) = frame.samples.iter().find(|s| s.len() != self.channels) {
            return Err(DaqError::Transfer(format!(
                "frame {} carries {}-channel samples on a {}-channel device",
                frame.sequence,
                bad.len(),
                self.channels
            )));
        }
        self.expected_sequence = self.expected_sequence.wrapping_add(1);

        let remaining = self.remaining() as usize;
        let received = frame.samples.len();
        if received > remaining {
            warn!(
                "Frame {} carries {} samples, only {} needed; dropping the excess",
                frame.sequence, received, remaining
            );
        }
        for readings in frame.samples.into_iter().take(remaining) {
            let index = self.samples.len() as u64;
            self.samples.push(Sample { index, readings });
        }

        if self.remaining() == 0 {
            Ok(FrameProgress::Complete)
        } else if frame.finished {
            Ok(FrameProgress::Finished)
        } else {
            Ok(FrameProgress::Continue)
        }
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}
