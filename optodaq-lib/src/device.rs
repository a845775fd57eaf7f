use crate::acquisition::{
    AcquisitionBuffer, AcquisitionStatus, CancelToken, ChannelSnapshot, ControllerState, FrameAssembler,
    FrameProgress, RunLimit, RunMode, SnapshotResult, TriggerConfig,
};
use crate::adc::{EnvironmentReading, RawReading, Sample};
use crate::calibration::{GainIndex, Unit, autogain_step};
use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::constants::{CHANNEL_READING_SIZE, DATA_FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::DaqError;
use crate::message::{Command, Response};
use crate::state::{AcquisitionConfig, ChannelConfig, DeviceIdentity, DeviceState, FrontEnd, FrontEndKind};
use crate::transport::Transport;
use crate::validate::{RateSetting, validate_gain, validate_linear_channel, validate_oversampling_frequency};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A live session with one instrument.
///
/// The session owns the transport. Every operation takes `&mut self`, so
/// at most one command is in flight at a time.
#[derive(Debug)]
pub struct OptoDaq {
    codec: Codec,
    state: DeviceState,
    controller: ControllerState,
    config: SessionConfig,
}

fn unexpected(command: &str, response: Response) -> DaqError {
    DaqError::Malformed(format!("unexpected reply to {}: {:?}", command, response))
}

async fn ack(codec: &mut Codec, command: Command) -> Result<(), DaqError> {
    match codec.transact(&command).await? {
        Response::Ack => Ok(()),
        other => Err(unexpected("command", other)),
    }
}

impl OptoDaq {
    /// Open the configured serial port and read the device state.
    pub async fn connect(config: SessionConfig) -> Result<Self, DaqError> {
        config.validate()?;
        let transport = Transport::open(&config.port, config.baud_rate).await?;
        Self::with_transport(transport, config).await
    }

    /// Start a session over an already-open transport.
    pub async fn with_transport(transport: Transport, config: SessionConfig) -> Result<Self, DaqError> {
        config.validate()?;
        info!("Connecting to instrument on {}", transport.name());
        let mut codec = Codec::new(transport, config.command_timeout());
        let state = Self::read_device_state(&mut codec, &config).await?;

        info!(
            "Connected: {} ({} front end, {} channel(s), {} at {} Hz)",
            state.identity().description,
            state.front_end_kind(),
            state.channels(),
            state.oversampling(),
            state.frequency_hz()
        );

        Ok(Self {
            codec,
            state,
            controller: ControllerState::Idle,
            config,
        })
    }

    async fn read_device_state(codec: &mut Codec, config: &SessionConfig) -> Result<DeviceState, DaqError> {
        let description = match codec.transact(&Command::Identify).await? {
            Response::Identity(description) => description,
            other => return Err(unexpected("Identify", other)),
        };
        let (kind, channels) = match codec.transact(&Command::QueryFrontEnd).await? {
            Response::FrontEnd { kind, channels } => (kind, channels),
            other => return Err(unexpected("QueryFrontEnd", other)),
        };
        info!("Identified {:?}: {} front end with {} channel(s)", description, kind, channels);

        let front_end = match kind {
            FrontEndKind::Linear => {
                let zeros = match codec.transact(&Command::QueryFactoryZeros).await? {
                    Response::FactoryZeros(zeros) => zeros,
                    other => return Err(unexpected("QueryFactoryZeros", other)),
                };
                if zeros.len() != channels {
                    return Err(DaqError::Malformed(format!(
                        "{} factory zeros for a {}-channel device",
                        zeros.len(),
                        channels
                    )));
                }

                let mut configs = Vec::with_capacity(channels);
                for (channel, factory_zero) in zeros.into_iter().enumerate() {
                    let gain = match codec.transact(&Command::GetGain { channel: channel as u8 }).await? {
                        Response::Gain(gain) => GainIndex::new(gain)
                            .map_err(|_| DaqError::Malformed(format!("channel {} reports gain {}", channel, gain)))?,
                        other => return Err(unexpected("GetGain", other)),
                    };
                    debug!("Channel {}: gain {}, factory zero {}", channel, gain, factory_zero);
                    configs.push(ChannelConfig {
                        gain,
                        factory_zero,
                        soft_zero: None,
                    });
                }
                FrontEnd::Linear { channels: configs }
            }
            FrontEndKind::Log => {
                let table = match codec.transact(&Command::QueryCalibration).await? {
                    Response::Calibration(table) => table,
                    other => return Err(unexpected("QueryCalibration", other)),
                };
                debug!(
                    "Calibration table: {} points, deadband {} V",
                    table.points().len(),
                    table.deadband_v()
                );
                FrontEnd::Log { table }
            }
        };

        let setting = validate_oversampling_frequency(config.oversampling, config.frequency_hz)?;
        if setting.adjusted {
            warn!(
                "Configured {} Hz exceeds the {} ceiling, using {} Hz",
                config.frequency_hz, setting.oversampling, setting.frequency_hz
            );
        }
        ack(
            codec,
            Command::SetOversampling {
                index: setting.oversampling.get(),
            },
        )
        .await?;
        ack(
            codec,
            Command::SetFrequency {
                millihertz: to_millihertz(setting.frequency_hz),
            },
        )
        .await?;

        DeviceState::new(
            DeviceIdentity {
                description,
                front_end: kind,
                channels,
            },
            front_end,
            AcquisitionConfig::from(setting),
        )
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.state.identity()
    }

    pub fn front_end_kind(&self) -> FrontEndKind {
        self.state.front_end_kind()
    }

    pub fn channels(&self) -> usize {
        self.state.channels()
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn autogain(&self) -> bool {
        self.config.autogain
    }

    /// Enable or disable autogain before snapshots and soft-zero captures.
    pub fn set_autogain(&mut self, enabled: bool) -> Result<(), DaqError> {
        if enabled && self.front_end_kind() == FrontEndKind::Log {
            return Err(DaqError::Unsupported {
                operation: "autogain",
                front_end: FrontEndKind::Log,
            });
        }
        self.config.autogain = enabled;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), DaqError> {
        if self.controller.is_running() {
            return Err(DaqError::Busy);
        }
        Ok(())
    }

    /// Send one configuration command while marking the controller as configuring.
    async fn apply(&mut self, command: Command) -> Result<(), DaqError> {
        self.ensure_idle()?;
        self.controller = ControllerState::Configuring;
        let result = ack(&mut self.codec, command).await;
        self.controller = ControllerState::Idle;
        result
    }

    pub async fn set_gain(&mut self, channel: usize, gain: u8) -> Result<GainIndex, DaqError> {
        self.ensure_idle()?;
        let gain = validate_gain(self.front_end_kind(), self.channels(), channel, gain)?;
        self.apply(Command::SetGain {
            channel: channel as u8,
            gain: gain.get(),
        })
        .await?;
        self.state.set_gain(channel, gain)?;
        info!("Channel {} gain set to {} ({} Ω)", channel, gain, gain.transimpedance_ohms());
        Ok(gain)
    }

    /// Ask the device for a channel's gain and refresh the cached value.
    pub async fn query_gain(&mut self, channel: usize) -> Result<GainIndex, DaqError> {
        self.ensure_idle()?;
        validate_linear_channel(self.front_end_kind(), self.channels(), channel, "gain control")?;
        let raw = match self.codec.transact(&Command::GetGain { channel: channel as u8 }).await? {
            Response::Gain(raw) => raw,
            other => return Err(unexpected("GetGain", other)),
        };
        let gain = GainIndex::new(raw)
            .map_err(|_| DaqError::Malformed(format!("channel {} reports gain {}", channel, raw)))?;
        let cached = self.state.gain(channel)?;
        if cached != gain {
            warn!("Channel {} gain was cached as {}, device reports {}", channel, cached, gain);
            self.state.set_gain(channel, gain)?;
        }
        Ok(gain)
    }

    /// Change the oversampling index, clamping the current frequency to its ceiling.
    pub async fn set_oversampling(&mut self, oversampling: u8) -> Result<RateSetting, DaqError> {
        let frequency_hz = self.state.frequency_hz();
        self.configure_rate(oversampling, frequency_hz).await
    }

    pub async fn set_frequency(&mut self, frequency_hz: f64) -> Result<RateSetting, DaqError> {
        let oversampling = self.state.oversampling().get();
        self.configure_rate(oversampling, frequency_hz).await
    }

    /// Validate and apply an oversampling/frequency pair, sending only what changed.
    pub async fn configure_rate(&mut self, oversampling: u8, frequency_hz: f64) -> Result<RateSetting, DaqError> {
        self.ensure_idle()?;
        let setting = validate_oversampling_frequency(oversampling, frequency_hz)?;
        if setting.adjusted {
            warn!(
                "{} Hz exceeds the {} ceiling, adjusted to {} Hz",
                frequency_hz, setting.oversampling, setting.frequency_hz
            );
        }

        let current = self.state.acquisition();
        let frequency_changed = setting.frequency_hz != current.frequency_hz;
        // Lower the frequency before tightening the ceiling, raise it after.
        let frequency_first = setting.frequency_hz < current.frequency_hz;
        if frequency_changed && frequency_first {
            self.send_frequency(setting.frequency_hz).await?;
            self.state.set_acquisition(RateSetting {
                oversampling: current.oversampling,
                ..setting
            });
        }
        if setting.oversampling != current.oversampling {
            self.apply(Command::SetOversampling {
                index: setting.oversampling.get(),
            })
            .await?;
            self.state.set_acquisition(RateSetting {
                frequency_hz: self.state.frequency_hz(),
                ..setting
            });
        }
        if frequency_changed && !frequency_first {
            self.send_frequency(setting.frequency_hz).await?;
        }
        self.state.set_acquisition(setting);
        info!("Rate set to {} at {} Hz", setting.oversampling, setting.frequency_hz);
        Ok(setting)
    }

    async fn send_frequency(&mut self, frequency_hz: f64) -> Result<(), DaqError> {
        self.apply(Command::SetFrequency {
            millihertz: to_millihertz(frequency_hz),
        })
        .await
    }

    async fn read_raw(&mut self) -> Result<Vec<RawReading>, DaqError> {
        let readings = match self.codec.transact(&Command::ReadRaw).await? {
            Response::Reading(readings) => readings,
            other => return Err(unexpected("ReadRaw", other)),
        };
        if readings.len() != self.channels() {
            return Err(DaqError::Malformed(format!(
                "raw read returned {} channels, device has {}",
                readings.len(),
                self.channels()
            )));
        }
        Ok(readings)
    }

    /// One probe read; step each listed channel by at most one gain index,
    /// then read once more if anything changed.
    ///
    /// Returns the last reading taken, which reflects the gains now in effect.
    async fn run_autogain(&mut self, channels: &[usize]) -> Result<Vec<RawReading>, DaqError> {
        let probe = self.read_raw().await?;
        let mut stepped = false;
        for &channel in channels {
            let gain = self.state.gain(channel)?;
            let zero = self.state.zero(channel)?;
            if let Some(next) = autogain_step(probe[channel].code as f64, zero, gain) {
                ack(
                    &mut self.codec,
                    Command::SetGain {
                        channel: channel as u8,
                        gain: next.get(),
                    },
                )
                .await?;
                self.state.set_gain(channel, next)?;
                info!("Autogain: channel {} {} -> {}", channel, gain, next);
                stepped = true;
            }
        }
        if stepped {
            let check = self.read_raw().await?;
            debug!("Autogain re-read: {:?}", check);
            return Ok(check);
        }
        Ok(probe)
    }

    /// Read until `reads` readings are in hand and average the codes of each
    /// channel. `first`, when given, counts as the first of them.
    async fn average_reads(&mut self, reads: u32, first: Option<Vec<RawReading>>) -> Result<Vec<(f64, u8)>, DaqError> {
        let mut sums = vec![0f64; self.channels()];
        let mut gains: Vec<Option<u8>> = vec![None; self.channels()];
        let mut pending = first;
        for _ in 0..reads {
            let readings = match pending.take() {
                Some(readings) => readings,
                None => self.read_raw().await?,
            };
            for (channel, reading) in readings.iter().enumerate() {
                sums[channel] += reading.code as f64;
                match gains[channel] {
                    None => gains[channel] = Some(reading.gain),
                    Some(g) if g != reading.gain => {
                        return Err(DaqError::Malformed(format!(
                            "channel {} gain changed from {} to {} during a snapshot",
                            channel, g, reading.gain
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(sums
            .into_iter()
            .zip(gains)
            .map(|(sum, gain)| (sum / reads as f64, gain.unwrap_or_default()))
            .collect())
    }

    /// Average `reads` raw reads per channel and convert the averages once.
    pub async fn snapshot(&mut self, reads: u32, unit: Unit) -> Result<SnapshotResult, DaqError> {
        self.ensure_idle()?;
        if reads == 0 {
            return Err(DaqError::InvalidArgument("snapshot needs at least one read".to_string()));
        }
        self.controller = ControllerState::Running(RunMode::Snapshot);
        let result = self.snapshot_inner(reads, unit).await;
        self.controller = ControllerState::Idle;
        result
    }

    async fn snapshot_inner(&mut self, reads: u32, unit: Unit) -> Result<SnapshotResult, DaqError> {
        let linear = self.front_end_kind() == FrontEndKind::Linear;
        let mut first = None;
        if linear && self.config.autogain {
            let all: Vec<usize> = (0..self.channels()).collect();
            first = Some(self.run_autogain(&all).await?);
        }

        let averages = self.average_reads(reads, first).await?;
        let mut channels = Vec::with_capacity(averages.len());
        for (channel, (mean_code, gain)) in averages.into_iter().enumerate() {
            let gain_used = if linear {
                let reported = GainIndex::new(gain)
                    .map_err(|_| DaqError::Malformed(format!("channel {} reports gain {}", channel, gain)))?;
                let cached = self.state.gain(channel)?;
                if reported != cached {
                    warn!("Channel {} read at gain {} but {} is cached", channel, reported, cached);
                }
                Some(reported)
            } else {
                None
            };
            channels.push(ChannelSnapshot {
                channel,
                mean_code,
                value: self.state.convert_code(channel, mean_code, gain, unit)?,
                gain: gain_used,
            });
        }
        debug!("Snapshot of {} reads: {:?}", reads, channels);
        Ok(SnapshotResult { unit, reads, channels })
    }

    /// Capture `reads` samples on a LINEAR channel and store their mean as its zero.
    pub async fn soft_zero(&mut self, channel: usize, reads: u32) -> Result<f64, DaqError> {
        self.ensure_idle()?;
        validate_linear_channel(self.front_end_kind(), self.channels(), channel, "zeroing")?;
        if reads == 0 {
            return Err(DaqError::InvalidArgument("soft zero needs at least one read".to_string()));
        }
        self.controller = ControllerState::Running(RunMode::Snapshot);
        let result = async {
            let first = if self.config.autogain {
                Some(self.run_autogain(&[channel]).await?)
            } else {
                None
            };
            let averages = self.average_reads(reads, first).await?;
            Ok::<f64, DaqError>(averages[channel].0)
        }
        .await;
        self.controller = ControllerState::Idle;

        let zero = result?;
        self.state.set_soft_zero(channel, Some(zero))?;
        info!("Channel {} soft zero set to {:.1} codes over {} reads", channel, zero, reads);
        Ok(zero)
    }

    /// Drop the soft zero of a channel and go back to its factory zero.
    pub fn reset_zero(&mut self, channel: usize) -> Result<i32, DaqError> {
        self.ensure_idle()?;
        validate_linear_channel(self.front_end_kind(), self.channels(), channel, "zeroing")?;
        self.state.set_soft_zero(channel, None)?;
        let factory = self.state.channel_config(channel)?.factory_zero;
        info!("Channel {} zero reset to factory value {}", channel, factory);
        Ok(factory)
    }

    /// Timer-paced run until `limit` is reached, the device ends the run, or `cancel` fires.
    pub async fn free_running(&mut self, limit: RunLimit, cancel: &CancelToken) -> Result<AcquisitionBuffer, DaqError> {
        self.run(RunMode::FreeRunning, limit, None, cancel).await
    }

    /// Like [`free_running`](Self::free_running), but the device starts on an external edge.
    pub async fn triggered(
        &mut self,
        limit: RunLimit,
        trigger: TriggerConfig,
        cancel: &CancelToken,
    ) -> Result<AcquisitionBuffer, DaqError> {
        self.run(RunMode::Triggered, limit, Some(trigger), cancel).await
    }

    async fn run(
        &mut self,
        mode: RunMode,
        limit: RunLimit,
        trigger: Option<TriggerConfig>,
        cancel: &CancelToken,
    ) -> Result<AcquisitionBuffer, DaqError> {
        self.ensure_idle()?;
        let acquisition = self.state.acquisition();
        let requested = limit.sample_count(acquisition.frequency_hz)?;
        let started_at = Utc::now();
        info!(
            "Starting {} run: {} samples at {} Hz ({})",
            mode, requested, acquisition.frequency_hz, acquisition.oversampling
        );

        let arm = match trigger {
            None => Command::ArmTimer {
                sample_count: requested,
            },
            Some(trigger) => Command::ArmTrigger {
                sample_count: requested,
                edge: trigger.edge,
            },
        };

        self.controller = ControllerState::Configuring;
        let mut assembler = FrameAssembler::new(self.channels(), requested);
        let outcome = match ack(&mut self.codec, arm).await {
            Ok(()) => {
                self.controller = ControllerState::Running(mode);
                match ack(&mut self.codec, Command::StartAcquisition).await {
                    Ok(()) => self.collect(&mut assembler, trigger, cancel).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = ack(&mut self.codec, Command::StopAcquisition).await {
            warn!("Stop after {} run failed: {}", mode, e);
        }
        self.controller = ControllerState::Idle;

        let status = outcome?;
        info!("{} run finished {}: {} of {} samples", mode, status, assembler.len(), requested);
        Ok(AcquisitionBuffer {
            mode,
            status,
            started_at,
            oversampling: acquisition.oversampling,
            frequency_hz: acquisition.frequency_hz,
            channels: self.channels(),
            requested,
            samples: assembler.into_samples(),
        })
    }

    async fn collect(
        &mut self,
        assembler: &mut FrameAssembler,
        trigger: Option<TriggerConfig>,
        cancel: &CancelToken,
    ) -> Result<AcquisitionStatus, DaqError> {
        let trigger_deadline = trigger.map(|t| (Instant::now() + t.timeout, t.timeout));
        // A reply has to fit in one frame payload
        let fit = ((MAX_PAYLOAD_SIZE - DATA_FRAME_HEADER_SIZE) / (self.channels() * CHANNEL_READING_SIZE)).max(1) as u32;
        let frame_samples = (self.config.frame_samples as u32).min(fit);
        if frame_samples < self.config.frame_samples as u32 {
            debug!(
                "Frame size {} too large for {} channels, requesting {} samples per frame",
                self.config.frame_samples,
                self.channels(),
                frame_samples
            );
        }
        let poll_interval = self.config.poll_interval();

        loop {
            if cancel.is_cancelled() {
                info!("Run cancelled after {} samples", assembler.len());
                return Ok(AcquisitionStatus::Cancelled);
            }

            let max_samples = assembler.remaining().min(frame_samples) as u16;
            let frame = match self.codec.transact(&Command::ReadFrame { max_samples }).await {
                Ok(Response::Frame(frame)) => frame,
                Ok(other) => return Err(unexpected("ReadFrame", other)),
                Err(DaqError::Timeout(after)) => {
                    warn!("No frame within {:?} after {} samples", after, assembler.len());
                    return Ok(AcquisitionStatus::Incomplete);
                }
                Err(DaqError::Malformed(reason)) => return Err(DaqError::Transfer(reason)),
                Err(e) => return Err(e),
            };

            match assembler.push(frame)? {
                FrameProgress::Complete => return Ok(AcquisitionStatus::Complete),
                FrameProgress::Finished => {
                    warn!(
                        "Device ended the run after {} of {} samples",
                        assembler.len(),
                        assembler.len() as u32 + assembler.remaining()
                    );
                    return Ok(AcquisitionStatus::Incomplete);
                }
                FrameProgress::Continue => {}
                FrameProgress::Empty => {
                    let mut wake = Instant::now() + poll_interval;
                    if let Some((deadline, timeout)) = trigger_deadline {
                        if assembler.is_empty() {
                            if Instant::now() >= deadline {
                                warn!("No trigger within {:?}", timeout);
                                return Err(DaqError::TriggerTimeout(timeout));
                            }
                            wake = wake.min(deadline);
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    /// Stop a running acquisition and return the controller to idle.
    ///
    /// Needed only when a run's future was dropped before it finished.
    pub async fn stop_acquisition(&mut self) -> Result<(), DaqError> {
        let result = ack(&mut self.codec, Command::StopAcquisition).await;
        self.controller = ControllerState::Idle;
        result
    }

    pub async fn read_environment(&mut self) -> Result<EnvironmentReading, DaqError> {
        self.ensure_idle()?;
        match self.codec.transact(&Command::ReadEnvironment).await? {
            Response::Environment(reading) => Ok(reading),
            other => Err(unexpected("ReadEnvironment", other)),
        }
    }

    /// Convert every channel of a captured sample.
    pub fn convert_sample(&self, sample: &Sample, unit: Unit) -> Result<Vec<f64>, DaqError> {
        self.state.convert_readings(&sample.readings, unit)
    }

    pub fn convert_buffer(&self, buffer: &AcquisitionBuffer, unit: Unit) -> Result<Vec<Vec<f64>>, DaqError> {
        buffer.samples.iter().map(|s| self.convert_sample(s, unit)).collect()
    }

    pub async fn close(mut self) -> Result<(), DaqError> {
        if self.controller.is_running() {
            if let Err(e) = ack(&mut self.codec, Command::StopAcquisition).await {
                warn!("Stop on close failed: {}", e);
            }
        }
        self.codec.close().await
    }
}

fn to_millihertz(frequency_hz: f64) -> u32 {
    (frequency_hz * 1_000.0).round() as u32
}
