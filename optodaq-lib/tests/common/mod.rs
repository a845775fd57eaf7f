//! Common test utilities: an in-process fake instrument speaking the wire
//! protocol over `tokio::io::duplex`.

// Shared across test files; not every helper is used by every file
#![allow(dead_code)]

use bytes::Bytes;
use optodaq_lib::acquisition::CancelToken;
use optodaq_lib::adc::{DataFrame, EnvironmentRaw, EnvironmentReading, RawReading, encode_readings};
use optodaq_lib::calibration::{CalibrationPoint, CalibrationTable};
use optodaq_lib::constants::{CHECKSUM_SIZE, HEADER_SIZE};
use optodaq_lib::message::Command;
use optodaq_lib::packet::{CommandType, RawPacket, parse_header};
use optodaq_lib::{OptoDaq, SessionConfig, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use zerocopy::IntoBytes;

pub type CodeFn = Arc<dyn Fn(usize, u8) -> i32 + Send + Sync>;

#[derive(Clone)]
pub enum FakeFrontEnd {
    Linear { zeros: Vec<i32>, gains: Vec<u8> },
    Log { calibration: Vec<u8> },
}

/// Behaviour of the fake instrument.
#[derive(Clone)]
pub struct FakeConfig {
    pub identity: String,
    pub front_end: FakeFrontEnd,
    /// Code returned by ReadRaw for (channel, current gain)
    pub raw_code: CodeFn,
    /// Whether an armed trigger ever fires
    pub trigger_fires: bool,
    /// Empty frames served before the first data frame
    pub empty_frames: usize,
    /// Stop answering ReadFrame after this many data frames
    pub silent_after_frames: Option<usize>,
    /// Send this data frame with a skipped sequence number
    pub skip_sequence_at: Option<usize>,
    /// End the run on the device side after this many samples
    pub end_after_samples: Option<u32>,
    /// Trip this token after serving this many data frames
    pub cancel_after_frames: Option<(usize, CancelToken)>,
    /// Answer this command with an error status and message
    pub error_on: Option<(CommandType, u8, String)>,
    pub environment: EnvironmentReading,
}

impl FakeConfig {
    pub fn linear(channels: usize) -> Self {
        Self {
            identity: "PDA-2 rev C fw 1.4".to_string(),
            front_end: FakeFrontEnd::Linear {
                zeros: (0..channels).map(|c| 100 + c as i32).collect(),
                gains: vec![2; channels],
            },
            raw_code: Arc::new(|channel, _gain| 1_000_000 + channel as i32 * 1_000),
            trigger_fires: true,
            empty_frames: 0,
            silent_after_frames: None,
            skip_sequence_at: None,
            end_after_samples: None,
            cancel_after_frames: None,
            error_on: None,
            environment: EnvironmentReading {
                temperature_c: 24.5,
                humidity_pct: 38.25,
            },
        }
    }

    pub fn log() -> Self {
        Self {
            identity: "PDL-1 fw 2.0".to_string(),
            front_end: FakeFrontEnd::Log {
                calibration: log_table().to_bytes(),
            },
            raw_code: Arc::new(|_, _| 0),
            ..Self::linear(1)
        }
    }

    pub fn with_raw_code(mut self, f: impl Fn(usize, u8) -> i32 + Send + Sync + 'static) -> Self {
        self.raw_code = Arc::new(f);
        self
    }
}

/// Two-point table: 1 µW at 0.5 V to 1 mW at 2.0 V, deadband 0.2 V.
pub fn log_table() -> CalibrationTable {
    CalibrationTable::new(
        0.2,
        vec![
            CalibrationPoint { volts: 0.5, watts: 1e-6 },
            CalibrationPoint { volts: 2.0, watts: 1e-3 },
        ],
    )
    .unwrap()
}

/// Code the fake puts in data frames: channel-major offset plus capture index.
pub fn frame_code(channel: usize, index: u64) -> i32 {
    channel as i32 * 1_000_000 + index as i32
}

#[derive(Clone, Default)]
pub struct FakeLog {
    commands: Arc<Mutex<Vec<Command>>>,
}

impl FakeLog {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command_type: CommandType) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.command_type() == command_type)
            .count()
    }

    /// Commands received since the log was last cleared.
    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }
}

struct Run {
    armed: u32,
    produced: u32,
    frames: usize,
    triggered: bool,
    started: bool,
}

struct FakeInstrument {
    config: FakeConfig,
    gains: Vec<u8>,
    run: Option<Run>,
    log: FakeLog,
}

impl FakeInstrument {
    fn channels(&self) -> usize {
        match &self.config.front_end {
            FakeFrontEnd::Linear { zeros, .. } => zeros.len(),
            FakeFrontEnd::Log { .. } => 1,
        }
    }

    /// `None` means: do not answer at all.
    fn handle(&mut self, request: RawPacket) -> Option<RawPacket> {
        let command_type = request.command();
        let command = match Command::try_from(request) {
            Ok(command) => command,
            Err(e) => return Some(RawPacket::reply(command_type, 0x7F, Bytes::from(e.to_string()))),
        };
        self.log.commands.lock().unwrap().push(command.clone());

        if let Some((failing, code, message)) = &self.config.error_on {
            if *failing == command_type {
                return Some(RawPacket::reply(command_type, *code, Bytes::from(message.clone())));
            }
        }

        let ok = |payload: Vec<u8>| Some(RawPacket::reply(command_type, 0, Bytes::from(payload)));

        match command {
            Command::Identify => ok(self.config.identity.clone().into_bytes()),
            Command::QueryFrontEnd => {
                let kind = match self.config.front_end {
                    FakeFrontEnd::Linear { .. } => 0u8,
                    FakeFrontEnd::Log { .. } => 1u8,
                };
                ok(vec![kind, self.channels() as u8])
            }
            Command::QueryFactoryZeros => match &self.config.front_end {
                FakeFrontEnd::Linear { zeros, .. } => ok(zeros.iter().flat_map(|z| z.to_le_bytes()).collect()),
                FakeFrontEnd::Log { .. } => Some(RawPacket::reply(command_type, 2, Bytes::from("no zeros"))),
            },
            Command::QueryCalibration => match &self.config.front_end {
                FakeFrontEnd::Log { calibration } => ok(calibration.clone()),
                FakeFrontEnd::Linear { .. } => Some(RawPacket::reply(command_type, 2, Bytes::from("no table"))),
            },
            Command::SetGain { channel, gain } => {
                self.gains[channel as usize] = gain;
                ok(Vec::new())
            }
            Command::GetGain { channel } => ok(vec![self.gains[channel as usize]]),
            Command::SetOversampling { .. } | Command::SetFrequency { .. } => ok(Vec::new()),
            Command::ReadRaw => {
                let readings: Vec<RawReading> = (0..self.channels())
                    .map(|channel| {
                        let gain = self.gains.get(channel).copied().unwrap_or(0);
                        RawReading {
                            code: (self.config.raw_code)(channel, gain),
                            gain,
                        }
                    })
                    .collect();
                ok(encode_readings(&readings))
            }
            Command::ArmTimer { sample_count } => {
                self.arm(sample_count, false);
                ok(Vec::new())
            }
            Command::ArmTrigger { sample_count, .. } => {
                self.arm(sample_count, true);
                ok(Vec::new())
            }
            Command::StartAcquisition => {
                if let Some(run) = self.run.as_mut() {
                    run.started = true;
                }
                ok(Vec::new())
            }
            Command::StopAcquisition => {
                self.run = None;
                ok(Vec::new())
            }
            Command::ReadFrame { max_samples } => self.read_frame(max_samples).map(|frame| {
                RawPacket::reply(command_type, 0, Bytes::from(frame.to_bytes()))
            }),
            Command::ReadEnvironment => ok(EnvironmentRaw::from(self.config.environment).as_bytes().to_vec()),
        }
    }

    fn arm(&mut self, armed: u32, triggered: bool) {
        self.run = Some(Run {
            armed,
            produced: 0,
            frames: 0,
            triggered,
            started: false,
        });
    }

    fn read_frame(&mut self, max_samples: u16) -> Option<DataFrame> {
        let channels = self.channels();
        let empty_frames = self.config.empty_frames;
        let trigger_fires = self.config.trigger_fires;
        let silent_after = self.config.silent_after_frames;
        let skip_at = self.config.skip_sequence_at;
        let end_after = self.config.end_after_samples;

        let Some(run) = self.run.as_mut() else {
            return Some(DataFrame {
                sequence: 0,
                finished: true,
                samples: Vec::new(),
            });
        };

        let empty = DataFrame {
            sequence: 0,
            finished: false,
            samples: Vec::new(),
        };
        if !run.started || (run.triggered && !trigger_fires) {
            return Some(empty);
        }
        if run.frames < empty_frames && run.produced == 0 {
            run.frames += 1;
            return Some(empty);
        }

        let data_frames = run.frames.saturating_sub(empty_frames);
        if silent_after.is_some_and(|k| data_frames >= k) {
            return None;
        }

        let limit = end_after.map_or(run.armed, |end| end.min(run.armed));
        let count = (limit - run.produced).min(max_samples as u32);
        let samples = (0..count)
            .map(|i| {
                let index = (run.produced + i) as u64;
                (0..channels)
                    .map(|channel| RawReading {
                        code: frame_code(channel, index),
                        gain: 2,
                    })
                    .collect()
            })
            .collect();

        let mut sequence = data_frames as u16;
        if skip_at == Some(data_frames) {
            sequence = sequence.wrapping_add(1);
        }
        run.produced += count;
        run.frames += 1;
        let finished = run.produced >= limit;

        if let Some((k, token)) = &self.config.cancel_after_frames {
            if data_frames + 1 >= *k {
                token.cancel();
            }
        }

        Some(DataFrame {
            sequence,
            finished,
            samples,
        })
    }
}

async fn read_request(device: &mut DuplexStream) -> Option<RawPacket> {
    let mut head = [0u8; 1 + HEADER_SIZE];
    device.read_exact(&mut head).await.ok()?;
    let header = parse_header(head[1..].try_into().ok()?).ok()?;
    let mut rest = vec![0u8; header.length() as usize + CHECKSUM_SIZE];
    device.read_exact(&mut rest).await.ok()?;
    let mut all = head.to_vec();
    all.extend_from_slice(&rest);
    RawPacket::try_from(Bytes::from(all)).ok()
}

/// Start a fake instrument task and return the host end of its link.
pub fn spawn(config: FakeConfig) -> (Transport, FakeLog) {
    let (host, mut device) = tokio::io::duplex(64 * 1024);
    let log = FakeLog::default();
    let gains = match &config.front_end {
        FakeFrontEnd::Linear { gains, .. } => gains.clone(),
        FakeFrontEnd::Log { .. } => vec![0],
    };
    let mut instrument = FakeInstrument {
        config,
        gains,
        run: None,
        log: log.clone(),
    };

    tokio::spawn(async move {
        while let Some(request) = read_request(&mut device).await {
            if let Some(reply) = instrument.handle(request) {
                if device.write_all(&reply.encode()).await.is_err() {
                    break;
                }
            }
        }
    });

    (Transport::from_stream(host, "fake"), log)
}

pub fn session_config() -> SessionConfig {
    SessionConfig::new("fake")
        .with_command_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(1))
        .with_frame_samples(8)
}

pub async fn connect(config: FakeConfig) -> (OptoDaq, FakeLog) {
    connect_with(config, session_config()).await
}

/// Route library logs through the test harness; set RUST_LOG to see them.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn connect_with(config: FakeConfig, session: SessionConfig) -> (OptoDaq, FakeLog) {
    init_logging();
    let (transport, log) = spawn(config);
    let daq = OptoDaq::with_transport(transport, session).await.unwrap();
    log.clear();
    (daq, log)
}

pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance * b.abs().max(1e-300)
}

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data.replace(' ', "")).expect("Failed to decode hex"))
}
