mod output;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use optodaq_lib::{CancelToken, OptoDaq, RunLimit, SessionConfig, TriggerConfig, TriggerEdge, Unit};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line client for serial photodetector front ends.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the instrument (e.g. /dev/ttyACM0, COM3).
    #[arg(short, long, global = true)]
    port: Option<String>,
    /// Serial baud rate.
    #[arg(long, global = true)]
    baud: Option<u32>,
    /// Per-command response timeout in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// TOML file with session settings. Flags take precedence.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show identity, front end, rate, and per-channel gain and zero or the LUT.
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Averaged on-demand measurement of every channel.
    Snapshot {
        /// Raw reads to average.
        #[arg(short = 'n', long, default_value_t = 10)]
        reads: u32,
        #[arg(short, long, value_enum, default_value_t = UnitArg::Mv)]
        unit: UnitArg,
        /// Adjust gain by at most one stage before measuring.
        #[arg(long)]
        autogain: bool,
        #[arg(long)]
        json: bool,
        /// Retry this many times when the device does not answer in time.
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Set or query the gain stage of a LINEAR channel.
    Gain {
        channel: usize,
        /// Gain index 0 (1 kΩ) to 7 (10 MΩ). Omit to query.
        index: Option<u8>,
    },
    /// Capture a soft zero on a LINEAR channel, or restore its factory zero.
    Zero {
        channel: usize,
        #[arg(short = 'n', long, default_value_t = 100)]
        reads: u32,
        #[arg(long)]
        reset: bool,
    },
    /// Apply an oversampling index and/or sampling frequency.
    Rate {
        #[arg(long)]
        oversampling: Option<u8>,
        /// Sampling frequency in Hz.
        #[arg(long)]
        frequency: Option<f64>,
    },
    /// Timed or triggered acquisition. Ctrl-C stops early and keeps what was captured.
    Acquire {
        /// Number of samples to capture.
        #[arg(long, conflicts_with = "duration", required_unless_present = "duration")]
        samples: Option<u32>,
        /// Run length in seconds at the active frequency.
        #[arg(long)]
        duration: Option<f64>,
        /// Wait for an external edge before sampling.
        #[arg(long, value_enum)]
        trigger: Option<EdgeArg>,
        /// Seconds to wait for the trigger.
        #[arg(long, default_value_t = 10.0)]
        trigger_timeout: f64,
        #[arg(short, long, value_enum, default_value_t = UnitArg::Mv)]
        unit: UnitArg,
        /// CSV file to write; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Board temperature and humidity.
    Env,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum UnitArg {
    Mv,
    W,
}

impl From<UnitArg> for Unit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::Mv => Unit::Millivolts,
            UnitArg::W => Unit::Watts,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum EdgeArg {
    Rising,
    Falling,
}

impl From<EdgeArg> for TriggerEdge {
    fn from(edge: EdgeArg) -> Self {
        match edge {
            EdgeArg::Rising => TriggerEdge::Rising,
            EdgeArg::Falling => TriggerEdge::Falling,
        }
    }
}

fn setup_logging(log_file_path: Option<&PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stdout carries measurement output
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

/// Settings from the optional TOML file, overridden by command-line flags.
fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
            toml::from_str::<SessionConfig>(&text).with_context(|| format!("Invalid config {:?}", path))?
        }
        None => SessionConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.command_timeout_ms = timeout_ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = setup_logging(cli.log_file.as_ref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        // flush the file sink before exiting
        drop(guard);
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let port = config.port.clone();
    let mut daq = OptoDaq::connect(config)
        .await
        .with_context(|| format!("Failed to connect on {}", port))?;

    let result = dispatch(&mut daq, cli.command).await;
    if let Err(e) = daq.close().await {
        warn!("Closing the port failed: {}", e);
    }
    result
}

async fn dispatch(daq: &mut OptoDaq, command: Commands) -> Result<()> {
    match command {
        Commands::Info { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(daq.state())?);
            } else {
                output::print_info(daq.state());
            }
        }
        Commands::Snapshot {
            reads,
            unit,
            autogain,
            json,
            retries,
        } => {
            if autogain {
                daq.set_autogain(true)?;
            }
            let mut attempt = 0;
            let result = loop {
                match daq.snapshot(reads, unit.into()).await {
                    Err(e) if e.is_retryable() && attempt < retries => {
                        attempt += 1;
                        warn!("{}; retrying ({}/{})", e, attempt, retries);
                    }
                    other => break other,
                }
            }?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                output::print_snapshot(&result);
            }
        }
        Commands::Gain { channel, index } => {
            let gain = match index {
                Some(index) => daq.set_gain(channel, index).await?,
                None => daq.query_gain(channel).await?,
            };
            println!("ch{}: gain {} ({:.0e} Ω)", channel, gain, gain.transimpedance_ohms());
        }
        Commands::Zero { channel, reads, reset } => {
            if reset {
                let zero = daq.reset_zero(channel)?;
                println!("ch{}: factory zero {} restored", channel, zero);
            } else {
                let zero = daq.soft_zero(channel, reads).await?;
                println!("ch{}: soft zero {:.1} codes", channel, zero);
            }
        }
        Commands::Rate { oversampling, frequency } => {
            let setting = match (oversampling, frequency) {
                (Some(os), Some(hz)) => daq.configure_rate(os, hz).await?,
                (Some(os), None) => daq.set_oversampling(os).await?,
                (None, Some(hz)) => daq.set_frequency(hz).await?,
                (None, None) => bail!("Nothing to set: pass --oversampling and/or --frequency"),
            };
            if setting.adjusted {
                eprintln!(
                    "warning: frequency adjusted to {} Hz, the maximum for {}",
                    setting.frequency_hz, setting.oversampling
                );
            }
            println!("{} at {} Hz", setting.oversampling, setting.frequency_hz);
        }
        Commands::Acquire {
            samples,
            duration,
            trigger,
            trigger_timeout,
            unit,
            output: csv_path,
        } => {
            let limit = match (samples, duration) {
                (Some(n), _) => RunLimit::Samples(n),
                (None, Some(secs)) => RunLimit::Duration(
                    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid duration {}", secs))?,
                ),
                (None, None) => bail!("Pass --samples or --duration"),
            };

            let cancel = CancelToken::new();
            let trip = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping acquisition");
                    trip.cancel();
                }
            });

            let buffer = match trigger {
                Some(edge) => {
                    let timeout = Duration::try_from_secs_f64(trigger_timeout)
                        .with_context(|| format!("Invalid trigger timeout {}", trigger_timeout))?;
                    let trigger = TriggerConfig {
                        edge: edge.into(),
                        timeout,
                    };
                    daq.triggered(limit, trigger, &cancel).await?
                }
                None => daq.free_running(limit, &cancel).await?,
            };
            info!(
                "Captured {} of {} samples ({})",
                buffer.len(),
                buffer.requested,
                buffer.status
            );

            let values = daq.convert_buffer(&buffer, unit.into())?;
            match csv_path {
                Some(path) => {
                    let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
                    output::write_csv(BufWriter::new(file), &buffer, &values, unit.into())?;
                    info!("Wrote {:?}", path);
                }
                None => output::write_csv(std::io::stdout().lock(), &buffer, &values, unit.into())?,
            }
        }
        Commands::Env => {
            let env = daq.read_environment().await?;
            println!("{}", env);
        }
    }
    Ok(())
}
