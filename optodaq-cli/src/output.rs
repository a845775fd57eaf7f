use anyhow::Result;
use optodaq_lib::state::FrontEnd;
use optodaq_lib::{AcquisitionBuffer, DeviceState, SnapshotResult, Unit};
use std::io::Write;

pub fn print_info(state: &DeviceState) {
    let identity = state.identity();
    println!("Device:      {}", identity.description);
    println!("Front end:   {}", identity.front_end);
    println!("Channels:    {}", identity.channels);
    println!("Rate:        {} at {} Hz", state.oversampling(), state.frequency_hz());
    match state.front_end() {
        FrontEnd::Linear { channels } => {
            for (i, channel) in channels.iter().enumerate() {
                let zero = match channel.soft_zero {
                    Some(soft) => format!("{:.1} (soft)", soft),
                    None => format!("{} (factory)", channel.factory_zero),
                };
                println!(
                    "  ch{}: gain {} ({:.0e} Ω), zero {}",
                    i,
                    channel.gain,
                    channel.gain.transimpedance_ohms(),
                    zero
                );
            }
        }
        FrontEnd::Log { table } => {
            let points = table.points();
            println!("  LUT: {} points, deadband {:.3} V", points.len(), table.deadband_v());
            if let (Some(first), Some(last)) = (points.first(), points.last()) {
                println!(
                    "  range: {:.3} V / {:.3e} W .. {:.3} V / {:.3e} W",
                    first.volts, first.watts, last.volts, last.watts
                );
            }
        }
    }
}

pub fn print_snapshot(result: &SnapshotResult) {
    for channel in &result.channels {
        let gain = channel.gain.map(|g| format!(" (gain {})", g)).unwrap_or_default();
        match result.unit {
            Unit::Millivolts => println!("ch{}: {:.4} {}{}", channel.channel, channel.value, result.unit, gain),
            Unit::Watts => println!("ch{}: {:.4e} {}{}", channel.channel, channel.value, result.unit, gain),
        }
    }
}

/// Write one row per sample: index, time offset, then one column per channel.
pub fn write_csv<W: Write>(writer: W, buffer: &AcquisitionBuffer, values: &[Vec<f64>], unit: Unit) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec!["index".to_string(), "time_s".to_string()];
    header.extend((0..buffer.channels).map(|ch| format!("ch{}_{}", ch, unit)));
    csv.write_record(&header)?;

    for (sample, row) in buffer.samples.iter().zip(values) {
        let mut record = vec![
            sample.index.to_string(),
            format!("{:.9}", buffer.offset_seconds(sample.index)),
        ];
        record.extend(row.iter().map(|v| v.to_string()));
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(())
}
