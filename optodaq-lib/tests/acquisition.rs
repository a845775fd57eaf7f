mod common;

use common::*;
use optodaq_lib::constants::{CHANNEL_READING_SIZE, DATA_FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use optodaq_lib::message::{Command, TriggerEdge};
use optodaq_lib::packet::CommandType;
use optodaq_lib::{
    AcquisitionStatus, CancelToken, ControllerState, DaqError, RunLimit, RunMode, TriggerConfig, Unit,
};
use std::time::Duration;

fn assert_in_order(buffer: &optodaq_lib::AcquisitionBuffer) {
    for (i, sample) in buffer.samples.iter().enumerate() {
        assert_eq!(sample.index, i as u64);
        for channel in 0..buffer.channels {
            assert_eq!(sample.code(channel), Some(frame_code(channel, i as u64)));
        }
    }
}

#[tokio::test]
async fn test_free_running_collects_requested_samples() {
    let config = FakeConfig {
        empty_frames: 3,
        ..FakeConfig::linear(2)
    };
    let (mut daq, log) = connect(config).await;
    let buffer = daq
        .free_running(RunLimit::Samples(20), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(buffer.status, AcquisitionStatus::Complete);
    assert_eq!(buffer.mode, RunMode::FreeRunning);
    assert_eq!(buffer.len(), 20);
    assert_eq!(buffer.requested, 20);
    assert_eq!(buffer.channels, 2);
    assert_in_order(&buffer);

    let commands = log.commands();
    assert_eq!(commands[0], Command::ArmTimer { sample_count: 20 });
    assert_eq!(commands[1], Command::StartAcquisition);
    assert_eq!(commands.last(), Some(&Command::StopAcquisition));
    // frame size 8: 3 empty + 8 + 8 + 4
    assert_eq!(log.count(CommandType::ReadFrame), 6);
    assert!(commands.contains(&Command::ReadFrame { max_samples: 4 }));
    assert_eq!(daq.controller_state(), ControllerState::Idle);
}

#[tokio::test]
async fn test_wide_device_frames_fit_payload_limit() {
    let session = session_config().with_frame_samples(64);
    let (mut daq, log) = connect_with(FakeConfig::linear(16), session).await;
    let buffer = daq
        .free_running(RunLimit::Samples(64), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(buffer.status, AcquisitionStatus::Complete);
    assert_eq!(buffer.len(), 64);
    assert_in_order(&buffer);

    // 16 channels x 5 bytes: 51 samples fit behind the frame header
    let per_frame = (MAX_PAYLOAD_SIZE - DATA_FRAME_HEADER_SIZE) / (16 * CHANNEL_READING_SIZE);
    assert_eq!(per_frame, 51);
    let requests: Vec<u16> = log
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            Command::ReadFrame { max_samples } => Some(max_samples),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![51, 13]);
}

#[tokio::test]
async fn test_duration_limit_uses_active_frequency() {
    let (mut daq, log) = connect(FakeConfig::linear(1)).await;
    daq.set_frequency(2_000.0).await.unwrap();
    log.clear();

    let buffer = daq
        .free_running(RunLimit::Duration(Duration::from_millis(15)), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(buffer.requested, 30);
    assert_eq!(buffer.len(), 30);
    assert_eq!(buffer.frequency_hz, 2_000.0);
    assert!((buffer.offset_seconds(29) - 0.0145).abs() < 1e-12);
    assert_eq!(log.commands()[0], Command::ArmTimer { sample_count: 30 });
}

#[tokio::test]
async fn test_zero_sample_limit_is_invalid() {
    let (mut daq, log) = connect(FakeConfig::linear(1)).await;
    assert!(matches!(
        daq.free_running(RunLimit::Samples(0), &CancelToken::new()).await,
        Err(DaqError::InvalidArgument(_))
    ));
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn test_cancel_returns_partial_buffer() {
    let cancel = CancelToken::new();
    let config = FakeConfig {
        cancel_after_frames: Some((2, cancel.clone())),
        ..FakeConfig::linear(2)
    };
    let (mut daq, log) = connect(config).await;
    let buffer = daq.free_running(RunLimit::Samples(1_000), &cancel).await.unwrap();

    assert_eq!(buffer.status, AcquisitionStatus::Cancelled);
    assert_eq!(buffer.len(), 16);
    assert_in_order(&buffer);
    assert_eq!(daq.controller_state(), ControllerState::Idle);
    assert_eq!(log.commands().last(), Some(&Command::StopAcquisition));

    // session usable afterwards
    daq.snapshot(1, Unit::Millivolts).await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_start_yields_empty_buffer() {
    let (mut daq, _log) = connect(FakeConfig::linear(1)).await;
    let cancel = CancelToken::new();
    cancel.cancel();
    let buffer = daq.free_running(RunLimit::Samples(10), &cancel).await.unwrap();
    assert_eq!(buffer.status, AcquisitionStatus::Cancelled);
    assert!(buffer.is_empty());
    assert_eq!(daq.controller_state(), ControllerState::Idle);
}

#[tokio::test]
async fn test_cancel_wakes_polling_run() {
    let config = FakeConfig {
        empty_frames: usize::MAX,
        ..FakeConfig::linear(1)
    };
    let session = session_config().with_poll_interval(Duration::from_secs(3600));
    let (mut daq, _log) = connect_with(config, session).await;

    let cancel = CancelToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trip.cancel();
    });
    let buffer = tokio::time::timeout(Duration::from_secs(5), daq.free_running(RunLimit::Samples(10), &cancel))
        .await
        .expect("cancel should interrupt the poll sleep")
        .unwrap();
    assert_eq!(buffer.status, AcquisitionStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_codec_timeout_mid_run_is_incomplete() {
    let config = FakeConfig {
        silent_after_frames: Some(2),
        ..FakeConfig::linear(2)
    };
    let (mut daq, log) = connect(config).await;
    let buffer = daq
        .free_running(RunLimit::Samples(100), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(buffer.status, AcquisitionStatus::Incomplete);
    assert_eq!(buffer.len(), 16);
    assert_in_order(&buffer);
    assert_eq!(daq.controller_state(), ControllerState::Idle);
    assert_eq!(log.commands().last(), Some(&Command::StopAcquisition));
}

#[tokio::test]
async fn test_device_ending_run_early_is_incomplete() {
    let config = FakeConfig {
        end_after_samples: Some(11),
        ..FakeConfig::linear(1)
    };
    let (mut daq, _log) = connect(config).await;
    let buffer = daq
        .free_running(RunLimit::Samples(50), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(buffer.status, AcquisitionStatus::Incomplete);
    assert_eq!(buffer.len(), 11);
    assert_in_order(&buffer);
}

#[tokio::test]
async fn test_out_of_sequence_frame_fails_run() {
    let config = FakeConfig {
        skip_sequence_at: Some(1),
        ..FakeConfig::linear(1)
    };
    let (mut daq, log) = connect(config).await;
    let result = daq.free_running(RunLimit::Samples(40), &CancelToken::new()).await;
    assert!(matches!(result, Err(DaqError::Transfer(_))), "{:?}", result);
    assert_eq!(daq.controller_state(), ControllerState::Idle);
    assert_eq!(log.commands().last(), Some(&Command::StopAcquisition));
}

#[tokio::test]
async fn test_device_error_mid_run_is_propagated() {
    let config = FakeConfig {
        error_on: Some((CommandType::StartAcquisition, 6, "not armed".to_string())),
        ..FakeConfig::linear(1)
    };
    let (mut daq, log) = connect(config).await;
    let result = daq.free_running(RunLimit::Samples(4), &CancelToken::new()).await;
    assert!(matches!(result, Err(DaqError::Device { code: 6, .. })));
    assert_eq!(daq.controller_state(), ControllerState::Idle);
    assert_eq!(log.count(CommandType::ReadFrame), 0);
    assert_eq!(log.commands().last(), Some(&Command::StopAcquisition));
}

#[tokio::test]
async fn test_triggered_run_waits_for_first_sample() {
    let config = FakeConfig {
        empty_frames: 5,
        ..FakeConfig::linear(2)
    };
    let (mut daq, log) = connect(config).await;
    let trigger = TriggerConfig {
        edge: TriggerEdge::Falling,
        timeout: Duration::from_secs(2),
    };
    let buffer = daq
        .triggered(RunLimit::Samples(12), trigger, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(buffer.mode, RunMode::Triggered);
    assert_eq!(buffer.status, AcquisitionStatus::Complete);
    assert_eq!(buffer.len(), 12);
    assert_in_order(&buffer);
    assert_eq!(
        log.commands()[0],
        Command::ArmTrigger {
            sample_count: 12,
            edge: TriggerEdge::Falling
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_trigger_timeout() {
    let config = FakeConfig {
        trigger_fires: false,
        ..FakeConfig::linear(1)
    };
    let (mut daq, log) = connect(config).await;
    let trigger = TriggerConfig {
        edge: TriggerEdge::Rising,
        timeout: Duration::from_secs(2),
    };

    let started = tokio::time::Instant::now();
    let result = daq
        .triggered(RunLimit::Samples(10), trigger, &CancelToken::new())
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(DaqError::TriggerTimeout(d)) if d == Duration::from_secs(2)));
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_100), "{:?}", elapsed);
    assert_eq!(daq.controller_state(), ControllerState::Idle);
    assert_eq!(log.commands().last(), Some(&Command::StopAcquisition));
}

#[tokio::test]
async fn test_converted_buffer() {
    let (mut daq, _log) = connect(FakeConfig::linear(2)).await;
    let buffer = daq
        .free_running(RunLimit::Samples(3), &CancelToken::new())
        .await
        .unwrap();
    let converted = daq.convert_buffer(&buffer, Unit::Millivolts).unwrap();
    assert_eq!(converted.len(), 3);
    let expected = (frame_code(1, 2) as f64 - 101.0) * optodaq_lib::constants::CODE_TO_MV;
    assert!(approx_eq(converted[2][1], expected, 1e-12));
}

#[tokio::test]
async fn test_buffer_serializes() {
    let (mut daq, _log) = connect(FakeConfig::linear(1)).await;
    let buffer = daq
        .free_running(RunLimit::Samples(2), &CancelToken::new())
        .await
        .unwrap();
    let json = serde_json::to_value(&buffer).unwrap();
    assert_eq!(json["status"], "Complete");
    assert_eq!(json["mode"], "FreeRunning");
    assert_eq!(json["samples"].as_array().unwrap().len(), 2);
}
