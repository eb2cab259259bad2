use std::time::Duration;

use scope_acquire::simulator::signal_code;
use scope_acquire::{
    to_voltage, AcquisitionConfig, AcquisitionController, BlockRequest, CaptureSession, Channel,
    ChannelConfig, DeviceHandle, ErrorCategory, PollControl, PollPolicy, RapidBlockRequest,
    SimulatedScope, StreamingRequest, TimeUnit, TriggerConfig, VoltageRange,
};

fn fast_polling() -> PollPolicy {
    PollPolicy::fixed(Duration::from_micros(50), Duration::from_secs(5))
}

fn channel_a() -> AcquisitionConfig {
    AcquisitionConfig::new()
        .channel(ChannelConfig::on(Channel::A))
        .poll_policy(fast_polling())
}

#[test]
fn test_ten_bit_triggered_block() {
    let driver = SimulatedScope::new().polls_until_ready(5);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);

    let config = AcquisitionConfig::new()
        .resolution_bits(10)
        .channel(ChannelConfig::on(Channel::A).range(VoltageRange::symmetric_mv(5000)))
        .trigger(TriggerConfig::start_capturing_when(Channel::A, 1000.0).rising_edge())
        .poll_policy(fast_polling());
    let dataset = controller
        .run_block_capture(&config, &BlockRequest::new(1_000_000, 9_000_000))
        .unwrap();

    assert_eq!(dataset.len(), 10_000_000);
    assert_eq!(dataset.pre_trigger_samples(), 1_000_000);
    let trace = dataset.trace(Channel::A).unwrap();
    assert_eq!(trace.len(), 10_000_000);
    assert!(trace.iter().all(|mv| (-5000.0..=5000.0).contains(mv)));
    assert!(!probe.is_open());
}

#[test]
fn test_block_length_follows_driver_count() {
    let short = SimulatedScope::new().samples_collected(7_500);
    let mut controller = AcquisitionController::new(short);
    let dataset = controller
        .run_block_capture(&channel_a(), &BlockRequest::new(0, 10_000))
        .unwrap();
    assert_eq!(dataset.len(), 7_500);

    let generous = SimulatedScope::new().samples_collected(50_000);
    let mut controller = AcquisitionController::new(generous);
    let dataset = controller
        .run_block_capture(&channel_a(), &BlockRequest::new(0, 10_000))
        .unwrap();
    assert_eq!(dataset.len(), 10_000);
}

#[test]
fn test_rapid_block_ten_segments() {
    let driver = SimulatedScope::new().overflow_on_segment(4);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);

    let datasets = controller
        .run_rapid_block_capture(&channel_a(), &RapidBlockRequest::new(100, 400, 10))
        .unwrap();

    assert_eq!(datasets.len(), 10);
    for (segment, dataset) in datasets.iter().enumerate() {
        assert_eq!(dataset.segment(), segment as u32);
        assert_eq!(dataset.len(), 500);
        assert_eq!(dataset.is_overflowed(), segment == 4, "segment {segment}");
    }
    assert_ne!(
        datasets[0].trace(Channel::A).unwrap()[10],
        datasets[1].trace(Channel::A).unwrap()[10]
    );
    assert_eq!(probe.memory_segments(), 10);
    assert_eq!(probe.registered_buffers(), 0);
}

#[test]
fn test_streaming_hand_off_without_drops() {
    let driver = SimulatedScope::new().streaming(300, 3);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);
    let request = StreamingRequest::new(1, TimeUnit::Microseconds, 1000)
        .max_buffers(8)
        .ring_slots(2)
        .poll_interval(Duration::ZERO);

    let mut most_filled = 0;
    let dataset = controller
        .run_streaming_capture_with(&channel_a(), &request, |progress| {
            assert!(progress.buffers_filled <= 8);
            assert!(progress.buffers_filled >= most_filled);
            most_filled = progress.buffers_filled;
            PollControl::Continue
        })
        .unwrap();

    assert_eq!(most_filled, 7);
    assert_eq!(probe.dropped_samples(), 0);
    let trace = dataset.trace(Channel::A).unwrap();
    assert_eq!(trace.len(), 8000);
    for (i, &mv) in trace.iter().enumerate() {
        let expected = to_voltage(signal_code(Channel::A, i as u64, 0, 32512), 32512, 5000.0);
        assert!((mv - expected).abs() < 1e-9, "sample {i}: {mv} != {expected}");
    }
}

#[test]
fn test_capacity_error_before_arming() {
    let driver = SimulatedScope::new().memory_samples(1_000_000);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);

    let error = controller
        .run_block_capture(&channel_a(), &BlockRequest::new(600_000, 600_000))
        .unwrap_err();
    assert_eq!(error.category(), ErrorCategory::Configuration);
    assert_eq!(probe.calls_named("run_block"), 0);
    assert_eq!(probe.calls_named("set_data_buffer"), 0);
    assert!(!probe.is_open());
}

#[test]
fn test_oversized_window_is_a_configuration_error() {
    let driver = SimulatedScope::new();
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);

    let error = controller
        .run_block_capture(&channel_a(), &BlockRequest::new(u64::MAX, 1))
        .unwrap_err();
    assert_eq!(error.category(), ErrorCategory::Configuration);
    assert_eq!(error.operation(), "arm_block");
    assert_eq!(probe.calls_named("run_block"), 0);
    assert!(!probe.is_open());
}

#[test]
fn test_abandoned_stream_closes_device() {
    let driver = SimulatedScope::new().streaming(250, 1);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);
    let request = StreamingRequest::new(1, TimeUnit::Microseconds, 1000)
        .max_buffers(100)
        .poll_interval(Duration::ZERO);

    let error = controller
        .run_streaming_capture_with(&channel_a(), &request, |progress| {
            if progress.buffers_filled >= 2 {
                PollControl::Abandon
            } else {
                PollControl::Continue
            }
        })
        .unwrap_err();

    assert_eq!(error.category(), ErrorCategory::Cancelled);
    assert!(!probe.is_open());
    assert!(!probe.is_running());
    assert_eq!(probe.registered_buffers(), 0);
}

#[test]
fn test_disable_all_channels_is_idempotent() {
    let mut driver = SimulatedScope::new();
    let mut device = DeviceHandle::open(&mut driver, None).unwrap();
    let mut session = CaptureSession::new(&mut device).unwrap();
    session.set_channel(ChannelConfig::on(Channel::C)).unwrap();

    session.disable_all_channels().unwrap();
    let once = session.device().channel_configs().clone();
    session.disable_all_channels().unwrap();
    assert_eq!(session.device().channel_configs(), &once);
    assert!(session.device().enabled_channels().is_empty());
}
