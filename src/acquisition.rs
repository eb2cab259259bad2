//! End-to-end capture runs.
//!
//! [`AcquisitionController`] owns a driver and performs complete runs on it:
//! connect, configure, arm, collect, retrieve, scale, disconnect. The device
//! is disconnected on every exit path; a failed run reports the operation
//! that failed and the device status at that point.

use std::fmt;

use crate::capture::{BlockRequest, RapidBlockRequest, StreamingRequest};
use crate::channel_config::ChannelConfig;
use crate::dataset::WaveformDataset;
use crate::device::{DeviceError, DeviceHandle, DeviceStatus};
use crate::driver::ScopeDriver;
use crate::polling::PollPolicy;
use crate::session::{CaptureSession, PollControl, SessionError, StreamingProgress};
use crate::trigger_config::TriggerConfig;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Configuration,
    Arm,
    BufferBind,
    Timeout,
    Cancelled,
    Calibration,
    Driver,
}

impl ErrorCategory {
    pub(crate) fn of_device_error(error: &DeviceError) -> Self {
        match error {
            DeviceError::Connection(_) => Self::Connection,
            DeviceError::UnsupportedResolution { .. } | DeviceError::CaptureArmed => {
                Self::Configuration
            }
            DeviceError::Driver { source, .. } if source.is_connection_loss() => Self::Connection,
            DeviceError::Driver { .. } => Self::Driver,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Configuration => "configuration",
            Self::Arm => "arm",
            Self::BufferBind => "buffer-bind",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Calibration => "calibration",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-level settings applied at the start of every run.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    /// Serial of the device to open; the first one found if `None`.
    pub serial: Option<String>,
    pub resolution_bits: u8,
    pub channels: Vec<ChannelConfig>,
    pub trigger: TriggerConfig,
    pub poll: PollPolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            serial: None,
            resolution_bits: 8,
            channels: Vec::new(),
            trigger: TriggerConfig::disabled(),
            poll: PollPolicy::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn resolution_bits(mut self, bits: u8) -> Self {
        self.resolution_bits = bits;
        self
    }

    /// Enable (or explicitly disable) one channel. Channels not mentioned stay off.
    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.channels.retain(|c| c.channel != config.channel);
        self.channels.push(config);
        self
    }

    pub fn trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionFailure {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, thiserror::Error)]
#[error("{operation} failed (device {device_status}): {source}")]
pub struct AcquisitionError {
    operation: &'static str,
    device_status: DeviceStatus,
    #[source]
    source: AcquisitionFailure,
}

impl AcquisitionError {
    fn new(
        operation: &'static str,
        device_status: DeviceStatus,
        source: impl Into<AcquisitionFailure>,
    ) -> Self {
        Self {
            operation,
            device_status,
            source: source.into(),
        }
    }

    /// Driver call or run step that failed.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Device status when the failure was observed.
    pub fn device_status(&self) -> DeviceStatus {
        self.device_status
    }

    pub fn failure(&self) -> &AcquisitionFailure {
        &self.source
    }

    pub fn category(&self) -> ErrorCategory {
        match &self.source {
            AcquisitionFailure::Device(error) => ErrorCategory::of_device_error(error),
            AcquisitionFailure::Session(error) => error.category(),
        }
    }
}

/// Runs complete captures on the driver it owns.
#[derive(Debug)]
pub struct AcquisitionController<D: ScopeDriver> {
    driver: D,
}

impl<D: ScopeDriver> AcquisitionController<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Connect, capture one block, scale it and disconnect.
    pub fn run_block_capture(
        &mut self,
        config: &AcquisitionConfig,
        request: &BlockRequest,
    ) -> Result<WaveformDataset, AcquisitionError> {
        self.run("block", config, |session| {
            session.arm_block(request)?;
            session.wait_until_ready(&config.poll)?;
            session.retrieve(
                0,
                request.total_samples(),
                request.downsampling,
                request.segment,
            )?;
            single(session)
        })
    }

    /// Connect, capture `request.segments` segments, scale each and disconnect.
    ///
    /// The datasets come back in segment order, each with its own overflow flags.
    pub fn run_rapid_block_capture(
        &mut self,
        config: &AcquisitionConfig,
        request: &RapidBlockRequest,
    ) -> Result<Vec<WaveformDataset>, AcquisitionError> {
        self.run("rapid-block", config, |session| {
            session.arm_rapid_block(request)?;
            session.wait_until_ready(&config.poll)?;
            session.retrieve_bulk(0, request.segments.saturating_sub(1))?;
            session.scale()
        })
    }

    pub fn run_streaming_capture(
        &mut self,
        config: &AcquisitionConfig,
        request: &StreamingRequest,
    ) -> Result<WaveformDataset, AcquisitionError> {
        self.run_streaming_capture_with(config, request, |_| PollControl::Continue)
    }

    /// Streaming run with an observer that sees progress and may abandon the run.
    ///
    /// The drained buffers are concatenated in the order they were registered.
    pub fn run_streaming_capture_with(
        &mut self,
        config: &AcquisitionConfig,
        request: &StreamingRequest,
        observer: impl FnMut(&StreamingProgress) -> PollControl,
    ) -> Result<WaveformDataset, AcquisitionError> {
        self.run("streaming", config, |session| {
            session.arm_streaming(request)?;
            session.collect_streaming(&config.poll, observer)?;
            session.retrieve_streaming()?;
            single(session)
        })
    }

    fn run<T>(
        &mut self,
        mode: &'static str,
        config: &AcquisitionConfig,
        capture: impl FnOnce(&mut CaptureSession<'_, '_, D>) -> Result<T, SessionError>,
    ) -> Result<T, AcquisitionError> {
        let span = tracing::info_span!(
            "acquisition",
            mode,
            serial = config.serial.as_deref().unwrap_or("<any>")
        );
        let _entered = span.enter();
        log::info!("Starting {} capture", mode);

        let mut device = DeviceHandle::open(&mut self.driver, config.serial.as_deref())
            .map_err(|e| AcquisitionError::new("open_unit", DeviceStatus::Closed, e))?;

        let opened_status = device.status();
        let outcome = match CaptureSession::new(&mut device) {
            Ok(mut session) => configure(&mut session, config)
                .and_then(|()| capture(&mut session))
                .map_err(|e| {
                    let operation = e.operation().unwrap_or(mode);
                    AcquisitionError::new(operation, session.device_status(), e)
                }),
            Err(e) => Err(AcquisitionError::new(mode, opened_status, e)),
        };

        let status = device.status();
        let closed = device.close();
        match (outcome, closed) {
            (Ok(value), Ok(())) => {
                log::info!("{} capture finished", mode);
                Ok(value)
            }
            (Ok(_), Err(e)) => Err(AcquisitionError::new("close_unit", status, e)),
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    log::warn!("Closing device after failed run also failed: {}", close_error);
                }
                log::info!("{} capture failed: {}", mode, e);
                Err(e)
            }
        }
    }
}

fn configure<D: ScopeDriver>(
    session: &mut CaptureSession<'_, '_, D>,
    config: &AcquisitionConfig,
) -> Result<(), SessionError> {
    session.set_resolution(config.resolution_bits)?;
    session.disable_all_channels()?;
    for channel in &config.channels {
        session.set_channel(*channel)?;
    }
    session.set_trigger(config.trigger)
}

/// Scale a capture that produced exactly one result.
fn single<D: ScopeDriver>(
    session: &mut CaptureSession<'_, '_, D>,
) -> Result<WaveformDataset, SessionError> {
    let state = session.state().clone();
    session
        .scale()?
        .into_iter()
        .next()
        .ok_or(SessionError::InvalidState {
            operation: "scale",
            state,
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel_config::{Channel, VoltageRange};
    use crate::driver::{DriverError, TimeUnit};
    use crate::simulator::SimulatedScope;

    fn config() -> AcquisitionConfig {
        AcquisitionConfig::new()
            .channel(ChannelConfig::on(Channel::A).range(VoltageRange::symmetric_mv(2000)))
            .poll_policy(PollPolicy::fixed(
                Duration::from_micros(50),
                Duration::from_secs(5),
            ))
    }

    #[test]
    fn test_channel_builder_replaces() {
        let config = AcquisitionConfig::new()
            .channel(ChannelConfig::on(Channel::A))
            .channel(ChannelConfig::on(Channel::B))
            .channel(ChannelConfig::off(Channel::A));
        assert_eq!(config.channels.len(), 2);
        assert!(!config.channels[1].enabled);
        assert_eq!(config.resolution_bits, 8);
    }

    #[test]
    fn test_block_run_closes_device() {
        let driver = SimulatedScope::new();
        let probe = driver.probe();
        let mut controller = AcquisitionController::new(driver);

        let dataset = controller
            .run_block_capture(&config(), &BlockRequest::new(100, 400))
            .unwrap();
        assert_eq!(dataset.len(), 500);
        assert_eq!(dataset.pre_trigger_samples(), 100);
        assert!(dataset
            .trace(Channel::A)
            .unwrap()
            .iter()
            .all(|mv| mv.abs() <= 2000.0));
        assert!(!probe.is_open());
        assert_eq!(probe.registered_buffers(), 0);
    }

    #[test]
    fn test_failure_names_operation() {
        let driver = SimulatedScope::new().fail_on("run_block", DriverError::Status(0x1d));
        let probe = driver.probe();
        let mut controller = AcquisitionController::new(driver);

        let error = controller
            .run_block_capture(&config(), &BlockRequest::new(0, 100))
            .unwrap_err();
        assert_eq!(error.operation(), "run_block");
        assert_eq!(error.device_status(), DeviceStatus::Open);
        assert_eq!(error.category(), ErrorCategory::Arm);
        assert!(!probe.is_open());
        assert_eq!(probe.registered_buffers(), 0);
    }

    #[test]
    fn test_connection_failure() {
        let mut controller = AcquisitionController::new(SimulatedScope::new());
        let error = controller
            .run_block_capture(&config().serial("XX999/0000"), &BlockRequest::new(0, 100))
            .unwrap_err();
        assert_eq!(error.category(), ErrorCategory::Connection);
        assert_eq!(error.device_status(), DeviceStatus::Closed);
    }

    #[test]
    fn test_lost_connection_reports_error_status() {
        let driver = SimulatedScope::new().fail_on("is_ready", DriverError::ConnectionLost);
        let mut controller = AcquisitionController::new(driver);
        let error = controller
            .run_block_capture(&config(), &BlockRequest::new(0, 100))
            .unwrap_err();
        assert_eq!(error.operation(), "is_ready");
        assert_eq!(error.device_status(), DeviceStatus::Error);
        assert_eq!(error.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_device_reusable_after_run() {
        let driver = SimulatedScope::new().streaming(500, 1);
        let probe = driver.probe();
        let mut controller = AcquisitionController::new(driver);
        let request = StreamingRequest::new(1, TimeUnit::Microseconds, 1000)
            .max_buffers(3)
            .poll_interval(Duration::ZERO);

        let first = controller.run_streaming_capture(&config(), &request).unwrap();
        let second = controller.run_streaming_capture(&config(), &request).unwrap();
        assert_eq!(first.len(), 3000);
        assert_eq!(first, second);
        assert_eq!(probe.calls_named("open_unit"), 2);
        assert_eq!(probe.calls_named("close_unit"), 2);
    }
}
