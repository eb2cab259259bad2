//! One capture on one device, from configuration to scaled data.
//!
//! A session mutably borrows its [`DeviceHandle`], so no second session or
//! stray configuration call can reach the device while it runs. States move
//! `Configured -> Armed -> Collecting -> Ready -> Retrieved -> Scaled`; any
//! driver failure moves to `Failed` after the device is stopped and every
//! registered buffer released. Dropping a session does the same cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::thread;

use crate::acquisition::ErrorCategory;
use crate::buffer_pool::{BufferBindError, BufferPool, BufferRole};
use crate::calibration::{scale_capture, CalibrationError};
use crate::capture::{
    BlockRequest, CaptureMode, CaptureRequest, CaptureResult, DownSampling, RapidBlockRequest,
    StreamingRequest, StreamingStop, TimebaseChoice,
};
use crate::channel_config::{Channel, ChannelConfig};
use crate::configurator::{self, ConfigError};
use crate::dataset::WaveformDataset;
use crate::device::{DeviceError, DeviceHandle, DeviceStatus};
use crate::driver::{
    DownSampleMode, DriverError, Resolution, ScopeDriver, StreamingSettings, TimebaseInfo,
    ValuesInfo,
};
use crate::polling::{PollPolicy, PollTimeout, Poller};
use crate::trigger_config::TriggerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Armed,
    Collecting,
    Ready,
    Retrieved,
    Scaled,
    Failed {
        operation: &'static str,
        reason: String,
    },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => f.write_str("configured"),
            Self::Armed => f.write_str("armed"),
            Self::Collecting => f.write_str("collecting"),
            Self::Ready => f.write_str("ready"),
            Self::Retrieved => f.write_str("retrieved"),
            Self::Scaled => f.write_str("scaled"),
            Self::Failed { operation, reason } => write!(f, "failed in {operation}: {reason}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Device is {status}")]
    DeviceUnavailable { status: DeviceStatus },

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{operation}: {reason}")]
    InvalidRequest {
        operation: &'static str,
        reason: String,
    },

    #[error("Capture needs {requested} samples but the device holds {capacity}")]
    CapacityExceeded { requested: u64, capacity: u64 },

    #[error("Cannot split memory into {segments} segments")]
    InsufficientMemory {
        segments: u32,
        #[source]
        source: DriverError,
    },

    #[error("Arming failed in {operation}: {source}")]
    Arm {
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    BufferBind(#[from] BufferBindError),

    #[error("{operation} timed out: {timeout}")]
    Timeout {
        operation: &'static str,
        #[source]
        timeout: PollTimeout,
    },

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("Capture abandoned")]
    Cancelled,
}

impl SessionError {
    /// Driver call or session step the error came from, where known.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::InvalidState { operation, .. }
            | Self::InvalidRequest { operation, .. }
            | Self::Arm { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Driver { operation, .. } => Some(*operation),
            Self::Configuration(ConfigError::Driver { operation, .. })
            | Self::Device(DeviceError::Driver { operation, .. }) => Some(*operation),
            Self::InsufficientMemory { .. } => Some("set_memory_segments"),
            Self::BufferBind(_) => Some("set_data_buffer"),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        let driver = |source: &DriverError, otherwise| {
            if source.is_connection_loss() {
                ErrorCategory::Connection
            } else {
                otherwise
            }
        };
        match self {
            Self::InvalidState { .. }
            | Self::InvalidRequest { .. }
            | Self::CapacityExceeded { .. }
            | Self::InsufficientMemory { .. } => ErrorCategory::Configuration,
            Self::DeviceUnavailable { .. } => ErrorCategory::Connection,
            Self::Configuration(ConfigError::Driver { source, .. }) => {
                driver(source, ErrorCategory::Configuration)
            }
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Device(error) => ErrorCategory::of_device_error(error),
            Self::Arm { source, .. } => driver(source, ErrorCategory::Arm),
            Self::BufferBind(BufferBindError::Driver { source, .. }) => {
                driver(source, ErrorCategory::BufferBind)
            }
            Self::BufferBind(_) => ErrorCategory::BufferBind,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Driver { source, .. } => driver(source, ErrorCategory::Driver),
            Self::Calibration(_) => ErrorCategory::Calibration,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Errors caught before the device was touched leave the session as it was.
    fn leaves_session_usable(&self) -> bool {
        match self {
            Self::InvalidState { .. }
            | Self::InvalidRequest { .. }
            | Self::CapacityExceeded { .. }
            | Self::InsufficientMemory { .. } => true,
            Self::Configuration(error) => !matches!(error, ConfigError::Driver { .. }),
            Self::Device(error) => matches!(
                error,
                DeviceError::UnsupportedResolution { .. } | DeviceError::CaptureArmed
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingProgress {
    /// Samples handed over by this poll.
    pub new_samples: usize,
    pub total_samples: u64,
    pub buffers_filled: u32,
    pub auto_stopped: bool,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamingPoll {
    /// The driver had nothing yet; poll again.
    NotReady,
    Progress(StreamingProgress),
}

/// Answer of a streaming observer after each poll with progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Abandon,
}

/// Parameters fixed when a capture is armed.
#[derive(Debug, Clone, Copy)]
struct ArmedCapture {
    mode: CaptureMode,
    pre_trigger: u64,
    post_trigger: u64,
    downsampling: DownSampling,
    first_segment: u32,
    segments: u32,
    /// Interval between raw samples.
    sample_interval_s: f64,
    resolution: Resolution,
}

impl ArmedCapture {
    fn total(&self) -> u64 {
        self.pre_trigger.saturating_add(self.post_trigger)
    }

    fn buffer_len(&self) -> usize {
        self.downsampling.output_len(self.total()) as usize
    }

    fn has_segment(&self, segment: u32) -> bool {
        segment
            .checked_sub(self.first_segment)
            .is_some_and(|offset| offset < self.segments)
    }
}

#[derive(Debug)]
struct StreamRun {
    request: StreamingRequest,
    /// Buffers filled and drained so far.
    cursor: u32,
    samples: BTreeMap<Channel, Vec<i16>>,
    minimums: BTreeMap<Channel, Vec<i16>>,
    overflow: BTreeSet<Channel>,
    total_samples: u64,
    triggered_at: Option<u64>,
    auto_stopped: bool,
}

impl StreamRun {
    fn new(request: StreamingRequest) -> Self {
        Self {
            request,
            cursor: 0,
            samples: BTreeMap::new(),
            minimums: BTreeMap::new(),
            overflow: BTreeSet::new(),
            total_samples: 0,
            triggered_at: None,
            auto_stopped: false,
        }
    }

    fn slot(&self) -> u32 {
        self.cursor % self.request.ring_slots
    }
}

pub struct CaptureSession<'s, 'd, D: ScopeDriver> {
    device: &'s mut DeviceHandle<'d, D>,
    pool: BufferPool,
    state: SessionState,
    armed: Option<ArmedCapture>,
    stream: Option<StreamRun>,
    results: Vec<CaptureResult>,
}

impl<'s, 'd, D: ScopeDriver> CaptureSession<'s, 'd, D> {
    pub fn new(device: &'s mut DeviceHandle<'d, D>) -> Result<Self, SessionError> {
        match device.status() {
            DeviceStatus::Open => {}
            status => return Err(SessionError::DeviceUnavailable { status }),
        }
        Ok(Self {
            device,
            pool: BufferPool::new(),
            state: SessionState::Configured,
            armed: None,
            stream: None,
            results: Vec::new(),
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn device(&self) -> &DeviceHandle<'d, D> {
        self.device
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.device.status()
    }

    pub fn registered_buffers(&self) -> usize {
        self.pool.registered_count()
    }

    /// Results retrieved so far, in retrieval order.
    pub fn results(&self) -> &[CaptureResult] {
        &self.results
    }

    fn transition(&mut self, state: SessionState) {
        log::debug!("Session {} -> {}", self.state, state);
        self.state = state;
    }

    fn check_state(
        &self,
        operation: &'static str,
        allowed: impl Fn(&SessionState) -> bool,
    ) -> Result<(), SessionError> {
        if allowed(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state.clone(),
            })
        }
    }

    /// Stop the device and release every buffer. Safe to call repeatedly.
    fn teardown(&mut self) {
        if self.device.is_armed() || self.device.status() == DeviceStatus::Streaming {
            if let Err(e) = self.device.call("stop", |driver, handle| driver.stop(handle)) {
                log::warn!("Stopping capture during teardown failed: {}", e);
            }
            self.device.set_armed(false);
            if self.device.status() == DeviceStatus::Streaming {
                self.device.set_status(DeviceStatus::Open);
            }
        }
        if !self.pool.is_empty() {
            if let Err(e) = self.pool.release_all(self.device) {
                log::warn!("Releasing buffers during teardown failed: {}", e);
            }
        }
    }

    fn fail(&mut self, operation: &'static str, error: SessionError) -> SessionError {
        log::warn!("{} failed, tearing down: {}", operation, error);
        self.teardown();
        self.state = SessionState::Failed {
            operation,
            reason: error.to_string(),
        };
        error
    }

    fn driver_failed(&mut self, operation: &'static str, source: DriverError) -> SessionError {
        self.fail(operation, SessionError::Driver { operation, source })
    }

    fn arm_failed(&mut self, operation: &'static str, source: DriverError) -> SessionError {
        self.fail(operation, SessionError::Arm { operation, source })
    }

    fn timed_out(&mut self, operation: &'static str, timeout: PollTimeout) -> SessionError {
        self.fail(operation, SessionError::Timeout { operation, timeout })
    }

    /// Hand back `error`, failing the session unless nothing was touched.
    fn reject(&mut self, operation: &'static str, error: SessionError) -> SessionError {
        if error.leaves_session_usable() {
            log::debug!("{} rejected: {}", operation, error);
            error
        } else {
            self.fail(operation, error)
        }
    }

    pub fn set_resolution(&mut self, bits: u8) -> Result<(), SessionError> {
        self.check_state("set_resolution", |s| *s == SessionState::Configured)?;
        self.device
            .set_resolution(bits)
            .map_err(|e| self.reject("set_resolution", e.into()))
    }

    pub fn disable_all_channels(&mut self) -> Result<(), SessionError> {
        self.check_state("disable_all_channels", |s| *s == SessionState::Configured)?;
        configurator::disable_all_channels(self.device)
            .map_err(|e| self.reject("disable_all_channels", e.into()))
    }

    pub fn set_channel(&mut self, config: ChannelConfig) -> Result<(), SessionError> {
        self.check_state("set_channel", |s| *s == SessionState::Configured)?;
        configurator::set_channel(self.device, config)
            .map_err(|e| self.reject("set_channel", e.into()))
    }

    pub fn set_trigger(&mut self, trigger: TriggerConfig) -> Result<(), SessionError> {
        self.check_state("set_trigger", |s| *s == SessionState::Configured)?;
        configurator::set_trigger(self.device, trigger)
            .map_err(|e| self.reject("set_trigger", e.into()))
    }

    /// Device-independent checks shared by every arm call. Returns the enabled channels.
    fn prepare(
        &self,
        operation: &'static str,
        request: CaptureRequest,
    ) -> Result<Vec<Channel>, SessionError> {
        self.check_state(operation, |s| *s == SessionState::Configured)?;
        request
            .validate()
            .map_err(|reason| SessionError::InvalidRequest { operation, reason })?;
        let channels = self.device.enabled_channels();
        if channels.is_empty() {
            return Err(SessionError::InvalidRequest {
                operation,
                reason: "no channel is enabled".to_string(),
            });
        }
        Ok(channels)
    }

    fn resolve_timebase(
        &mut self,
        choice: TimebaseChoice,
        samples: u64,
        segment: u32,
    ) -> Result<TimebaseInfo, SessionError> {
        match choice {
            TimebaseChoice::Fastest => {
                let enabled = self.device.enabled_channels();
                let resolution = self.device.resolution();
                self.device
                    .call("get_fastest_timebase", |driver, handle| {
                        driver.get_fastest_timebase(handle, &enabled, resolution)
                    })
                    .map_err(|source| SessionError::Arm {
                        operation: "get_fastest_timebase",
                        source,
                    })
            }
            TimebaseChoice::Explicit(timebase) => self
                .device
                .call("get_timebase", |driver, handle| {
                    driver.get_timebase(handle, timebase, samples, segment)
                })
                .map_err(|source| match source {
                    DriverError::TooManySamples {
                        requested,
                        available,
                    } => SessionError::CapacityExceeded {
                        requested,
                        capacity: available,
                    },
                    source => SessionError::Arm {
                        operation: "get_timebase",
                        source,
                    },
                }),
        }
    }

    /// Allocate a buffer per channel and role at `index`.
    fn allocate(&mut self, channels: &[Channel], index: u32, len: usize, mode: DownSampleMode) {
        for &channel in channels {
            for &role in mode.roles() {
                self.pool.allocate(channel, len, index, role);
            }
        }
    }

    fn register_index(
        &mut self,
        index: u32,
        required: usize,
        mode: DownSampleMode,
    ) -> Result<(), BufferBindError> {
        for key in self.pool.keys_at(index) {
            self.pool.register(self.device, key, required, mode)?;
        }
        Ok(())
    }

    fn start_block(
        &mut self,
        pre_trigger: u64,
        post_trigger: u64,
        timebase: u32,
        segment: u32,
    ) -> Result<(), SessionError> {
        let estimate = self
            .device
            .call("run_block", |driver, handle| {
                driver.run_block(handle, pre_trigger, post_trigger, timebase, segment)
            })
            .map_err(|source| self.arm_failed("run_block", source))?;
        self.device.set_armed(true);
        log::debug!("Block capture armed, done in about {:?}", estimate);
        Ok(())
    }

    /// Arm a single block capture.
    ///
    /// The request is checked against the device memory before anything is
    /// armed; a capture that cannot fit leaves the session `Configured`.
    pub fn arm_block(&mut self, request: &BlockRequest) -> Result<(), SessionError> {
        const OPERATION: &str = "arm_block";
        let channels = self.prepare(OPERATION, CaptureRequest::Block(*request))?;
        let total = request.total_samples();

        let capacity = self
            .device
            .memory_capacity()
            .map_err(|source| self.driver_failed("memory_capacity", source))?;
        if total > capacity {
            return Err(self.reject(
                OPERATION,
                SessionError::CapacityExceeded {
                    requested: total,
                    capacity,
                },
            ));
        }

        let timebase = self
            .resolve_timebase(request.timebase, total, request.segment)
            .map_err(|e| self.reject(OPERATION, e))?;
        let armed = ArmedCapture {
            mode: CaptureMode::Block,
            pre_trigger: request.pre_trigger,
            post_trigger: request.post_trigger,
            downsampling: request.downsampling,
            first_segment: request.segment,
            segments: 1,
            sample_interval_s: timebase.sample_interval_s,
            resolution: self.device.resolution(),
        };

        let mode = request.downsampling.mode;
        self.allocate(&channels, request.segment, armed.buffer_len(), mode);
        self.register_index(request.segment, armed.buffer_len(), mode)
            .map_err(|e| self.fail(OPERATION, e.into()))?;

        self.start_block(
            request.pre_trigger,
            request.post_trigger,
            timebase.timebase,
            request.segment,
        )?;
        log::debug!(
            "Block: {} + {} samples on {:?}, timebase {} ({} s)",
            request.pre_trigger,
            request.post_trigger,
            channels,
            timebase.timebase,
            timebase.sample_interval_s
        );
        self.armed = Some(armed);
        self.transition(SessionState::Armed);
        Ok(())
    }

    /// Arm a rapid-block capture of `request.segments` segments.
    pub fn arm_rapid_block(&mut self, request: &RapidBlockRequest) -> Result<(), SessionError> {
        const OPERATION: &str = "arm_rapid_block";
        let channels = self.prepare(OPERATION, CaptureRequest::RapidBlock(*request))?;
        let total = request.total_samples();
        let segments = request.segments;

        let per_segment = match self.device.call("set_memory_segments", |driver, handle| {
            driver.set_memory_segments(handle, segments)
        }) {
            Ok(per_segment) => per_segment,
            Err(source @ DriverError::InsufficientMemory { .. }) => {
                return Err(self.reject(
                    OPERATION,
                    SessionError::InsufficientMemory { segments, source },
                ))
            }
            Err(source) => return Err(self.driver_failed("set_memory_segments", source)),
        };
        if total > per_segment {
            // Undo the split before rejecting.
            self.device
                .call("set_memory_segments", |driver, handle| {
                    driver.set_memory_segments(handle, 1)
                })
                .map_err(|source| self.driver_failed("set_memory_segments", source))?;
            return Err(self.reject(
                OPERATION,
                SessionError::CapacityExceeded {
                    requested: total,
                    capacity: per_segment,
                },
            ));
        }

        self.device
            .call("set_capture_count", |driver, handle| {
                driver.set_capture_count(handle, segments)
            })
            .map_err(|source| self.arm_failed("set_capture_count", source))?;

        let timebase = self
            .resolve_timebase(request.timebase, total, 0)
            .map_err(|e| self.reject(OPERATION, e))?;
        let armed = ArmedCapture {
            mode: CaptureMode::RapidBlock,
            pre_trigger: request.pre_trigger,
            post_trigger: request.post_trigger,
            downsampling: request.downsampling,
            first_segment: 0,
            segments,
            sample_interval_s: timebase.sample_interval_s,
            resolution: self.device.resolution(),
        };

        let mode = request.downsampling.mode;
        for segment in 0..segments {
            self.allocate(&channels, segment, armed.buffer_len(), mode);
            self.register_index(segment, armed.buffer_len(), mode)
                .map_err(|e| self.fail(OPERATION, e.into()))?;
        }

        self.start_block(
            request.pre_trigger,
            request.post_trigger,
            timebase.timebase,
            0,
        )?;
        log::debug!(
            "Rapid block: {} segments of {} samples, {} buffers registered",
            segments,
            total,
            self.pool.registered_count()
        );
        self.armed = Some(armed);
        self.transition(SessionState::Armed);
        Ok(())
    }

    fn armed_for(&self, operation: &'static str, mode: CaptureMode) -> Result<ArmedCapture, SessionError> {
        self.armed
            .filter(|armed| armed.mode == mode)
            .ok_or_else(|| SessionError::InvalidRequest {
                operation,
                reason: format!("no {mode:?} capture is armed"),
            })
    }

    /// One `is_ready` round-trip. "Not ready" answers are not errors.
    pub fn poll_ready(&mut self) -> Result<bool, SessionError> {
        const OPERATION: &str = "is_ready";
        self.check_state(OPERATION, |s| {
            matches!(s, SessionState::Armed | SessionState::Collecting)
        })?;
        if self.armed.is_some_and(|armed| armed.mode == CaptureMode::Streaming) {
            return Err(SessionError::InvalidRequest {
                operation: OPERATION,
                reason: "streaming captures are polled with poll_streaming".to_string(),
            });
        }

        match self.device.call(OPERATION, |driver, handle| driver.is_ready(handle)) {
            Ok(true) => {
                self.device.set_armed(false);
                self.transition(SessionState::Ready);
                Ok(true)
            }
            Ok(false) => {
                self.collecting();
                Ok(false)
            }
            Err(e) if e.is_transient() => {
                log::trace!("is_ready: {}", e);
                self.collecting();
                Ok(false)
            }
            Err(source) => Err(self.driver_failed(OPERATION, source)),
        }
    }

    fn collecting(&mut self) {
        if self.state == SessionState::Armed {
            self.transition(SessionState::Collecting);
        }
    }

    /// Poll until the block capture is done, giving up after `policy.timeout`.
    pub fn wait_until_ready(&mut self, policy: &PollPolicy) -> Result<(), SessionError> {
        let mut poller = Poller::new(*policy);
        loop {
            if self.poll_ready()? {
                log::debug!("Capture ready after {} polls", poller.attempts() + 1);
                return Ok(());
            }
            poller
                .wait()
                .map_err(|timeout| self.timed_out("is_ready", timeout))?;
        }
    }

    /// Drain the buffers of `segment` into a result.
    fn collect_segment(
        &mut self,
        armed: &ArmedCapture,
        segment: u32,
        info: ValuesInfo,
        start_index: u64,
        count: u64,
        downsampling: DownSampling,
    ) -> CaptureResult {
        let collected = info.samples.min(downsampling.output_len(count));
        let filled = usize::try_from(collected).unwrap_or(usize::MAX);
        self.pool.mark_filled(|key| key.index == segment, filled);

        let mut samples = BTreeMap::new();
        let mut minimums = BTreeMap::new();
        for key in self.pool.keys_at(segment) {
            if let Some(buffer) = self.pool.get_mut(&key) {
                let target = match key.role {
                    BufferRole::Max => &mut samples,
                    BufferRole::Min => &mut minimums,
                };
                target.insert(key.channel, buffer.drain());
            }
        }

        let result = CaptureResult {
            segment,
            resolution: armed.resolution,
            samples,
            minimums,
            overflow: info.overflow,
            samples_collected: collected,
            sample_interval_s: armed.sample_interval_s * f64::from(downsampling.ratio),
            pre_trigger_samples: downsampling
                .output_len(armed.pre_trigger.saturating_sub(start_index))
                .min(collected),
            trigger_index: None,
        };
        if let Some(warning) = result.overflow_warning() {
            log::warn!("{}", warning);
        }
        result
    }

    /// Copy `count` samples from `start_index` of one captured segment.
    ///
    /// `downsampling` must use the mode the buffers were registered with; a
    /// smaller ratio than at arm time only works if the result still fits.
    pub fn retrieve(
        &mut self,
        start_index: u64,
        count: u64,
        downsampling: DownSampling,
        segment: u32,
    ) -> Result<&CaptureResult, SessionError> {
        const OPERATION: &str = "get_values";
        self.check_state(OPERATION, |s| {
            matches!(s, SessionState::Ready | SessionState::Retrieved)
        })?;
        let armed = self
            .armed_for(OPERATION, CaptureMode::Block)
            .or_else(|_| self.armed_for(OPERATION, CaptureMode::RapidBlock))?;

        let invalid = |reason: String| SessionError::InvalidRequest {
            operation: OPERATION,
            reason,
        };
        if !armed.has_segment(segment) {
            return Err(invalid(format!("segment {segment} was not captured")));
        }
        if !downsampling.is_valid() || downsampling.mode != armed.downsampling.mode {
            return Err(invalid(format!(
                "buffers were registered for {:?}, not ratio {} {:?}",
                armed.downsampling.mode, downsampling.ratio, downsampling.mode
            )));
        }
        if !matches!(start_index.checked_add(count), Some(end) if end <= armed.total()) {
            return Err(invalid(format!(
                "{} samples from {} are outside the {} captured",
                count,
                start_index,
                armed.total()
            )));
        }
        if downsampling.output_len(count) > armed.buffer_len() as u64 {
            return Err(invalid(format!(
                "{} samples do not fit buffers of {}",
                downsampling.output_len(count),
                armed.buffer_len()
            )));
        }

        let values = {
            let device = &mut *self.device;
            let mut targets = self.pool.targets(|key| key.index == segment);
            device.call(OPERATION, |driver, handle| {
                driver.get_values(
                    handle,
                    start_index,
                    count,
                    downsampling.ratio,
                    downsampling.mode,
                    segment,
                    &mut targets,
                )
            })
        };
        let info = values.map_err(|source| self.driver_failed(OPERATION, source))?;

        let result = self.collect_segment(&armed, segment, info, start_index, count, downsampling);
        let index = self.results.len();
        self.results.push(result);
        self.transition(SessionState::Retrieved);
        Ok(&self.results[index])
    }

    /// Copy segments `from_segment..=to_segment` of a rapid-block capture in one call.
    pub fn retrieve_bulk(
        &mut self,
        from_segment: u32,
        to_segment: u32,
    ) -> Result<&[CaptureResult], SessionError> {
        const OPERATION: &str = "get_values_bulk";
        self.check_state(OPERATION, |s| {
            matches!(s, SessionState::Ready | SessionState::Retrieved)
        })?;
        let armed = self.armed_for(OPERATION, CaptureMode::RapidBlock)?;
        if from_segment > to_segment
            || !armed.has_segment(from_segment)
            || !armed.has_segment(to_segment)
        {
            return Err(SessionError::InvalidRequest {
                operation: OPERATION,
                reason: format!(
                    "segments {from_segment}..={to_segment} are not within the {} captured",
                    armed.segments
                ),
            });
        }

        let downsampling = armed.downsampling;
        let total = armed.total();
        let values = {
            let device = &mut *self.device;
            let mut targets = self
                .pool
                .targets(|key| (from_segment..=to_segment).contains(&key.index));
            device.call(OPERATION, |driver, handle| {
                driver.get_values_bulk(
                    handle,
                    0,
                    total,
                    from_segment,
                    to_segment,
                    downsampling.ratio,
                    downsampling.mode,
                    &mut targets,
                )
            })
        };
        let expected = (to_segment - from_segment + 1) as usize;
        let infos = values
            .and_then(|infos| {
                if infos.len() == expected {
                    Ok(infos)
                } else {
                    Err(DriverError::InvalidParameter(format!(
                        "{} results for {} segments",
                        infos.len(),
                        expected
                    )))
                }
            })
            .map_err(|source| self.driver_failed(OPERATION, source))?;

        let first = self.results.len();
        for (segment, info) in (from_segment..=to_segment).zip(infos) {
            let result = self.collect_segment(&armed, segment, info, 0, total, downsampling);
            self.results.push(result);
        }
        self.transition(SessionState::Retrieved);
        Ok(&self.results[first..])
    }

    /// Start streaming into a ring of `request.ring_slots` buffers per channel.
    ///
    /// Only the first slot is registered up front; each following slot is
    /// registered as soon as its predecessor fills.
    pub fn arm_streaming(&mut self, request: &StreamingRequest) -> Result<(), SessionError> {
        const OPERATION: &str = "arm_streaming";
        let channels = self.prepare(OPERATION, CaptureRequest::Streaming(*request))?;
        let mode = request.downsampling.mode;

        for slot in 0..request.ring_slots {
            self.allocate(&channels, slot, request.samples_per_buffer, mode);
        }
        self.register_index(0, request.samples_per_buffer, mode)
            .map_err(|e| self.fail(OPERATION, e.into()))?;

        let settings = StreamingSettings {
            sample_interval: request.sample_interval,
            time_unit: request.time_unit,
            pre_trigger: request.pre_trigger,
            post_trigger: request.post_trigger,
            auto_stop: request.auto_stop,
            ratio: request.downsampling.ratio,
            mode,
        };
        let sample_interval_s = self
            .device
            .call("run_streaming", |driver, handle| {
                driver.run_streaming(handle, &settings)
            })
            .map_err(|source| self.arm_failed("run_streaming", source))?;

        self.device.set_armed(true);
        self.device.set_status(DeviceStatus::Streaming);
        log::debug!(
            "Streaming at {} s per sample into {} x {} sample buffers, stop after {}",
            sample_interval_s,
            request.ring_slots,
            request.samples_per_buffer,
            request.max_buffers
        );
        self.armed = Some(ArmedCapture {
            mode: CaptureMode::Streaming,
            pre_trigger: request.pre_trigger,
            post_trigger: request.post_trigger,
            downsampling: request.downsampling,
            first_segment: 0,
            segments: 1,
            sample_interval_s,
            resolution: self.device.resolution(),
        });
        self.stream = Some(StreamRun::new(*request));
        self.transition(SessionState::Armed);
        Ok(())
    }

    fn drain_slot(&mut self, slot: u32) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        for key in self.pool.keys_at(slot) {
            if let Some(buffer) = self.pool.get_mut(&key) {
                let out = match key.role {
                    BufferRole::Max => stream.samples.entry(key.channel).or_default(),
                    BufferRole::Min => stream.minimums.entry(key.channel).or_default(),
                };
                buffer.drain_into(out);
            }
        }
    }

    fn finish_streaming(&mut self) -> Result<(), SessionError> {
        self.device
            .call("stop", |driver, handle| driver.stop(handle))
            .map_err(|source| self.driver_failed("stop", source))?;
        self.device.set_armed(false);
        self.device.set_status(DeviceStatus::Open);
        self.transition(SessionState::Ready);
        Ok(())
    }

    /// One `get_streaming_latest_values` round-trip.
    ///
    /// When the current buffer fills it is drained and the next ring slot is
    /// registered before this returns, so the following poll already has
    /// somewhere to write.
    pub fn poll_streaming(&mut self) -> Result<StreamingPoll, SessionError> {
        const OPERATION: &str = "get_streaming_latest_values";
        self.check_state(OPERATION, |s| {
            matches!(s, SessionState::Armed | SessionState::Collecting)
        })?;
        let (request, slot) = match &self.stream {
            Some(stream) => (stream.request, stream.slot()),
            None => {
                return Err(SessionError::InvalidRequest {
                    operation: OPERATION,
                    reason: "no streaming capture is armed".to_string(),
                })
            }
        };

        let latest = {
            let device = &mut *self.device;
            let mut targets = self.pool.targets(|key| key.index == slot);
            device.call(OPERATION, |driver, handle| {
                driver.get_streaming_latest_values(handle, &mut targets)
            })
        };
        self.collecting();
        let update = match latest {
            Ok(update) => update,
            Err(e) if e.is_transient() => {
                log::trace!("Streaming poll: {}", e);
                return Ok(StreamingPoll::NotReady);
            }
            Err(source) => return Err(self.driver_failed(OPERATION, source)),
        };

        self.pool.mark_filled(
            |key| key.index == slot,
            update.start_index.saturating_add(update.sample_count),
        );
        let full = self
            .pool
            .keys_at(slot)
            .iter()
            .filter_map(|key| self.pool.get(key))
            .any(|buffer| buffer.is_full());

        let (cursor, auto_stopped, total_samples) = {
            let Some(stream) = self.stream.as_mut() else {
                return Err(SessionError::Cancelled);
            };
            stream.total_samples += update.sample_count as u64;
            if let Some(at) = update.triggered_at {
                stream.triggered_at.get_or_insert(at);
            }
            stream.auto_stopped |= update.auto_stopped;
            if !update.overflow.is_subset(&stream.overflow) {
                log::warn!("Over-range while streaming on {:?}", update.overflow);
                stream.overflow.extend(&update.overflow);
            }
            if full {
                stream.cursor += 1;
            }
            (stream.cursor, stream.auto_stopped, stream.total_samples)
        };
        log::trace!(
            "Streaming: {} new samples at {}, {} total, {} buffers filled",
            update.sample_count,
            update.start_index,
            total_samples,
            cursor
        );

        let auto_stop_ends = auto_stopped && request.stop == StreamingStop::BufferLimitOrAutoStop;
        let finished = cursor >= request.max_buffers || auto_stop_ends;
        if full || finished {
            self.drain_slot(slot);
        }
        if full && !finished {
            let next = cursor % request.ring_slots;
            self.register_index(next, request.samples_per_buffer, request.downsampling.mode)
                .map_err(|e| self.fail(OPERATION, e.into()))?;
        }
        if finished {
            log::debug!(
                "Streaming finished: {} samples in {} buffers{}",
                total_samples,
                cursor,
                if auto_stopped { " (auto-stopped)" } else { "" }
            );
            self.finish_streaming()?;
        }

        Ok(StreamingPoll::Progress(StreamingProgress {
            new_samples: update.sample_count,
            total_samples,
            buffers_filled: cursor,
            auto_stopped,
            finished,
        }))
    }

    /// Poll until the streaming run finishes.
    ///
    /// `observer` sees every poll that brought data and may abandon the run,
    /// in which case the device is stopped and the buffers released before
    /// [`SessionError::Cancelled`] is returned. The idle timeout of `policy`
    /// restarts whenever data arrives.
    pub fn collect_streaming(
        &mut self,
        policy: &PollPolicy,
        mut observer: impl FnMut(&StreamingProgress) -> PollControl,
    ) -> Result<StreamingProgress, SessionError> {
        let interval = self
            .stream
            .as_ref()
            .map(|stream| stream.request.poll_interval)
            .unwrap_or_default();
        let mut poller = Poller::new(*policy);
        loop {
            match self.poll_streaming()? {
                StreamingPoll::Progress(progress) if progress.finished => return Ok(progress),
                StreamingPoll::Progress(progress) => {
                    if observer(&progress) == PollControl::Abandon {
                        self.abandon();
                        return Err(SessionError::Cancelled);
                    }
                    if progress.new_samples > 0 {
                        poller.reset();
                        thread::sleep(interval);
                        continue;
                    }
                }
                StreamingPoll::NotReady => {}
            }
            poller
                .wait()
                .map_err(|timeout| self.timed_out("get_streaming_latest_values", timeout))?;
        }
    }

    /// Everything streamed, concatenated in buffer order.
    pub fn retrieve_streaming(&mut self) -> Result<&CaptureResult, SessionError> {
        const OPERATION: &str = "retrieve_streaming";
        self.check_state(OPERATION, |s| *s == SessionState::Ready)?;
        let armed = self.armed_for(OPERATION, CaptureMode::Streaming)?;
        let stream = self.stream.take().ok_or_else(|| SessionError::InvalidRequest {
            operation: OPERATION,
            reason: "streamed data was already retrieved".to_string(),
        })?;

        let downsampling = armed.downsampling;
        let result = CaptureResult {
            segment: 0,
            resolution: armed.resolution,
            samples: stream.samples,
            minimums: stream.minimums,
            overflow: stream.overflow,
            samples_collected: stream.total_samples,
            sample_interval_s: armed.sample_interval_s * f64::from(downsampling.ratio),
            pre_trigger_samples: downsampling.output_len(armed.pre_trigger),
            trigger_index: stream.triggered_at,
        };
        let index = self.results.len();
        self.results.push(result);
        self.transition(SessionState::Retrieved);
        Ok(&self.results[index])
    }

    /// Scale every retrieved result with the ADC limits of the capture resolution.
    pub fn scale(&mut self) -> Result<Vec<WaveformDataset>, SessionError> {
        const OPERATION: &str = "scale";
        self.check_state(OPERATION, |s| *s == SessionState::Retrieved)?;

        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("CaptureSession::scale");

        let limits = self.device.adc_limits();
        let scaled = self
            .results
            .iter()
            .map(|result| scale_capture(result, self.device.channel_configs(), limits))
            .collect::<Result<Vec<_>, _>>();
        match scaled {
            Ok(datasets) => {
                self.transition(SessionState::Scaled);
                self.teardown();
                Ok(datasets)
            }
            Err(e) => Err(self.fail(OPERATION, e.into())),
        }
    }

    /// Stop the device and release every buffer now. The session ends `Failed`.
    pub fn abandon(&mut self) {
        if matches!(self.state, SessionState::Scaled | SessionState::Failed { .. }) {
            return;
        }
        log::info!("Abandoning capture while {}", self.state);
        self.teardown();
        self.state = SessionState::Failed {
            operation: "abandon",
            reason: "abandoned by caller".to_string(),
        };
    }
}

impl<D: ScopeDriver> Drop for CaptureSession<'_, '_, D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: ScopeDriver> fmt::Debug for CaptureSession<'_, '_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("buffers", &self.pool.len())
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::TimeUnit;
    use crate::simulator::{signal_code, SimulatedScope};

    fn policy() -> PollPolicy {
        PollPolicy::fixed(Duration::from_micros(50), Duration::from_secs(5))
    }

    fn streaming_request(samples_per_buffer: usize, max_buffers: u32) -> StreamingRequest {
        StreamingRequest::new(1, TimeUnit::Microseconds, samples_per_buffer)
            .max_buffers(max_buffers)
            .poll_interval(Duration::ZERO)
    }

    #[test]
    fn test_block_capture() {
        let mut driver = SimulatedScope::new().polls_until_ready(3);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        session.arm_block(&BlockRequest::new(100, 900)).unwrap();
        assert_eq!(session.state(), &SessionState::Armed);
        assert!(matches!(
            session.set_channel(ChannelConfig::on(Channel::B)),
            Err(SessionError::InvalidState { .. })
        ));

        session.wait_until_ready(&policy()).unwrap();
        assert_eq!(session.state(), &SessionState::Ready);
        assert_eq!(probe.calls_named("is_ready"), 4);

        let result = session
            .retrieve(0, 1000, DownSampling::default(), 0)
            .unwrap();
        assert_eq!(result.samples_collected, 1000);
        assert_eq!(result.samples[&Channel::A].len(), 1000);
        assert_eq!(result.pre_trigger_samples, 100);

        let datasets = session.scale().unwrap();
        assert_eq!(session.state(), &SessionState::Scaled);
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].len(), 1000);
        assert_eq!(session.registered_buffers(), 0);
        assert_eq!(probe.registered_buffers(), 0);
    }

    #[test]
    fn test_capacity_checked_before_arming() {
        let mut driver = SimulatedScope::new().memory_samples(1000);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        let result = session.arm_block(&BlockRequest::new(600, 600));
        assert!(matches!(
            result,
            Err(SessionError::CapacityExceeded {
                requested: 1200,
                capacity: 1000
            })
        ));
        assert_eq!(session.state(), &SessionState::Configured);
        assert_eq!(probe.calls_named("run_block"), 0);
        assert_eq!(probe.registered_buffers(), 0);

        // Still usable with a request that fits.
        session.arm_block(&BlockRequest::new(100, 400)).unwrap();
    }

    #[test]
    fn test_arm_without_channels() {
        let mut driver = SimulatedScope::new();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        assert!(matches!(
            session.arm_block(&BlockRequest::new(0, 100)),
            Err(SessionError::InvalidRequest { .. })
        ));
        assert_eq!(session.state(), &SessionState::Configured);
    }

    #[test]
    fn test_timeout_tears_down() {
        let mut driver = SimulatedScope::new().polls_until_ready(u32::MAX);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.arm_block(&BlockRequest::new(0, 100)).unwrap();
        assert!(probe.is_running());

        let fast = PollPolicy::fixed(Duration::from_micros(100), Duration::from_millis(5));
        let error = session.wait_until_ready(&fast).unwrap_err();
        assert_eq!(error.category(), ErrorCategory::Timeout);
        assert!(matches!(
            session.state(),
            SessionState::Failed {
                operation: "is_ready",
                ..
            }
        ));
        assert!(!probe.is_running());
        assert_eq!(probe.registered_buffers(), 0);
        assert!(!session.device().is_armed());
    }

    #[test]
    fn test_short_capture_reports_collected_count() {
        let mut driver = SimulatedScope::new().polls_until_ready(0).samples_collected(700);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.arm_block(&BlockRequest::new(0, 1000)).unwrap();
        session.wait_until_ready(&policy()).unwrap();

        let result = session
            .retrieve(0, 1000, DownSampling::default(), 0)
            .unwrap();
        assert_eq!(result.samples_collected, 700);
        assert_eq!(result.samples[&Channel::A].len(), 700);
    }

    #[test]
    fn test_aggregate_retrieves_pairs() {
        let mut driver = SimulatedScope::new().polls_until_ready(0);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.set_channel(ChannelConfig::on(Channel::B)).unwrap();

        let aggregate = DownSampling::new(10, DownSampleMode::Aggregate);
        session
            .arm_block(&BlockRequest::new(0, 1000).downsampling(aggregate))
            .unwrap();
        assert_eq!(session.registered_buffers(), 4);
        session.wait_until_ready(&policy()).unwrap();

        let wrong_mode = DownSampling::new(10, DownSampleMode::Average);
        assert!(matches!(
            session.retrieve(0, 1000, wrong_mode, 0),
            Err(SessionError::InvalidRequest { .. })
        ));
        assert_eq!(session.state(), &SessionState::Ready);

        let result = session.retrieve(0, 1000, aggregate, 0).unwrap();
        assert_eq!(result.samples[&Channel::B].len(), 100);
        assert_eq!(result.minimums[&Channel::B].len(), 100);
        assert!(result.samples[&Channel::B]
            .iter()
            .zip(&result.minimums[&Channel::B])
            .all(|(hi, lo)| hi >= lo));
    }

    #[test]
    fn test_rapid_block_overflow_per_segment() {
        let mut driver = SimulatedScope::new()
            .polls_until_ready(1)
            .overflow_on_segment(2);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        session
            .arm_rapid_block(&RapidBlockRequest::new(50, 150, 4))
            .unwrap();
        assert_eq!(probe.memory_segments(), 4);
        assert_eq!(probe.registered_buffers(), 4);
        session.wait_until_ready(&policy()).unwrap();

        let results = session.retrieve_bulk(0, 3).unwrap();
        assert_eq!(results.len(), 4);
        for (segment, result) in results.iter().enumerate() {
            assert_eq!(result.segment, segment as u32);
            assert_eq!(result.samples[&Channel::A].len(), 200);
            assert_eq!(result.is_overflowed(), segment == 2);
        }
        assert_eq!(session.scale().unwrap().len(), 4);
    }

    #[test]
    fn test_rapid_block_insufficient_memory() {
        let mut driver = SimulatedScope::new().memory_samples(5);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        assert!(matches!(
            session.arm_rapid_block(&RapidBlockRequest::new(0, 1, 10)),
            Err(SessionError::InsufficientMemory { segments: 10, .. })
        ));
        assert_eq!(session.state(), &SessionState::Configured);
        assert_eq!(probe.calls_named("set_capture_count"), 0);
    }

    #[test]
    fn test_rapid_block_too_large_restores_memory() {
        let mut driver = SimulatedScope::new().memory_samples(1000);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        assert!(matches!(
            session.arm_rapid_block(&RapidBlockRequest::new(0, 200, 10)),
            Err(SessionError::CapacityExceeded {
                requested: 200,
                capacity: 100
            })
        ));
        assert_eq!(session.state(), &SessionState::Configured);
        assert_eq!(probe.memory_segments(), 1);
        assert_eq!(probe.calls_named("set_capture_count"), 0);

        session.arm_block(&BlockRequest::new(0, 800)).unwrap();
        assert_eq!(session.state(), &SessionState::Armed);
    }

    #[test]
    fn test_retrieve_clamps_to_requested_count() {
        let mut driver = SimulatedScope::new().polls_until_ready(0).overreport_values(500);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.arm_block(&BlockRequest::new(100, 900)).unwrap();
        session.wait_until_ready(&policy()).unwrap();

        assert!(matches!(
            session.retrieve(u64::MAX, 2, DownSampling::default(), 0),
            Err(SessionError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.retrieve(0, 10, DownSampling::default(), u32::MAX),
            Err(SessionError::InvalidRequest { .. })
        ));

        let result = session
            .retrieve(0, 400, DownSampling::default(), 0)
            .unwrap();
        assert_eq!(result.samples_collected, 400);
        assert_eq!(result.samples[&Channel::A].len(), 400);
        assert_eq!(result.pre_trigger_samples, 100);
    }

    #[test]
    fn test_streaming_hand_off() {
        let mut driver = SimulatedScope::new().streaming(250, 3);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        session.arm_streaming(&streaming_request(1000, 5)).unwrap();
        assert_eq!(session.device_status(), DeviceStatus::Streaming);
        assert_eq!(probe.registered_buffers(), 1);

        let mut most_filled = 0;
        let progress = session
            .collect_streaming(&policy(), |progress| {
                assert!(progress.buffers_filled <= 5);
                most_filled = most_filled.max(progress.buffers_filled);
                PollControl::Continue
            })
            .unwrap();
        assert!(progress.finished);
        assert_eq!(progress.buffers_filled, 5);
        assert_eq!(progress.total_samples, 5000);
        assert_eq!(session.device_status(), DeviceStatus::Open);
        assert_eq!(probe.dropped_samples(), 0);

        let result = session.retrieve_streaming().unwrap();
        let samples = &result.samples[&Channel::A];
        assert_eq!(samples.len(), 5000);
        for (i, &code) in samples.iter().enumerate() {
            assert_eq!(code, signal_code(Channel::A, i as u64, 0, 32512), "sample {i}");
        }
    }

    #[test]
    fn test_streaming_aggregate_pairs_across_ring() {
        let mut driver = SimulatedScope::new().streaming(100, 2);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        let request = streaming_request(300, 5)
            .ring_slots(2)
            .downsampling(DownSampling::new(10, DownSampleMode::Aggregate));
        session.arm_streaming(&request).unwrap();
        assert_eq!(probe.registered_buffers(), 2);

        let progress = session
            .collect_streaming(&policy(), |_| PollControl::Continue)
            .unwrap();
        assert_eq!(progress.buffers_filled, 5);
        assert_eq!(probe.dropped_samples(), 0);

        let result = session.retrieve_streaming().unwrap();
        let maxima = &result.samples[&Channel::A];
        let minima = &result.minimums[&Channel::A];
        assert_eq!(maxima.len(), 1500);
        assert_eq!(minima.len(), 1500);
        assert!(maxima.iter().zip(minima).all(|(hi, lo)| hi >= lo));
        assert!(maxima.iter().zip(minima).any(|(hi, lo)| hi > lo));
    }

    #[test]
    fn test_streaming_reports_overflow() {
        let mut driver = SimulatedScope::new()
            .streaming(500, 1)
            .overflow_while_streaming(Channel::B);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.set_channel(ChannelConfig::on(Channel::B)).unwrap();
        session.arm_streaming(&streaming_request(1000, 2)).unwrap();
        session
            .collect_streaming(&policy(), |_| PollControl::Continue)
            .unwrap();

        let result = session.retrieve_streaming().unwrap();
        assert_eq!(result.overflow, [Channel::B].into_iter().collect());
        let warning = result.overflow_warning().unwrap();
        assert_eq!(warning.channels, vec![Channel::B]);
    }

    #[test]
    fn test_streaming_auto_stop_drains_partial_buffer() {
        let mut driver = SimulatedScope::new().streaming(400, 1);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        let request = streaming_request(1000, 10).auto_stop(0, 2500);
        session.arm_streaming(&request).unwrap();
        let progress = session
            .collect_streaming(&policy(), |_| PollControl::Continue)
            .unwrap();
        assert!(progress.auto_stopped);
        assert_eq!(progress.buffers_filled, 2);

        let result = session.retrieve_streaming().unwrap();
        assert_eq!(result.samples[&Channel::A].len(), 2500);
        assert_eq!(result.samples_collected, 2500);
    }

    #[test]
    fn test_streaming_buffer_limit_ignores_auto_stop() {
        let mut driver = SimulatedScope::new().streaming(400, 1);
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();

        let request = streaming_request(1000, 10)
            .auto_stop(0, 2500)
            .stop(StreamingStop::BufferLimit);
        session.arm_streaming(&request).unwrap();
        let fast = PollPolicy::fixed(Duration::from_micros(100), Duration::from_millis(5));
        let error = session
            .collect_streaming(&fast, |_| PollControl::Continue)
            .unwrap_err();
        assert!(matches!(error, SessionError::Timeout { .. }));
        assert_eq!(session.registered_buffers(), 0);
    }

    #[test]
    fn test_abandon_mid_stream() {
        let mut driver = SimulatedScope::new().streaming(100, 2);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.arm_streaming(&streaming_request(1000, 10)).unwrap();

        let mut polls = 0;
        let error = session
            .collect_streaming(&policy(), |_| {
                polls += 1;
                if polls == 3 {
                    PollControl::Abandon
                } else {
                    PollControl::Continue
                }
            })
            .unwrap_err();
        assert!(matches!(error, SessionError::Cancelled));
        assert!(!probe.is_running());
        assert_eq!(probe.registered_buffers(), 0);
        assert_eq!(session.device_status(), DeviceStatus::Open);
        assert!(matches!(session.state(), SessionState::Failed { .. }));
    }

    #[test]
    fn test_driver_failure_while_streaming() {
        let mut driver = SimulatedScope::new().fail_on(
            "get_streaming_latest_values",
            DriverError::Status(0x0f),
        );
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        let mut session = CaptureSession::new(&mut device).unwrap();
        session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
        session.arm_streaming(&streaming_request(1000, 10)).unwrap();

        let error = session.poll_streaming().unwrap_err();
        assert_eq!(error.operation(), Some("get_streaming_latest_values"));
        assert_eq!(error.category(), ErrorCategory::Driver);
        assert!(!probe.is_running());
        assert_eq!(probe.registered_buffers(), 0);
    }

    #[test]
    fn test_drop_releases_device() {
        let mut driver = SimulatedScope::new();
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        {
            let mut session = CaptureSession::new(&mut device).unwrap();
            session.set_channel(ChannelConfig::on(Channel::A)).unwrap();
            session.arm_block(&BlockRequest::new(0, 100)).unwrap();
        }
        assert!(!probe.is_running());
        assert_eq!(probe.registered_buffers(), 0);
        assert!(!device.is_armed());
    }
}
