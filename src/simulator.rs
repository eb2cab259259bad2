//! A software stand-in for an acquisition device.
//!
//! `SimulatedScope` implements the full driver interface over a deterministic
//! signal (see [`signal_code`]), with knobs for the situations real hardware
//! produces: slow readiness, sparse streaming data, over-range segments,
//! truncated captures and failing calls. The driver is usually moved into a
//! controller, so its state is shared with a [`SimProbe`] for inspection.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::TAU;
use std::rc::Rc;
use std::time::Duration;

use crate::buffer_pool::{BufferKey, BufferRole};
use crate::channel_config::{Channel, ChannelConfig};
use crate::driver::{
    BufferTarget, DeviceInfo, DownSampleMode, DriverError, DriverHandle, DriverResult, Resolution,
    ScopeDriver, StreamingSettings, StreamingUpdate, TimebaseInfo, ValuesInfo,
};
use crate::signal_generator::{SignalGenerator, SweepType, Waveform};
use crate::trigger_config::SimpleTrigger;

pub const SIMULATED_SERIAL: &str = "SIM00/0001";
const SIMULATED_MODEL: &str = "SIM-4000";

/// Samples of 8-bit memory. Higher resolutions get half.
const DEFAULT_MEMORY_SAMPLES: u64 = 512 * 1024 * 1024;

/// Simulated signal on `channel` at `sample` of `segment`, as an ADC code.
///
/// A sine at 80 % of full scale whose period differs per channel and whose
/// phase differs per segment.
pub fn signal_code(channel: Channel, sample: u64, segment: u32, max_code: i16) -> i16 {
    let period = 1000.0 + 250.0 * channel.index() as f64;
    let phase = f64::from(segment) * 0.1;
    let value = 0.8 * f64::from(max_code) * (TAU * sample as f64 / period + phase).sin();
    value.round() as i16
}

fn adc_max(resolution: Resolution) -> i16 {
    match resolution {
        Resolution::Bits8 => 32512,
        Resolution::Bits10 => 32704,
        Resolution::Bits12 => 32736,
    }
}

fn max_range_mv(resolution: Resolution) -> f64 {
    match resolution {
        Resolution::Bits8 | Resolution::Bits10 => 20_000.0,
        Resolution::Bits12 => 10_000.0,
    }
}

fn timebase_interval(timebase: u32) -> f64 {
    if timebase < 5 {
        f64::from(1u32 << timebase) / 5e9
    } else {
        f64::from(timebase - 4) / 156_250_000.0
    }
}

fn reduce(mode: DownSampleMode, role: BufferRole, window: &[i16]) -> i16 {
    match (mode, role) {
        (DownSampleMode::Aggregate, BufferRole::Max) => window.iter().copied().max().unwrap_or(0),
        (DownSampleMode::Aggregate, BufferRole::Min) => window.iter().copied().min().unwrap_or(0),
        (DownSampleMode::Average, _) => {
            let sum: i64 = window.iter().map(|&code| i64::from(code)).sum();
            let len = window.len().max(1) as f64;
            (sum as f64 / len).round() as i16
        }
        (DownSampleMode::None | DownSampleMode::Decimate, _) => window.first().copied().unwrap_or(0),
    }
}

/// Last signal generator settings the driver received.
#[derive(Debug, Clone, PartialEq)]
pub struct SigGenOutput {
    pub waveform: Waveform,
    pub amplitude_mv: u32,
    pub offset_mv: i32,
    pub start_hz: f64,
    pub stop_hz: f64,
    pub increment_hz: f64,
    pub dwell: Duration,
    pub sweep_type: SweepType,
    pub applied: bool,
}

#[derive(Debug)]
struct BlockRun {
    pre_trigger: u64,
    post_trigger: u64,
    first_segment: u32,
    captures: u32,
    polls_left: u32,
    complete: bool,
}

#[derive(Debug)]
struct StreamRun {
    settings: StreamingSettings,
    polls: u32,
    /// Raw samples produced since the start.
    produced: u64,
    /// Down-sampled samples handed over.
    delivered: u64,
    /// Write position in the currently registered buffers.
    offset: usize,
    dropped: u64,
    stopped: bool,
}

impl StreamRun {
    fn ratio(&self) -> u64 {
        u64::from(self.settings.ratio.max(1))
    }

    fn limit(&self) -> Option<u64> {
        self.settings
            .auto_stop
            .then_some(self.settings.pre_trigger.saturating_add(self.settings.post_trigger))
    }

    fn limit_reached(&self) -> bool {
        self.limit().is_some_and(|limit| self.produced >= limit)
    }

    fn available(&self) -> u64 {
        let ratio = self.ratio();
        let ready = if self.limit_reached() {
            self.produced.div_ceil(ratio)
        } else {
            self.produced / ratio
        };
        ready - self.delivered - self.dropped
    }
}

#[derive(Debug)]
struct SimState {
    open: Option<DriverHandle>,
    next_handle: i16,
    serial: String,
    reported_channels: Option<u8>,
    physical_channels: u8,
    resolution: Resolution,
    memory_samples: u64,
    channels: BTreeMap<Channel, ChannelConfig>,
    trigger: Option<SimpleTrigger>,
    segments: u32,
    capture_count: u32,
    registered: BTreeMap<BufferKey, (usize, DownSampleMode)>,
    block: Option<BlockRun>,
    stream: Option<StreamRun>,
    /// Dropped by earlier, stopped streams.
    dropped: u64,
    polls_until_ready: u32,
    samples_per_poll: usize,
    ready_every: u32,
    samples_collected: Option<u64>,
    overflow_segments: BTreeSet<u32>,
    streaming_overflow: BTreeSet<Channel>,
    values_overreport: u64,
    failures: BTreeMap<&'static str, DriverError>,
    call_log: Vec<&'static str>,
    sig_gen: Option<SigGenOutput>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            open: None,
            next_handle: 1,
            serial: SIMULATED_SERIAL.to_string(),
            reported_channels: Some(4),
            physical_channels: 4,
            resolution: Resolution::Bits8,
            memory_samples: DEFAULT_MEMORY_SAMPLES,
            channels: BTreeMap::new(),
            trigger: None,
            segments: 1,
            capture_count: 1,
            registered: BTreeMap::new(),
            block: None,
            stream: None,
            dropped: 0,
            polls_until_ready: 2,
            samples_per_poll: 1000,
            ready_every: 1,
            samples_collected: None,
            overflow_segments: BTreeSet::new(),
            streaming_overflow: BTreeSet::new(),
            values_overreport: 0,
            failures: BTreeMap::new(),
            call_log: Vec::new(),
            sig_gen: None,
        }
    }
}

impl SimState {
    /// Log `call`, then fail it if requested or if `handle` is stale.
    fn enter(&mut self, call: &'static str, handle: Option<DriverHandle>) -> DriverResult<()> {
        self.call_log.push(call);
        if let Some(error) = self.failures.get(call) {
            return Err(error.clone());
        }
        match handle {
            Some(handle) if self.open != Some(handle) => Err(DriverError::NotOpen),
            _ => Ok(()),
        }
    }

    fn end_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.dropped += stream.dropped;
        }
    }

    fn capacity(&self, resolution: Resolution) -> u64 {
        match resolution {
            Resolution::Bits8 => self.memory_samples,
            Resolution::Bits10 | Resolution::Bits12 => self.memory_samples / 2,
        }
    }

    fn has_channel(&self, channel: Channel) -> bool {
        channel.index() < usize::from(self.physical_channels)
    }

    fn enabled_channels(&self) -> Vec<Channel> {
        self.channels
            .values()
            .filter(|c| c.enabled)
            .map(|c| c.channel)
            .collect()
    }

    fn segment_samples(&self, segment: u32, start: u64, count: u64) -> impl Fn(Channel) -> Vec<i16> {
        let max_code = adc_max(self.resolution);
        move |channel| {
            (start..start + count)
                .map(|sample| signal_code(channel, sample, segment, max_code))
                .collect()
        }
    }

    /// Write one segment into the buffers of `targets` that belong to it.
    fn fill_segment(
        &self,
        start_index: u64,
        samples: u64,
        segment: u32,
        ratio: u32,
        mode: DownSampleMode,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<ValuesInfo> {
        let block = self.block.as_ref().ok_or(DriverError::NotReady)?;
        if !block.complete {
            return Err(DriverError::NotReady);
        }
        if segment < block.first_segment
            || segment >= block.first_segment.saturating_add(block.captures)
        {
            return Err(DriverError::InvalidParameter(format!(
                "segment {segment} was not captured"
            )));
        }
        if ratio == 0 || (mode == DownSampleMode::None && ratio != 1) {
            return Err(DriverError::InvalidParameter(format!(
                "ratio {ratio} with mode {mode:?}"
            )));
        }

        let total = block.pre_trigger.saturating_add(block.post_trigger);
        let collected = self.samples_collected.map_or(total, |n| n.min(total));
        let count = collected.saturating_sub(start_index).min(samples);
        let ratio = u64::from(ratio);
        let out_len = count.div_ceil(ratio);

        let mut overflow = BTreeSet::new();
        let mut raw_cache: BTreeMap<Channel, Vec<i16>> = BTreeMap::new();
        let generate = self.segment_samples(segment, start_index, count);
        for target in targets.iter_mut().filter(|t| t.key.index == segment) {
            if (target.data.len() as u64) < out_len {
                return Err(DriverError::InvalidBuffer(format!(
                    "{} holds {} samples, {} needed",
                    target.key,
                    target.data.len(),
                    out_len
                )));
            }
            let channel = target.key.channel;
            let raw = raw_cache
                .entry(channel)
                .or_insert_with(|| generate(channel));
            for (out, window) in target.data.iter_mut().zip(raw.chunks(ratio as usize)) {
                *out = reduce(mode, target.key.role, window);
            }
            if self.overflow_segments.contains(&segment) {
                overflow.insert(target.key.channel);
            }
        }

        Ok(ValuesInfo {
            samples: out_len + self.values_overreport,
            overflow,
        })
    }
}

/// Simulated acquisition device implementing [`ScopeDriver`] and [`SignalGenerator`].
#[derive(Debug, Default)]
pub struct SimulatedScope {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn configure(self, f: impl FnOnce(&mut SimState)) -> Self {
        f(&mut self.state.borrow_mut());
        self
    }

    /// Channel count the device reports; `None` hides it from the host.
    pub fn with_channel_count(self, count: Option<u8>) -> Self {
        self.configure(|s| {
            s.reported_channels = count;
            if let Some(count) = count {
                s.physical_channels = count;
            }
        })
    }

    /// Channels actually present, regardless of what is reported.
    pub fn with_physical_channels(self, count: u8) -> Self {
        self.configure(|s| s.physical_channels = count)
    }

    pub fn with_serial(self, serial: &str) -> Self {
        self.configure(|s| s.serial = serial.to_string())
    }

    /// Sample memory at 8 bits.
    pub fn memory_samples(self, samples: u64) -> Self {
        self.configure(|s| s.memory_samples = samples)
    }

    /// Number of `is_ready` calls answering `false` before a block is done.
    pub fn polls_until_ready(self, polls: u32) -> Self {
        self.configure(|s| s.polls_until_ready = polls)
    }

    /// Streaming produces `samples_per_poll` samples per poll, and data is
    /// only handed over on every `ready_every`th poll.
    pub fn streaming(self, samples_per_poll: usize, ready_every: u32) -> Self {
        self.configure(|s| {
            s.samples_per_poll = samples_per_poll;
            s.ready_every = ready_every.max(1);
        })
    }

    /// Report fewer samples than requested for block captures.
    pub fn samples_collected(self, samples: u64) -> Self {
        self.configure(|s| s.samples_collected = Some(samples))
    }

    pub fn overflow_on_segment(self, segment: u32) -> Self {
        self.configure(|s| {
            s.overflow_segments.insert(segment);
        })
    }

    /// Streamed samples of `channel` are reported over range.
    pub fn overflow_while_streaming(self, channel: Channel) -> Self {
        self.configure(|s| {
            s.streaming_overflow.insert(channel);
        })
    }

    /// `get_values` claims `extra` more samples than it wrote.
    pub fn overreport_values(self, extra: u64) -> Self {
        self.configure(|s| s.values_overreport = extra)
    }

    /// Every call named `call` fails with `error`.
    pub fn fail_on(self, call: &'static str, error: DriverError) -> Self {
        self.configure(|s| {
            s.failures.insert(call, error);
        })
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Rc::clone(&self.state),
        }
    }
}

impl ScopeDriver for SimulatedScope {
    fn open_unit(&mut self, serial: Option<&str>) -> DriverResult<(DriverHandle, DeviceInfo)> {
        let mut s = self.state.borrow_mut();
        s.enter("open_unit", None)?;
        if let Some(serial) = serial {
            if serial != s.serial {
                return Err(DriverError::NotFound {
                    serial: Some(serial.to_string()),
                });
            }
        }
        if s.open.is_some() {
            return Err(DriverError::Busy);
        }

        let handle = DriverHandle(s.next_handle);
        s.next_handle += 1;
        s.open = Some(handle);
        s.resolution = Resolution::Bits8;
        s.channels.clear();
        s.trigger = None;
        s.segments = 1;
        s.capture_count = 1;

        let info = DeviceInfo {
            serial: s.serial.clone(),
            model: SIMULATED_MODEL.to_string(),
            channel_count: s.reported_channels,
            resolutions: vec![Resolution::Bits8, Resolution::Bits10, Resolution::Bits12],
        };
        Ok((handle, info))
    }

    fn close_unit(&mut self, handle: DriverHandle) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("close_unit", Some(handle))?;
        s.open = None;
        s.registered.clear();
        s.block = None;
        s.end_stream();
        Ok(())
    }

    fn set_resolution(&mut self, handle: DriverHandle, resolution: Resolution) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_resolution", Some(handle))?;
        if s.block.as_ref().is_some_and(|b| !b.complete) || s.stream.is_some() {
            return Err(DriverError::Busy);
        }
        s.resolution = resolution;
        Ok(())
    }

    fn get_adc_limits(
        &mut self,
        handle: DriverHandle,
        resolution: Resolution,
    ) -> DriverResult<(i16, i16)> {
        self.state.borrow_mut().enter("get_adc_limits", Some(handle))?;
        let max = adc_max(resolution);
        Ok((-max, max))
    }

    fn memory_capacity(&mut self, handle: DriverHandle, resolution: Resolution) -> DriverResult<u64> {
        let mut s = self.state.borrow_mut();
        s.enter("memory_capacity", Some(handle))?;
        Ok(s.capacity(resolution) / u64::from(s.segments))
    }

    fn set_channel_on(&mut self, handle: DriverHandle, config: &ChannelConfig) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_channel_on", Some(handle))?;
        if !s.has_channel(config.channel) {
            return Err(DriverError::ChannelNotSupported(config.channel));
        }
        if config.range.full_scale_mv() > max_range_mv(s.resolution) {
            return Err(DriverError::InvalidVoltageRange(config.channel));
        }
        s.channels.insert(config.channel, *config);
        Ok(())
    }

    fn set_channel_off(&mut self, handle: DriverHandle, channel: Channel) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_channel_off", Some(handle))?;
        if !s.has_channel(channel) {
            return Err(DriverError::ChannelNotSupported(channel));
        }
        s.channels.insert(channel, ChannelConfig::off(channel));
        Ok(())
    }

    fn set_simple_trigger(
        &mut self,
        handle: DriverHandle,
        trigger: &SimpleTrigger,
    ) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_simple_trigger", Some(handle))?;
        if trigger.enabled && !s.channels.get(&trigger.source).is_some_and(|c| c.enabled) {
            return Err(DriverError::InvalidTriggerChannel(trigger.source));
        }
        s.trigger = Some(*trigger);
        Ok(())
    }

    fn get_fastest_timebase(
        &mut self,
        handle: DriverHandle,
        enabled: &[Channel],
        resolution: Resolution,
    ) -> DriverResult<TimebaseInfo> {
        self.state
            .borrow_mut()
            .enter("get_fastest_timebase", Some(handle))?;
        let by_channels = match enabled.len() {
            0 | 1 => 0,
            2 => 1,
            _ => 2,
        };
        let timebase = by_channels + u32::from(resolution != Resolution::Bits8);
        Ok(TimebaseInfo {
            timebase,
            sample_interval_s: timebase_interval(timebase),
        })
    }

    fn get_timebase(
        &mut self,
        handle: DriverHandle,
        timebase: u32,
        samples: u64,
        segment: u32,
    ) -> DriverResult<TimebaseInfo> {
        let mut s = self.state.borrow_mut();
        s.enter("get_timebase", Some(handle))?;
        if segment >= s.segments {
            return Err(DriverError::InvalidParameter(format!("no segment {segment}")));
        }
        let available = s.capacity(s.resolution) / u64::from(s.segments);
        if samples > available {
            return Err(DriverError::TooManySamples {
                requested: samples,
                available,
            });
        }
        Ok(TimebaseInfo {
            timebase,
            sample_interval_s: timebase_interval(timebase),
        })
    }

    fn set_memory_segments(&mut self, handle: DriverHandle, segments: u32) -> DriverResult<u64> {
        let mut s = self.state.borrow_mut();
        s.enter("set_memory_segments", Some(handle))?;
        let capacity = s.capacity(s.resolution);
        if segments == 0 {
            return Err(DriverError::InvalidParameter("zero segments".to_string()));
        }
        if u64::from(segments) > capacity {
            return Err(DriverError::InsufficientMemory { segments });
        }
        s.segments = segments;
        Ok(capacity / u64::from(segments))
    }

    fn set_capture_count(&mut self, handle: DriverHandle, captures: u32) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_capture_count", Some(handle))?;
        if captures == 0 || captures > s.segments {
            return Err(DriverError::InvalidParameter(format!(
                "{captures} captures into {} segments",
                s.segments
            )));
        }
        s.capture_count = captures;
        Ok(())
    }

    fn set_data_buffer(
        &mut self,
        handle: DriverHandle,
        key: BufferKey,
        capacity: usize,
        mode: DownSampleMode,
    ) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_data_buffer", Some(handle))?;
        if !s.has_channel(key.channel) {
            return Err(DriverError::ChannelNotSupported(key.channel));
        }
        if capacity == 0 {
            return Err(DriverError::InvalidBuffer(format!("{key} is empty")));
        }
        s.registered.insert(key, (capacity, mode));
        if let Some(stream) = s.stream.as_mut() {
            stream.offset = 0;
        }
        Ok(())
    }

    fn clear_data_buffers(&mut self, handle: DriverHandle) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("clear_data_buffers", Some(handle))?;
        s.registered.clear();
        Ok(())
    }

    fn run_block(
        &mut self,
        handle: DriverHandle,
        pre_trigger: u64,
        post_trigger: u64,
        timebase: u32,
        segment: u32,
    ) -> DriverResult<Duration> {
        let mut s = self.state.borrow_mut();
        s.enter("run_block", Some(handle))?;
        if s.stream.is_some() {
            return Err(DriverError::Busy);
        }
        if s.enabled_channels().is_empty() {
            return Err(DriverError::InvalidParameter("no channel enabled".to_string()));
        }
        let captures = if segment == 0 { s.capture_count } else { 1 };
        if segment.saturating_add(captures) > s.segments {
            return Err(DriverError::InvalidParameter(format!("no segment {segment}")));
        }
        let available = s.capacity(s.resolution) / u64::from(s.segments);
        let requested = pre_trigger.saturating_add(post_trigger);
        if requested > available {
            return Err(DriverError::TooManySamples {
                requested,
                available,
            });
        }

        let polls_left = s.polls_until_ready;
        s.block = Some(BlockRun {
            pre_trigger,
            post_trigger,
            first_segment: segment,
            captures,
            polls_left,
            complete: false,
        });
        let seconds = timebase_interval(timebase) * requested as f64 * f64::from(captures);
        Ok(Duration::from_secs_f64(seconds))
    }

    fn is_ready(&mut self, handle: DriverHandle) -> DriverResult<bool> {
        let mut s = self.state.borrow_mut();
        s.enter("is_ready", Some(handle))?;
        let block = s
            .block
            .as_mut()
            .ok_or_else(|| DriverError::InvalidParameter("no block capture running".to_string()))?;
        if block.polls_left > 0 {
            block.polls_left -= 1;
            return Ok(false);
        }
        block.complete = true;
        Ok(true)
    }

    fn run_streaming(
        &mut self,
        handle: DriverHandle,
        settings: &StreamingSettings,
    ) -> DriverResult<f64> {
        let mut s = self.state.borrow_mut();
        s.enter("run_streaming", Some(handle))?;
        if s.block.as_ref().is_some_and(|b| !b.complete) || s.stream.is_some() {
            return Err(DriverError::Busy);
        }
        if s.registered.is_empty() {
            return Err(DriverError::InvalidBuffer("no buffer registered".to_string()));
        }
        if settings.sample_interval == 0 {
            return Err(DriverError::InvalidParameter("zero sample interval".to_string()));
        }
        s.stream = Some(StreamRun {
            settings: *settings,
            polls: 0,
            produced: 0,
            delivered: 0,
            offset: 0,
            dropped: 0,
            stopped: false,
        });
        Ok(settings.time_unit.to_seconds(settings.sample_interval))
    }

    fn get_streaming_latest_values(
        &mut self,
        handle: DriverHandle,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<StreamingUpdate> {
        let mut s = self.state.borrow_mut();
        s.enter("get_streaming_latest_values", Some(handle))?;
        let internal = s.capacity(s.resolution);
        let samples_per_poll = s.samples_per_poll as u64;
        let ready_every = s.ready_every;
        let max_code = adc_max(s.resolution);
        let trigger_enabled = s.trigger.is_some_and(|t| t.enabled);
        let over_range = s.streaming_overflow.clone();
        let stream = s
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::InvalidParameter("not streaming".to_string()))?;

        if !stream.stopped {
            stream.produced += samples_per_poll * stream.ratio();
            if let Some(limit) = stream.limit() {
                stream.produced = stream.produced.min(limit);
            }
            let backlog = stream.available();
            if backlog > internal {
                stream.dropped += backlog - internal;
            }
        }
        stream.polls += 1;
        if stream.polls % ready_every != 0 {
            return Err(DriverError::NotReady);
        }

        let space = targets
            .iter()
            .map(|t| t.data.len().saturating_sub(stream.offset))
            .min()
            .unwrap_or(0);
        let count = stream.available().min(space as u64) as usize;
        let ratio = stream.ratio();
        let mode = stream.settings.mode;
        let first = stream.delivered + stream.dropped;
        for target in targets.iter_mut() {
            let channel = target.key.channel;
            for k in 0..count {
                let raw_start = (first + k as u64) * ratio;
                let raw_end = (raw_start + ratio).min(stream.produced);
                let window: Vec<i16> = (raw_start..raw_end)
                    .map(|sample| signal_code(channel, sample, 0, max_code))
                    .collect();
                target.data[stream.offset + k] = reduce(mode, target.key.role, &window);
            }
        }

        let start_index = stream.offset;
        stream.offset += count;
        stream.delivered += count as u64;
        if stream.limit_reached() && stream.available() == 0 {
            stream.stopped = true;
        }
        let pre_trigger = stream.settings.pre_trigger;
        let triggered_at =
            (trigger_enabled && stream.produced >= pre_trigger).then(|| pre_trigger / ratio);

        let overflow = if count > 0 {
            targets
                .iter()
                .map(|t| t.key.channel)
                .filter(|channel| over_range.contains(channel))
                .collect()
        } else {
            BTreeSet::new()
        };

        Ok(StreamingUpdate {
            start_index,
            sample_count: count,
            triggered_at,
            auto_stopped: stream.stopped,
            overflow,
        })
    }

    fn get_values(
        &mut self,
        handle: DriverHandle,
        start_index: u64,
        samples: u64,
        ratio: u32,
        mode: DownSampleMode,
        segment: u32,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<ValuesInfo> {
        let mut s = self.state.borrow_mut();
        s.enter("get_values", Some(handle))?;
        s.fill_segment(start_index, samples, segment, ratio, mode, targets)
    }

    fn get_values_bulk(
        &mut self,
        handle: DriverHandle,
        start_index: u64,
        samples: u64,
        from_segment: u32,
        to_segment: u32,
        ratio: u32,
        mode: DownSampleMode,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<Vec<ValuesInfo>> {
        let mut s = self.state.borrow_mut();
        s.enter("get_values_bulk", Some(handle))?;
        if from_segment > to_segment {
            return Err(DriverError::InvalidParameter(format!(
                "segments {from_segment}..={to_segment}"
            )));
        }
        (from_segment..=to_segment)
            .map(|segment| s.fill_segment(start_index, samples, segment, ratio, mode, &mut *targets))
            .collect()
    }

    fn stop(&mut self, handle: DriverHandle) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("stop", Some(handle))?;
        if s.block.as_ref().is_some_and(|b| !b.complete) {
            s.block = None;
        }
        s.end_stream();
        Ok(())
    }
}

impl SignalGenerator for SimulatedScope {
    fn set_sig_gen_waveform(
        &mut self,
        handle: DriverHandle,
        waveform: Waveform,
        amplitude_mv: u32,
        offset_mv: i32,
    ) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_sig_gen_waveform", Some(handle))?;
        let output = s.sig_gen.get_or_insert(SigGenOutput {
            waveform,
            amplitude_mv,
            offset_mv,
            start_hz: 1000.0,
            stop_hz: 1000.0,
            increment_hz: 0.0,
            dwell: Duration::ZERO,
            sweep_type: SweepType::Up,
            applied: false,
        });
        output.waveform = waveform;
        output.amplitude_mv = amplitude_mv;
        output.offset_mv = offset_mv;
        output.applied = false;
        Ok(())
    }

    fn set_sig_gen_frequency(
        &mut self,
        handle: DriverHandle,
        start_hz: f64,
        stop_hz: f64,
        increment_hz: f64,
        dwell: Duration,
        sweep_type: SweepType,
    ) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("set_sig_gen_frequency", Some(handle))?;
        let output = s.sig_gen.as_mut().ok_or_else(|| {
            DriverError::InvalidParameter("waveform must be set first".to_string())
        })?;
        output.start_hz = start_hz;
        output.stop_hz = stop_hz;
        output.increment_hz = increment_hz;
        output.dwell = dwell;
        output.sweep_type = sweep_type;
        output.applied = false;
        Ok(())
    }

    fn sig_gen_apply(&mut self, handle: DriverHandle) -> DriverResult<()> {
        let mut s = self.state.borrow_mut();
        s.enter("sig_gen_apply", Some(handle))?;
        let output = s
            .sig_gen
            .as_mut()
            .ok_or_else(|| DriverError::InvalidParameter("nothing to apply".to_string()))?;
        output.applied = true;
        Ok(())
    }
}

/// Read-only view on a [`SimulatedScope`]'s state.
#[derive(Debug, Clone)]
pub struct SimProbe {
    state: Rc<RefCell<SimState>>,
}

impl SimProbe {
    pub fn is_open(&self) -> bool {
        self.state.borrow().open.is_some()
    }

    /// A block capture is in progress or the device is streaming.
    pub fn is_running(&self) -> bool {
        let s = self.state.borrow();
        s.block.as_ref().is_some_and(|b| !b.complete) || s.stream.is_some()
    }

    pub fn registered_buffers(&self) -> usize {
        self.state.borrow().registered.len()
    }

    pub fn resolution(&self) -> Resolution {
        self.state.borrow().resolution
    }

    pub fn memory_segments(&self) -> u32 {
        self.state.borrow().segments
    }

    pub fn trigger(&self) -> Option<SimpleTrigger> {
        self.state.borrow().trigger
    }

    pub fn call_log(&self) -> Vec<&'static str> {
        self.state.borrow().call_log.clone()
    }

    pub fn calls_named(&self, call: &str) -> usize {
        self.state
            .borrow()
            .call_log
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Streaming samples lost because the host did not keep up.
    pub fn dropped_samples(&self) -> u64 {
        let s = self.state.borrow();
        s.dropped + s.stream.as_ref().map_or(0, |stream| stream.dropped)
    }

    pub fn sig_gen(&self) -> Option<SigGenOutput> {
        self.state.borrow().sig_gen.clone()
    }
}
