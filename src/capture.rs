use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::channel_config::Channel;
use crate::driver::{DownSampleMode, Resolution, TimeUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Block,
    RapidBlock,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimebaseChoice {
    /// Fastest timebase for the enabled channels at the current resolution.
    #[default]
    Fastest,
    Explicit(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownSampling {
    pub ratio: u32,
    pub mode: DownSampleMode,
}

impl DownSampling {
    pub fn new(ratio: u32, mode: DownSampleMode) -> Self {
        Self { ratio, mode }
    }

    /// Samples produced from `raw` input samples.
    pub fn output_len(&self, raw: u64) -> u64 {
        raw.div_ceil(u64::from(self.ratio.max(1)))
    }

    pub fn is_valid(&self) -> bool {
        self.ratio >= 1 && (self.mode != DownSampleMode::None || self.ratio == 1)
    }
}

impl Default for DownSampling {
    fn default() -> Self {
        Self::new(1, DownSampleMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub pre_trigger: u64,
    pub post_trigger: u64,
    pub timebase: TimebaseChoice,
    pub segment: u32,
    pub downsampling: DownSampling,
}

impl BlockRequest {
    pub fn new(pre_trigger: u64, post_trigger: u64) -> Self {
        Self {
            pre_trigger,
            post_trigger,
            timebase: TimebaseChoice::default(),
            segment: 0,
            downsampling: DownSampling::default(),
        }
    }

    pub fn timebase(mut self, timebase: TimebaseChoice) -> Self {
        self.timebase = timebase;
        self
    }

    pub fn segment(mut self, segment: u32) -> Self {
        self.segment = segment;
        self
    }

    pub fn downsampling(mut self, downsampling: DownSampling) -> Self {
        self.downsampling = downsampling;
        self
    }

    pub fn total_samples(&self) -> u64 {
        self.pre_trigger.saturating_add(self.post_trigger)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RapidBlockRequest {
    pub pre_trigger: u64,
    pub post_trigger: u64,
    pub segments: u32,
    pub timebase: TimebaseChoice,
    pub downsampling: DownSampling,
}

impl RapidBlockRequest {
    pub fn new(pre_trigger: u64, post_trigger: u64, segments: u32) -> Self {
        Self {
            pre_trigger,
            post_trigger,
            segments,
            timebase: TimebaseChoice::default(),
            downsampling: DownSampling::default(),
        }
    }

    pub fn timebase(mut self, timebase: TimebaseChoice) -> Self {
        self.timebase = timebase;
        self
    }

    pub fn downsampling(mut self, downsampling: DownSampling) -> Self {
        self.downsampling = downsampling;
        self
    }

    pub fn total_samples(&self) -> u64 {
        self.pre_trigger.saturating_add(self.post_trigger)
    }
}

/// When a streaming run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingStop {
    /// Only after `max_buffers` buffers have been filled; device auto-stop is ignored.
    BufferLimit,
    /// After `max_buffers` buffers, or as soon as the device reports auto-stop.
    #[default]
    BufferLimitOrAutoStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingRequest {
    pub pre_trigger: u64,
    pub post_trigger: u64,
    pub sample_interval: u32,
    pub time_unit: TimeUnit,
    pub auto_stop: bool,
    pub downsampling: DownSampling,
    pub samples_per_buffer: usize,
    /// Buffers to fill before the run ends.
    pub max_buffers: u32,
    /// Physical buffers cycled per channel.
    pub ring_slots: u32,
    pub stop: StreamingStop,
    /// Delay between `get_streaming_latest_values` calls.
    pub poll_interval: Duration,
}

impl StreamingRequest {
    pub fn new(sample_interval: u32, time_unit: TimeUnit, samples_per_buffer: usize) -> Self {
        Self {
            pre_trigger: 0,
            post_trigger: 0,
            sample_interval,
            time_unit,
            auto_stop: false,
            downsampling: DownSampling::default(),
            samples_per_buffer,
            max_buffers: 10,
            ring_slots: 2,
            stop: StreamingStop::default(),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Let the device stop on its own after `pre + post` samples.
    pub fn auto_stop(mut self, pre_trigger: u64, post_trigger: u64) -> Self {
        self.pre_trigger = pre_trigger;
        self.post_trigger = post_trigger;
        self.auto_stop = true;
        self
    }

    pub fn trigger_window(mut self, pre_trigger: u64, post_trigger: u64) -> Self {
        self.pre_trigger = pre_trigger;
        self.post_trigger = post_trigger;
        self
    }

    pub fn max_buffers(mut self, max_buffers: u32) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn ring_slots(mut self, ring_slots: u32) -> Self {
        self.ring_slots = ring_slots;
        self
    }

    pub fn stop(mut self, stop: StreamingStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn downsampling(mut self, downsampling: DownSampling) -> Self {
        self.downsampling = downsampling;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn total_samples(&self) -> u64 {
        self.pre_trigger.saturating_add(self.post_trigger)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    Block(BlockRequest),
    RapidBlock(RapidBlockRequest),
    Streaming(StreamingRequest),
}

impl CaptureRequest {
    pub fn mode(&self) -> CaptureMode {
        match self {
            Self::Block(_) => CaptureMode::Block,
            Self::RapidBlock(_) => CaptureMode::RapidBlock,
            Self::Streaming(_) => CaptureMode::Streaming,
        }
    }

    /// Pre- plus post-trigger samples; per segment in rapid-block mode.
    /// Saturates, see [`CaptureRequest::validate`].
    pub fn total_samples(&self) -> u64 {
        match self {
            Self::Block(r) => r.total_samples(),
            Self::RapidBlock(r) => r.total_samples(),
            Self::Streaming(r) => r.total_samples(),
        }
    }

    fn window(&self) -> (u64, u64) {
        match self {
            Self::Block(r) => (r.pre_trigger, r.post_trigger),
            Self::RapidBlock(r) => (r.pre_trigger, r.post_trigger),
            Self::Streaming(r) => (r.pre_trigger, r.post_trigger),
        }
    }

    pub fn segment_count(&self) -> u32 {
        match self {
            Self::RapidBlock(r) => r.segments,
            Self::Block(_) | Self::Streaming(_) => 1,
        }
    }

    pub fn downsampling(&self) -> DownSampling {
        match self {
            Self::Block(r) => r.downsampling,
            Self::RapidBlock(r) => r.downsampling,
            Self::Streaming(r) => r.downsampling,
        }
    }

    /// Checks that hold regardless of the device.
    pub fn validate(&self) -> Result<(), String> {
        if !self.downsampling().is_valid() {
            return Err(format!(
                "down-sampling ratio {} is not valid for mode {:?}",
                self.downsampling().ratio,
                self.downsampling().mode
            ));
        }
        if self.segment_count() == 0 {
            return Err("segment count must be at least 1".to_string());
        }
        let (pre, post) = self.window();
        if pre.checked_add(post).is_none() {
            return Err(format!("{pre} pre- plus {post} post-trigger samples overflow"));
        }
        match self {
            Self::Block(_) | Self::RapidBlock(_) if self.total_samples() == 0 => {
                Err("a block capture needs at least one sample".to_string())
            }
            Self::Streaming(r) if r.samples_per_buffer == 0 => {
                Err("samples per buffer must be at least 1".to_string())
            }
            Self::Streaming(r) if r.max_buffers == 0 || r.ring_slots == 0 => {
                Err("streaming needs at least one buffer".to_string())
            }
            Self::Streaming(r) if r.sample_interval == 0 => {
                Err("sample interval must be positive".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Raw codes from one segment (or one whole stream), before scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub segment: u32,
    pub resolution: Resolution,
    pub samples: BTreeMap<Channel, Vec<i16>>,
    /// Window minima, present only for aggregated down-sampling.
    pub minimums: BTreeMap<Channel, Vec<i16>>,
    pub overflow: BTreeSet<Channel>,
    pub samples_collected: u64,
    pub sample_interval_s: f64,
    pub pre_trigger_samples: u64,
    pub trigger_index: Option<u64>,
}

impl CaptureResult {
    pub fn is_overflowed(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn overflow_warning(&self) -> Option<OverflowWarning> {
        self.is_overflowed().then(|| OverflowWarning {
            segment: self.segment,
            channels: self.overflow.iter().copied().collect(),
        })
    }
}

/// Input went over range on some channels; the data is still usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Segment {segment}: over-range on channel(s) {}", ChannelList(.channels))]
pub struct OverflowWarning {
    pub segment: u32,
    pub channels: Vec<Channel>,
}

struct ChannelList<'a>(&'a [Channel]);

impl fmt::Display for ChannelList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, channel) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{channel}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_len_rounds_up() {
        let ds = DownSampling::new(4, DownSampleMode::Average);
        assert_eq!(ds.output_len(16), 4);
        assert_eq!(ds.output_len(17), 5);
        assert_eq!(DownSampling::default().output_len(17), 17);
    }

    #[test]
    fn test_ratio_without_mode_is_invalid() {
        assert!(!DownSampling::new(2, DownSampleMode::None).is_valid());
        assert!(!DownSampling::new(0, DownSampleMode::Decimate).is_valid());
        assert!(DownSampling::new(8, DownSampleMode::Aggregate).is_valid());
    }

    #[test]
    fn test_validate() {
        assert!(CaptureRequest::Block(BlockRequest::new(10, 90)).validate().is_ok());
        assert!(CaptureRequest::Block(BlockRequest::new(0, 0)).validate().is_err());
        assert!(CaptureRequest::RapidBlock(RapidBlockRequest::new(0, 100, 0))
            .validate()
            .is_err());
        let streaming = StreamingRequest::new(1, TimeUnit::Microseconds, 1000);
        assert!(CaptureRequest::Streaming(streaming).validate().is_ok());
        assert!(CaptureRequest::Streaming(streaming.max_buffers(0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_oversized_window_does_not_wrap() {
        let request = BlockRequest::new(u64::MAX, 1);
        assert_eq!(request.total_samples(), u64::MAX);
        assert!(CaptureRequest::Block(request).validate().is_err());
        assert!(
            CaptureRequest::RapidBlock(RapidBlockRequest::new(1, u64::MAX, 2))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_overflow_warning_message() {
        let result = CaptureResult {
            segment: 3,
            resolution: Resolution::Bits8,
            samples: BTreeMap::new(),
            minimums: BTreeMap::new(),
            overflow: [Channel::A, Channel::C].into_iter().collect(),
            samples_collected: 0,
            sample_interval_s: 1e-9,
            pre_trigger_samples: 0,
            trigger_index: None,
        };
        let warning = result.overflow_warning().unwrap();
        assert_eq!(warning.to_string(), "Segment 3: over-range on channel(s) A, C");
    }
}
