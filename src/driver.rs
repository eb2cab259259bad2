//! The capability interface a vendor driver has to provide.
//!
//! Everything below this trait (transport, timing, the driver's own memory
//! management) belongs to the driver. The rest of the crate only sequences
//! these calls.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::buffer_pool::{BufferKey, BufferRole};
use crate::channel_config::{Channel, ChannelConfig};
use crate::trigger_config::SimpleTrigger;

/// Handle number the driver hands out on `open_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverHandle(pub i16);

impl fmt::Display for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Resolution {
    #[default]
    Bits8,
    Bits10,
    Bits12,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Self::Bits8 => 8,
            Self::Bits10 => 10,
            Self::Bits12 => 12,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::Bits8),
            10 => Some(Self::Bits10),
            12 => Some(Self::Bits12),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// ADC code range for one resolution. Only meaningful together with that resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcLimits {
    pub resolution: Resolution,
    pub min_code: i16,
    pub max_code: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    Femtoseconds,
    Picoseconds,
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn to_seconds(self, value: u32) -> f64 {
        let scale = match self {
            Self::Femtoseconds => 1e-15,
            Self::Picoseconds => 1e-12,
            Self::Nanoseconds => 1e-9,
            Self::Microseconds => 1e-6,
            Self::Milliseconds => 1e-3,
            Self::Seconds => 1.0,
        };
        f64::from(value) * scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownSampleMode {
    #[default]
    None,
    /// Max and min of each window, into a buffer pair.
    Aggregate,
    Decimate,
    Average,
}

impl DownSampleMode {
    /// Buffer roles the driver writes for this mode.
    pub fn roles(self) -> &'static [BufferRole] {
        match self {
            Self::Aggregate => &[BufferRole::Max, BufferRole::Min],
            Self::None | Self::Decimate | Self::Average => &[BufferRole::Max],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    /// `None` when the driver cannot tell; channel calls are then best-effort.
    pub channel_count: Option<u8>,
    pub resolutions: Vec<Resolution>,
}

impl DeviceInfo {
    pub fn has_channel(&self, channel: Channel) -> Option<bool> {
        self.channel_count
            .map(|count| channel.index() < usize::from(count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseInfo {
    pub timebase: u32,
    pub sample_interval_s: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValuesInfo {
    /// Samples written into each target buffer, after down-sampling.
    pub samples: u64,
    pub overflow: BTreeSet<Channel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingUpdate {
    /// Offset into the currently registered buffers where the new samples start.
    pub start_index: usize,
    pub sample_count: usize,
    /// Stream-absolute sample index of the trigger event, once seen.
    pub triggered_at: Option<u64>,
    pub auto_stopped: bool,
    /// Channels that went over range in the samples of this update.
    pub overflow: BTreeSet<Channel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingSettings {
    pub sample_interval: u32,
    pub time_unit: TimeUnit,
    pub pre_trigger: u64,
    pub post_trigger: u64,
    pub auto_stop: bool,
    pub ratio: u32,
    pub mode: DownSampleMode,
}

/// Mutable view of one registered buffer, handed to the driver for a transfer.
#[derive(Debug)]
pub struct BufferTarget<'a> {
    pub key: BufferKey,
    pub data: &'a mut [i16],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("No device found{}", .serial.as_ref().map(|s| format!(" with serial {s}")).unwrap_or_default())]
    NotFound { serial: Option<String> },

    #[error("Device is not open")]
    NotOpen,

    #[error("Connection to the device was lost")]
    ConnectionLost,

    #[error("Channel {0} is not present on this model")]
    ChannelNotSupported(Channel),

    #[error("Resolution of {0} bits is not supported")]
    ResolutionNotSupported(u8),

    #[error("Voltage range not available on channel {0}")]
    InvalidVoltageRange(Channel),

    #[error("Trigger source {0} is not usable")]
    InvalidTriggerChannel(Channel),

    #[error("Requested {requested} samples but only {available} fit")]
    TooManySamples { requested: u64, available: u64 },

    #[error("Not enough memory for {segments} segments")]
    InsufficientMemory { segments: u32 },

    #[error("Buffer rejected: {0}")]
    InvalidBuffer(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Data not ready yet")]
    NotReady,

    #[error("Device is busy")]
    Busy,

    #[error("Driver returned status {0:#06x}")]
    Status(u32),
}

impl DriverError {
    /// Transient statuses a poll loop retries instead of failing on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady | Self::Busy)
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::NotOpen)
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Capability interface of an acquisition device driver.
///
/// Calls map one-to-one onto the vendor API. Buffers are registered by key
/// and only lent to the driver as [`BufferTarget`]s for the duration of a
/// transfer call.
pub trait ScopeDriver {
    fn open_unit(&mut self, serial: Option<&str>) -> DriverResult<(DriverHandle, DeviceInfo)>;
    fn close_unit(&mut self, handle: DriverHandle) -> DriverResult<()>;

    fn set_resolution(&mut self, handle: DriverHandle, resolution: Resolution) -> DriverResult<()>;
    fn get_adc_limits(&mut self, handle: DriverHandle, resolution: Resolution)
        -> DriverResult<(i16, i16)>;
    /// Total sample memory available at `resolution`, in samples.
    fn memory_capacity(&mut self, handle: DriverHandle, resolution: Resolution) -> DriverResult<u64>;

    fn set_channel_on(&mut self, handle: DriverHandle, config: &ChannelConfig) -> DriverResult<()>;
    fn set_channel_off(&mut self, handle: DriverHandle, channel: Channel) -> DriverResult<()>;
    fn set_simple_trigger(&mut self, handle: DriverHandle, trigger: &SimpleTrigger)
        -> DriverResult<()>;

    fn get_fastest_timebase(
        &mut self,
        handle: DriverHandle,
        enabled: &[Channel],
        resolution: Resolution,
    ) -> DriverResult<TimebaseInfo>;
    fn get_timebase(
        &mut self,
        handle: DriverHandle,
        timebase: u32,
        samples: u64,
        segment: u32,
    ) -> DriverResult<TimebaseInfo>;

    /// Splits memory into `segments`; returns the max samples per segment.
    fn set_memory_segments(&mut self, handle: DriverHandle, segments: u32) -> DriverResult<u64>;
    fn set_capture_count(&mut self, handle: DriverHandle, captures: u32) -> DriverResult<()>;

    fn set_data_buffer(
        &mut self,
        handle: DriverHandle,
        key: BufferKey,
        capacity: usize,
        mode: DownSampleMode,
    ) -> DriverResult<()>;
    fn clear_data_buffers(&mut self, handle: DriverHandle) -> DriverResult<()>;

    /// Starts a block (or rapid-block) capture; returns the estimated time to completion.
    fn run_block(
        &mut self,
        handle: DriverHandle,
        pre_trigger: u64,
        post_trigger: u64,
        timebase: u32,
        segment: u32,
    ) -> DriverResult<Duration>;
    fn is_ready(&mut self, handle: DriverHandle) -> DriverResult<bool>;

    /// Starts streaming; returns the sample interval the device actually uses, in seconds.
    fn run_streaming(&mut self, handle: DriverHandle, settings: &StreamingSettings)
        -> DriverResult<f64>;
    fn get_streaming_latest_values(
        &mut self,
        handle: DriverHandle,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<StreamingUpdate>;

    fn get_values(
        &mut self,
        handle: DriverHandle,
        start_index: u64,
        samples: u64,
        ratio: u32,
        mode: DownSampleMode,
        segment: u32,
        targets: &mut [BufferTarget<'_>],
    ) -> DriverResult<ValuesInfo>;
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
    ) -> DriverResult<Vec<ValuesInfo>>;

    fn stop(&mut self, handle: DriverHandle) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_bits() {
        for resolution in [Resolution::Bits8, Resolution::Bits10, Resolution::Bits12] {
            assert_eq!(Resolution::from_bits(resolution.bits()), Some(resolution));
        }
        assert_eq!(Resolution::from_bits(14), None);
    }

    #[test]
    fn test_time_unit_scale() {
        assert!((TimeUnit::Microseconds.to_seconds(5) - 5e-6).abs() < 1e-18);
        assert!((TimeUnit::Seconds.to_seconds(2) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_needs_pair() {
        assert_eq!(DownSampleMode::Aggregate.roles().len(), 2);
        assert_eq!(DownSampleMode::Average.roles(), &[BufferRole::Max]);
    }

    #[test]
    fn test_not_found_message() {
        let error = DriverError::NotFound {
            serial: Some("JY123/0001".to_string()),
        };
        assert_eq!(error.to_string(), "No device found with serial JY123/0001");
        assert!(DriverError::NotReady.is_transient());
        assert!(!DriverError::Status(3).is_transient());
    }
}
