//! # scope-acquire
//!
//! Host-side acquisition controller for oscilloscope-like devices.
//!
//! The crate sequences calls on a vendor driver to configure channels and
//! triggers, manage sample memory and buffers, run block, rapid-block and
//! streaming captures, and turn raw ADC codes into calibrated waveforms.
//!
//! ## Features
//!
//! - **Driver abstraction**: any device implementing [`ScopeDriver`] can be driven
//! - **Capture modes**: block, rapid-block (segmented memory) and streaming with buffer hand-off
//! - **Buffer management**: keyed buffer pool; no buffer is re-registered before it is drained
//! - **Bounded polling**: readiness polling with timeout and backoff, never an unbounded spin
//! - **Calibration**: ADC codes to millivolts with the resolution-specific full-scale code
//! - **DataFrame output**: datasets convert to `polars` frames
//! - **Simulation**: `SimulatedScope` implements the full driver interface for tests and demos
//!   (`simulator` feature, on by default)
//!
//! ## Examples
//!
//! ### Block capture
//!
//! ```rust
//! use scope_acquire::{
//!     AcquisitionConfig, AcquisitionController, BlockRequest, Channel, ChannelConfig,
//!     SimulatedScope, TriggerConfig, VoltageRange,
//! };
//!
//! let mut controller = AcquisitionController::new(SimulatedScope::new());
//! let config = AcquisitionConfig::new()
//!     .resolution_bits(10)
//!     .channel(ChannelConfig::on(Channel::A).range(VoltageRange::symmetric_mv(5000)))
//!     .trigger(TriggerConfig::start_capturing_when(Channel::A, 1000.0).rising_edge());
//!
//! let dataset = controller.run_block_capture(&config, &BlockRequest::new(1_000, 9_000))?;
//! println!("Captured {} samples", dataset.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Step by step
//!
//! ```rust
//! use scope_acquire::{
//!     BlockRequest, CaptureSession, Channel, ChannelConfig, DeviceHandle, DownSampling,
//!     PollPolicy, SimulatedScope,
//! };
//!
//! let mut driver = SimulatedScope::new();
//! let mut device = DeviceHandle::open(&mut driver, None)?;
//! let mut session = CaptureSession::new(&mut device)?;
//!
//! session.disable_all_channels()?;
//! session.set_channel(ChannelConfig::on(Channel::B))?;
//! session.arm_block(&BlockRequest::new(0, 500))?;
//! session.wait_until_ready(&PollPolicy::default())?;
//! session.retrieve(0, 500, DownSampling::default(), 0)?;
//!
//! let datasets = session.scale()?;
//! let df = datasets[0].to_dataframe()?;
//! println!("{} rows, columns {:?}", df.height(), df.get_column_names());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition;
pub mod buffer_pool;
pub mod calibration;
pub mod capture;
pub mod channel_config;
pub mod configurator;
pub mod dataset;
pub mod device;
pub mod driver;
pub mod polling;
pub mod session;
pub mod signal_generator;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
pub mod trigger_config;

// Re-export the main types for convenience
pub use acquisition::{
    AcquisitionConfig, AcquisitionController, AcquisitionError, AcquisitionFailure, ErrorCategory,
};

pub use buffer_pool::{BufferBindError, BufferKey, BufferPool, BufferRole};

pub use calibration::{to_raw_code, to_voltage, CalibrationError};

pub use capture::{
    BlockRequest, CaptureMode, CaptureResult, DownSampling, OverflowWarning, RapidBlockRequest,
    StreamingRequest, StreamingStop, TimebaseChoice,
};

pub use channel_config::{
    BandwidthLimit, Channel, ChannelConfig, Coupling, ProbeAttenuation, VoltageRange,
};

pub use configurator::ConfigError;

pub use dataset::WaveformDataset;

pub use device::{DeviceError, DeviceHandle, DeviceStatus};

pub use driver::{
    DownSampleMode, DriverError, DriverHandle, Resolution, ScopeDriver, TimeUnit,
};

pub use polling::{PollPolicy, PollTimeout};

pub use session::{
    CaptureSession, PollControl, SessionError, SessionState, StreamingPoll, StreamingProgress,
};

pub use signal_generator::{SignalGenerator, SignalGeneratorConfig, SignalGeneratorError, Waveform};

#[cfg(any(test, feature = "simulator"))]
pub use simulator::{SimProbe, SimulatedScope};

pub use trigger_config::{ThresholdDirection, TriggerConfig};
