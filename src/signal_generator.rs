//! Built-in function generator, independent of the capture path.

use std::time::Duration;

use crate::device::DeviceHandle;
use crate::driver::{DriverError, DriverHandle, DriverResult, ScopeDriver};

#[derive(Debug, Clone, PartialEq, Eq, Copy, Default)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Triangle,
    RampUp,
    RampDown,
    DcVoltage,
}

impl Waveform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Triangle => "triangle",
            Waveform::RampUp => "ramp-up",
            Waveform::RampDown => "ramp-down",
            Waveform::DcVoltage => "dc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepType {
    #[default]
    Up,
    Down,
    UpDown,
    DownUp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sweep {
    pub stop_hz: f64,
    pub increment_hz: f64,
    /// Time spent at each frequency step.
    pub dwell: Duration,
    pub sweep_type: SweepType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalGeneratorConfig {
    pub waveform: Waveform,
    pub frequency_hz: f64,
    /// Peak-to-peak.
    pub amplitude_mv: u32,
    pub offset_mv: i32,
    pub sweep: Option<Sweep>,
}

impl SignalGeneratorConfig {
    pub fn new(waveform: Waveform, frequency_hz: f64) -> Self {
        Self {
            waveform,
            frequency_hz,
            amplitude_mv: 2000,
            offset_mv: 0,
            sweep: None,
        }
    }

    pub fn amplitude_mv(mut self, amplitude_mv: u32) -> Self {
        self.amplitude_mv = amplitude_mv;
        self
    }

    pub fn offset_mv(mut self, offset_mv: i32) -> Self {
        self.offset_mv = offset_mv;
        self
    }

    pub fn sweep_to(
        mut self,
        stop_hz: f64,
        increment_hz: f64,
        dwell: Duration,
        sweep_type: SweepType,
    ) -> Self {
        self.sweep = Some(Sweep {
            stop_hz,
            increment_hz,
            dwell,
            sweep_type,
        });
        self
    }

    pub fn validate(&self) -> Result<(), SignalGeneratorError> {
        if !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0) {
            return Err(SignalGeneratorError::InvalidFrequency(self.frequency_hz));
        }
        if let Some(sweep) = &self.sweep {
            if !(sweep.stop_hz.is_finite() && sweep.stop_hz > self.frequency_hz) {
                return Err(SignalGeneratorError::InvalidSweep {
                    start_hz: self.frequency_hz,
                    stop_hz: sweep.stop_hz,
                });
            }
            if !(sweep.increment_hz.is_finite() && sweep.increment_hz > 0.0) {
                return Err(SignalGeneratorError::InvalidIncrement(sweep.increment_hz));
            }
            if sweep.dwell.is_zero() {
                return Err(SignalGeneratorError::InvalidDwell);
            }
        }
        Ok(())
    }

    /// `(start, stop, increment, dwell, type)` as the driver takes them.
    fn frequency_plan(&self) -> (f64, f64, f64, Duration, SweepType) {
        match &self.sweep {
            Some(sweep) => (
                self.frequency_hz,
                sweep.stop_hz,
                sweep.increment_hz,
                sweep.dwell,
                sweep.sweep_type,
            ),
            None => (
                self.frequency_hz,
                self.frequency_hz,
                0.0,
                Duration::ZERO,
                SweepType::Up,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalGeneratorError {
    #[error("Frequency {0} Hz is not positive")]
    InvalidFrequency(f64),

    #[error("Sweep must go from a lower to a higher frequency ({start_hz} Hz -> {stop_hz} Hz)")]
    InvalidSweep { start_hz: f64, stop_hz: f64 },

    #[error("Sweep increment {0} Hz is not positive")]
    InvalidIncrement(f64),

    #[error("Sweep dwell time must be positive")]
    InvalidDwell,

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
}

/// Signal generator sub-interface of a driver.
pub trait SignalGenerator {
    fn set_sig_gen_waveform(
        &mut self,
        handle: DriverHandle,
        waveform: Waveform,
        amplitude_mv: u32,
        offset_mv: i32,
    ) -> DriverResult<()>;

    fn set_sig_gen_frequency(
        &mut self,
        handle: DriverHandle,
        start_hz: f64,
        stop_hz: f64,
        increment_hz: f64,
        dwell: Duration,
        sweep_type: SweepType,
    ) -> DriverResult<()>;

    /// Push the staged settings to the output.
    fn sig_gen_apply(&mut self, handle: DriverHandle) -> DriverResult<()>;
}

fn driver_error(operation: &'static str) -> impl FnOnce(DriverError) -> SignalGeneratorError {
    move |source| SignalGeneratorError::Driver { operation, source }
}

/// Validate `config` and program the generator with it.
pub fn apply<D: ScopeDriver + SignalGenerator>(
    device: &mut DeviceHandle<'_, D>,
    config: &SignalGeneratorConfig,
) -> Result<(), SignalGeneratorError> {
    config.validate()?;

    device
        .call("set_sig_gen_waveform", |driver, handle| {
            driver.set_sig_gen_waveform(handle, config.waveform, config.amplitude_mv, config.offset_mv)
        })
        .map_err(driver_error("set_sig_gen_waveform"))?;

    let (start, stop, increment, dwell, sweep_type) = config.frequency_plan();
    device
        .call("set_sig_gen_frequency", |driver, handle| {
            driver.set_sig_gen_frequency(handle, start, stop, increment, dwell, sweep_type)
        })
        .map_err(driver_error("set_sig_gen_frequency"))?;

    device
        .call("sig_gen_apply", |driver, handle| driver.sig_gen_apply(handle))
        .map_err(driver_error("sig_gen_apply"))?;

    log::debug!(
        "Signal generator: {} at {} Hz, {} mVpp, offset {} mV",
        config.waveform.as_str(),
        config.frequency_hz,
        config.amplitude_mv,
        config.offset_mv
    );
    Ok(())
}
