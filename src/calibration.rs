//! Linear ADC-code to millivolt scaling.
//!
//! The full-scale code depends on the resolution the capture ran at, so a
//! result is only ever scaled with the [`AdcLimits`] of that same resolution.

use std::collections::BTreeMap;

use crate::capture::CaptureResult;
use crate::channel_config::{Channel, ChannelConfig};
use crate::dataset::WaveformDataset;
use crate::driver::{AdcLimits, Resolution};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Capture ran at {captured} but ADC limits are for {limits}")]
    ResolutionMismatch {
        captured: Resolution,
        limits: Resolution,
    },

    #[error("ADC full-scale code {0} is not positive")]
    InvalidAdcMax(i16),

    #[error("No channel configuration for {0}")]
    MissingChannelConfig(Channel),
}

/// `code / adc_max * voltage_range_mv`
pub fn to_voltage(code: i16, adc_max: i16, voltage_range_mv: f64) -> f64 {
    f64::from(code) / f64::from(adc_max) * voltage_range_mv
}

/// Nearest ADC code for `millivolts`, saturating at `±adc_max`.
pub fn to_raw_code(millivolts: f64, adc_max: i16, voltage_range_mv: f64) -> i16 {
    let max = f64::from(adc_max);
    let code = (millivolts / voltage_range_mv * max).round();
    code.clamp(-max, max) as i16
}

/// Scaling for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelScaling {
    adc_max: i16,
    range_mv: f64,
    probe: f64,
}

impl ChannelScaling {
    pub fn new(config: &ChannelConfig, adc_max: i16) -> Self {
        Self {
            adc_max,
            range_mv: config.range.full_scale_mv(),
            probe: config.probe.to_multiplier(),
        }
    }

    pub fn millivolts(&self, code: i16) -> f64 {
        to_voltage(code, self.adc_max, self.range_mv) * self.probe
    }

    pub fn apply(&self, codes: &[i16]) -> Vec<f64> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("ChannelScaling::apply");

        codes.iter().map(|&code| self.millivolts(code)).collect()
    }
}

/// Scale every trace of `result` into a dataset.
pub fn scale_capture(
    result: &CaptureResult,
    channels: &BTreeMap<Channel, ChannelConfig>,
    limits: AdcLimits,
) -> Result<WaveformDataset, CalibrationError> {
    if result.resolution != limits.resolution {
        return Err(CalibrationError::ResolutionMismatch {
            captured: result.resolution,
            limits: limits.resolution,
        });
    }
    if limits.max_code <= 0 {
        return Err(CalibrationError::InvalidAdcMax(limits.max_code));
    }

    let scale = |codes: &BTreeMap<Channel, Vec<i16>>| {
        codes
            .iter()
            .map(|(&channel, raw)| {
                let config = channels
                    .get(&channel)
                    .ok_or(CalibrationError::MissingChannelConfig(channel))?;
                Ok((channel, ChannelScaling::new(config, limits.max_code).apply(raw)))
            })
            .collect::<Result<BTreeMap<_, _>, CalibrationError>>()
    };

    let traces = scale(&result.samples)?;
    let minimums = scale(&result.minimums)?;

    Ok(WaveformDataset::new(
        result.segment,
        result.resolution,
        result.sample_interval_s,
        traces,
        minimums,
        result.overflow.clone(),
        result.pre_trigger_samples,
        result.trigger_index,
    ))
}
