//! Channel and trigger setup, applied to a device before a capture is armed.
//!
//! Channels come first, then the trigger, then buffer registration: the
//! trigger needs an enabled source, and buffers need enabled channels.

use crate::calibration::to_raw_code;
use crate::channel_config::{Channel, ChannelConfig, VoltageRange};
use crate::device::DeviceHandle;
use crate::driver::{DriverError, Resolution, ScopeDriver};
use crate::trigger_config::{SimpleTrigger, TriggerConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Channel {0} is not present on this device")]
    UnknownChannel(Channel),

    #[error("Range {range} on channel {channel} is not available at {resolution}")]
    InvalidRange {
        channel: Channel,
        range: VoltageRange,
        resolution: Resolution,
    },

    #[error("Trigger source {0} is not enabled")]
    InvalidTriggerSource(Channel),

    #[error("Trigger threshold {threshold_mv} mV is outside the range of channel {channel}")]
    ThresholdOutOfRange { channel: Channel, threshold_mv: f64 },

    #[error("Channel {0} is the trigger source; disable the trigger first")]
    TriggerSourceInUse(Channel),

    #[error("Configuration is locked while a capture is armed")]
    CaptureArmed,

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
}

fn ensure_not_armed<D: ScopeDriver>(device: &DeviceHandle<'_, D>) -> Result<(), ConfigError> {
    if device.is_armed() {
        return Err(ConfigError::CaptureArmed);
    }
    Ok(())
}

/// Switch every channel off.
///
/// Channel counts vary by model. Where the device reports its channel count,
/// absent channels are skipped; otherwise every channel is tried and a
/// "not supported" answer is ignored.
pub fn disable_all_channels<D: ScopeDriver>(
    device: &mut DeviceHandle<'_, D>,
) -> Result<(), ConfigError> {
    ensure_not_armed(device)?;
    if device.trigger().enabled {
        log::debug!("Disabling trigger along with all channels");
        set_trigger(device, TriggerConfig::disabled())?;
    }

    for channel in Channel::ALL {
        if device.info().has_channel(channel) == Some(false) {
            continue;
        }
        match device.call("set_channel_off", |driver, handle| {
            driver.set_channel_off(handle, channel)
        }) {
            Ok(()) => device.record_channel(ChannelConfig::off(channel)),
            Err(DriverError::ChannelNotSupported(_)) => {
                log::debug!("Channel {} not present, skipping", channel);
            }
            Err(source) => {
                return Err(ConfigError::Driver {
                    operation: "set_channel_off",
                    source,
                })
            }
        }
    }
    Ok(())
}

pub fn set_channel<D: ScopeDriver>(
    device: &mut DeviceHandle<'_, D>,
    config: ChannelConfig,
) -> Result<(), ConfigError> {
    ensure_not_armed(device)?;
    let channel = config.channel;
    if device.info().has_channel(channel) == Some(false) {
        return Err(ConfigError::UnknownChannel(channel));
    }

    if !config.enabled {
        let trigger = device.trigger();
        if trigger.enabled && trigger.source == channel {
            return Err(ConfigError::TriggerSourceInUse(channel));
        }
        device
            .call("set_channel_off", |driver, handle| {
                driver.set_channel_off(handle, channel)
            })
            .map_err(|source| channel_error(channel, "set_channel_off", source))?;
        device.record_channel(config);
        return Ok(());
    }

    let resolution = device.resolution();
    if !config.range.is_well_formed() {
        return Err(ConfigError::InvalidRange {
            channel,
            range: config.range,
            resolution,
        });
    }

    device
        .call("set_channel_on", |driver, handle| {
            driver.set_channel_on(handle, &config)
        })
        .map_err(|source| match source {
            DriverError::InvalidVoltageRange(_) => ConfigError::InvalidRange {
                channel,
                range: config.range,
                resolution,
            },
            source => channel_error(channel, "set_channel_on", source),
        })?;

    log::debug!(
        "Channel {} on: {:?}, {}, probe {:?}",
        channel,
        config.coupling,
        config.range,
        config.probe
    );
    device.record_channel(config);
    Ok(())
}

fn channel_error(channel: Channel, operation: &'static str, source: DriverError) -> ConfigError {
    match source {
        DriverError::ChannelNotSupported(_) => ConfigError::UnknownChannel(channel),
        source => ConfigError::Driver { operation, source },
    }
}

pub fn set_trigger<D: ScopeDriver>(
    device: &mut DeviceHandle<'_, D>,
    trigger: TriggerConfig,
) -> Result<(), ConfigError> {
    ensure_not_armed(device)?;

    let threshold_code = if trigger.enabled {
        let source = device
            .channel_config(trigger.source)
            .filter(|c| c.enabled)
            .ok_or(ConfigError::InvalidTriggerSource(trigger.source))?;

        // Threshold is given at the probe tip; the ADC sees it divided down.
        let at_input_mv = trigger.threshold_mv / source.probe.to_multiplier();
        if !source.range.contains_mv(at_input_mv) {
            return Err(ConfigError::ThresholdOutOfRange {
                channel: trigger.source,
                threshold_mv: trigger.threshold_mv,
            });
        }
        to_raw_code(
            at_input_mv,
            device.adc_limits().max_code,
            source.range.full_scale_mv(),
        )
    } else {
        0
    };

    let simple = SimpleTrigger {
        enabled: trigger.enabled,
        source: trigger.source,
        threshold_code,
        direction: trigger.direction,
        delay_samples: trigger.delay_samples,
        auto_trigger_us: trigger.auto_trigger_us,
    };
    device
        .call("set_simple_trigger", |driver, handle| {
            driver.set_simple_trigger(handle, &simple)
        })
        .map_err(|source| match source {
            DriverError::InvalidTriggerChannel(channel) => ConfigError::InvalidTriggerSource(channel),
            source => ConfigError::Driver {
                operation: "set_simple_trigger",
                source,
            },
        })?;

    if trigger.enabled {
        log::debug!(
            "Trigger on {} {} {} mV (code {})",
            trigger.source,
            trigger.direction.as_str(),
            trigger.threshold_mv,
            threshold_code
        );
    }
    device.record_trigger(trigger);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedScope;

    #[test]
    fn test_disable_all_is_idempotent() {
        let mut driver = SimulatedScope::new().with_channel_count(Some(4));
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        set_channel(&mut device, ChannelConfig::on(Channel::B)).unwrap();

        disable_all_channels(&mut device).unwrap();
        let once = device.channel_configs().clone();
        disable_all_channels(&mut device).unwrap();
        assert_eq!(device.channel_configs(), &once);

        assert_eq!(once.len(), 4);
        assert!(device.enabled_channels().is_empty());
    }

    #[test]
    fn test_disable_all_swallows_missing_channels() {
        // Channel count unknown to the host: every channel is tried.
        let mut driver = SimulatedScope::new()
            .with_channel_count(None)
            .with_physical_channels(2);
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();

        disable_all_channels(&mut device).unwrap();
        assert_eq!(probe.calls_named("set_channel_off"), 8);
        assert_eq!(device.channel_configs().len(), 2);
    }

    #[test]
    fn test_disable_all_skips_known_missing_channels() {
        let mut driver = SimulatedScope::new().with_channel_count(Some(2));
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();

        disable_all_channels(&mut device).unwrap();
        assert_eq!(probe.calls_named("set_channel_off"), 2);
    }

    #[test]
    fn test_unknown_channel() {
        let mut driver = SimulatedScope::new().with_channel_count(Some(2));
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        assert!(matches!(
            set_channel(&mut device, ChannelConfig::on(Channel::D)),
            Err(ConfigError::UnknownChannel(Channel::D))
        ));
    }

    #[test]
    fn test_range_not_representable() {
        let mut driver = SimulatedScope::new();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        device.set_resolution(12).unwrap();

        // The simulated front end tops out at ±10 V in 12-bit mode.
        let config = ChannelConfig::on(Channel::A).range(VoltageRange::symmetric_mv(20_000));
        assert!(matches!(
            set_channel(&mut device, config),
            Err(ConfigError::InvalidRange {
                resolution: Resolution::Bits12,
                ..
            })
        ));
        assert!(!device.is_channel_enabled(Channel::A));

        let inverted = ChannelConfig::on(Channel::A).range(VoltageRange::new(10, -10));
        assert!(matches!(
            set_channel(&mut device, inverted),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_trigger_requires_enabled_source() {
        let mut driver = SimulatedScope::new();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        set_channel(&mut device, ChannelConfig::on(Channel::A)).unwrap();

        let on_b = TriggerConfig::start_capturing_when(Channel::B, 100.0).rising_edge();
        assert!(matches!(
            set_trigger(&mut device, on_b),
            Err(ConfigError::InvalidTriggerSource(Channel::B))
        ));

        let on_a = TriggerConfig::start_capturing_when(Channel::A, 100.0).rising_edge();
        set_trigger(&mut device, on_a).unwrap();
        assert_eq!(device.trigger(), &on_a);
    }

    #[test]
    fn test_trigger_threshold_code() {
        let mut driver = SimulatedScope::new();
        let probe = driver.probe();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        set_channel(&mut device, ChannelConfig::on(Channel::A)).unwrap();

        let trigger = TriggerConfig::start_capturing_when(Channel::A, 2500.0).rising_edge();
        set_trigger(&mut device, trigger).unwrap();

        let max_code = device.adc_limits().max_code;
        let code = probe.trigger().unwrap().threshold_code;
        assert_eq!(code, to_raw_code(2500.0, max_code, 5000.0));
        assert!((i32::from(code) - i32::from(max_code) / 2).abs() <= 1);
    }

    #[test]
    fn test_trigger_threshold_out_of_range() {
        let mut driver = SimulatedScope::new();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        set_channel(&mut device, ChannelConfig::on(Channel::A)).unwrap();

        let trigger = TriggerConfig::start_capturing_when(Channel::A, 6000.0).rising_edge();
        assert!(matches!(
            set_trigger(&mut device, trigger),
            Err(ConfigError::ThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cannot_disable_trigger_source() {
        let mut driver = SimulatedScope::new();
        let mut device = DeviceHandle::open(&mut driver, None).unwrap();
        set_channel(&mut device, ChannelConfig::on(Channel::A)).unwrap();
        set_trigger(
            &mut device,
            TriggerConfig::start_capturing_when(Channel::A, 0.0).rising_edge(),
        )
        .unwrap();

        assert!(matches!(
            set_channel(&mut device, ChannelConfig::off(Channel::A)),
            Err(ConfigError::TriggerSourceInUse(Channel::A))
        ));
    }
}
