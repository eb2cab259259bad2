use std::time::Duration;

use crate::channel_config::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdDirection {
    Above,
    Below,
    #[default]
    Rising,
    Falling,
    RisingOrFalling,
}

impl ThresholdDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
            Self::Rising => "rising",
            Self::Falling => "falling",
            Self::RisingOrFalling => "rising-or-falling",
        }
    }
}

/// Simple edge/level trigger on one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    pub enabled: bool,
    pub source: Channel,
    pub threshold_mv: f64,
    pub direction: ThresholdDirection,
    /// Samples between the trigger event and the first stored post-trigger sample.
    pub delay_samples: u64,
    /// Fire anyway after this many microseconds; `0` waits forever.
    pub auto_trigger_us: u32,
}

impl TriggerConfig {
    pub fn start_capturing_when(source: Channel, threshold_mv: f64) -> TriggerBuilder {
        TriggerBuilder {
            source,
            threshold_mv,
            direction: ThresholdDirection::Rising,
            delay_samples: 0,
            auto_trigger_us: 0,
        }
    }

    /// A trigger that never fires; the device captures immediately after arming.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            source: Channel::A,
            threshold_mv: 0.0,
            direction: ThresholdDirection::default(),
            delay_samples: 0,
            auto_trigger_us: 0,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug)]
pub struct TriggerBuilder {
    source: Channel,
    threshold_mv: f64,
    direction: ThresholdDirection,
    delay_samples: u64,
    auto_trigger_us: u32,
}

impl TriggerBuilder {
    pub fn rising_edge(mut self) -> TriggerConfig {
        self.direction = ThresholdDirection::Rising;
        self.build()
    }

    pub fn falling_edge(mut self) -> TriggerConfig {
        self.direction = ThresholdDirection::Falling;
        self.build()
    }

    pub fn either_edge(mut self) -> TriggerConfig {
        self.direction = ThresholdDirection::RisingOrFalling;
        self.build()
    }

    pub fn above(mut self) -> TriggerConfig {
        self.direction = ThresholdDirection::Above;
        self.build()
    }

    pub fn below(mut self) -> TriggerConfig {
        self.direction = ThresholdDirection::Below;
        self.build()
    }

    pub fn delay_samples(mut self, samples: u64) -> Self {
        self.delay_samples = samples;
        self
    }

    /// Same as waiting for the edge, but fires anyway once `timeout` elapses.
    pub fn auto_trigger_after(mut self, timeout: Duration) -> Self {
        self.auto_trigger_us = u32::try_from(timeout.as_micros()).unwrap_or(u32::MAX);
        self
    }

    fn build(self) -> TriggerConfig {
        TriggerConfig {
            enabled: true,
            source: self.source,
            threshold_mv: self.threshold_mv,
            direction: self.direction,
            delay_samples: self.delay_samples,
            auto_trigger_us: self.auto_trigger_us,
        }
    }
}

/// Trigger in the form the driver takes it: threshold as an ADC code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleTrigger {
    pub enabled: bool,
    pub source: Channel,
    pub threshold_code: i16,
    pub direction: ThresholdDirection,
    pub delay_samples: u64,
    pub auto_trigger_us: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_direction() {
        let trigger = TriggerConfig::start_capturing_when(Channel::A, 1000.0).rising_edge();
        assert!(trigger.enabled);
        assert_eq!(trigger.source, Channel::A);
        assert_eq!(trigger.direction, ThresholdDirection::Rising);

        let trigger = TriggerConfig::start_capturing_when(Channel::C, -50.0)
            .delay_samples(100)
            .falling_edge();
        assert_eq!(trigger.direction, ThresholdDirection::Falling);
        assert_eq!(trigger.delay_samples, 100);
    }

    #[test]
    fn test_auto_trigger_saturates() {
        let trigger = TriggerConfig::start_capturing_when(Channel::A, 0.0)
            .auto_trigger_after(Duration::from_secs(u64::MAX / 2))
            .above();
        assert_eq!(trigger.auto_trigger_us, u32::MAX);

        let trigger = TriggerConfig::start_capturing_when(Channel::A, 0.0)
            .auto_trigger_after(Duration::from_millis(100))
            .above();
        assert_eq!(trigger.auto_trigger_us, 100_000);
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(!TriggerConfig::default().enabled);
        assert_eq!(ThresholdDirection::RisingOrFalling.as_str(), "rising-or-falling");
    }
}
