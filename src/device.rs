use std::collections::BTreeMap;
use std::fmt;

use crate::channel_config::{Channel, ChannelConfig};
use crate::driver::{AdcLimits, DeviceInfo, DriverError, DriverHandle, Resolution, ScopeDriver};
use crate::trigger_config::TriggerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Closed,
    Open,
    Streaming,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Error => "in error",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Could not connect: {0}")]
    Connection(#[source] DriverError),

    #[error("Resolution of {bits} bits is not supported by this device")]
    UnsupportedResolution { bits: u8 },

    #[error("Cannot change resolution while a capture is armed")]
    CaptureArmed,

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
}

/// An open connection to one device.
///
/// Borrows the driver for the lifetime of the connection and closes the unit
/// when dropped, so every exit path of an acquisition run disconnects.
pub struct DeviceHandle<'d, D: ScopeDriver> {
    driver: &'d mut D,
    handle: DriverHandle,
    info: DeviceInfo,
    status: DeviceStatus,
    adc_limits: AdcLimits,
    channels: BTreeMap<Channel, ChannelConfig>,
    trigger: TriggerConfig,
    armed: bool,
}

impl<'d, D: ScopeDriver> DeviceHandle<'d, D> {
    /// Connect to the device with the given serial, or the first one found.
    pub fn open(driver: &'d mut D, serial: Option<&str>) -> Result<Self, DeviceError> {
        log::debug!("Opening device {}", serial.unwrap_or("<any>"));
        let (handle, info) = driver.open_unit(serial).map_err(DeviceError::Connection)?;
        log::debug!("Opened {} ({}) as {}", info.model, info.serial, handle);

        let resolution = Resolution::default();
        let limits = match driver.get_adc_limits(handle, resolution) {
            Ok(limits) => limits,
            Err(e) => {
                if let Err(close) = driver.close_unit(handle) {
                    log::warn!("Closing {} after a failed open: {}", handle, close);
                }
                return Err(DeviceError::Connection(e));
            }
        };

        Ok(Self {
            driver,
            handle,
            info,
            status: DeviceStatus::Open,
            adc_limits: AdcLimits {
                resolution,
                min_code: limits.0,
                max_code: limits.1,
            },
            channels: BTreeMap::new(),
            trigger: TriggerConfig::disabled(),
            armed: false,
        })
    }

    /// Disconnect. A fresh [`DeviceHandle::open`] is needed afterwards.
    pub fn close(mut self) -> Result<(), DeviceError> {
        self.disconnect()
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        if self.status == DeviceStatus::Closed {
            return Ok(());
        }
        log::debug!("Closing device {}", self.handle);
        if self.armed || self.status == DeviceStatus::Streaming {
            if let Err(e) = self.driver.stop(self.handle) {
                log::warn!("Stopping {} before close failed: {}", self.handle, e);
            }
            self.armed = false;
        }
        let result = self.driver.close_unit(self.handle);
        self.status = DeviceStatus::Closed;
        result.map_err(|source| DeviceError::Driver {
            operation: "close_unit",
            source,
        })
    }

    pub fn set_resolution(&mut self, bits: u8) -> Result<(), DeviceError> {
        if self.armed {
            return Err(DeviceError::CaptureArmed);
        }
        let resolution = Resolution::from_bits(bits)
            .filter(|r| self.info.resolutions.contains(r))
            .ok_or(DeviceError::UnsupportedResolution { bits })?;

        self.call("set_resolution", |driver, handle| {
            driver.set_resolution(handle, resolution)
        })
        .map_err(|source| match source {
            DriverError::ResolutionNotSupported(bits) => DeviceError::UnsupportedResolution { bits },
            source => DeviceError::Driver {
                operation: "set_resolution",
                source,
            },
        })?;

        let (min_code, max_code) = self
            .get_adc_limits(resolution)
            .map_err(|source| DeviceError::Driver {
                operation: "get_adc_limits",
                source,
            })?;
        self.adc_limits = AdcLimits {
            resolution,
            min_code,
            max_code,
        };
        log::debug!(
            "Resolution set to {}, ADC codes [{}, {}]",
            resolution,
            min_code,
            max_code
        );
        Ok(())
    }

    pub fn get_adc_limits(&mut self, resolution: Resolution) -> Result<(i16, i16), DriverError> {
        self.call("get_adc_limits", |driver, handle| {
            driver.get_adc_limits(handle, resolution)
        })
    }

    pub fn memory_capacity(&mut self) -> Result<u64, DriverError> {
        let resolution = self.resolution();
        self.call("memory_capacity", |driver, handle| {
            driver.memory_capacity(handle, resolution)
        })
    }

    /// Run one driver call, logging it and tracking connection loss.
    pub(crate) fn call<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut D, DriverHandle) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        if self.status == DeviceStatus::Closed {
            return Err(DriverError::NotOpen);
        }
        log::trace!("{} -> {}", self.handle, operation);
        let result = f(&mut *self.driver, self.handle);
        if let Err(e) = &result {
            if e.is_connection_loss() {
                log::debug!("{} lost connection during {}", self.handle, operation);
                self.status = DeviceStatus::Error;
            }
        }
        result
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn resolution(&self) -> Resolution {
        self.adc_limits.resolution
    }

    /// ADC limits paired with the current resolution.
    pub fn adc_limits(&self) -> AdcLimits {
        self.adc_limits
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn channel_config(&self, channel: Channel) -> Option<&ChannelConfig> {
        self.channels.get(&channel)
    }

    pub fn channel_configs(&self) -> &BTreeMap<Channel, ChannelConfig> {
        &self.channels
    }

    pub fn enabled_channels(&self) -> Vec<Channel> {
        self.channels
            .values()
            .filter(|c| c.enabled)
            .map(|c| c.channel)
            .collect()
    }

    pub fn is_channel_enabled(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.enabled)
    }

    pub fn trigger(&self) -> &TriggerConfig {
        &self.trigger
    }

    pub(crate) fn record_channel(&mut self, config: ChannelConfig) {
        self.channels.insert(config.channel, config);
    }

    pub(crate) fn record_trigger(&mut self, trigger: TriggerConfig) {
        self.trigger = trigger;
    }

    pub(crate) fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub(crate) fn set_status(&mut self, status: DeviceStatus) {
        if self.status != DeviceStatus::Closed {
            self.status = status;
        }
    }
}

impl<D: ScopeDriver> Drop for DeviceHandle<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::warn!("Closing device on drop failed: {}", e);
        }
    }
}

impl<D: ScopeDriver> fmt::Debug for DeviceHandle<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("handle", &self.handle)
            .field("serial", &self.info.serial)
            .field("status", &self.status)
            .field("resolution", &self.adc_limits.resolution)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}
