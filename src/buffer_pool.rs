//! Sample buffers keyed by (channel, segment-or-waveform index, role).
//!
//! The pool owns every buffer a capture writes into. Registration binds a
//! buffer to the device; only registered buffers are lent to the driver
//! during a transfer. A buffer holding samples nobody has read yet cannot be
//! registered again, which is what keeps a recycled streaming slot from
//! overwriting data.

use std::collections::BTreeMap;
use std::fmt;

use crate::channel_config::Channel;
use crate::device::DeviceHandle;
use crate::driver::{BufferTarget, DownSampleMode, DriverError, ScopeDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferRole {
    /// Plain samples, or the maximum of each window when aggregating.
    Max,
    /// Minimum of each window when aggregating.
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferKey {
    pub channel: Channel,
    /// Segment in block/rapid-block mode, ring slot in streaming mode.
    pub index: u32,
    pub role: BufferRole,
}

impl BufferKey {
    pub fn new(channel: Channel, index: u32, role: BufferRole) -> Self {
        Self {
            channel,
            index,
            role,
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]/{:?}", self.channel, self.index, self.role)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferBindError {
    #[error("No buffer allocated for {0}")]
    UnknownBuffer(BufferKey),

    #[error("Buffer {key} holds {capacity} samples but the capture needs {required}")]
    CapacityTooSmall {
        key: BufferKey,
        capacity: usize,
        required: usize,
    },

    #[error("Buffer {0} still holds unread samples")]
    NotDrained(BufferKey),

    #[error("Channel {0} is not enabled")]
    ChannelDisabled(Channel),

    #[error("Driver rejected buffer {key}: {source}")]
    Driver {
        key: BufferKey,
        #[source]
        source: DriverError,
    },
}

#[derive(Debug)]
pub struct SampleBuffer {
    key: BufferKey,
    data: Vec<i16>,
    filled: usize,
    unread: bool,
    registered: bool,
}

impl SampleBuffer {
    fn new(key: BufferKey, capacity: usize) -> Self {
        Self {
            key,
            data: vec![0; capacity],
            filled: 0,
            unread: false,
            registered: false,
        }
    }

    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn is_drained(&self) -> bool {
        !self.unread
    }

    /// Samples written so far.
    pub fn samples(&self) -> &[i16] {
        &self.data[..self.filled]
    }

    /// Record that the driver has written up to `filled` samples.
    pub(crate) fn mark_filled(&mut self, filled: usize) {
        self.filled = filled.min(self.data.len());
        self.unread = self.filled > 0;
    }

    /// Copy out everything written and mark the buffer reusable.
    pub fn drain(&mut self) -> Vec<i16> {
        let samples = self.data[..self.filled].to_vec();
        self.unread = false;
        samples
    }

    /// Like [`SampleBuffer::drain`], appending onto `out`.
    pub fn drain_into(&mut self, out: &mut Vec<i16>) {
        out.extend_from_slice(&self.data[..self.filled]);
        self.unread = false;
    }
}

#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: BTreeMap<BufferKey, SampleBuffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer, replacing any previous buffer with the same key.
    pub fn allocate(
        &mut self,
        channel: Channel,
        capacity: usize,
        index: u32,
        role: BufferRole,
    ) -> BufferKey {
        let key = BufferKey::new(channel, index, role);
        if let Some(old) = self.buffers.get(&key) {
            if !old.is_drained() {
                log::warn!("Reallocating {} with {} unread samples", key, old.filled);
            }
        }
        log::trace!("Allocating {} with {} samples", key, capacity);
        self.buffers.insert(key, SampleBuffer::new(key, capacity));
        key
    }

    /// Bind a buffer to the device for a capture that writes `required` samples into it.
    pub fn register<D: ScopeDriver>(
        &mut self,
        device: &mut DeviceHandle<'_, D>,
        key: BufferKey,
        required: usize,
        mode: DownSampleMode,
    ) -> Result<(), BufferBindError> {
        let buffer = self
            .buffers
            .get_mut(&key)
            .ok_or(BufferBindError::UnknownBuffer(key))?;

        if buffer.capacity() < required {
            return Err(BufferBindError::CapacityTooSmall {
                key,
                capacity: buffer.capacity(),
                required,
            });
        }
        if !buffer.is_drained() {
            return Err(BufferBindError::NotDrained(key));
        }
        if !device.is_channel_enabled(key.channel) {
            return Err(BufferBindError::ChannelDisabled(key.channel));
        }

        let capacity = buffer.capacity();
        device
            .call("set_data_buffer", |driver, handle| {
                driver.set_data_buffer(handle, key, capacity, mode)
            })
            .map_err(|source| BufferBindError::Driver { key, source })?;

        buffer.filled = 0;
        buffer.registered = true;
        log::trace!("Registered {}", key);
        Ok(())
    }

    /// Unbind every buffer from the device and drop them.
    pub fn release_all<D: ScopeDriver>(
        &mut self,
        device: &mut DeviceHandle<'_, D>,
    ) -> Result<(), DriverError> {
        let registered = self.registered_count();
        self.buffers.clear();
        if registered == 0 {
            return Ok(());
        }
        log::debug!("Releasing {} registered buffers", registered);
        device.call("clear_data_buffers", |driver, handle| {
            driver.clear_data_buffers(handle)
        })
    }

    pub fn get(&self, key: &BufferKey) -> Option<&SampleBuffer> {
        self.buffers.get(key)
    }

    pub fn get_mut(&mut self, key: &BufferKey) -> Option<&mut SampleBuffer> {
        self.buffers.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn registered_count(&self) -> usize {
        self.buffers.values().filter(|b| b.registered).count()
    }

    /// Keys of all buffers at `index`, in key order.
    pub fn keys_at(&self, index: u32) -> Vec<BufferKey> {
        self.buffers
            .keys()
            .filter(|k| k.index == index)
            .copied()
            .collect()
    }

    /// Lend the registered buffers selected by `select` to the driver.
    pub(crate) fn targets(
        &mut self,
        select: impl Fn(&BufferKey) -> bool,
    ) -> Vec<BufferTarget<'_>> {
        self.buffers
            .iter_mut()
            .filter(|(key, buffer)| buffer.registered && select(key))
            .map(|(key, buffer)| BufferTarget {
                key: *key,
                data: buffer.data.as_mut_slice(),
            })
            .collect()
    }

    pub(crate) fn mark_filled(&mut self, select: impl Fn(&BufferKey) -> bool, filled: usize) {
        for (_, buffer) in self.buffers.iter_mut().filter(|(key, _)| select(key)) {
            buffer.mark_filled(filled);
        }
    }
}
