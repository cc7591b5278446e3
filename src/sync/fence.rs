use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ash::vk;

use crate::{Device, Error};

/// Wrapper around a [`VkFence`](vk::Fence) object. Fences are used for CPU-GPU sync.
///
/// Fences are allocated from the device's fence pool with [`Device::allocate_fence`] and go back to that pool
/// when dropped.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Fence {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Fence,
}

impl Fence {
    pub(crate) fn from_pool(device: Device, handle: vk::Fence) -> Self {
        Self {
            device,
            handle,
        }
    }

    /// Polls the fence without blocking.
    /// # Errors
    /// Fails with [`Error::DeviceLost`] if the device was lost.
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(self.device.get_fence_status(self.handle).map_err(Error::from)?)
    }

    /// Blocks until the fence is signaled or the timeout elapses. Returns whether the fence was signaled.
    /// # Errors
    /// Fails with [`Error::DeviceLost`] if the device was lost.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        Ok(self
            .device
            .wait_for_fence(self.handle, timeout_ns)
            .map_err(Error::from)?)
    }

    /// Resets the fence to the unsignaled state. The fence must not be in use by a pending submission.
    pub fn reset(&self) -> Result<()> {
        Ok(self.device.reset_fence(self.handle).map_err(Error::from)?)
    }

    /// Get unsafe access to the underlying `VkFence` handle.
    /// # Safety
    /// The caller must not destroy the fence, it is owned by the device fence pool.
    pub unsafe fn handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.release_fence(self.handle);
    }
}

/// Counts how many times a command buffer's fence has been observed signaled and reset.
///
/// The counter is shared, so anything that recorded a value while the command buffer was in flight can later check
/// whether that submission has completed.
#[derive(Debug, Clone, Default)]
pub struct SignalCounter(Arc<AtomicU64>);

impl SignalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_counter_is_shared_between_clones() {
        let counter = SignalCounter::new();
        let observer = counter.clone();
        assert_eq!(observer.get(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(observer.get(), 1);
    }
}
