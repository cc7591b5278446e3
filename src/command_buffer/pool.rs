//! The command buffer pool owns every [`CmdBuffer`] of one manager, along with the native command pool they are
//! allocated from.

use std::time::Instant;

use anyhow::Result;
use ash::vk;

use crate::{CmdBuffer, CmdBufferId, CmdBufferState, Device};

/// Owns the native command pool and all command buffers allocated from it.
///
/// Every command buffer is either *live* (it has native memory and is somewhere in its lifecycle) or *free*
/// (its memory was released because it sat idle for too long). Freed buffers keep their fence and id, and are
/// brought back to life by [`CommandBufferPool::create`] before a brand new buffer is constructed.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CommandBufferPool {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::CommandPool,
    buffers: Vec<CmdBuffer>,
    live: Vec<CmdBufferId>,
    free: Vec<CmdBufferId>,
    last_free_scan: Instant,
}

impl CommandBufferPool {
    /// Create the native pool for `family`. Individual command buffers of the pool can be reset.
    pub fn new(device: Device, family: u32) -> Result<Self> {
        let handle = device.create_command_pool(family, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkCommandPool {handle:p}");
        Ok(CommandBufferPool {
            device,
            handle,
            buffers: Vec::new(),
            live: Vec::new(),
            free: Vec::new(),
            last_free_scan: Instant::now(),
        })
    }

    /// Get a command buffer in the `ReadyForBegin` state. A freed buffer of the same kind is reused if there is one,
    /// otherwise a new one is created.
    pub fn create(&mut self, is_upload_only: bool) -> Result<CmdBufferId> {
        let reusable = self
            .free
            .iter()
            .position(|id| self.buffers[id.0].is_upload_only() == is_upload_only);
        if let Some(position) = reusable {
            let id = self.free.remove(position);
            self.buffers[id.0].allocate_memory()?;
            self.live.push(id);
            return Ok(id);
        }

        let id = CmdBufferId(self.buffers.len());
        let cmd = CmdBuffer::new(self.device.clone(), self.handle, id, is_upload_only)?;
        self.buffers.push(cmd);
        self.live.push(id);
        Ok(id)
    }

    /// Poll the fence of every live command buffer except `skip`, recycling the ones that finished executing.
    pub fn refresh_fence_status(&mut self, skip: Option<CmdBufferId>) -> Result<()> {
        for id in &self.live {
            if Some(*id) == skip {
                continue;
            }
            self.buffers[id.0].refresh_fence_status()?;
        }
        Ok(())
    }

    /// Release the native memory of command buffers that have been idle for longer than
    /// [`ContextSettings::unused_cmd_buffer_threshold`](crate::ContextSettings::unused_cmd_buffer_threshold).
    /// The scan runs at most once per [`ContextSettings::free_unused_interval`](crate::ContextSettings::free_unused_interval).
    /// `last_submitted` is never freed. Returns the number of freed command buffers.
    pub fn free_unused_cmd_buffers(&mut self, last_submitted: Option<vk::CommandBuffer>) -> Result<usize> {
        let settings = self.device.settings();
        if self.last_free_scan.elapsed() < settings.free_unused_interval {
            return Ok(0);
        }
        self.last_free_scan = Instant::now();
        let threshold = settings.unused_cmd_buffer_threshold;

        let mut freed = 0;
        let mut index = 0;
        while index < self.live.len() {
            let cmd = &mut self.buffers[self.live[index].0];
            // SAFETY: Only used for comparison.
            let handle = unsafe { cmd.handle() };
            if cmd.state() == CmdBufferState::ReadyForBegin && cmd.idle_time() > threshold && Some(handle) != last_submitted {
                cmd.free_memory();
                let id = self.live.swap_remove(index);
                self.free.push(id);
                freed += 1;
            } else {
                index += 1;
            }
        }
        if freed > 0 {
            warn!("Freed {freed} command buffers that were unused for more than {threshold:?}");
        }
        Ok(freed)
    }

    /// Find a live command buffer of the given kind that is ready to begin.
    pub fn find_ready(&self, is_upload_only: bool) -> Option<CmdBufferId> {
        self.live.iter().copied().find(|id| {
            let cmd = &self.buffers[id.0];
            cmd.state() == CmdBufferState::ReadyForBegin && cmd.is_upload_only() == is_upload_only
        })
    }

    /// # Panics
    /// Panics if `id` does not belong to this pool.
    pub fn get(&self, id: CmdBufferId) -> &CmdBuffer {
        &self.buffers[id.0]
    }

    /// # Panics
    /// Panics if `id` does not belong to this pool.
    pub fn get_mut(&mut self, id: CmdBufferId) -> &mut CmdBuffer {
        &mut self.buffers[id.0]
    }

    /// Ids of all command buffers that have native memory.
    pub fn live(&self) -> &[CmdBufferId] {
        &self.live
    }

    /// Ids of all command buffers whose native memory was freed.
    pub fn free(&self) -> &[CmdBufferId] {
        &self.free
    }

    /// Get unsafe access to the underlying `VkCommandPool` handle.
    /// # Safety
    /// Command buffers allocated from the handle are not tracked by the pool.
    pub unsafe fn handle(&self) -> vk::CommandPool {
        self.handle
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        // Command buffers wait on their fences and free themselves, which needs the native pool to be alive.
        self.buffers.clear();
        self.device.destroy_command_pool(self.handle);
        #[cfg(feature = "log-objects")]
        trace!("Destroyed VkCommandPool {:p}", self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{ContextSettingsBuilder, DeviceInfo, ObjectKind, RecordingDriver};

    #[test]
    fn freed_buffers_are_reused_by_kind() -> Result<()> {
        let driver = Arc::new(RecordingDriver::new());
        let settings = ContextSettingsBuilder::new()
            .free_unused_interval(std::time::Duration::ZERO)
            .unused_cmd_buffer_threshold(std::time::Duration::ZERO)
            .build();
        let device = Device::new(driver.clone(), DeviceInfo::default(), settings)?;
        let mut pool = CommandBufferPool::new(device, 0)?;
        let upload = pool.create(true)?;
        let graphics = pool.create(false)?;
        assert_eq!(driver.live_objects(ObjectKind::CommandBuffer), 2);

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(pool.free_unused_cmd_buffers(None)?, 2);
        assert_eq!(driver.live_objects(ObjectKind::CommandBuffer), 0);
        assert!(pool.live().is_empty());
        assert_eq!(pool.get(upload).state(), CmdBufferState::NotAllocated);

        assert_eq!(pool.create(false)?, graphics);
        assert_eq!(pool.create(true)?, upload);
        assert!(pool.free().is_empty());
        Ok(())
    }
}
