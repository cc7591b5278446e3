//! The command buffer manager hands out the command buffer to record into, and drives submission.
//!
//! Each manager has two independent slots:
//! - The *active* slot holds the command buffer graphics and compute work is recorded into. There is always an active
//!   command buffer between [`CommandBufferManager::prepare_for_new_active_command_buffer`] and
//!   [`CommandBufferManager::submit_active_cmd_buffer`].
//! - The *upload* slot holds a transfer-only command buffer, which is created lazily by
//!   [`CommandBufferManager::get_upload_cmd_buffer`] and retired independently of the active buffer.
//!
//! The two slots never hold the same command buffer.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;

use crate::{CmdBuffer, CmdBufferId, CmdBufferState, CommandBufferPool, Device, Error, Queue, SemaphoreId};

/// Locked access to one command buffer of a manager's pool. The pool stays locked for as long as the guard lives.
pub struct CmdBufferGuard<'a> {
    pool: MutexGuard<'a, CommandBufferPool>,
    id: CmdBufferId,
}

impl Deref for CmdBufferGuard<'_> {
    type Target = CmdBuffer;

    fn deref(&self) -> &Self::Target {
        self.pool.get(self.id)
    }
}

impl DerefMut for CmdBufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.pool.get_mut(self.id)
    }
}

/// Owns a command buffer pool and the active and upload slots. See the [module-level documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CommandBufferManager {
    #[derivative(Debug = "ignore")]
    device: Device,
    queue: Arc<Queue>,
    pool: Mutex<CommandBufferPool>,
    active: Option<CmdBufferId>,
    upload: Option<CmdBufferId>,
}

impl CommandBufferManager {
    /// Create a manager submitting to `queue`. The manager starts out with a begun active command buffer.
    pub fn new(device: Device, queue: Arc<Queue>) -> Result<Self> {
        let pool = CommandBufferPool::new(device.clone(), queue.family_index())?;
        let mut manager = CommandBufferManager {
            device,
            queue,
            pool: Mutex::new(pool),
            active: None,
            upload: None,
        };
        manager.prepare_for_new_active_command_buffer()?;
        info!("Created command buffer manager for queue family {}", manager.queue.family_index());
        Ok(manager)
    }

    fn lock_pool(&self) -> Result<MutexGuard<CommandBufferPool>> {
        Ok(self.pool.lock().map_err(Error::from)?)
    }

    /// Lock the pool for direct access.
    pub fn pool(&self) -> Result<MutexGuard<CommandBufferPool>> {
        self.lock_pool()
    }

    /// Access any command buffer of this manager's pool.
    pub fn cmd_buffer(&self, id: CmdBufferId) -> Result<CmdBufferGuard> {
        Ok(CmdBufferGuard {
            pool: self.lock_pool()?,
            id,
        })
    }

    /// Access the active command buffer.
    /// # Panics
    /// Panics if there is no active command buffer.
    pub fn active_cmd_buffer(&self) -> Result<CmdBufferGuard> {
        let id = self.active.expect("No active command buffer, call prepare_for_new_active_command_buffer first");
        self.cmd_buffer(id)
    }

    pub fn active_id(&self) -> Option<CmdBufferId> {
        self.active
    }

    pub fn upload_id(&self) -> Option<CmdBufferId> {
        self.upload
    }

    pub fn has_pending_active_cmd_buffer(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_pending_upload_cmd_buffer(&self) -> bool {
        self.upload.is_some()
    }

    /// Get the upload command buffer, beginning a new one if none is outstanding.
    /// Repeated calls return the same command buffer until it is submitted.
    pub fn get_upload_cmd_buffer(&mut self) -> Result<CmdBufferGuard> {
        if let Some(id) = self.upload {
            return self.cmd_buffer(id);
        }
        let mut pool = self.pool.lock().map_err(Error::from)?;
        pool.refresh_fence_status(None)?;
        let id = match pool.find_ready(true) {
            Some(id) => id,
            None => pool.create(true)?,
        };
        pool.get_mut(id).begin()?;
        self.upload = Some(id);
        Ok(CmdBufferGuard {
            pool,
            id,
        })
    }

    /// End and submit the upload command buffer, signaling `signal` on completion.
    /// # Panics
    /// Panics if there is no upload command buffer.
    pub fn submit_upload_cmd_buffer(&mut self, signal: &[SemaphoreId]) -> Result<()> {
        // The slot is cleared even if submission fails, a failed buffer is never submitted again.
        let id = self
            .upload
            .take()
            .expect("No upload command buffer to submit");
        let mut pool = self.lock_pool()?;
        let cmd = pool.get_mut(id);
        assert!(
            cmd.is_outside_render_pass(),
            "Upload command buffer {id:?} must be outside a render pass when submitted, state is {:?}",
            cmd.state()
        );
        cmd.end()?;
        self.queue.submit(cmd, signal)
    }

    /// Begin a new active command buffer, reusing one that finished executing if possible.
    /// # Panics
    /// Panics if there is an outstanding upload or active command buffer.
    pub fn prepare_for_new_active_command_buffer(&mut self) -> Result<()> {
        assert!(self.upload.is_none(), "The upload command buffer must be submitted before preparing a new active one");
        assert!(self.active.is_none(), "The active command buffer {:?} was not submitted", self.active);
        let mut pool = self.pool.lock().map_err(Error::from)?;
        pool.refresh_fence_status(None)?;
        let id = match pool.find_ready(false) {
            Some(id) => id,
            None => pool.create(false)?,
        };
        pool.get_mut(id).begin()?;
        self.active = Some(id);
        Ok(())
    }

    /// End and submit the active command buffer, signaling `signal` on completion.
    /// If the command buffer is still inside a render pass, that render pass is ended first.
    /// # Panics
    /// Panics if there is no active command buffer, or an outstanding upload command buffer.
    pub fn submit_active_cmd_buffer(&mut self, signal: Option<SemaphoreId>) -> Result<()> {
        assert!(self.upload.is_none(), "The upload command buffer must be submitted before the active one");
        let id = self
            .active
            .take()
            .expect("No active command buffer to submit");
        let mut pool = self.lock_pool()?;
        let cmd = pool.get_mut(id);
        if cmd.is_inside_render_pass() {
            warn!("Forcing end of render pass on command buffer {id:?} at submission");
            cmd.end_render_pass();
        }
        cmd.end()?;
        self.queue.submit(cmd, signal.as_slice())
    }

    /// Block until command buffer `id` finished executing, then recycle it.
    /// # Errors
    /// - Fails with [`Error::FenceTimeout`] if the fence did not signal in time. Treat this as fatal.
    /// - Fails with [`Error::DeviceLost`] if the device was lost.
    /// # Panics
    /// Panics if the command buffer was not submitted.
    pub fn wait_for_cmd_buffer(&self, id: CmdBufferId, timeout: Duration) -> Result<()> {
        let mut pool = self.lock_pool()?;
        let cmd = pool.get_mut(id);
        assert_eq!(cmd.state(), CmdBufferState::Submitted, "Waiting on command buffer {id:?} that was not submitted");
        match cmd.fence().wait(timeout) {
            Ok(true) => {}
            Ok(false) => {
                error!("Command buffer {id:?} did not finish within {timeout:?}, the GPU is likely hung");
                return Err(Error::FenceTimeout {
                    timeout,
                }
                .into());
            }
            Err(err) => {
                error!("Waiting on command buffer {id:?} failed: {err}");
                return Err(err);
            }
        }
        cmd.refresh_fence_status()
    }

    /// Recycle every command buffer that finished executing, except `skip`.
    pub fn refresh_fence_status(&self, skip: Option<CmdBufferId>) -> Result<()> {
        self.lock_pool()?.refresh_fence_status(skip)
    }

    /// Release the memory of command buffers that have been idle for too long.
    pub fn free_unused_cmd_buffers(&self) -> Result<usize> {
        let last_submitted = self.queue.last_submitted_cmd_buffer()?;
        self.lock_pool()?.free_unused_cmd_buffers(last_submitted)
    }

    /// Wait for the whole device to go idle, then recycle every finished command buffer.
    /// This should not be used as a synchronization measure, except on exit.
    pub fn wait_until_idle(&self) -> Result<()> {
        self.device.wait_idle()?;
        self.refresh_fence_status(None)
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
