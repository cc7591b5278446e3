use std::slice;
use std::sync::Mutex;

use anyhow::Result;
use ash::vk;

use crate::{CmdBuffer, Device, Error, SemaphoreId, SignalCounter, SubmitDescription};

/// Identifies one submission of a command buffer. The submission has retired once the command buffer's fence was
/// observed signaled, which bumps its [`SignalCounter`].
#[derive(Debug, Clone)]
pub struct SubmissionMarker {
    counter: SignalCounter,
    value: u64,
}

impl SubmissionMarker {
    /// Marker for the submission currently in flight on the command buffer owning `counter`.
    pub fn new(counter: SignalCounter) -> Self {
        let value = counter.get();
        Self {
            counter,
            value,
        }
    }

    /// The fence signaled counter value at the time of submission.
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_retired(&self) -> bool {
        self.value < self.counter.get()
    }
}

#[derive(Debug)]
struct LastSubmitted {
    handle: vk::CommandBuffer,
    marker: SubmissionMarker,
}

/// Exposes a logical command queue on the device. Submission is serialized through an internal lock.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Queue {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: Mutex<vk::Queue>,
    family_index: u32,
    last_submitted: Mutex<Option<LastSubmitted>>,
}

impl Queue {
    /// Get queue `queue_index` of family `family_index`. The queue must have been requested when the device was created.
    pub fn new(device: Device, family_index: u32, queue_index: u32) -> Result<Self> {
        let handle = device.get_device_queue(family_index, queue_index);
        Ok(Queue {
            device,
            handle: Mutex::new(handle),
            family_index,
            last_submitted: Mutex::default(),
        })
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Submit a command buffer that has ended. Its wait semaphores are waited on, `signal` is signaled on completion and
    /// the command buffer's fence is attached to the submission.
    /// # Errors
    /// - Fails with [`Error::DeviceLost`] if the device was lost.
    /// - Fails with a generic Vulkan error if the submission failed.
    pub fn submit(&self, cmd: &mut CmdBuffer, signal: &[SemaphoreId]) -> Result<()> {
        assert!(
            cmd.has_ended(),
            "Command buffer {:?} must have ended before it is submitted, state is {:?}",
            cmd.id(),
            cmd.state()
        );
        let signal = signal
            .iter()
            .map(|id| self.device.semaphore_handle(*id))
            .collect::<Result<Vec<_>>>()?;
        let wait = cmd
            .wait_semaphores()
            .iter()
            .map(|id| self.device.semaphore_handle(*id))
            .collect::<Result<Vec<_>>>()?;
        // SAFETY: The command buffer has ended, so the handle is valid and not being recorded into.
        let handle = unsafe { cmd.handle() };
        {
            let queue = self.handle.lock().map_err(Error::from)?;
            let submit = SubmitDescription {
                command_buffers: slice::from_ref(&handle),
                wait_semaphores: &wait,
                wait_stages: cmd.wait_stages(),
                signal_semaphores: &signal,
            };
            // SAFETY: We own the fence, and it is unsignaled because it was reset when the command buffer was recycled.
            let fence = unsafe { cmd.fence().handle() };
            self.device
                .queue_submit(*queue, &submit, fence)
                .map_err(Error::from)?;
        }
        cmd.mark_submitted();

        let marker = cmd.submission_marker();
        *self.last_submitted.lock().map_err(Error::from)? = Some(LastSubmitted {
            handle,
            marker: marker.clone(),
        });
        self.device.set_last_submission(marker)?;

        if self.device.settings().wait_idle_on_submit {
            let timeout = self.device.settings().fence_wait_timeout;
            if !cmd.fence().wait(timeout)? {
                error!("Command buffer {:?} did not finish within {timeout:?}", cmd.id());
                return Err(Error::FenceTimeout {
                    timeout,
                }
                .into());
            }
            cmd.refresh_fence_status()?;
        }
        Ok(())
    }

    /// Native handle of the command buffer most recently submitted to this queue.
    pub fn last_submitted_cmd_buffer(&self) -> Result<Option<vk::CommandBuffer>> {
        let last = self.last_submitted.lock().map_err(Error::from)?;
        Ok(last.as_ref().map(|last| last.handle))
    }

    /// Marker of the most recent submission to this queue.
    pub fn last_submission(&self) -> Result<Option<SubmissionMarker>> {
        let last = self.last_submitted.lock().map_err(Error::from)?;
        Ok(last.as_ref().map(|last| last.marker.clone()))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
