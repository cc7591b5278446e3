//! Command buffers and their lifecycle.
//!
//! A [`CmdBuffer`] wraps one native command buffer together with the fence that tracks its execution. It moves through
//! a strict state machine:
//!
//! ```text
//! NotAllocated -> ReadyForBegin -> IsInsideBegin <-> IsInsideRenderPass
//!                      ^                |
//!                      |                v
//!                  Submitted  <-   HasEnded
//! ```
//!
//! The step from `Submitted` back to `ReadyForBegin` only happens in [`CmdBuffer::refresh_fence_status`], once the fence
//! has been observed signaled. Each such step bumps the buffer's fence signaled counter, which is how other systems
//! find out whether work they recorded has finished.
//!
//! Calling a state machine operation out of order is a bug in the caller and panics.
//!
//! Command buffers are owned by a [`CommandBufferPool`](pool::CommandBufferPool), and handed out by a
//! [`CommandBufferManager`](manager::CommandBufferManager).

use std::time::{Duration, Instant};

use anyhow::Result;
use ash::vk;

use crate::command_buffer::state::DynamicStateCache;
use crate::command_buffer::timing::GpuTiming;
use crate::descriptor::DescriptorPoolSet;
use crate::{
    BufferBarrier, Device, Error, Fence, Framebuffer, ImageBarrier, ImageCopyDescription, MemoryBarrier, RenderPass, RenderPassBeginDescription,
    RenderTargetLayout, SemaphoreId, SignalCounter, SubmissionMarker, SubresourceRange,
};

pub mod manager;
pub mod pool;

pub(crate) mod state;
pub(crate) mod timing;

/// Identifies a command buffer within its pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdBufferId(pub(crate) usize);

/// States of a [`CmdBuffer`]. See the [module-level documentation](self).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CmdBufferState {
    NotAllocated,
    ReadyForBegin,
    IsInsideBegin,
    IsInsideRenderPass,
    HasEnded,
    Submitted,
}

/// One native command buffer, its fence and everything that is only valid while it is in flight.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CmdBuffer {
    #[derivative(Debug = "ignore")]
    device: Device,
    id: CmdBufferId,
    pool: vk::CommandPool,
    handle: vk::CommandBuffer,
    state: CmdBufferState,
    is_upload_only: bool,
    fence: Fence,
    signal_counter: SignalCounter,
    submitted_fence_counter: u64,
    wait_semaphores: Vec<SemaphoreId>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    submitted_time: Option<Instant>,
    last_activity: Instant,
    dynamic_state: DynamicStateCache,
    descriptor_pool_set: Option<DescriptorPoolSet>,
    timing: Option<GpuTiming>,
}

impl CmdBuffer {
    /// Create a new command buffer and allocate its memory from `pool`. The caller must hold the pool lock.
    pub(crate) fn new(device: Device, pool: vk::CommandPool, id: CmdBufferId, is_upload_only: bool) -> Result<Self> {
        let fence = device.allocate_fence()?;
        let timing = if device.settings().profile_cmd_buffers {
            Some(GpuTiming::new(&device)?)
        } else {
            None
        };
        let mut cmd = CmdBuffer {
            device,
            id,
            pool,
            handle: vk::CommandBuffer::null(),
            state: CmdBufferState::NotAllocated,
            is_upload_only,
            fence,
            signal_counter: SignalCounter::new(),
            submitted_fence_counter: 0,
            wait_semaphores: Vec::new(),
            wait_stages: Vec::new(),
            submitted_time: None,
            last_activity: Instant::now(),
            dynamic_state: DynamicStateCache::default(),
            descriptor_pool_set: None,
            timing,
        };
        cmd.allocate_memory()?;
        Ok(cmd)
    }

    /// Allocate the native command buffer. The caller must hold the pool lock.
    pub(crate) fn allocate_memory(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            CmdBufferState::NotAllocated,
            "Command buffer {:?} already has memory allocated",
            self.id
        );
        self.handle = self.device.allocate_command_buffer(self.pool)?;
        #[cfg(feature = "log-objects")]
        trace!("Allocated new VkCommandBuffer {:p}", self.handle);
        self.state = CmdBufferState::ReadyForBegin;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Free the native command buffer. The caller must hold the pool lock.
    pub(crate) fn free_memory(&mut self) {
        assert_eq!(
            self.state,
            CmdBufferState::ReadyForBegin,
            "Only idle command buffers can be freed, {:?} is {:?}",
            self.id,
            self.state
        );
        self.device.free_command_buffer(self.pool, self.handle);
        #[cfg(feature = "log-objects")]
        trace!("Freed VkCommandBuffer {:p}", self.handle);
        self.handle = vk::CommandBuffer::null();
        self.state = CmdBufferState::NotAllocated;
    }

    /// Start recording.
    /// # Panics
    /// Panics if the command buffer is not ready for begin.
    pub fn begin(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            CmdBufferState::ReadyForBegin,
            "Can't begin command buffer {:?} in state {:?}",
            self.id,
            self.state
        );
        self.device
            .begin_command_buffer(self.handle, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.state = CmdBufferState::IsInsideBegin;
        self.dynamic_state = DynamicStateCache::default();
        self.last_activity = Instant::now();
        if let Some(timing) = &self.timing {
            timing.begin(&self.device, self.handle);
        }
        Ok(())
    }

    /// Stop recording.
    /// # Panics
    /// Panics if the command buffer was not begun, or is still inside a render pass.
    pub fn end(&mut self) -> Result<()> {
        assert!(
            self.is_outside_render_pass(),
            "Can't end command buffer {:?} in state {:?}",
            self.id,
            self.state
        );
        if let Some(timing) = &self.timing {
            timing.end(&self.device, self.handle);
        }
        self.device.end_command_buffer(self.handle)?;
        self.state = CmdBufferState::HasEnded;
        Ok(())
    }

    /// Begin a render pass. The first render pass in a command buffer also acquires its descriptor pool set.
    /// # Panics
    /// Panics if the command buffer is not recording or already inside a render pass.
    pub fn begin_render_pass(
        &mut self,
        layout: &RenderTargetLayout,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        assert!(
            self.is_outside_render_pass(),
            "Can't begin a render pass on command buffer {:?} in state {:?}",
            self.id,
            self.state
        );
        self.acquire_descriptor_pool_set()?;
        let num_clear_values = (layout.num_used_clear_values() as usize).min(clear_values.len());
        let begin = RenderPassBeginDescription {
            // SAFETY: The render pass and framebuffer are alive for the duration of this call, and destruction of both
            // is deferred until this command buffer has retired.
            render_pass: unsafe { render_pass.handle() },
            framebuffer: unsafe { framebuffer.handle() },
            area: framebuffer.render_area(),
            clear_values: &clear_values[..num_clear_values],
        };
        self.device.cmd_begin_render_pass(self.handle, &begin);
        self.state = CmdBufferState::IsInsideRenderPass;
        Ok(())
    }

    /// # Panics
    /// Panics if the command buffer is not inside a render pass.
    pub fn end_render_pass(&mut self) {
        assert!(
            self.is_inside_render_pass(),
            "Can't end a render pass on command buffer {:?} in state {:?}",
            self.id,
            self.state
        );
        self.device.cmd_end_render_pass(self.handle);
        self.state = CmdBufferState::IsInsideBegin;
    }

    /// Advance to the next subpass of the current render pass.
    pub fn next_subpass(&mut self) {
        assert!(self.is_inside_render_pass(), "next_subpass called outside a render pass on {:?}", self.id);
        self.device.cmd_next_subpass(self.handle);
    }

    /// Make the next submission of this command buffer wait on `semaphore` at `stage`. The command buffer holds a
    /// reference to the semaphore until its fence signals.
    pub fn add_wait_semaphore(&mut self, stage: vk::PipelineStageFlags, semaphore: SemaphoreId) -> Result<()> {
        self.device.add_semaphore_ref(semaphore)?;
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
        Ok(())
    }

    /// Poll the fence. If this command buffer was submitted and its fence has signaled, recycle it so it is ready for
    /// begin again.
    /// # Panics
    /// Panics if the fence is signaled while the command buffer is not submitted.
    pub fn refresh_fence_status(&mut self) -> Result<()> {
        if self.state == CmdBufferState::Submitted {
            if self.fence.is_signaled()? {
                self.on_fence_signaled()?;
            }
        } else {
            assert!(
                !self.fence.is_signaled()?,
                "Fence of command buffer {:?} is signaled but it was never submitted (state {:?})",
                self.id,
                self.state
            );
        }
        Ok(())
    }

    fn on_fence_signaled(&mut self) -> Result<()> {
        self.submitted_time = None;
        self.wait_stages.clear();
        for semaphore in std::mem::take(&mut self.wait_semaphores) {
            self.device.release_semaphore(semaphore)?;
        }
        self.dynamic_state = DynamicStateCache::default();
        if let Some(timing) = &mut self.timing {
            timing.resolve(&self.device)?;
        }
        self.device.reset_command_buffer(self.handle)?;
        self.fence.reset()?;
        self.signal_counter.increment();
        if let Some(set) = self.descriptor_pool_set.take() {
            self.device.release_descriptor_pool_set(set)?;
        }
        self.state = CmdBufferState::ReadyForBegin;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Mark the command buffer as submitted. Called by the queue after a successful submission.
    pub(crate) fn mark_submitted(&mut self) {
        assert_eq!(self.state, CmdBufferState::HasEnded, "Submitted command buffer {:?} that has not ended", self.id);
        self.state = CmdBufferState::Submitted;
        self.submitted_fence_counter = self.signal_counter.get();
        self.submitted_time = Some(Instant::now());
        self.last_activity = Instant::now();
    }

    fn acquire_descriptor_pool_set(&mut self) -> Result<&mut DescriptorPoolSet> {
        if self.descriptor_pool_set.is_none() {
            self.descriptor_pool_set = Some(
                self.device
                    .descriptor_pools()
                    .acquire_pool_set_container()?,
            );
        }
        Ok(self
            .descriptor_pool_set
            .as_mut()
            .ok_or(Error::Uncategorized("descriptor pool set missing"))?)
    }

    /// Reserve a descriptor set from this command buffer's pool set. Returns the pool to allocate it from.
    pub fn allocate_descriptor_set(&mut self) -> Result<vk::DescriptorPool> {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        let device = self.device.clone();
        self.acquire_descriptor_pool_set()?.allocate(device.driver())
    }

    /// Number of descriptor sets allocated since the command buffer was last recycled.
    pub fn allocated_descriptor_sets(&self) -> u32 {
        self.descriptor_pool_set
            .as_ref()
            .map_or(0, |set| set.allocated_sets())
    }

    /// Record a pipeline barrier.
    /// # Panics
    /// Panics if the command buffer is not recording, or inside a render pass.
    pub fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: &[MemoryBarrier],
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        assert!(
            self.is_outside_render_pass(),
            "Pipeline barriers must be recorded outside a render pass, {:?} is {:?}",
            self.id,
            self.state
        );
        self.device
            .cmd_pipeline_barrier(self.handle, src_stage, dst_stage, memory, buffers, images);
    }

    pub fn set_viewport(&mut self, viewport: &vk::Viewport) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        if self.dynamic_state.set_viewport(viewport) {
            self.device.cmd_set_viewport(self.handle, viewport);
        }
    }

    pub fn set_scissor(&mut self, scissor: &vk::Rect2D) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        if self.dynamic_state.set_scissor(scissor) {
            self.device.cmd_set_scissor(self.handle, scissor);
        }
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        if self.dynamic_state.set_stencil_reference(reference) {
            self.device.cmd_set_stencil_reference(self.handle, reference);
        }
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        if self.dynamic_state.bind_pipeline(bind_point, pipeline) {
            self.device.cmd_bind_pipeline(self.handle, bind_point, pipeline);
        }
    }

    /// # Panics
    /// Panics if the command buffer is not inside a render pass.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        assert!(self.is_inside_render_pass(), "Draw outside a render pass on {:?}", self.id);
        self.device
            .cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
    }

    /// # Panics
    /// Panics if the command buffer is not inside a render pass.
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        assert!(self.is_inside_render_pass(), "Draw outside a render pass on {:?}", self.id);
        self.device
            .cmd_draw_indexed(self.handle, index_count, instance_count, first_index, vertex_offset, first_instance);
    }

    /// # Panics
    /// Panics if the command buffer is not recording, or inside a render pass.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        assert!(self.is_outside_render_pass(), "Dispatch inside a render pass or outside recording on {:?}", self.id);
        self.device.cmd_dispatch(self.handle, x, y, z);
    }

    pub fn copy_image(&mut self, copy: &ImageCopyDescription) {
        assert!(self.is_outside_render_pass(), "Copies must be recorded outside a render pass on {:?}", self.id);
        self.device.cmd_copy_image(self.handle, copy);
    }

    pub fn clear_color_image(&mut self, image: vk::Image, layout: vk::ImageLayout, color: &vk::ClearColorValue, range: &SubresourceRange) {
        assert!(self.is_outside_render_pass(), "Clears must be recorded outside a render pass on {:?}", self.id);
        self.device
            .cmd_clear_color_image(self.handle, image, layout, color, range);
    }

    pub fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        range: &SubresourceRange,
    ) {
        assert!(self.is_outside_render_pass(), "Clears must be recorded outside a render pass on {:?}", self.id);
        self.device
            .cmd_clear_depth_stencil_image(self.handle, image, layout, value, range);
    }

    #[cfg_attr(not(feature = "debug-markers"), allow(dead_code))]
    pub(crate) fn begin_debug_label(&mut self, name: &str) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        self.device.cmd_begin_debug_label(self.handle, name);
    }

    #[cfg_attr(not(feature = "debug-markers"), allow(dead_code))]
    pub(crate) fn end_debug_label(&mut self) {
        assert!(self.has_begun(), "Command buffer {:?} is not recording", self.id);
        self.device.cmd_end_debug_label(self.handle);
    }

    pub fn id(&self) -> CmdBufferId {
        self.id
    }

    pub fn state(&self) -> CmdBufferState {
        self.state
    }

    pub fn is_upload_only(&self) -> bool {
        self.is_upload_only
    }

    /// Recording, either inside or outside a render pass.
    pub fn has_begun(&self) -> bool {
        matches!(self.state, CmdBufferState::IsInsideBegin | CmdBufferState::IsInsideRenderPass)
    }

    pub fn has_ended(&self) -> bool {
        self.state == CmdBufferState::HasEnded
    }

    pub fn is_submitted(&self) -> bool {
        self.state == CmdBufferState::Submitted
    }

    pub fn is_inside_render_pass(&self) -> bool {
        self.state == CmdBufferState::IsInsideRenderPass
    }

    /// Recording, and not inside a render pass.
    pub fn is_outside_render_pass(&self) -> bool {
        self.state == CmdBufferState::IsInsideBegin
    }

    /// Number of times the fence was observed signaled.
    pub fn fence_signaled_counter(&self) -> u64 {
        self.signal_counter.get()
    }

    /// Value of the fence signaled counter at the last submission.
    pub fn submitted_fence_counter(&self) -> u64 {
        self.submitted_fence_counter
    }

    pub fn signal_counter(&self) -> &SignalCounter {
        &self.signal_counter
    }

    /// Marker that retires once the current (or most recent) submission of this command buffer completes.
    pub fn submission_marker(&self) -> SubmissionMarker {
        SubmissionMarker::new(self.signal_counter.clone())
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn wait_semaphores(&self) -> &[SemaphoreId] {
        &self.wait_semaphores
    }

    pub fn wait_stages(&self) -> &[vk::PipelineStageFlags] {
        &self.wait_stages
    }

    pub fn submitted_time(&self) -> Option<Instant> {
        self.submitted_time
    }

    /// Time since the command buffer last changed state.
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// GPU execution time of the last completed submission. Only available with
    /// [`ContextSettings::profile_cmd_buffers`](crate::ContextSettings::profile_cmd_buffers).
    pub fn last_gpu_time(&self) -> Option<Duration> {
        self.timing.as_ref().and_then(|timing| timing.last())
    }

    /// Get unsafe access to the underlying `VkCommandBuffer` handle.
    /// # Safety
    /// Commands recorded directly into the handle bypass the state machine and layout tracking.
    pub unsafe fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
}

impl Drop for CmdBuffer {
    fn drop(&mut self) {
        if self.state == CmdBufferState::Submitted {
            let timeout = self.device.settings().fence_wait_timeout;
            match self.fence.wait(timeout) {
                Ok(true) => {}
                Ok(false) => error!("Command buffer {:?} still executing after {timeout:?}, destroying anyway", self.id),
                Err(err) => error!("Failed waiting on command buffer {:?}: {err}", self.id),
            }
        }
        for semaphore in std::mem::take(&mut self.wait_semaphores) {
            if let Err(err) = self.device.release_semaphore(semaphore) {
                error!("Failed to release wait semaphore: {err}");
            }
        }
        if let Some(set) = self.descriptor_pool_set.take() {
            if let Err(err) = self.device.release_descriptor_pool_set(set) {
                error!("Failed to release descriptor pool set: {err}");
            }
        }
        if let Some(timing) = &self.timing {
            timing.destroy(&self.device);
        }
        if self.state != CmdBufferState::NotAllocated {
            self.device.free_command_buffer(self.pool, self.handle);
        }
    }
}
