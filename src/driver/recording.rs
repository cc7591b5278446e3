//! A headless [`Driver`] that records everything.
//!
//! The recording driver never touches a GPU. Handles are unique integers, commands are stored per command buffer,
//! and fences only become signaled when the owner of the driver says so. This makes it possible to drive the entire
//! command buffer lifecycle deterministically, which is what the test suite does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;

use crate::driver::*;

/// Kinds of native objects the recording driver counts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    RenderPass,
    ImageView,
    Framebuffer,
    QueryPool,
    DescriptorPool,
}

/// A command recorded into a command buffer.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: Vec<MemoryBarrier>,
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        num_clear_values: usize,
    },
    NextSubpass,
    EndRenderPass,
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetStencilReference(u32),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyImage(ImageCopyDescription),
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        query: u32,
    },
    BeginDebugLabel(String),
    EndDebugLabel,
    End,
}

/// One call to `queue_submit`.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Commands of each submitted command buffer at the time of submission.
    pub commands: Vec<Vec<RecordedCommand>>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Debug, Default)]
struct RecordingState {
    recording: HashMap<vk::CommandBuffer, Vec<RecordedCommand>>,
    submissions: Vec<SubmitRecord>,
    fences: HashMap<vk::Fence, FenceState>,
    live: HashMap<ObjectKind, usize>,
    render_passes: HashMap<vk::RenderPass, RenderPassDescription>,
    image_views: HashMap<vk::ImageView, ImageViewDescription>,
    framebuffers: HashMap<vk::Framebuffer, FramebufferDescription>,
    device_lost: bool,
    gpu_hang: bool,
}

impl RecordingState {
    fn created(&mut self, kind: ObjectKind) {
        *self.live.entry(kind).or_default() += 1;
    }

    fn destroyed(&mut self, kind: ObjectKind) {
        let count = self.live.entry(kind).or_default();
        assert!(*count > 0, "Destroyed more {kind:?} objects than were created");
        *count -= 1;
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        self.recording.entry(cmd).or_default().push(command);
    }

    fn complete_pending(&mut self) {
        for state in self.fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }
}

/// Headless [`Driver`] implementation. See the [module-level documentation](self).
#[derive(Debug)]
pub struct RecordingDriver {
    next_handle: AtomicU64,
    state: Mutex<RecordingState>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            state: Mutex::default(),
        }
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn state(&self) -> MutexGuard<RecordingState> {
        // A panicking test thread may poison the lock, the recorded data is still meaningful.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Hand out a fresh image handle. Images are owned by the caller, so they are not counted.
    pub fn create_image(&self) -> vk::Image {
        self.next()
    }

    /// Hand out a fresh buffer handle.
    pub fn create_buffer(&self) -> vk::Buffer {
        self.next()
    }

    /// Hand out a fresh pipeline handle.
    pub fn create_pipeline(&self) -> vk::Pipeline {
        self.next()
    }

    /// Commands recorded into `cmd` since it was last begun.
    pub fn commands_for(&self, cmd: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state().recording.get(&cmd).cloned().unwrap_or_default()
    }

    /// All queue submissions so far, oldest first.
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state().submissions.clone()
    }

    /// Number of live objects of a kind.
    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state().live.get(&kind).copied().unwrap_or_default()
    }

    pub fn render_pass_description(&self, render_pass: vk::RenderPass) -> Option<RenderPassDescription> {
        self.state().render_passes.get(&render_pass).cloned()
    }

    pub fn framebuffer_description(&self, framebuffer: vk::Framebuffer) -> Option<FramebufferDescription> {
        self.state().framebuffers.get(&framebuffer).cloned()
    }

    pub fn image_view_description(&self, view: vk::ImageView) -> Option<ImageViewDescription> {
        self.state().image_views.get(&view).copied()
    }

    /// Signal a single fence, as if the GPU finished the work it guards.
    pub fn signal_fence(&self, fence: vk::Fence) {
        if let Some(state) = self.state().fences.get_mut(&fence) {
            *state = FenceState::Signaled;
        }
    }

    /// Signal every fence attached to a submission that has not completed yet.
    pub fn complete_submissions(&self) {
        self.state().complete_pending();
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence) == Some(&FenceState::Signaled)
    }

    /// Every call that can report device loss will do so from now on.
    pub fn set_device_lost(&self, lost: bool) {
        self.state().device_lost = lost;
    }

    /// Submitted work never completes while the GPU is hung, so waits time out.
    pub fn set_gpu_hang(&self, hang: bool) {
        self.state().gpu_hang = hang;
    }
}

impl Driver for RecordingDriver {
    fn get_device_queue(&self, _family_index: u32, _queue_index: u32) -> vk::Queue {
        self.next()
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if state.gpu_hang {
            return Err(vk::Result::TIMEOUT);
        }
        state.complete_pending();
        Ok(())
    }

    fn create_command_pool(&self, _family_index: u32, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        self.state().created(ObjectKind::CommandPool);
        Ok(self.next())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state().destroyed(ObjectKind::CommandPool);
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.state().created(ObjectKind::CommandBuffer);
        Ok(self.next())
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        let mut state = self.state();
        state.destroyed(ObjectKind::CommandBuffer);
        state.recording.remove(&cmd);
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        self.state().recording.insert(cmd, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.state().record(cmd, RecordedCommand::End);
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.state().recording.remove(&cmd);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = self.next();
        let mut state = self.state();
        state.created(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.destroyed(ObjectKind::Fence);
        state.fences.remove(&fence);
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(state.fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<bool> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let hang = state.gpu_hang;
        match state.fences.get_mut(&fence) {
            Some(fence_state) if *fence_state == FenceState::Signaled => Ok(true),
            // Waiting on submitted work lets the fake GPU finish it.
            Some(fence_state) if *fence_state == FenceState::Pending && !hang => {
                *fence_state = FenceState::Signaled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        if let Some(state) = self.state().fences.get_mut(&fence) {
            *state = FenceState::Unsignaled;
        }
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.state().created(ObjectKind::Semaphore);
        Ok(self.next())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.state().destroyed(ObjectKind::Semaphore);
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let commands = submit
            .command_buffers
            .iter()
            .map(|cmd| state.recording.get(cmd).cloned().unwrap_or_default())
            .collect();
        if fence != vk::Fence::null() {
            state.fences.insert(fence, FenceState::Pending);
        }
        state.submissions.push(SubmitRecord {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            commands,
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass> {
        let render_pass = self.next();
        let mut state = self.state();
        state.created(ObjectKind::RenderPass);
        state.render_passes.insert(render_pass, desc.clone());
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state();
        state.destroyed(ObjectKind::RenderPass);
        state.render_passes.remove(&render_pass);
    }

    fn create_image_view(&self, desc: &ImageViewDescription) -> VkResult<vk::ImageView> {
        let view = self.next();
        let mut state = self.state();
        state.created(ObjectKind::ImageView);
        state.image_views.insert(view, *desc);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state();
        state.destroyed(ObjectKind::ImageView);
        state.image_views.remove(&view);
    }

    fn create_framebuffer(&self, desc: &FramebufferDescription) -> VkResult<vk::Framebuffer> {
        let framebuffer = self.next();
        let mut state = self.state();
        state.created(ObjectKind::Framebuffer);
        state.framebuffers.insert(framebuffer, desc.clone());
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state();
        state.destroyed(ObjectKind::Framebuffer);
        state.framebuffers.remove(&framebuffer);
    }

    fn create_query_pool(&self, _count: u32) -> VkResult<vk::QueryPool> {
        self.state().created(ObjectKind::QueryPool);
        Ok(self.next())
    }

    fn destroy_query_pool(&self, _pool: vk::QueryPool) {
        self.state().destroyed(ObjectKind::QueryPool);
    }

    fn get_query_results(&self, _pool: vk::QueryPool, first: u32, results: &mut [u64]) -> VkResult<bool> {
        // Every query lands 1000 ticks after the previous one.
        for (index, value) in results.iter_mut().enumerate() {
            *value = (first as u64 + index as u64) * 1000;
        }
        Ok(true)
    }

    fn create_descriptor_pool(&self, _max_sets: u32) -> VkResult<vk::DescriptorPool> {
        self.state().created(ObjectKind::DescriptorPool);
        Ok(self.next())
    }

    fn reset_descriptor_pool(&self, _pool: vk::DescriptorPool) -> VkResult<()> {
        Ok(())
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state().destroyed(ObjectKind::DescriptorPool);
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: &[MemoryBarrier],
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    ) {
        self.state().record(
            cmd,
            RecordedCommand::PipelineBarrier {
                src_stage,
                dst_stage,
                memory: memory.to_vec(),
                buffers: buffers.to_vec(),
                images: images.to_vec(),
            },
        );
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBeginDescription) {
        self.state().record(
            cmd,
            RecordedCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
                area: begin.area,
                num_clear_values: begin.clear_values.len(),
            },
        );
    }

    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer) {
        self.state().record(cmd, RecordedCommand::NextSubpass);
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state().record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.state().record(cmd, RecordedCommand::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        self.state().record(cmd, RecordedCommand::SetScissor(*scissor));
    }

    fn cmd_set_stencil_reference(&self, cmd: vk::CommandBuffer, reference: u32) {
        self.state()
            .record(cmd, RecordedCommand::SetStencilReference(reference));
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.state().record(
            cmd,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.state().record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state().record(
            cmd,
            RecordedCommand::Dispatch {
                x,
                y,
                z,
            },
        );
    }

    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, copy: &ImageCopyDescription) {
        self.state().record(cmd, RecordedCommand::CopyImage(*copy));
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        _range: &SubresourceRange,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::ClearColorImage {
                image,
                layout,
            },
        );
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        _value: &vk::ClearDepthStencilValue,
        _range: &SubresourceRange,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::ClearDepthStencilImage {
                image,
                layout,
            },
        );
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        self.state().record(
            cmd,
            RecordedCommand::ResetQueryPool {
                pool,
                first,
                count,
            },
        );
    }

    fn cmd_write_timestamp(&self, cmd: vk::CommandBuffer, _stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        self.state().record(
            cmd,
            RecordedCommand::WriteTimestamp {
                pool,
                query,
            },
        );
    }

    fn cmd_begin_debug_label(&self, cmd: vk::CommandBuffer, name: &str) {
        self.state()
            .record(cmd, RecordedCommand::BeginDebugLabel(name.to_owned()));
    }

    fn cmd_end_debug_label(&self, cmd: vk::CommandBuffer) {
        self.state().record(cmd, RecordedCommand::EndDebugLabel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_only_signal_after_submission_completes() {
        let driver = RecordingDriver::new();
        let fence = driver.create_fence(false).unwrap();
        assert!(!driver.get_fence_status(fence).unwrap());
        driver
            .queue_submit(vk::Queue::null(), &SubmitDescription::default(), fence)
            .unwrap();
        assert!(!driver.get_fence_status(fence).unwrap());
        driver.complete_submissions();
        assert!(driver.get_fence_status(fence).unwrap());
        driver.reset_fence(fence).unwrap();
        // Unsubmitted fences never signal on their own, not even when waited on.
        driver.complete_submissions();
        assert!(!driver.wait_for_fence(fence, 0).unwrap());
    }

    #[test]
    fn device_loss_is_reported() {
        let driver = RecordingDriver::new();
        let fence = driver.create_fence(false).unwrap();
        driver.set_device_lost(true);
        assert_eq!(driver.get_fence_status(fence), Err(vk::Result::ERROR_DEVICE_LOST));
    }
}
