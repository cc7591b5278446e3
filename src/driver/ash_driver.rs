use std::ffi::CString;
use std::slice;

use ash::prelude::VkResult;
use ash::vk;

use crate::driver::*;

/// [`Driver`] implementation over a real Vulkan device.
///
/// The device is not destroyed when this driver is dropped, since it is owned by whoever bootstrapped the instance.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct AshDriver {
    #[derivative(Debug = "ignore")]
    device: ash::Device,
    #[derivative(Debug = "ignore")]
    debug_utils: Option<ash::extensions::ext::DebugUtils>,
}

impl AshDriver {
    /// Wrap an existing device. Pass the debug utils loader to get command buffer labels.
    pub fn new(device: ash::Device, debug_utils: Option<ash::extensions::ext::DebugUtils>) -> Self {
        Self {
            device,
            debug_utils,
        }
    }

    /// Get unsafe access to the underlying `ash::Device`.
    /// # Safety
    /// Any handles created through this device are not tracked by deimos.
    pub unsafe fn handle(&self) -> &ash::Device {
        &self.device
    }
}

fn to_vk_image_barrier(barrier: &ImageBarrier) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        p_next: std::ptr::null(),
        src_access_mask: barrier.src_access,
        dst_access_mask: barrier.dst_access,
        old_layout: barrier.old_layout,
        new_layout: barrier.new_layout,
        src_queue_family_index: barrier.src_queue_family,
        dst_queue_family_index: barrier.dst_queue_family,
        image: barrier.image,
        subresource_range: barrier.range.to_vk(),
    }
}

fn to_vk_buffer_barrier(barrier: &BufferBarrier) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier {
        s_type: vk::StructureType::BUFFER_MEMORY_BARRIER,
        p_next: std::ptr::null(),
        src_access_mask: barrier.src_access,
        dst_access_mask: barrier.dst_access,
        src_queue_family_index: barrier.src_queue_family,
        dst_queue_family_index: barrier.dst_queue_family,
        buffer: barrier.buffer,
        offset: barrier.offset,
        size: barrier.size,
    }
}

impl Driver for AshDriver {
    fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        // SAFETY: The queue was requested at device creation by the caller.
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        // SAFETY: Valid device.
        unsafe { self.device.device_wait_idle() }
    }

    fn create_command_pool(&self, family_index: u32, flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family_index)
            .flags(flags);
        // SAFETY: Valid create info.
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: The caller owns the pool and all its command buffers are done executing.
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: Valid allocate info. The caller holds the pool lock.
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers.first().copied().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        // SAFETY: The command buffer was allocated from this pool and is not pending execution.
        unsafe { self.device.free_command_buffers(pool, slice::from_ref(&cmd)) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        // SAFETY: The command buffer is in the initial state.
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: The command buffer is in the recording state.
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        // SAFETY: The pool was created with RESET_COMMAND_BUFFER, and the buffer is not pending.
        unsafe { self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        // SAFETY: Valid create info.
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: The fence is not in use by a pending submission.
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        // SAFETY: Valid fence handle.
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        // SAFETY: Valid fence handle.
        match unsafe { self.device.wait_for_fences(slice::from_ref(&fence), true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        // SAFETY: The fence is not in use by a pending submission.
        unsafe { self.device.reset_fences(slice::from_ref(&fence)) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        // SAFETY: Valid create info.
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: The semaphore has no outstanding references.
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription, fence: vk::Fence) -> VkResult<()> {
        let info = vk::SubmitInfo::builder()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .signal_semaphores(submit.signal_semaphores)
            .build();
        // SAFETY: The caller holds the queue lock. All slices outlive this call.
        unsafe { self.device.queue_submit(queue, slice::from_ref(&info), fence) }
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass> {
        let subpasses = desc
            .subpasses
            .iter()
            .map(|subpass| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&subpass.input)
                    .color_attachments(&subpass.color);
                if !subpass.resolve.is_empty() {
                    builder = builder.resolve_attachments(&subpass.resolve);
                }
                if let Some(depth) = &subpass.depth_stencil {
                    builder = builder.depth_stencil_attachment(depth);
                }
                builder.build()
            })
            .collect::<Vec<_>>();
        let view_masks = vec![desc.view_mask; desc.subpasses.len()];
        let correlation_masks = [desc.view_mask];
        let mut multiview = vk::RenderPassMultiviewCreateInfo::builder()
            .view_masks(&view_masks)
            .correlation_masks(&correlation_masks);
        let mut info = vk::RenderPassCreateInfo::builder()
            .attachments(&desc.attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);
        if desc.view_mask != 0 {
            info = info.push_next(&mut multiview);
        }
        // SAFETY: All pointers in the create info point into locals that outlive this call.
        unsafe { self.device.create_render_pass(&info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: Destruction is deferred until no command buffer references the render pass.
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_image_view(&self, desc: &ImageViewDescription) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(desc.range.to_vk());
        // SAFETY: Valid create info, the image is alive.
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: Destruction is deferred until no command buffer references the view.
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_framebuffer(&self, desc: &FramebufferDescription) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(desc.render_pass)
            .attachments(&desc.attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        // SAFETY: Valid create info, all attachments are alive.
        unsafe { self.device.create_framebuffer(&info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: Destruction is deferred until no command buffer references the framebuffer.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_query_pool(&self, count: u32) -> VkResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        // SAFETY: Valid create info.
        unsafe { self.device.create_query_pool(&info, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        // SAFETY: The query pool is not in use.
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn get_query_results(&self, pool: vk::QueryPool, first: u32, results: &mut [u64]) -> VkResult<bool> {
        let count = results.len() as u32;
        // SAFETY: results holds exactly `count` 64-bit values.
        let result = unsafe {
            self.device
                .get_query_pool_results(pool, first, count, results, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::NOT_READY) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: max_sets,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        // SAFETY: Valid create info.
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        // SAFETY: No descriptor set from this pool is used by a pending command buffer.
        unsafe { self.device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: No descriptor set from this pool is used by a pending command buffer.
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
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
        let memory = memory
            .iter()
            .map(|barrier| {
                vk::MemoryBarrier::builder()
                    .src_access_mask(barrier.src_access)
                    .dst_access_mask(barrier.dst_access)
                    .build()
            })
            .collect::<Vec<_>>();
        let buffers = buffers.iter().map(to_vk_buffer_barrier).collect::<Vec<_>>();
        let images = images.iter().map(to_vk_image_barrier).collect::<Vec<_>>();
        // SAFETY: The command buffer is recording and outside a render pass.
        unsafe {
            self.device
                .cmd_pipeline_barrier(cmd, src_stage, dst_stage, vk::DependencyFlags::empty(), &memory, &buffers, &images)
        }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBeginDescription) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.area)
            .clear_values(begin.clear_values);
        // SAFETY: The command buffer is recording and outside a render pass.
        unsafe { self.device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE) }
    }

    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer) {
        // SAFETY: The command buffer is inside a render pass with a following subpass.
        unsafe { self.device.cmd_next_subpass(cmd, vk::SubpassContents::INLINE) }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        // SAFETY: The command buffer is inside a render pass.
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        // SAFETY: The command buffer is recording.
        unsafe { self.device.cmd_set_viewport(cmd, 0, slice::from_ref(viewport)) }
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        // SAFETY: The command buffer is recording.
        unsafe { self.device.cmd_set_scissor(cmd, 0, slice::from_ref(scissor)) }
    }

    fn cmd_set_stencil_reference(&self, cmd: vk::CommandBuffer, reference: u32) {
        // SAFETY: The command buffer is recording.
        unsafe {
            self.device
                .cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        // SAFETY: The command buffer is recording.
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) }
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        // SAFETY: The command buffer is inside a render pass with a bound pipeline.
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: The command buffer is inside a render pass with a bound pipeline.
        unsafe {
            self.device
                .cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance)
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        // SAFETY: The command buffer is outside a render pass with a bound compute pipeline.
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, copy: &ImageCopyDescription) {
        // SAFETY: Both images are in the given layouts.
        unsafe {
            self.device.cmd_copy_image(
                cmd,
                copy.src_image,
                copy.src_layout,
                copy.dst_image,
                copy.dst_layout,
                slice::from_ref(&copy.region),
            )
        }
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        range: &SubresourceRange,
    ) {
        let range = range.to_vk();
        // SAFETY: The image is in the given layout.
        unsafe {
            self.device
                .cmd_clear_color_image(cmd, image, layout, color, slice::from_ref(&range))
        }
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        range: &SubresourceRange,
    ) {
        let range = range.to_vk();
        // SAFETY: The image is in the given layout.
        unsafe {
            self.device
                .cmd_clear_depth_stencil_image(cmd, image, layout, value, slice::from_ref(&range))
        }
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        // SAFETY: The command buffer is outside a render pass.
        unsafe { self.device.cmd_reset_query_pool(cmd, pool, first, count) }
    }

    fn cmd_write_timestamp(&self, cmd: vk::CommandBuffer, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        // SAFETY: The query was reset before this write.
        unsafe { self.device.cmd_write_timestamp(cmd, stage, pool, query) }
    }

    fn cmd_begin_debug_label(&self, cmd: vk::CommandBuffer, name: &str) {
        let Some(debug) = &self.debug_utils else {
            return;
        };
        let name = CString::new(name).unwrap_or_default();
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).build();
        // SAFETY: The label name outlives this call.
        unsafe { debug.cmd_begin_debug_utils_label(cmd, &label) }
    }

    fn cmd_end_debug_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug) = &self.debug_utils {
            // SAFETY: A label was begun on this command buffer.
            unsafe { debug.cmd_end_debug_utils_label(cmd) }
        }
    }
}
