//! The driver module is the seam between deimos and the native graphics API.
//!
//! Every native call deimos makes goes through the [`Driver`] trait. Arguments are passed as plain Rust structs
//! instead of pointer-carrying create infos, which keeps implementations simple and makes recorded calls easy to inspect.
//!
//! Two implementations are provided:
//! - [`AshDriver`] forwards to an [`ash::Device`].
//! - [`RecordingDriver`] is headless. It hands out fake handles and records everything it is asked to do.

use ash::prelude::VkResult;
use ash::vk;

pub mod ash_driver;
pub mod recording;

pub use ash_driver::AshDriver;
pub use recording::{ObjectKind, RecordedCommand, RecordingDriver, SubmitRecord};

/// A range of mips and array layers of an image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    /// Aspects of the image included in the range.
    pub aspect: vk::ImageAspectFlags,
    /// First mip level.
    pub base_mip: u32,
    /// Number of mip levels. May be [`vk::REMAINING_MIP_LEVELS`].
    pub mip_count: u32,
    /// First array layer.
    pub base_layer: u32,
    /// Number of array layers. May be [`vk::REMAINING_ARRAY_LAYERS`].
    pub layer_count: u32,
}

impl SubresourceRange {
    /// Range covering every mip and layer of the image.
    pub fn full(aspect: vk::ImageAspectFlags) -> Self {
        Self {
            aspect,
            base_mip: 0,
            mip_count: vk::REMAINING_MIP_LEVELS,
            base_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Range covering exactly one mip of one layer.
    pub fn single(aspect: vk::ImageAspectFlags, mip: u32, layer: u32) -> Self {
        Self {
            aspect,
            base_mip: mip,
            mip_count: 1,
            base_layer: layer,
            layer_count: 1,
        }
    }

    pub fn to_vk(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

/// Image memory barrier, optionally transferring queue family ownership.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub range: SubresourceRange,
}

impl ImageBarrier {
    /// Layout transition barrier without ownership transfer.
    pub fn new(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        range: SubresourceRange,
    ) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            range,
        }
    }
}

/// Buffer memory barrier, optionally transferring queue family ownership.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl BufferBarrier {
    /// Barrier over the whole buffer.
    pub fn whole(buffer: vk::Buffer, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        Self {
            buffer,
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }
}

/// Global memory barrier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// One subpass of a render pass.
#[derive(Debug, Clone, Default)]
pub struct SubpassDescription {
    pub input: Vec<vk::AttachmentReference>,
    pub color: Vec<vk::AttachmentReference>,
    /// Either empty or exactly as long as `color`.
    pub resolve: Vec<vk::AttachmentReference>,
    pub depth_stencil: Option<vk::AttachmentReference>,
}

/// Everything needed to create a `VkRenderPass`.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDescription {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<vk::SubpassDependency>,
    /// Multiview mask applied to every subpass. Zero disables multiview.
    pub view_mask: u32,
}

/// Everything needed to create a `VkImageView`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageViewDescription {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: SubresourceRange,
}

/// Everything needed to create a `VkFramebuffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescription {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

/// Arguments to `vkCmdBeginRenderPass`.
#[derive(Copy, Clone)]
pub struct RenderPassBeginDescription<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

/// One queue submission.
#[derive(Debug, Copy, Clone, Default)]
pub struct SubmitDescription<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Same length as `wait_semaphores`.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Arguments to `vkCmdCopyImage` with a single region.
#[derive(Debug, Copy, Clone)]
pub struct ImageCopyDescription {
    pub src_image: vk::Image,
    pub src_layout: vk::ImageLayout,
    pub dst_image: vk::Image,
    pub dst_layout: vk::ImageLayout,
    pub region: vk::ImageCopy,
}

/// The native graphics API as seen by deimos.
///
/// Creation functions return [`VkResult`] so native failures can be propagated. Destruction and command recording cannot
/// fail. Implementations must be usable from multiple threads, external synchronization of individual handles is the
/// responsibility of the caller, as in Vulkan.
pub trait Driver: Send + Sync {
    fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn create_command_pool(&self, family_index: u32, flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Returns `Ok(false)` if the timeout elapsed before the fence was signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDescription, fence: vk::Fence) -> VkResult<()>;

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_image_view(&self, desc: &ImageViewDescription) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_framebuffer(&self, desc: &FramebufferDescription) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Creates a timestamp query pool with `count` queries.
    fn create_query_pool(&self, count: u32) -> VkResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Reads 64-bit results. Returns `Ok(false)` if they are not available yet.
    fn get_query_results(&self, pool: vk::QueryPool, first: u32, results: &mut [u64]) -> VkResult<bool>;

    fn create_descriptor_pool(&self, max_sets: u32) -> VkResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: &[MemoryBarrier],
        buffers: &[BufferBarrier],
        images: &[ImageBarrier],
    );
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBeginDescription);
    fn cmd_next_subpass(&self, cmd: vk::CommandBuffer);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: &vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: &vk::Rect2D);
    fn cmd_set_stencil_reference(&self, cmd: vk::CommandBuffer, reference: u32);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_image(&self, cmd: vk::CommandBuffer, copy: &ImageCopyDescription);
    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        range: &SubresourceRange,
    );
    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        range: &SubresourceRange,
    );
    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    fn cmd_write_timestamp(&self, cmd: vk::CommandBuffer, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32);
    fn cmd_begin_debug_label(&self, cmd: vk::CommandBuffer, name: &str);
    fn cmd_end_debug_label(&self, cmd: vk::CommandBuffer);
}
