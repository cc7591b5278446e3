//! Resource transitions requested by the renderer, and the barriers they turn into.

use ash::vk;

use crate::{BufferBarrier, ImageBarrier, Texture, UnorderedAccessView};

/// The access a set of resources is transitioned to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransitionAccess {
    Readable,
    Writable,
    /// Read-write access, with a barrier between the previous and the next use.
    RWBarrier,
    /// Read-write access without a barrier. The caller guarantees accesses don't overlap.
    RWNoBarrier,
    /// Read-write access to a different subresource than the previous use.
    RWSubResBarrier,
    /// Only metadata of the resource is read, such as the size of a buffer.
    MetaData,
}

/// Pipelines on each side of a transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransitionPipeline {
    GfxToGfx,
    GfxToCompute,
    ComputeToGfx,
    ComputeToCompute,
}

const ALL_GRAPHICS: vk::PipelineStageFlags = vk::PipelineStageFlags::ALL_GRAPHICS;
const COMPUTE: vk::PipelineStageFlags = vk::PipelineStageFlags::COMPUTE_SHADER;

impl TransitionPipeline {
    /// Source and destination stage masks.
    pub fn stages(self) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
        match self {
            TransitionPipeline::GfxToGfx => (ALL_GRAPHICS, ALL_GRAPHICS),
            TransitionPipeline::GfxToCompute => (ALL_GRAPHICS, COMPUTE),
            TransitionPipeline::ComputeToGfx => (COMPUTE, ALL_GRAPHICS),
            TransitionPipeline::ComputeToCompute => (COMPUTE, COMPUTE | ALL_GRAPHICS),
        }
    }

    /// Whether the destination of the transition is the graphics pipeline.
    pub fn is_to_graphics(self) -> bool {
        matches!(self, TransitionPipeline::GfxToGfx | TransitionPipeline::ComputeToGfx)
    }
}

/// Barriers gathered for a UAV transition. Layout changes of texture UAVs are listed in `new_layouts` and must be
/// recorded in the layout map by the caller.
#[derive(Debug, Clone, Default)]
pub struct GatheredBarriers {
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub new_layouts: Vec<(vk::Image, vk::ImageLayout)>,
}

impl GatheredBarriers {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    /// Turn the barriers into a queue family ownership transfer. Returns the release half, to record on the source
    /// queue, and the acquire half, to record on the destination queue.
    pub fn into_ownership_transfer(self, src_family: u32, dst_family: u32) -> (GatheredBarriers, GatheredBarriers) {
        let mut release = self.clone();
        let mut acquire = self;
        for barrier in &mut release.buffers {
            barrier.dst_access = vk::AccessFlags::empty();
            barrier.src_queue_family = src_family;
            barrier.dst_queue_family = dst_family;
        }
        for barrier in &mut release.images {
            barrier.dst_access = vk::AccessFlags::empty();
            barrier.src_queue_family = src_family;
            barrier.dst_queue_family = dst_family;
        }
        release.dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        // Layouts change on the acquiring side.
        release.new_layouts.clear();

        for barrier in &mut acquire.buffers {
            barrier.src_access = vk::AccessFlags::empty();
            barrier.src_queue_family = src_family;
            barrier.dst_queue_family = dst_family;
        }
        for barrier in &mut acquire.images {
            barrier.src_access = vk::AccessFlags::empty();
            barrier.src_queue_family = src_family;
            barrier.dst_queue_family = dst_family;
        }
        acquire.src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
        (release, acquire)
    }
}

/// A requested transition of a set of textures or UAVs. Consumed once to produce barriers.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransition {
    pub access: TransitionAccess,
    pub pipeline: TransitionPipeline,
    pub textures: Vec<Texture>,
    pub uavs: Vec<UnorderedAccessView>,
}

fn uav_access(access: TransitionAccess) -> Option<(vk::AccessFlags, vk::AccessFlags)> {
    let read_write = vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    match access {
        TransitionAccess::Writable => Some((vk::AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_WRITE)),
        TransitionAccess::Readable => Some((vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ)),
        TransitionAccess::RWBarrier | TransitionAccess::RWSubResBarrier => Some((read_write, read_write)),
        TransitionAccess::RWNoBarrier | TransitionAccess::MetaData => None,
    }
}

impl PendingTransition {
    pub fn textures(access: TransitionAccess, pipeline: TransitionPipeline, textures: Vec<Texture>) -> Self {
        Self {
            access,
            pipeline,
            textures,
            uavs: Vec::new(),
        }
    }

    pub fn uavs(access: TransitionAccess, pipeline: TransitionPipeline, uavs: Vec<UnorderedAccessView>) -> Self {
        Self {
            access,
            pipeline,
            textures: Vec::new(),
            uavs,
        }
    }

    /// Build the barriers for the UAVs of this transition. `current_layout` returns the tracked layout of an image.
    pub fn gather_uav_barriers(&self, current_layout: impl Fn(vk::Image) -> vk::ImageLayout) -> GatheredBarriers {
        let mut gathered = GatheredBarriers::default();
        let Some((src_access, dst_access)) = uav_access(self.access) else {
            return gathered;
        };
        let (src_stage, dst_stage) = self.pipeline.stages();
        gathered.src_stage = src_stage;
        gathered.dst_stage = dst_stage;

        for uav in &self.uavs {
            match uav {
                UnorderedAccessView::VertexBuffer(buffer) | UnorderedAccessView::IndexBuffer(buffer) | UnorderedAccessView::StructuredBuffer(buffer) => {
                    let mut dst_access = dst_access;
                    if buffer.is_draw_indirect() && self.access == TransitionAccess::Readable {
                        dst_access = vk::AccessFlags::INDIRECT_COMMAND_READ;
                        gathered.dst_stage |= vk::PipelineStageFlags::DRAW_INDIRECT;
                    }
                    gathered
                        .buffers
                        .push(BufferBarrier::whole(buffer.buffer, src_access, dst_access));
                }
                UnorderedAccessView::Texture(texture) => {
                    let old_layout = current_layout(texture.image);
                    let new_layout = if self.access == TransitionAccess::Readable && self.pipeline.is_to_graphics() {
                        if texture.is_depth_or_stencil_aspect() {
                            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                        } else {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        }
                    } else {
                        vk::ImageLayout::GENERAL
                    };
                    let src_access = if old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    } else {
                        src_access
                    };
                    gathered.images.push(ImageBarrier::new(
                        texture.image,
                        old_layout,
                        new_layout,
                        src_access,
                        dst_access,
                        texture.full_range(),
                    ));
                    if old_layout != new_layout {
                        gathered.new_layouts.push((texture.image, new_layout));
                    }
                }
            }
        }
        gathered
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::Buffer;

    #[test]
    fn indirect_buffers_are_read_as_arguments() {
        let indirect = Buffer::new(vk::Buffer::from_raw(1), 64, vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER);
        let plain = Buffer::new(vk::Buffer::from_raw(2), 64, vk::BufferUsageFlags::STORAGE_BUFFER);
        let transition = PendingTransition::uavs(
            TransitionAccess::Readable,
            TransitionPipeline::ComputeToGfx,
            vec![UnorderedAccessView::StructuredBuffer(indirect), UnorderedAccessView::VertexBuffer(plain)],
        );
        let gathered = transition.gather_uav_barriers(|_| vk::ImageLayout::UNDEFINED);
        assert_eq!(gathered.buffers[0].dst_access, vk::AccessFlags::INDIRECT_COMMAND_READ);
        assert_eq!(gathered.buffers[1].dst_access, vk::AccessFlags::SHADER_READ);
        assert!(gathered.dst_stage.contains(vk::PipelineStageFlags::DRAW_INDIRECT));
        assert_eq!(gathered.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn texture_uav_layouts() {
        let texture = Texture::color_2d(vk::Image::from_raw(3), vk::Format::R32_SFLOAT, 8, 8).with_usage(vk::ImageUsageFlags::STORAGE);
        let to_gfx = PendingTransition::uavs(TransitionAccess::Readable, TransitionPipeline::ComputeToGfx, vec![UnorderedAccessView::Texture(texture)]);
        let gathered = to_gfx.gather_uav_barriers(|_| vk::ImageLayout::GENERAL);
        assert_eq!(gathered.images[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(gathered.new_layouts, vec![(texture.image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]);

        let to_compute = PendingTransition::uavs(TransitionAccess::Writable, TransitionPipeline::GfxToCompute, vec![UnorderedAccessView::Texture(texture)]);
        let gathered = to_compute.gather_uav_barriers(|_| vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(gathered.images[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(gathered.images[0].src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let no_barrier = PendingTransition::uavs(TransitionAccess::RWNoBarrier, TransitionPipeline::ComputeToCompute, vec![UnorderedAccessView::Texture(texture)]);
        assert!(no_barrier.gather_uav_barriers(|_| vk::ImageLayout::GENERAL).is_empty());
    }

    #[test]
    fn ownership_transfer_splits_access() {
        let buffer = Buffer::new(vk::Buffer::from_raw(4), 64, vk::BufferUsageFlags::STORAGE_BUFFER);
        let transition = PendingTransition::uavs(TransitionAccess::Readable, TransitionPipeline::ComputeToGfx, vec![UnorderedAccessView::StructuredBuffer(buffer)]);
        let (release, acquire) = transition
            .gather_uav_barriers(|_| vk::ImageLayout::UNDEFINED)
            .into_ownership_transfer(1, 0);
        assert_eq!(release.buffers[0].dst_access, vk::AccessFlags::empty());
        assert_eq!(release.buffers[0].src_queue_family, 1);
        assert_eq!(acquire.buffers[0].src_access, vk::AccessFlags::empty());
        assert_eq!(acquire.buffers[0].dst_queue_family, 0);
        assert_eq!(acquire.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
}
