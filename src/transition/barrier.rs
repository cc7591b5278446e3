//! Image layout barrier table and batched pipeline barriers.

use ash::vk;

use crate::{CmdBuffer, ImageBarrier, MemoryBarrier, SubresourceRange};

/// The states an image moves between, each with the layout, access mask and pipeline stage that go with it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageLayoutBarrier {
    Undefined,
    TransferDest,
    ColorAttachment,
    DepthStencilAttachment,
    TransferSource,
    Present,
    PixelShaderRead,
    PixelDepthStencilRead,
    ComputeGeneralRW,
    PixelGeneralRW,
    DepthReadStencilAttachment,
    DepthAttachmentStencilRead,
}

impl ImageLayoutBarrier {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageLayoutBarrier::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayoutBarrier::TransferDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayoutBarrier::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayoutBarrier::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ImageLayoutBarrier::TransferSource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayoutBarrier::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            ImageLayoutBarrier::PixelShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayoutBarrier::PixelDepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            ImageLayoutBarrier::ComputeGeneralRW | ImageLayoutBarrier::PixelGeneralRW => vk::ImageLayout::GENERAL,
            ImageLayoutBarrier::DepthReadStencilAttachment => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
            ImageLayoutBarrier::DepthAttachmentStencilRead => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
        }
    }

    pub fn access(self) -> vk::AccessFlags {
        match self {
            ImageLayoutBarrier::Undefined | ImageLayoutBarrier::Present => vk::AccessFlags::empty(),
            ImageLayoutBarrier::TransferDest => vk::AccessFlags::TRANSFER_WRITE,
            ImageLayoutBarrier::TransferSource => vk::AccessFlags::TRANSFER_READ,
            ImageLayoutBarrier::ColorAttachment => vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ImageLayoutBarrier::DepthStencilAttachment
            | ImageLayoutBarrier::DepthReadStencilAttachment
            | ImageLayoutBarrier::DepthAttachmentStencilRead => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ImageLayoutBarrier::PixelShaderRead => vk::AccessFlags::SHADER_READ,
            ImageLayoutBarrier::PixelDepthStencilRead => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            ImageLayoutBarrier::ComputeGeneralRW | ImageLayoutBarrier::PixelGeneralRW => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }

    pub fn stage(self) -> vk::PipelineStageFlags {
        match self {
            ImageLayoutBarrier::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            ImageLayoutBarrier::Present => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ImageLayoutBarrier::TransferDest | ImageLayoutBarrier::TransferSource => vk::PipelineStageFlags::TRANSFER,
            ImageLayoutBarrier::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageLayoutBarrier::DepthStencilAttachment
            | ImageLayoutBarrier::DepthReadStencilAttachment
            | ImageLayoutBarrier::DepthAttachmentStencilRead => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            ImageLayoutBarrier::PixelShaderRead | ImageLayoutBarrier::PixelGeneralRW => vk::PipelineStageFlags::FRAGMENT_SHADER,
            ImageLayoutBarrier::PixelDepthStencilRead => vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            ImageLayoutBarrier::ComputeGeneralRW => vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    /// The barrier state for an image currently in `layout`. `GENERAL` maps to [`ImageLayoutBarrier::ComputeGeneralRW`].
    /// # Panics
    /// Panics on layouts images tracked by deimos are never in.
    pub fn from_layout(layout: vk::ImageLayout) -> Self {
        match layout {
            vk::ImageLayout::UNDEFINED => ImageLayoutBarrier::Undefined,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => ImageLayoutBarrier::TransferDest,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => ImageLayoutBarrier::ColorAttachment,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => ImageLayoutBarrier::DepthStencilAttachment,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => ImageLayoutBarrier::TransferSource,
            vk::ImageLayout::PRESENT_SRC_KHR => ImageLayoutBarrier::Present,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => ImageLayoutBarrier::PixelShaderRead,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => ImageLayoutBarrier::PixelDepthStencilRead,
            vk::ImageLayout::GENERAL => ImageLayoutBarrier::ComputeGeneralRW,
            vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL => ImageLayoutBarrier::DepthReadStencilAttachment,
            vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => ImageLayoutBarrier::DepthAttachmentStencilRead,
            other => panic!("Unsupported image layout {other:?}"),
        }
    }
}

/// A batch of barriers recorded as a single pipeline barrier.
#[derive(Debug, Clone, Default)]
pub struct PendingBarrier {
    images: Vec<ImageBarrier>,
    memory: Vec<MemoryBarrier>,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
}

impl PendingBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition `range` of `image` from `src` to `dst`.
    pub fn add_image_layout_transition(&mut self, image: vk::Image, src: ImageLayoutBarrier, dst: ImageLayoutBarrier, range: SubresourceRange) {
        self.images
            .push(ImageBarrier::new(image, src.layout(), dst.layout(), src.access(), dst.access(), range));
        self.add_stages(src.stage(), dst.stage());
    }

    /// Add an image barrier with explicit stages.
    pub fn add_image_barrier(&mut self, barrier: ImageBarrier, src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) {
        self.images.push(barrier);
        self.add_stages(src_stage, dst_stage);
    }

    /// Add a global memory dependency.
    pub fn add_memory_barrier(&mut self, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) {
        self.memory.push(MemoryBarrier {
            src_access,
            dst_access,
        });
    }

    /// Add extra stages to wait for and block.
    pub fn add_stages(&mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) {
        self.src_stage |= src;
        self.dst_stage |= dst;
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.memory.is_empty()
    }

    pub fn images(&self) -> &[ImageBarrier] {
        &self.images
    }

    /// Record the batch into `cmd`. Nothing is recorded for an empty batch.
    pub fn execute(self, cmd: &mut CmdBuffer) {
        if self.is_empty() {
            return;
        }
        let src_stage = if self.src_stage.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            self.src_stage
        };
        let dst_stage = if self.dst_stage.is_empty() {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        } else {
            self.dst_stage
        };
        cmd.pipeline_barrier(src_stage, dst_stage, &self.memory, &[], &self.images);
    }
}

/// Record a full memory barrier between all commands. Only used for debugging synchronization issues.
pub fn heavy_weight_barrier(cmd: &mut CmdBuffer) {
    let all = vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE;
    cmd.pipeline_barrier(
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::PipelineStageFlags::ALL_COMMANDS,
        &[MemoryBarrier {
            src_access: all,
            dst_access: all,
        }],
        &[],
        &[],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_round_trip_through_table() {
        let barriers = [
            ImageLayoutBarrier::Undefined,
            ImageLayoutBarrier::TransferDest,
            ImageLayoutBarrier::ColorAttachment,
            ImageLayoutBarrier::DepthStencilAttachment,
            ImageLayoutBarrier::TransferSource,
            ImageLayoutBarrier::Present,
            ImageLayoutBarrier::PixelShaderRead,
            ImageLayoutBarrier::PixelDepthStencilRead,
            ImageLayoutBarrier::ComputeGeneralRW,
            ImageLayoutBarrier::DepthReadStencilAttachment,
            ImageLayoutBarrier::DepthAttachmentStencilRead,
        ];
        for barrier in barriers {
            assert_eq!(ImageLayoutBarrier::from_layout(barrier.layout()), barrier);
        }
        assert_eq!(ImageLayoutBarrier::PixelGeneralRW.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    #[should_panic(expected = "Unsupported image layout")]
    fn unknown_layout_panics() {
        ImageLayoutBarrier::from_layout(vk::ImageLayout::PREINITIALIZED);
    }
}
