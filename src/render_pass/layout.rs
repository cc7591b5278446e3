use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ash::vk;

use crate::{RenderPassDescription, RenderPassInfo, RenderTargetsInfo, SubpassDescription, SubpassHint};

/// View mask used by multiview render passes, rendering to two views at once.
const MULTIVIEW_MASK: u32 = 0b11;

/// Attachment layout of a render pass, derived from a set of render targets.
///
/// Attachments are ordered as all colour targets, then the resolve targets (only for multisampled passes that have
/// at least one), then the depth target.
///
/// Two hashes are computed. The *compatible* hash covers everything that decides render pass compatibility (attachment
/// count, formats, sample counts, multiview and subpass hint). The *full* hash additionally covers load and store ops
/// and layouts, and identifies the exact render pass object.
#[derive(Debug, Clone)]
pub struct RenderTargetLayout {
    attachments: Vec<vk::AttachmentDescription>,
    color_refs: Vec<vk::AttachmentReference>,
    resolve_refs: Vec<vk::AttachmentReference>,
    depth_ref: Option<vk::AttachmentReference>,
    num_samples: vk::SampleCountFlags,
    num_used_clear_values: u32,
    extent: vk::Extent2D,
    layers: u32,
    multiview: bool,
    subpass_hint: SubpassHint,
    compatible_hash: u64,
    full_hash: u64,
}

fn attachment_ref(attachment: usize, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference {
        attachment: attachment as u32,
        layout,
    }
}

impl RenderTargetLayout {
    /// Layout for render targets bound with `set_render_targets`.
    pub fn from_render_targets(info: &RenderTargetsInfo, mixed_depth_stencil_layouts: bool) -> Self {
        Self::build(info, SubpassHint::None, mixed_depth_stencil_layouts)
    }

    /// Layout for an explicit render pass.
    pub fn from_render_pass_info(info: &RenderPassInfo, mixed_depth_stencil_layouts: bool) -> Self {
        Self::build(&info.to_render_targets_info(), info.subpass_hint, mixed_depth_stencil_layouts)
    }

    fn build(info: &RenderTargetsInfo, subpass_hint: SubpassHint, mixed_depth_stencil_layouts: bool) -> Self {
        assert!(
            subpass_hint != SubpassHint::DepthReadSubpass || info.depth_stencil.is_some(),
            "A depth read subpass requires a depth target"
        );

        let num_samples = info
            .color
            .first()
            .map(|view| view.texture.samples)
            .or_else(|| info.depth_stencil.map(|view| view.texture.samples))
            .unwrap_or(vk::SampleCountFlags::TYPE_1);
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        let mut resolve_refs = Vec::new();
        let mut extent: Option<(vk::Extent2D, u32)> = None;
        let mut merge_extent = |width: u32, height: u32, layers: u32| {
            let new = vk::Extent2D {
                width,
                height,
            };
            extent = match extent {
                None => Some((new, layers)),
                Some((old, old_layers)) => {
                    if old != new {
                        warn!("Render targets have mismatching extents {old:?} and {new:?}, using the smallest");
                    }
                    Some((
                        vk::Extent2D {
                            width: old.width.min(width),
                            height: old.height.min(height),
                        },
                        old_layers.min(layers),
                    ))
                }
            };
        };

        for view in &info.color {
            let texture = &view.texture;
            color_refs.push(attachment_ref(attachments.len(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
            attachments.push(vk::AttachmentDescription {
                format: texture.format,
                samples: texture.samples,
                load_op: view.load.to_vk(),
                store_op: view.store.to_vk(),
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
            let layers = if view.array_slice.is_some() {
                1
            } else {
                texture.array_layers
            };
            merge_extent((texture.width >> view.mip_index).max(1), (texture.height >> view.mip_index).max(1), layers);
        }

        let is_msaa = num_samples != vk::SampleCountFlags::TYPE_1;
        if is_msaa && info.color.iter().any(|view| view.resolve.is_some()) {
            for view in &info.color {
                match &view.resolve {
                    Some(resolve) => {
                        resolve_refs.push(attachment_ref(attachments.len(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
                        attachments.push(vk::AttachmentDescription {
                            format: resolve.format,
                            samples: vk::SampleCountFlags::TYPE_1,
                            load_op: vk::AttachmentLoadOp::DONT_CARE,
                            store_op: vk::AttachmentStoreOp::STORE,
                            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                            ..Default::default()
                        });
                    }
                    None => resolve_refs.push(vk::AttachmentReference {
                        attachment: vk::ATTACHMENT_UNUSED,
                        layout: vk::ImageLayout::UNDEFINED,
                    }),
                }
            }
        }

        let mut depth_ref = None;
        if let Some(view) = &info.depth_stencil {
            let texture = &view.texture;
            let layout = view.access.layout(mixed_depth_stencil_layouts);
            let (mut store_op, mut stencil_store_op) = (view.actions.depth.store.to_vk(), view.actions.stencil.store.to_vk());
            // Multisampled depth is never needed after the pass.
            if texture.is_multisampled() {
                store_op = vk::AttachmentStoreOp::DONT_CARE;
                stencil_store_op = vk::AttachmentStoreOp::DONT_CARE;
            }
            let stencil_load_op = if texture.has_stencil() {
                view.actions.stencil.load.to_vk()
            } else {
                stencil_store_op = vk::AttachmentStoreOp::DONT_CARE;
                vk::AttachmentLoadOp::DONT_CARE
            };
            depth_ref = Some(attachment_ref(attachments.len(), layout));
            attachments.push(vk::AttachmentDescription {
                format: texture.format,
                samples: texture.samples,
                load_op: view.actions.depth.load.to_vk(),
                store_op,
                stencil_load_op,
                stencil_store_op,
                initial_layout: layout,
                final_layout: layout,
                ..Default::default()
            });
            merge_extent(texture.width, texture.height, texture.array_layers);
        }

        let (extent, layers) = extent.unwrap_or_default();
        let layers = if info.multiview { 1 } else { layers.max(1) };
        let clears = attachments
            .iter()
            .any(|attachment| attachment.load_op == vk::AttachmentLoadOp::CLEAR || attachment.stencil_load_op == vk::AttachmentLoadOp::CLEAR);
        let num_used_clear_values = if clears {
            attachments.len() as u32
        } else {
            0
        };

        let mut hasher = DefaultHasher::new();
        attachments.len().hash(&mut hasher);
        info.multiview.hash(&mut hasher);
        num_samples.hash(&mut hasher);
        subpass_hint.hash(&mut hasher);
        for attachment in &attachments {
            attachment.format.hash(&mut hasher);
            attachment.samples.hash(&mut hasher);
        }
        resolve_refs.len().hash(&mut hasher);
        let compatible_hash = hasher.finish();

        let mut hasher = DefaultHasher::new();
        compatible_hash.hash(&mut hasher);
        for attachment in &attachments {
            attachment.load_op.hash(&mut hasher);
            attachment.store_op.hash(&mut hasher);
            attachment.stencil_load_op.hash(&mut hasher);
            attachment.stencil_store_op.hash(&mut hasher);
            attachment.initial_layout.hash(&mut hasher);
        }
        let full_hash = hasher.finish();

        RenderTargetLayout {
            attachments,
            color_refs,
            resolve_refs,
            depth_ref,
            num_samples,
            num_used_clear_values,
            extent,
            layers,
            multiview: info.multiview,
            subpass_hint,
            compatible_hash,
            full_hash,
        }
    }

    /// Description of the render pass object for this layout.
    pub fn description(&self) -> RenderPassDescription {
        let mut subpasses = vec![SubpassDescription {
            input: Vec::new(),
            color: self.color_refs.clone(),
            resolve: self.resolve_refs.clone(),
            depth_stencil: self.depth_ref,
        }];
        let mut dependencies = Vec::new();
        if let (SubpassHint::DepthReadSubpass, Some(depth)) = (self.subpass_hint, self.depth_ref) {
            let read = attachment_ref(depth.attachment as usize, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
            subpasses.push(SubpassDescription {
                input: vec![read],
                color: self.color_refs.clone(),
                resolve: Vec::new(),
                depth_stencil: Some(read),
            });
            dependencies.push(vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: 1,
                src_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            });
        }
        RenderPassDescription {
            attachments: self.attachments.clone(),
            subpasses,
            dependencies,
            view_mask: if self.multiview { MULTIVIEW_MASK } else { 0 },
        }
    }

    pub fn attachments(&self) -> &[vk::AttachmentDescription] {
        &self.attachments
    }

    pub fn num_color_attachments(&self) -> usize {
        self.color_refs.len()
    }

    pub fn has_resolve_attachments(&self) -> bool {
        !self.resolve_refs.is_empty()
    }

    pub fn has_depth_stencil(&self) -> bool {
        self.depth_ref.is_some()
    }

    pub fn num_samples(&self) -> vk::SampleCountFlags {
        self.num_samples
    }

    /// Number of clear values a render pass begin with this layout consumes.
    pub fn num_used_clear_values(&self) -> u32 {
        self.num_used_clear_values
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Whether either dimension of the extent is zero. Nothing can be rendered to such a layout.
    pub fn is_empty(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }

    /// Number of framebuffer layers.
    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn is_multiview(&self) -> bool {
        self.multiview
    }

    pub fn subpass_hint(&self) -> SubpassHint {
        self.subpass_hint
    }

    pub fn compatible_hash(&self) -> u64 {
        self.compatible_hash
    }

    pub fn full_hash(&self) -> u64 {
        self.full_hash
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::*;

    fn color(samples: vk::SampleCountFlags) -> Texture {
        Texture::color_2d(vk::Image::from_raw(1), vk::Format::R8G8B8A8_UNORM, 256, 128).with_samples(samples)
    }

    fn depth(samples: vk::SampleCountFlags) -> Texture {
        Texture::depth_stencil_2d(vk::Image::from_raw(2), vk::Format::D24_UNORM_S8_UINT, 256, 128).with_samples(samples)
    }

    #[test]
    fn load_ops_change_full_hash_only() {
        let clear = RenderPassInfo::new().color(ColorRenderTarget::new(color(vk::SampleCountFlags::TYPE_1), RenderTargetActions::CLEAR_STORE));
        let load = RenderPassInfo::new().color(ColorRenderTarget::new(color(vk::SampleCountFlags::TYPE_1), RenderTargetActions::LOAD_STORE));
        let clear = RenderTargetLayout::from_render_pass_info(&clear, true);
        let load = RenderTargetLayout::from_render_pass_info(&load, true);
        assert_eq!(clear.compatible_hash(), load.compatible_hash());
        assert_ne!(clear.full_hash(), load.full_hash());
        assert_eq!(clear.num_used_clear_values(), 1);
        assert_eq!(load.num_used_clear_values(), 0);
    }

    #[test]
    fn msaa_resolve_and_depth() {
        let samples = vk::SampleCountFlags::TYPE_4;
        let resolve = color(vk::SampleCountFlags::TYPE_1);
        let info = RenderPassInfo::new()
            .color(ColorRenderTarget::new(color(samples), RenderTargetActions::CLEAR_RESOLVE).with_resolve_target(resolve))
            .depth_stencil(DepthStencilRenderTarget::new(
                depth(samples),
                DepthStencilTargetActions::CLEAR_DEPTH_STENCIL_STORE,
                ExclusiveDepthStencil::DEPTH_WRITE_STENCIL_WRITE,
            ));
        let layout = RenderTargetLayout::from_render_pass_info(&info, true);
        let attachments = layout.attachments();
        assert_eq!(attachments.len(), 3);
        // Colour, resolve, depth.
        assert_eq!(attachments[0].samples, samples);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[1].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachments[2].store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(attachments[2].stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(layout.num_used_clear_values(), 3);
    }

    #[test]
    fn mip_extent_and_depth_read_subpass() {
        let info = RenderPassInfo::new()
            .color(ColorRenderTarget::new(color(vk::SampleCountFlags::TYPE_1).with_mips(4), RenderTargetActions::LOAD_STORE).with_mip(2))
            .depth_stencil(DepthStencilRenderTarget::new(
                depth(vk::SampleCountFlags::TYPE_1),
                DepthStencilTargetActions::LOAD_DEPTH_STENCIL_STORE,
                ExclusiveDepthStencil::DEPTH_WRITE_STENCIL_WRITE,
            ))
            .subpass_hint(SubpassHint::DepthReadSubpass)
            .multiview(true);
        let layout = RenderTargetLayout::from_render_pass_info(&info, true);
        assert_eq!(
            layout.extent(),
            vk::Extent2D {
                width: 64,
                height: 32
            }
        );
        let description = layout.description();
        assert_eq!(description.subpasses.len(), 2);
        assert_eq!(description.subpasses[1].input.len(), 1);
        assert_eq!(description.dependencies.len(), 1);
        assert_eq!(description.view_mask, 0b11);
    }

    #[test]
    fn empty_targets_have_no_extent() {
        let layout = RenderTargetLayout::from_render_targets(&RenderTargetsInfo::default(), true);
        assert!(layout.is_empty());
        assert_eq!(layout.num_used_clear_values(), 0);
    }
}
