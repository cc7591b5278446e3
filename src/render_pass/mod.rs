//! Render pass and framebuffer objects.
//!
//! Both are created and cached by the [`TransitionAndLayoutManager`](crate::TransitionAndLayoutManager), and shared
//! through an `Arc`. When the last reference is dropped, the native objects are queued on the device's deferred
//! deletion queue, since command buffers that are still executing may reference them.

use anyhow::Result;
use ash::vk;

use crate::{DeferredResource, Device, FramebufferDescription, ImageViewDescription, RenderTargetLayout, RenderTargetsInfo, SubresourceRange, Texture};

pub mod layout;
pub mod targets;

/// Wrapper around a `VkRenderPass`, along with the layout it was created from.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RenderPass {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::RenderPass,
    layout: RenderTargetLayout,
}

impl RenderPass {
    pub fn new(device: Device, layout: RenderTargetLayout) -> Result<Self> {
        let handle = device.create_render_pass(&layout.description())?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkRenderPass {handle:p}");
        Ok(RenderPass {
            device,
            handle,
            layout,
        })
    }

    pub fn layout(&self) -> &RenderTargetLayout {
        &self.layout
    }

    /// Get unsafe access to the underlying `VkRenderPass` handle.
    /// # Safety
    /// The caller must not destroy the render pass.
    pub unsafe fn handle(&self) -> vk::RenderPass {
        self.handle
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if let Err(err) = self.device.deferred_delete(DeferredResource::RenderPass(self.handle)) {
            error!("Failed to queue render pass for deletion: {err}");
        }
    }
}

/// A bound colour target, as far as framebuffer matching is concerned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct BoundTarget {
    image: vk::Image,
    mip_index: u32,
    array_slice: Option<u32>,
}

/// Wrapper around a `VkFramebuffer` and the image views it owns.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Framebuffer {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Framebuffer,
    render_pass: vk::RenderPass,
    views: Vec<vk::ImageView>,
    color: Vec<BoundTarget>,
    resolve: Vec<vk::Image>,
    depth_stencil: Option<vk::Image>,
    extent: vk::Extent2D,
}

fn view_type(texture: &Texture, array_slice: Option<u32>, multiview: bool) -> vk::ImageViewType {
    if array_slice.is_none() && (multiview || texture.array_layers > 1) {
        vk::ImageViewType::TYPE_2D_ARRAY
    } else {
        vk::ImageViewType::TYPE_2D
    }
}

fn layer_range(texture: &Texture, array_slice: Option<u32>) -> (u32, u32) {
    match array_slice {
        Some(slice) => (slice, 1),
        None => (0, texture.array_layers),
    }
}

impl Framebuffer {
    /// Create a framebuffer for `targets`, compatible with `render_pass`. One image view is created per attachment.
    pub fn new(device: Device, targets: &RenderTargetsInfo, layout: &RenderTargetLayout, render_pass: &RenderPass) -> Result<Self> {
        let mut views = Vec::with_capacity(layout.attachments().len());
        let mut create_view = |device: &Device, texture: &Texture, mip: u32, array_slice: Option<u32>, aspect: vk::ImageAspectFlags| -> Result<()> {
            let (base_layer, layer_count) = layer_range(texture, array_slice);
            let view = device.create_image_view(&ImageViewDescription {
                image: texture.image,
                view_type: view_type(texture, array_slice, targets.multiview),
                format: texture.format,
                range: SubresourceRange {
                    aspect,
                    base_mip: mip,
                    mip_count: 1,
                    base_layer,
                    layer_count,
                },
            })?;
            #[cfg(feature = "log-objects")]
            trace!("Created new VkImageView {view:p}");
            views.push(view);
            Ok(())
        };

        for target in &targets.color {
            create_view(&device, &target.texture, target.mip_index, target.array_slice, vk::ImageAspectFlags::COLOR)?;
        }
        let mut resolve = Vec::new();
        if layout.has_resolve_attachments() {
            for target in targets.color.iter() {
                if let Some(texture) = &target.resolve {
                    create_view(&device, texture, 0, target.array_slice, vk::ImageAspectFlags::COLOR)?;
                    resolve.push(texture.image);
                }
            }
        }
        if let Some(target) = &targets.depth_stencil {
            create_view(&device, &target.texture, 0, None, target.texture.full_aspect_mask())?;
        }

        // SAFETY: The render pass outlives this call.
        let render_pass = unsafe { render_pass.handle() };
        let extent = layout.extent();
        let handle = device.create_framebuffer(&FramebufferDescription {
            render_pass,
            attachments: views.clone(),
            width: extent.width,
            height: extent.height,
            layers: layout.layers(),
        })?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkFramebuffer {handle:p}");

        Ok(Framebuffer {
            device,
            handle,
            render_pass,
            views,
            color: targets
                .color
                .iter()
                .map(|target| BoundTarget {
                    image: target.texture.image,
                    mip_index: target.mip_index,
                    array_slice: target.array_slice,
                })
                .collect(),
            resolve,
            depth_stencil: targets.depth_stencil.map(|target| target.texture.image),
            extent,
        })
    }

    /// Whether this framebuffer binds exactly the images, mips and slices of `targets`.
    pub fn matches(&self, targets: &RenderTargetsInfo) -> bool {
        self.color.len() == targets.color.len()
            && self
                .color
                .iter()
                .zip(&targets.color)
                .all(|(bound, target)| {
                    bound.image == target.texture.image && bound.mip_index == target.mip_index && bound.array_slice == target.array_slice
                })
            && self.depth_stencil == targets.depth_stencil.map(|target| target.texture.image)
            && (self.resolve.is_empty()
                || self
                    .resolve
                    .iter()
                    .copied()
                    .eq(targets.color.iter().filter_map(|target| target.resolve.map(|texture| texture.image))))
    }

    /// Whether `image` is bound to any attachment of this framebuffer.
    pub fn contains_render_target(&self, image: vk::Image) -> bool {
        self.color.iter().any(|bound| bound.image == image) || self.resolve.contains(&image) || self.depth_stencil == Some(image)
    }

    /// Images of the colour attachments, in attachment order.
    pub fn color_images(&self) -> impl Iterator<Item = vk::Image> + '_ {
        self.color.iter().map(|bound| bound.image)
    }

    pub fn depth_stencil_image(&self) -> Option<vk::Image> {
        self.depth_stencil
    }

    /// The full extent of the framebuffer.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        }
    }

    /// Handle of the render pass this framebuffer was created against.
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Get unsafe access to the underlying `VkFramebuffer` handle.
    /// # Safety
    /// The caller must not destroy the framebuffer.
    pub unsafe fn handle(&self) -> vk::Framebuffer {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        let resources = std::iter::once(DeferredResource::Framebuffer(self.handle)).chain(self.views.iter().map(|view| DeferredResource::ImageView(*view)));
        for resource in resources {
            if let Err(err) = self.device.deferred_delete(resource) {
                error!("Failed to queue {resource:?} for deletion: {err}");
            }
        }
    }
}
