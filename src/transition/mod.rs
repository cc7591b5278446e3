//! Image layout tracking, and the render pass and framebuffer cache.
//!
//! The [`TransitionAndLayoutManager`] is the single source of truth for the layout every image is in. Any operation that
//! needs an image in a specific layout asks the manager, which records a barrier if the image is not in that layout yet
//! and updates its bookkeeping. Images the manager has never seen are assumed to be in `UNDEFINED` layout.
//!
//! The manager also creates render passes and framebuffers on demand and caches them:
//! - Render passes are keyed by the full hash of their [`RenderTargetLayout`].
//! - Framebuffers are bucketed by the compatible hash of the layout combined with the mip and array slice of every
//!   colour target. Within a bucket, a framebuffer is only reused if it binds exactly the same images.
//!
//! Render passes are started in one of two ways. *Emulated* render passes are implicitly begun by
//! [`CommandListContext::set_render_targets`](crate::CommandListContext::set_render_targets), and ended whenever the
//! bound targets change. *Real* render passes are begun and ended explicitly and support multiple subpasses and mip
//! generation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use multimap::MultiMap;

use crate::transition::barrier::heavy_weight_barrier;
use crate::{
    ClearValue, CmdBuffer, Device, Error, Framebuffer, ImageLayoutBarrier, LoadAction, PendingBarrier, RenderPass, RenderPassInfo, RenderTargetLayout,
    RenderTargetsInfo, SubresourceRange, Texture,
};

pub mod barrier;
pub mod pending;

/// Which kind of render pass the manager is currently in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RenderPassState {
    Outside,
    Emulated,
    Real,
}

/// Per slice, per mip layout tracking of the image mips are being generated for.
#[derive(Debug, Clone, Default)]
pub struct GenerateMipsInfo {
    image: Option<vk::Image>,
    aspect: vk::ImageAspectFlags,
    /// Indexed by `[slice][mip]`.
    layouts: Vec<Vec<vk::ImageLayout>>,
    current_mip: u32,
    current_slice: Option<u32>,
}

impl GenerateMipsInfo {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn init(&mut self, texture: &Texture, layout: vk::ImageLayout) {
        self.image = Some(texture.image);
        self.aspect = texture.aspect;
        self.layouts = vec![vec![layout; texture.num_mips as usize]; texture.array_layers as usize];
    }

    fn slices(&self, slice: Option<u32>) -> std::ops::Range<u32> {
        match slice {
            Some(slice) => slice..slice + 1,
            None => 0..self.layouts.len() as u32,
        }
    }

    /// Move one mip of the given slices to `dst`, recording barriers for every subresource not already in that layout.
    fn transition_mip(&mut self, barrier: &mut PendingBarrier, mip: u32, slice: Option<u32>, dst: ImageLayoutBarrier) {
        let Some(image) = self.image else {
            return;
        };
        for slice in self.slices(slice) {
            let tracked = &mut self.layouts[slice as usize][mip as usize];
            if *tracked != dst.layout() {
                let src = ImageLayoutBarrier::from_layout(*tracked);
                barrier.add_image_layout_transition(image, src, dst, SubresourceRange::single(self.aspect, mip, slice));
                *tracked = dst.layout();
            }
        }
    }

    /// Layout of one mip of one slice, if mips are being generated for `image`.
    pub fn layout(&self, image: vk::Image, slice: u32, mip: u32) -> Option<vk::ImageLayout> {
        if self.image != Some(image) {
            return None;
        }
        self.layouts
            .get(slice as usize)
            .and_then(|mips| mips.get(mip as usize))
            .copied()
    }

    pub fn is_active(&self) -> bool {
        self.image.is_some()
    }
}

fn framebuffer_key(layout: &RenderTargetLayout, targets: &RenderTargetsInfo) -> u64 {
    let mut hasher = DefaultHasher::new();
    layout.compatible_hash().hash(&mut hasher);
    for target in &targets.color {
        let slice = target.array_slice.unwrap_or(u32::MAX) as u64;
        ((slice << 32) | target.mip_index as u64).hash(&mut hasher);
    }
    hasher.finish()
}

/// Tracks image layouts and caches render passes and framebuffers. See the [module-level documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TransitionAndLayoutManager {
    #[derivative(Debug = "ignore")]
    device: Device,
    layouts: HashMap<vk::Image, vk::ImageLayout>,
    render_passes: Mutex<HashMap<u64, Arc<RenderPass>>>,
    #[derivative(Debug = "ignore")]
    framebuffers: Mutex<MultiMap<u64, Arc<Framebuffer>>>,
    current_render_pass: Option<Arc<RenderPass>>,
    current_framebuffer: Option<Arc<Framebuffer>>,
    state: RenderPassState,
    generate_mips: GenerateMipsInfo,
}

impl TransitionAndLayoutManager {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            layouts: HashMap::new(),
            render_passes: Mutex::default(),
            framebuffers: Mutex::new(MultiMap::new()),
            current_render_pass: None,
            current_framebuffer: None,
            state: RenderPassState::Outside,
            generate_mips: GenerateMipsInfo::default(),
        }
    }

    /// The tracked layout of `image`. Untracked images are in `UNDEFINED` layout.
    pub fn layout(&self, image: vk::Image) -> vk::ImageLayout {
        self.find_layout(image)
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub fn find_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.layouts.get(&image).copied()
    }

    /// Get the tracked layout of `image`, starting to track it in `layout` if it is not tracked yet.
    pub fn find_or_add_layout(&mut self, image: vk::Image, layout: vk::ImageLayout) -> vk::ImageLayout {
        *self.layouts.entry(image).or_insert(layout)
    }

    /// Record that `image` is now in `layout`, for example after a barrier recorded outside of deimos.
    pub fn set_layout(&mut self, image: vk::Image, layout: vk::ImageLayout) {
        self.layouts.insert(image, layout);
    }

    /// Number of tracked images.
    pub fn tracked_image_count(&self) -> usize {
        self.layouts.len()
    }

    /// Add a barrier moving every subresource of `texture` to `dst` to `barrier`, and record the new layout.
    /// Returns whether a barrier was needed.
    pub fn add_transition(&mut self, barrier: &mut PendingBarrier, texture: &Texture, dst: vk::ImageLayout) -> bool {
        let current = self.layout(texture.image);
        if current == dst {
            return false;
        }
        barrier.add_image_layout_transition(
            texture.image,
            ImageLayoutBarrier::from_layout(current),
            ImageLayoutBarrier::from_layout(dst),
            texture.full_range(),
        );
        self.layouts.insert(texture.image, dst);
        true
    }

    /// Move `texture` to `dst`, recording a barrier into `cmd` if it is not in that layout already.
    /// Returns whether a barrier was recorded.
    pub fn transition_resource(&mut self, cmd: &mut CmdBuffer, texture: &Texture, dst: vk::ImageLayout) -> bool {
        let mut barrier = PendingBarrier::new();
        let recorded = self.add_transition(&mut barrier, texture, dst);
        barrier.execute(cmd);
        recorded
    }

    /// Get the render pass for `layout`, creating it on a cache miss.
    pub fn get_or_create_render_pass(&self, layout: &RenderTargetLayout) -> Result<Arc<RenderPass>> {
        let mut render_passes = self
            .render_passes
            .lock()
            .map_err(Error::from)?;
        if let Some(render_pass) = render_passes.get(&layout.full_hash()) {
            return Ok(render_pass.clone());
        }
        debug!(
            "Creating render pass with {} attachments ({:?} samples)",
            layout.attachments().len(),
            layout.num_samples()
        );
        let render_pass = Arc::new(RenderPass::new(self.device.clone(), layout.clone())?);
        render_passes.insert(layout.full_hash(), render_pass.clone());
        Ok(render_pass)
    }

    /// Get a framebuffer binding exactly `targets`, creating it on a cache miss.
    pub fn get_or_create_framebuffer(
        &self,
        targets: &RenderTargetsInfo,
        layout: &RenderTargetLayout,
        render_pass: &RenderPass,
    ) -> Result<Arc<Framebuffer>> {
        let key = framebuffer_key(layout, targets);
        let mut framebuffers = self
            .framebuffers
            .lock()
            .map_err(Error::from)?;
        let existing = framebuffers
            .get_vec(&key)
            .and_then(|bucket| bucket.iter().find(|framebuffer| framebuffer.matches(targets)));
        if let Some(framebuffer) = existing {
            return Ok(framebuffer.clone());
        }
        debug!("Creating framebuffer of {:?} with {} colour targets", layout.extent(), targets.color.len());
        let framebuffer = Arc::new(Framebuffer::new(self.device.clone(), targets, layout, render_pass)?);
        framebuffers.insert(key, framebuffer.clone());
        Ok(framebuffer)
    }

    fn clear_values(targets: &RenderTargetsInfo, layout: &RenderTargetLayout) -> Vec<vk::ClearValue> {
        let mut values = Vec::with_capacity(layout.attachments().len());
        for target in &targets.color {
            let value = match target.texture.clear_value {
                value @ ClearValue::Color(_) => value,
                _ => ClearValue::BLACK,
            };
            values.push(value.to_vk());
        }
        if layout.has_resolve_attachments() {
            values.extend(
                targets
                    .color
                    .iter()
                    .filter(|target| target.resolve.is_some())
                    .map(|_| ClearValue::BLACK.to_vk()),
            );
        }
        if let Some(target) = &targets.depth_stencil {
            let value = match target.texture.clear_value {
                value @ ClearValue::DepthStencil {
                    ..
                } => value,
                _ => ClearValue::DEPTH_ONE,
            };
            values.push(value.to_vk());
        }
        values
    }

    fn assert_outside(&self, cmd: &CmdBuffer) {
        assert_eq!(self.state, RenderPassState::Outside, "Already inside a {:?} render pass", self.state);
        assert!(
            cmd.is_outside_render_pass(),
            "Command buffer {:?} must be recording outside a render pass, state is {:?}",
            cmd.id(),
            cmd.state()
        );
    }

    /// Transition the targets to attachment layouts and begin an emulated render pass.
    /// # Panics
    /// Panics if a render pass is already active.
    pub fn begin_emulated_render_pass(
        &mut self,
        cmd: &mut CmdBuffer,
        targets: &RenderTargetsInfo,
        layout: &RenderTargetLayout,
        render_pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
    ) -> Result<()> {
        self.assert_outside(cmd);
        let mut barrier = PendingBarrier::new();
        for target in &targets.color {
            let range = target.texture.full_range();
            match self.layout(target.texture.image) {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {}
                current => {
                    let src = ImageLayoutBarrier::from_layout(current);
                    barrier.add_image_layout_transition(target.texture.image, src, ImageLayoutBarrier::ColorAttachment, range);
                }
            }
            self.layouts
                .insert(target.texture.image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        }
        if let Some(target) = &targets.depth_stencil {
            let dst = target
                .access
                .layout(self.device.settings().mixed_depth_stencil_layouts);
            self.add_transition(&mut barrier, &target.texture, dst);
        }
        barrier.execute(cmd);

        let clear_values = Self::clear_values(targets, layout);
        cmd.begin_render_pass(layout, &render_pass, &framebuffer, &clear_values)?;
        self.current_render_pass = Some(render_pass);
        self.current_framebuffer = Some(framebuffer);
        self.state = RenderPassState::Emulated;
        Ok(())
    }

    /// End the current emulated render pass.
    /// # Panics
    /// Panics if no emulated render pass is active.
    pub fn end_emulated_render_pass(&mut self, cmd: &mut CmdBuffer) {
        assert_eq!(self.state, RenderPassState::Emulated, "No emulated render pass to end, state is {:?}", self.state);
        cmd.end_render_pass();
        self.finish_render_pass(cmd);
    }

    fn finish_render_pass(&mut self, cmd: &mut CmdBuffer) {
        self.state = RenderPassState::Outside;
        self.current_render_pass = None;
        self.current_framebuffer = None;
        if self.device.settings().heavy_weight_barrier_after_render_pass() {
            heavy_weight_barrier(cmd);
        }
    }

    /// Transition the attachments of `info` and begin a real render pass.
    /// # Panics
    /// - Panics if a render pass is already active.
    /// - Panics if mips are being generated and the colour target is not a single mip above zero.
    pub fn begin_real_render_pass(
        &mut self,
        cmd: &mut CmdBuffer,
        info: &RenderPassInfo,
        layout: &RenderTargetLayout,
        render_pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
    ) -> Result<()> {
        self.assert_outside(cmd);
        let mut barrier = PendingBarrier::new();
        if info.generating_mips {
            assert_eq!(info.color.len(), 1, "Generating mips requires exactly one colour target");
            let target = &info.color[0];
            assert!(target.mip_index > 0, "Generating mips requires a mip index above zero");
            let texture = &target.texture;
            if self.generate_mips.image != Some(texture.image) {
                let current = self.layout(texture.image);
                self.generate_mips.init(texture, current);
            }
            self.generate_mips
                .transition_mip(&mut barrier, target.mip_index - 1, target.array_slice, ImageLayoutBarrier::PixelShaderRead);
            self.generate_mips
                .transition_mip(&mut barrier, target.mip_index, target.array_slice, ImageLayoutBarrier::ColorAttachment);
            self.generate_mips.current_mip = target.mip_index;
            self.generate_mips.current_slice = target.array_slice;
            self.layouts
                .insert(texture.image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        } else {
            for target in &info.color {
                let image = target.texture.image;
                let range = target.texture.full_range();
                match self.layout(image) {
                    vk::ImageLayout::UNDEFINED => {
                        barrier.add_image_layout_transition(image, ImageLayoutBarrier::Undefined, ImageLayoutBarrier::ColorAttachment, range);
                    }
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
                        if target.actions.load == LoadAction::Load {
                            barrier.add_image_layout_transition(image, ImageLayoutBarrier::ColorAttachment, ImageLayoutBarrier::ColorAttachment, range);
                        }
                    }
                    current => {
                        barrier.add_image_layout_transition(image, ImageLayoutBarrier::from_layout(current), ImageLayoutBarrier::ColorAttachment, range);
                    }
                }
                self.layouts
                    .insert(image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
        }
        for target in info.color.iter().filter_map(|target| target.resolve.as_ref()) {
            if layout.has_resolve_attachments() {
                self.add_transition(&mut barrier, target, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
        }
        if let Some(target) = &info.depth_stencil {
            let dst = target
                .access
                .layout(self.device.settings().mixed_depth_stencil_layouts);
            self.add_transition(&mut barrier, &target.texture, dst);
        }
        barrier.execute(cmd);

        let clear_values = Self::clear_values(&info.to_render_targets_info(), layout);
        cmd.begin_render_pass(layout, &render_pass, &framebuffer, &clear_values)?;
        self.current_render_pass = Some(render_pass);
        self.current_framebuffer = Some(framebuffer);
        self.state = RenderPassState::Real;
        Ok(())
    }

    /// End the current real render pass. When generating mips, the mip that was just written becomes readable, and
    /// tracking ends after the last mip.
    /// # Panics
    /// Panics if no real render pass is active.
    pub fn end_real_render_pass(&mut self, cmd: &mut CmdBuffer) {
        assert_eq!(self.state, RenderPassState::Real, "No real render pass to end, state is {:?}", self.state);
        cmd.end_render_pass();
        if self.generate_mips.is_active() {
            let mut barrier = PendingBarrier::new();
            let (mip, slice) = (self.generate_mips.current_mip, self.generate_mips.current_slice);
            self.generate_mips
                .transition_mip(&mut barrier, mip, slice, ImageLayoutBarrier::PixelShaderRead);
            barrier.execute(cmd);
            let num_mips = self
                .generate_mips
                .layouts
                .first()
                .map_or(0, |mips| mips.len() as u32);
            if mip + 1 >= num_mips {
                self.generate_mips.reset();
            }
        }
        self.finish_render_pass(cmd);
    }

    pub fn generate_mips_info(&self) -> &GenerateMipsInfo {
        &self.generate_mips
    }

    /// Forget an interrupted mip generation.
    pub(crate) fn reset_generate_mips(&mut self) {
        self.generate_mips.reset();
    }

    /// Drop every cached framebuffer that references `image`, and stop tracking its layout. Must be called before the
    /// image is destroyed. Returns the number of framebuffers removed.
    /// # Panics
    /// Panics if `image` is bound to the active render pass.
    pub fn notify_deleted_render_target(&mut self, image: vk::Image) -> Result<usize> {
        if let Some(framebuffer) = &self.current_framebuffer {
            assert!(
                !framebuffer.contains_render_target(image),
                "Render target {image:?} deleted while bound to the active render pass"
            );
        }
        let mut framebuffers = self
            .framebuffers
            .lock()
            .map_err(Error::from)?;
        let removed = framebuffers
            .flat_iter()
            .filter(|(_, framebuffer)| framebuffer.contains_render_target(image))
            .count();
        framebuffers.retain(|_, framebuffer| !framebuffer.contains_render_target(image));
        self.layouts.remove(&image);
        if self.generate_mips.image == Some(image) {
            self.generate_mips.reset();
        }
        Ok(removed)
    }

    /// Whether render passes of layout `new` can keep using an active render pass of layout `old` instead of
    /// restarting it. The check is conservative, when in doubt the pass is restarted.
    pub fn is_compatible_render_pass(old: &RenderTargetLayout, new: &RenderTargetLayout) -> bool {
        if old.compatible_hash() != new.compatible_hash() || old.attachments().len() != new.attachments().len() {
            return false;
        }
        old.attachments()
            .iter()
            .zip(new.attachments())
            .all(|(old, new)| {
                // A clear only happens when the pass begins, so every requested clear restarts it.
                let needs_clear = |new_op: vk::AttachmentLoadOp| new_op == vk::AttachmentLoadOp::CLEAR;
                let needs_store = |new_op: vk::AttachmentStoreOp, old_op: vk::AttachmentStoreOp| {
                    new_op == vk::AttachmentStoreOp::STORE && old_op == vk::AttachmentStoreOp::DONT_CARE
                };
                old.format == new.format
                    && old.final_layout == new.final_layout
                    && !needs_clear(new.load_op)
                    && !needs_clear(new.stencil_load_op)
                    && !needs_store(new.store_op, old.store_op)
                    && !needs_store(new.stencil_store_op, old.stencil_store_op)
            })
    }

    pub fn state(&self) -> RenderPassState {
        self.state
    }

    pub fn is_inside_render_pass(&self) -> bool {
        self.state != RenderPassState::Outside
    }

    pub fn current_render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.current_render_pass.as_ref()
    }

    pub fn current_framebuffer(&self) -> Option<&Arc<Framebuffer>> {
        self.current_framebuffer.as_ref()
    }

    pub fn render_pass_count(&self) -> Result<usize> {
        Ok(self
            .render_passes
            .lock()
            .map_err(Error::from)?
            .len())
    }

    /// Number of distinct framebuffer cache keys.
    pub fn framebuffer_key_count(&self) -> Result<usize> {
        Ok(self
            .framebuffers
            .lock()
            .map_err(Error::from)?
            .keys()
            .count())
    }

    pub fn framebuffer_count(&self) -> Result<usize> {
        let framebuffers = self
            .framebuffers
            .lock()
            .map_err(Error::from)?;
        Ok(framebuffers.iter_all().map(|(_, bucket)| bucket.len()).sum())
    }

    /// Start from the layouts tracked by `other`. Used when a deferred context begins recording.
    pub fn copy_layouts_from(&mut self, other: &TransitionAndLayoutManager) {
        self.layouts = other.layouts.clone();
    }

    /// Merge the caches and layouts of this manager into `target`. Layouts tracked here override the ones in `target`.
    /// # Panics
    /// Panics if this manager is still inside a render pass.
    pub fn merge_into(&mut self, target: &mut TransitionAndLayoutManager) -> Result<()> {
        assert!(!self.is_inside_render_pass(), "Can't merge a layout manager that is inside a render pass");
        {
            let render_passes = self
                .render_passes
                .lock()
                .map_err(Error::from)?;
            let mut target_render_passes = target
                .render_passes
                .lock()
                .map_err(Error::from)?;
            for (hash, render_pass) in render_passes.iter() {
                target_render_passes
                    .entry(*hash)
                    .or_insert_with(|| render_pass.clone());
            }
        }
        {
            let framebuffers = self
                .framebuffers
                .lock()
                .map_err(Error::from)?;
            let mut target_framebuffers = target
                .framebuffers
                .lock()
                .map_err(Error::from)?;
            for (key, bucket) in framebuffers.iter_all() {
                for framebuffer in bucket {
                    let known = target_framebuffers
                        .get_vec(key)
                        .map_or(false, |existing| existing.iter().any(|other| Arc::ptr_eq(other, framebuffer)));
                    if !known {
                        target_framebuffers.insert(*key, framebuffer.clone());
                    }
                }
            }
        }
        target.layouts.extend(self.layouts.drain());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::*;

    fn layout(actions: RenderTargetActions) -> RenderTargetLayout {
        let texture = Texture::color_2d(vk::Image::from_raw(1), vk::Format::R8G8B8A8_UNORM, 32, 32);
        RenderTargetLayout::from_render_pass_info(&RenderPassInfo::new().color(ColorRenderTarget::new(texture, actions)), true)
    }

    #[test]
    fn compatibility_rejects_new_clears_and_stores() {
        let load_store = layout(RenderTargetActions::LOAD_STORE);
        let clear_store = layout(RenderTargetActions::CLEAR_STORE);
        let load_dont_store = layout(RenderTargetActions::LOAD_DONT_STORE);
        assert!(TransitionAndLayoutManager::is_compatible_render_pass(&load_store, &load_store));
        assert!(TransitionAndLayoutManager::is_compatible_render_pass(&clear_store, &load_store));
        assert!(!TransitionAndLayoutManager::is_compatible_render_pass(&load_store, &clear_store));
        assert!(!TransitionAndLayoutManager::is_compatible_render_pass(&clear_store, &clear_store));
        assert!(!TransitionAndLayoutManager::is_compatible_render_pass(&load_dont_store, &load_store));
        assert!(TransitionAndLayoutManager::is_compatible_render_pass(&load_store, &load_dont_store));

        let other_format = RenderTargetLayout::from_render_pass_info(
            &RenderPassInfo::new().color(ColorRenderTarget::new(
                Texture::color_2d(vk::Image::from_raw(1), vk::Format::B8G8R8A8_UNORM, 32, 32),
                RenderTargetActions::LOAD_STORE,
            )),
            true,
        );
        assert!(!TransitionAndLayoutManager::is_compatible_render_pass(&load_store, &other_format));
    }
}
