//! The command list context ties a [`CommandBufferManager`] and a [`TransitionAndLayoutManager`] together and exposes
//! the recording interface the renderer talks to.
//!
//! There is one *immediate* context per queue, which owns the frame boundaries, plus any number of *deferred*
//! contexts used to record in parallel. A deferred context starts from the layouts of the immediate context with
//! [`CommandListContext::begin_deferred`], and hands its work and its caches back with
//! [`CommandListContext::finish_into`].
//!
//! # Safe points
//! Submitting a command buffer is only valid outside a render pass. Callers that want to bound the amount of work in
//! flight call [`CommandListContext::submit_at_next_safe_point`]. The next time the context leaves a render pass or
//! finishes a transition outside of one, it submits the active command buffer and begins a new one.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::context::pending_state::{PendingComputeState, PendingGfxState};
use crate::{
    Buffer, CmdBufferGuard, CommandBufferManager, Device, ExclusiveDepthStencil, ImageCopyDescription, ImageLayoutBarrier, PendingBarrier,
    PendingTransition, PipelineStateCache, Queue, RenderPassInfo, RenderPassState, RenderTargetLayout, RenderTargetsInfo, ResolveParams,
    SemaphoreId, ShaderStage, SubresourceRange, Texture, TransitionAccess, TransitionAndLayoutManager, TransitionPipeline,
    UnorderedAccessView,
};

pub mod pending_state;

/// Per-thread recording context. See the [module-level documentation](self).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CommandListContext {
    #[derivative(Debug = "ignore")]
    device: Device,
    is_immediate: bool,
    manager: CommandBufferManager,
    layouts: TransitionAndLayoutManager,
    submit_at_next_safe_point: bool,
    gfx_state: PendingGfxState,
    compute_state: PendingComputeState,
    #[derivative(Debug = "ignore")]
    pipelines: Option<Arc<dyn PipelineStateCache>>,
    render_targets: Option<RenderTargetsInfo>,
    render_pass_info: Option<RenderPassInfo>,
    skipped_empty_render_pass: bool,
    event_depth: u32,
}

fn read_only_layout(texture: &Texture) -> vk::ImageLayout {
    if texture.is_depth_or_stencil_aspect() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

fn writable_layout(texture: &Texture) -> vk::ImageLayout {
    match (texture.is_render_targetable(), texture.is_depth_or_stencil_aspect()) {
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        (true, false) => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        (false, _) => vk::ImageLayout::GENERAL,
    }
}

fn mip_extent(texture: &Texture, mip: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (texture.width >> mip).max(1),
        height: (texture.height >> mip).max(1),
        depth: texture.depth.max(1),
    }
}

fn layers(texture: &Texture, mip: u32, layer: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: texture.aspect,
        mip_level: mip,
        base_array_layer: layer,
        layer_count: 1,
    }
}

impl CommandListContext {
    fn new(device: Device, queue: Arc<Queue>, is_immediate: bool) -> Result<Self> {
        let manager = CommandBufferManager::new(device.clone(), queue)?;
        let layouts = TransitionAndLayoutManager::new(device.clone());
        Ok(Self {
            device,
            is_immediate,
            manager,
            layouts,
            submit_at_next_safe_point: false,
            gfx_state: PendingGfxState::default(),
            compute_state: PendingComputeState::default(),
            pipelines: None,
            render_targets: None,
            render_pass_info: None,
            skipped_empty_render_pass: false,
            event_depth: 0,
        })
    }

    /// Create the immediate context of `queue`.
    pub fn new_immediate(device: Device, queue: Arc<Queue>) -> Result<Self> {
        Self::new(device, queue, true)
    }

    /// Create a deferred context submitting to `queue`.
    pub fn new_deferred(device: Device, queue: Arc<Queue>) -> Result<Self> {
        Self::new(device, queue, false)
    }

    pub fn is_immediate(&self) -> bool {
        self.is_immediate
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn manager(&self) -> &CommandBufferManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut CommandBufferManager {
        &mut self.manager
    }

    pub fn layouts(&self) -> &TransitionAndLayoutManager {
        &self.layouts
    }

    pub fn layouts_mut(&mut self) -> &mut TransitionAndLayoutManager {
        &mut self.layouts
    }

    /// Access the command buffer currently being recorded.
    pub fn active_cmd_buffer(&self) -> Result<CmdBufferGuard> {
        self.manager.active_cmd_buffer()
    }

    /// Get the upload command buffer. Uploads are submitted before the active command buffer.
    pub fn upload_cmd_buffer(&mut self) -> Result<CmdBufferGuard> {
        self.manager.get_upload_cmd_buffer()
    }

    /// Request a submission the next time no render pass is active.
    pub fn submit_at_next_safe_point(&mut self) {
        self.submit_at_next_safe_point = true;
    }

    pub fn has_pending_safe_point_submit(&self) -> bool {
        self.submit_at_next_safe_point
    }

    /// Submit the active command buffer if a submission was requested.
    /// # Panics
    /// Panics if a submission was requested and a render pass is active.
    pub fn safe_point_submit(&mut self) -> Result<()> {
        if self.submit_at_next_safe_point {
            assert!(!self.layouts.is_inside_render_pass(), "Safe point submit inside a render pass");
            self.submit_and_prepare(None)?;
            self.submit_at_next_safe_point = false;
        }
        Ok(())
    }

    /// Submit right away when outside a render pass, or at the next safe point otherwise.
    pub fn request_submit_current_commands(&mut self) -> Result<()> {
        self.submit_at_next_safe_point();
        if !self.layouts.is_inside_render_pass() {
            self.safe_point_submit()?;
        }
        Ok(())
    }

    /// Hint that the renderer reached a good point to kick off GPU work.
    pub fn submit_commands_hint(&mut self) -> Result<()> {
        self.request_submit_current_commands()
    }

    /// Submit the upload command buffer, if one is outstanding.
    pub fn flush_uploads(&mut self) -> Result<()> {
        if self.manager.has_pending_upload_cmd_buffer() {
            self.manager.submit_upload_cmd_buffer(&[])?;
        }
        Ok(())
    }

    /// Submit pending uploads, then the active command buffer, and begin a new active command buffer.
    fn submit_and_prepare(&mut self, signal: Option<SemaphoreId>) -> Result<()> {
        self.flush_uploads()?;
        self.manager.submit_active_cmd_buffer(signal)?;
        self.manager
            .prepare_for_new_active_command_buffer()?;
        self.gfx_state.invalidate();
        self.compute_state.invalidate();
        Ok(())
    }

    fn end_emulated_render_pass(&mut self) -> Result<()> {
        {
            let mut cmd = self.manager.active_cmd_buffer()?;
            self.layouts.end_emulated_render_pass(&mut cmd);
        }
        self.render_targets = None;
        if self.device.settings().submit_after_every_end_render_pass {
            self.submit_and_prepare(None)?;
        }
        Ok(())
    }

    /// End the emulated render pass if one is active.
    /// # Panics
    /// Panics if a real render pass is active.
    fn ensure_outside_render_pass(&mut self) -> Result<()> {
        match self.layouts.state() {
            RenderPassState::Outside => Ok(()),
            RenderPassState::Emulated => self.end_emulated_render_pass(),
            RenderPassState::Real => panic!("Operation is not allowed inside a render pass"),
        }
    }

    /// Whether `texture` is bound to the active render pass.
    fn is_bound_render_target(&self, texture: &Texture) -> bool {
        self.layouts
            .current_framebuffer()
            .map_or(false, |framebuffer| framebuffer.contains_render_target(texture.image))
    }

    /// Bind `targets`, implicitly beginning an emulated render pass. If the targets are already bound by a compatible
    /// render pass, nothing happens. Targets with a zero extent end the active emulated render pass without starting a
    /// new one.
    /// # Panics
    /// Panics if a real render pass is active.
    pub fn set_render_targets(&mut self, targets: &RenderTargetsInfo) -> Result<()> {
        assert_ne!(self.layouts.state(), RenderPassState::Real, "Can't set render targets inside a real render pass");
        self.layouts.reset_generate_mips();
        let layout = RenderTargetLayout::from_render_targets(targets, self.device.settings().mixed_depth_stencil_layouts);
        if layout.is_empty() {
            return self.ensure_outside_render_pass();
        }
        let render_pass = self.layouts.get_or_create_render_pass(&layout)?;
        let framebuffer = self
            .layouts
            .get_or_create_framebuffer(targets, &layout, &render_pass)?;

        if self.layouts.state() == RenderPassState::Emulated {
            let same_framebuffer = self
                .layouts
                .current_framebuffer()
                .map_or(false, |current| Arc::ptr_eq(current, &framebuffer));
            let compatible = self
                .layouts
                .current_render_pass()
                .map_or(false, |current| TransitionAndLayoutManager::is_compatible_render_pass(current.layout(), &layout));
            if same_framebuffer && compatible {
                return Ok(());
            }
            self.end_emulated_render_pass()?;
        }
        self.safe_point_submit()?;

        {
            let mut cmd = self.manager.active_cmd_buffer()?;
            self.layouts
                .begin_emulated_render_pass(&mut cmd, targets, &layout, render_pass, framebuffer)?;
        }
        self.gfx_state.reset_viewport(layout.extent());
        self.render_targets = Some(targets.clone());
        Ok(())
    }

    /// The targets bound by the active emulated render pass.
    pub fn render_targets(&self) -> Option<&RenderTargetsInfo> {
        self.render_targets.as_ref()
    }

    /// Begin an explicit render pass. An active emulated render pass is ended first.
    /// # Panics
    /// Panics if a real render pass is already active.
    pub fn begin_render_pass(&mut self, info: &RenderPassInfo, name: &str) -> Result<()> {
        self.ensure_outside_render_pass()?;
        assert!(self.render_pass_info.is_none(), "Render pass was not ended");
        let layout = RenderTargetLayout::from_render_pass_info(info, self.device.settings().mixed_depth_stencil_layouts);
        if layout.is_empty() {
            warn!("Skipping render pass {name} without any render target extent");
            self.skipped_empty_render_pass = true;
            return Ok(());
        }
        let render_pass = self.layouts.get_or_create_render_pass(&layout)?;
        let framebuffer = self
            .layouts
            .get_or_create_framebuffer(&info.to_render_targets_info(), &layout, &render_pass)?;

        self.push_event(name)?;
        {
            let mut cmd = self.manager.active_cmd_buffer()?;
            self.layouts
                .begin_real_render_pass(&mut cmd, info, &layout, render_pass, framebuffer)?;
        }
        self.gfx_state.reset_viewport(layout.extent());
        self.render_pass_info = Some(info.clone());
        Ok(())
    }

    /// End the explicit render pass. Targets with a resolve target are copied into it if the pass is not
    /// multisampled.
    /// # Panics
    /// Panics if no explicit render pass is active.
    pub fn end_render_pass(&mut self) -> Result<()> {
        if std::mem::take(&mut self.skipped_empty_render_pass) {
            return Ok(());
        }
        let info = self
            .render_pass_info
            .take()
            .expect("end_render_pass called without begin_render_pass");
        {
            let mut cmd = self.manager.active_cmd_buffer()?;
            self.layouts.end_real_render_pass(&mut cmd);
        }
        self.pop_event()?;

        if !info.is_msaa() {
            for target in &info.color {
                if let Some(resolve) = &target.resolve {
                    self.copy_to_resolve_target(&target.texture, resolve, &info.resolve_params)?;
                }
            }
            if let Some(target) = &info.depth_stencil {
                if let Some(resolve) = &target.resolve {
                    self.copy_to_resolve_target(&target.texture, resolve, &info.resolve_params)?;
                }
            }
        }

        if self.device.settings().submit_after_every_end_render_pass {
            self.submit_and_prepare(None)?;
        }
        self.safe_point_submit()
    }

    /// Advance to the next subpass of the explicit render pass.
    /// # Panics
    /// Panics if no explicit render pass is active.
    pub fn next_subpass(&mut self) -> Result<()> {
        assert_eq!(self.layouts.state(), RenderPassState::Real, "next_subpass requires an explicit render pass");
        self.manager.active_cmd_buffer()?.next_subpass();
        Ok(())
    }

    /// Transition `textures` for the given access. Barriers are never recorded inside a render pass: an active emulated
    /// render pass is ended when a barrier is needed.
    /// # Panics
    /// Panics if a barrier is needed while an explicit render pass is active.
    pub fn transition_textures(&mut self, access: TransitionAccess, pipeline: TransitionPipeline, textures: &[Texture]) -> Result<()> {
        let transition = PendingTransition::textures(access, pipeline, textures.to_vec());
        let mut barrier = PendingBarrier::new();
        match transition.access {
            TransitionAccess::Readable | TransitionAccess::MetaData => {
                if transition
                    .textures
                    .iter()
                    .any(|texture| self.is_bound_render_target(texture))
                {
                    self.ensure_outside_render_pass()?;
                }
                for texture in &transition.textures {
                    self.layouts
                        .add_transition(&mut barrier, texture, read_only_layout(texture));
                }
                match transition.pipeline {
                    TransitionPipeline::ComputeToGfx | TransitionPipeline::ComputeToCompute => {
                        let (src, dst) = transition.pipeline.stages();
                        barrier.add_stages(src, dst);
                        barrier.add_memory_barrier(vk::AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_READ);
                    }
                    _ => {}
                }
            }
            TransitionAccess::Writable => {
                for texture in &transition.textures {
                    self.layouts
                        .add_transition(&mut barrier, texture, writable_layout(texture));
                }
            }
            TransitionAccess::RWSubResBarrier => {
                self.ensure_outside_render_pass()?;
            }
            TransitionAccess::RWBarrier => {
                let (src, dst) = transition.pipeline.stages();
                barrier.add_stages(src, dst);
                let read_write = vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
                barrier.add_memory_barrier(read_write, read_write);
            }
            TransitionAccess::RWNoBarrier => {}
        }

        if !barrier.is_empty() {
            self.ensure_outside_render_pass()?;
            let mut cmd = self.manager.active_cmd_buffer()?;
            barrier.execute(&mut cmd);
        }
        if !self.layouts.is_inside_render_pass() {
            self.safe_point_submit()?;
        }
        Ok(())
    }

    /// Transition `uavs` for the given access. When `other` is given and submits to a different queue family, ownership
    /// of the resources is transferred to it: the release half is recorded and submitted here, and `other` waits on a
    /// semaphore before the acquire half.
    pub fn transition_uavs(
        &mut self,
        access: TransitionAccess,
        pipeline: TransitionPipeline,
        uavs: &[UnorderedAccessView],
        other: Option<&mut CommandListContext>,
    ) -> Result<()> {
        let transition = PendingTransition::uavs(access, pipeline, uavs.to_vec());
        let gathered = transition.gather_uav_barriers(|image| self.layouts.layout(image));
        if gathered.is_empty() {
            return Ok(());
        }
        self.ensure_outside_render_pass()?;

        let src_family = self.manager.queue().family_index();
        match other {
            Some(other) if other.manager.queue().family_index() != src_family => {
                let dst_family = other.manager.queue().family_index();
                let new_layouts = gathered.new_layouts.clone();
                let (release, acquire) = gathered.into_ownership_transfer(src_family, dst_family);
                self.manager.active_cmd_buffer()?.pipeline_barrier(
                    release.src_stage,
                    release.dst_stage,
                    &[],
                    &release.buffers,
                    &release.images,
                );

                let semaphore = self.device.create_semaphore()?;
                self.submit_and_prepare(Some(semaphore))?;

                other.ensure_outside_render_pass()?;
                {
                    let mut cmd = other.manager.active_cmd_buffer()?;
                    cmd.pipeline_barrier(acquire.src_stage, acquire.dst_stage, &[], &acquire.buffers, &acquire.images);
                    cmd.add_wait_semaphore(acquire.dst_stage, semaphore)?;
                }
                self.device.release_semaphore(semaphore)?;
                for (image, layout) in new_layouts {
                    self.layouts.set_layout(image, layout);
                    other.layouts.set_layout(image, layout);
                }
            }
            _ => {
                self.manager.active_cmd_buffer()?.pipeline_barrier(
                    gathered.src_stage,
                    gathered.dst_stage,
                    &[],
                    &gathered.buffers,
                    &gathered.images,
                );
                for (image, layout) in gathered.new_layouts {
                    self.layouts.set_layout(image, layout);
                }
            }
        }
        self.safe_point_submit()
    }

    /// Move a depth target to the layout matching `mode`.
    pub fn transition_depth_stencil(&mut self, mode: ExclusiveDepthStencil, texture: &Texture) -> Result<()> {
        let dst = mode.layout(self.device.settings().mixed_depth_stencil_layouts);
        if self.layouts.layout(texture.image) == dst {
            return Ok(());
        }
        // Barriers can't be recorded inside a render pass.
        self.ensure_outside_render_pass()?;
        let mut cmd = self.manager.active_cmd_buffer()?;
        self.layouts.transition_resource(&mut cmd, texture, dst);
        Ok(())
    }

    /// Copy one mip and slice of `source` into `dest`. The source returns to its previous layout, the destination ends
    /// up readable, or in `GENERAL` layout if it is read back by the CPU.
    pub fn copy_to_resolve_target(&mut self, source: &Texture, dest: &Texture, params: &ResolveParams) -> Result<()> {
        if source.image == dest.image {
            return Ok(());
        }
        self.ensure_outside_render_pass()?;
        let mip = params.mip_index;
        let src_range = SubresourceRange::single(source.aspect, mip, params.source_array_index);
        let dst_range = SubresourceRange::single(dest.aspect, mip, params.dest_array_index);
        let src_layout = self.layouts.layout(source.image);
        let dst_layout = self.layouts.layout(dest.image);

        let mut cmd = self.manager.active_cmd_buffer()?;
        let mut barrier = PendingBarrier::new();
        if src_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            barrier.add_image_layout_transition(source.image, ImageLayoutBarrier::from_layout(src_layout), ImageLayoutBarrier::TransferSource, src_range);
        }
        barrier.add_image_layout_transition(dest.image, ImageLayoutBarrier::from_layout(dst_layout), ImageLayoutBarrier::TransferDest, dst_range);
        barrier.execute(&mut cmd);

        cmd.copy_image(&ImageCopyDescription {
            src_image: source.image,
            src_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst_image: dest.image,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            region: vk::ImageCopy {
                src_subresource: layers(source, mip, params.source_array_index),
                src_offset: vk::Offset3D::default(),
                dst_subresource: layers(dest, mip, params.dest_array_index),
                dst_offset: vk::Offset3D::default(),
                extent: mip_extent(source, mip),
            },
        });

        let final_dst = if dest.cpu_readback {
            vk::ImageLayout::GENERAL
        } else {
            read_only_layout(dest)
        };
        let mut barrier = PendingBarrier::new();
        // An untracked source can't go back to UNDEFINED, it stays a transfer source.
        let final_src = match src_layout {
            vk::ImageLayout::UNDEFINED => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            layout => layout,
        };
        if final_src != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            barrier.add_image_layout_transition(source.image, ImageLayoutBarrier::TransferSource, ImageLayoutBarrier::from_layout(final_src), src_range);
        }
        barrier.add_image_layout_transition(dest.image, ImageLayoutBarrier::TransferDest, ImageLayoutBarrier::from_layout(final_dst), dst_range);
        barrier.execute(&mut cmd);
        drop(cmd);

        self.layouts.set_layout(source.image, final_src);
        self.layouts.set_layout(dest.image, final_dst);
        Ok(())
    }

    /// Clear every subresource of a colour texture. The texture is left in `TRANSFER_DST_OPTIMAL` layout.
    pub fn clear_color_texture(&mut self, texture: &Texture, color: [f32; 4]) -> Result<()> {
        self.ensure_outside_render_pass()?;
        let mut cmd = self.manager.active_cmd_buffer()?;
        self.layouts
            .transition_resource(&mut cmd, texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.clear_color_image(
            texture.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearColorValue {
                float32: color,
            },
            &texture.full_range(),
        );
        Ok(())
    }

    /// Clear every subresource of a depth texture. The texture is left in `TRANSFER_DST_OPTIMAL` layout.
    pub fn clear_depth_stencil_texture(&mut self, texture: &Texture, depth: f32, stencil: u32) -> Result<()> {
        self.ensure_outside_render_pass()?;
        let mut cmd = self.manager.active_cmd_buffer()?;
        self.layouts
            .transition_resource(&mut cmd, texture, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        cmd.clear_depth_stencil_image(
            texture.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearDepthStencilValue {
                depth,
                stencil,
            },
            &texture.full_range(),
        );
        Ok(())
    }

    pub fn set_pipeline_cache(&mut self, pipelines: Arc<dyn PipelineStateCache>) {
        self.pipelines = Some(pipelines);
    }

    pub fn set_graphics_pipeline(&mut self, key: u64) {
        self.gfx_state.set_pipeline(key);
    }

    pub fn set_compute_shader(&mut self, shader: u64) {
        self.compute_state.set_shader(shader);
    }

    pub fn set_shader_texture(&mut self, stage: ShaderStage, index: u32, texture: Texture) {
        match stage {
            ShaderStage::Compute => self.compute_state.set_texture(index, texture),
            stage => self.gfx_state.set_texture(stage, index, texture),
        }
    }

    pub fn set_shader_uniform_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Buffer) {
        match stage {
            ShaderStage::Compute => self
                .compute_state
                .set_uniform_buffer(index, buffer),
            stage => self
                .gfx_state
                .set_uniform_buffer(stage, index, buffer),
        }
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.gfx_state.set_viewport(viewport);
    }

    /// Set the scissor rectangle. `None` makes the scissor follow the viewport.
    pub fn set_scissor(&mut self, scissor: Option<vk::Rect2D>) {
        self.gfx_state.set_scissor(scissor);
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        self.gfx_state.set_stencil_ref(reference);
    }

    fn prepare_for_draw(&mut self) -> Result<CmdBufferGuard> {
        assert!(self.layouts.is_inside_render_pass(), "Draws must be recorded inside a render pass");
        let render_pass = self
            .layouts
            .current_render_pass()
            // SAFETY: The render pass is kept alive by the layout manager while it is active.
            .map(|render_pass| unsafe { render_pass.handle() })
            .unwrap_or_default();
        let mut cmd = self.manager.active_cmd_buffer()?;
        self.gfx_state
            .prepare_for_draw(&mut cmd, self.pipelines.as_deref(), render_pass)?;
        Ok(cmd)
    }

    /// # Panics
    /// Panics if no render pass is active.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        self.prepare_for_draw()?
            .draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    /// # Panics
    /// Panics if no render pass is active.
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) -> Result<()> {
        self.prepare_for_draw()?
            .draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance);
        Ok(())
    }

    /// Dispatch compute work. An active emulated render pass is ended first.
    /// # Panics
    /// Panics if an explicit render pass is active.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_outside_render_pass()?;
        let mut cmd = self.manager.active_cmd_buffer()?;
        self.compute_state
            .prepare_for_dispatch(&mut cmd, self.pipelines.as_deref())?;
        cmd.dispatch(x, y, z);
        Ok(())
    }

    /// Open a debug label region on the active command buffer. Only recorded with the `debug-markers` feature.
    #[allow(unused_variables)]
    pub fn push_event(&mut self, name: &str) -> Result<()> {
        self.event_depth += 1;
        #[cfg(feature = "debug-markers")]
        self.manager.active_cmd_buffer()?.begin_debug_label(name);
        Ok(())
    }

    /// # Panics
    /// Panics if no debug label region is open.
    pub fn pop_event(&mut self) -> Result<()> {
        assert!(self.event_depth > 0, "pop_event without matching push_event");
        self.event_depth -= 1;
        #[cfg(feature = "debug-markers")]
        self.manager.active_cmd_buffer()?.end_debug_label();
        Ok(())
    }

    /// Start a new frame: advance the deferred deletion frame counter and recycle finished command buffers.
    /// # Panics
    /// Panics on a deferred context.
    pub fn begin_frame(&mut self) -> Result<()> {
        assert!(self.is_immediate, "Only the immediate context has frame boundaries");
        let frame = self.device.deferred_deletion().advance_frame();
        trace!("Beginning frame {frame}");
        self.manager.refresh_fence_status(None)
    }

    /// End the frame: release deferred resources and descriptor pools that are no longer in use, and free command
    /// buffers that have been idle for too long.
    /// # Panics
    /// Panics on a deferred context.
    pub fn end_frame(&mut self) -> Result<()> {
        assert!(self.is_immediate, "Only the immediate context has frame boundaries");
        let frame = self.device.deferred_deletion().frame_number();
        let released = self
            .device
            .deferred_deletion()
            .release_resources(self.device.driver(), false)?;
        let pools = self
            .device
            .descriptor_pools()
            .gc(self.device.driver(), frame)?;
        let cmd_buffers = self.manager.free_unused_cmd_buffers()?;
        if released + pools + cmd_buffers > 0 {
            info!("End of frame {frame}: released {released} objects, {pools} descriptor pool sets and {cmd_buffers} command buffers");
        }
        Ok(())
    }

    /// Start recording on a deferred context from the layouts currently tracked by `immediate`.
    pub fn begin_deferred(&mut self, immediate: &CommandListContext) {
        assert!(!self.is_immediate, "begin_deferred called on the immediate context");
        self.layouts.copy_layouts_from(&immediate.layouts);
    }

    /// Submit everything recorded on this deferred context and merge its caches and layouts into `immediate`.
    /// An emulated render pass that is still active is ended first.
    /// # Panics
    /// Panics if called on the immediate context, or with an explicit render pass active.
    pub fn finish_into(&mut self, immediate: &mut CommandListContext) -> Result<()> {
        assert!(!self.is_immediate, "finish_into called on the immediate context");
        assert!(immediate.is_immediate, "finish_into target must be the immediate context");
        self.ensure_outside_render_pass()?;
        self.submit_and_prepare(None)?;
        self.submit_at_next_safe_point = false;
        self.layouts.merge_into(&mut immediate.layouts)
    }
}
