//! Pipeline state set on a context between draws or dispatches. The state is only flushed to the command buffer when
//! work is recorded, and only the parts that changed are re-recorded.

use std::collections::BTreeMap;

use anyhow::Result;
use ash::vk;

use crate::{Buffer, CmdBuffer, Error, PipelineStateCache, Texture};

/// Shader stage a resource is bound to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Textures and uniform buffers bound per stage and slot.
#[derive(Debug, Default)]
struct BoundResources {
    textures: BTreeMap<(ShaderStage, u32), Texture>,
    uniform_buffers: BTreeMap<(ShaderStage, u32), Buffer>,
    dirty: bool,
}

impl BoundResources {
    fn set_texture(&mut self, stage: ShaderStage, index: u32, texture: Texture) {
        if self.textures.insert((stage, index), texture) != Some(texture) {
            self.dirty = true;
        }
    }

    fn set_uniform_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Buffer) {
        if self.uniform_buffers.insert((stage, index), buffer) != Some(buffer) {
            self.dirty = true;
        }
    }

    fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.uniform_buffers.is_empty()
    }

    /// Allocate a fresh descriptor set if bindings changed since the last flush.
    fn flush(&mut self, cmd: &mut CmdBuffer) -> Result<()> {
        if self.dirty && !self.is_empty() {
            cmd.allocate_descriptor_set()?;
        }
        self.dirty = false;
        Ok(())
    }

    fn textures(&self) -> impl Iterator<Item = &Texture> {
        self.textures.values()
    }
}

/// Pending state for draws.
#[derive(Debug, Default)]
pub struct PendingGfxState {
    pipeline: Option<u64>,
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    stencil_ref: u32,
    resources: BoundResources,
}

impl PendingGfxState {
    pub fn set_pipeline(&mut self, key: u64) {
        self.pipeline = Some(key);
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.viewport = Some(viewport);
    }

    /// Set the scissor rectangle. `None` makes the scissor follow the viewport.
    pub fn set_scissor(&mut self, scissor: Option<vk::Rect2D>) {
        self.scissor = scissor;
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        self.stencil_ref = reference;
    }

    /// # Panics
    /// Panics if `stage` is [`ShaderStage::Compute`].
    pub fn set_texture(&mut self, stage: ShaderStage, index: u32, texture: Texture) {
        assert_ne!(stage, ShaderStage::Compute, "Compute resources are bound on the compute state");
        self.resources.set_texture(stage, index, texture);
    }

    /// # Panics
    /// Panics if `stage` is [`ShaderStage::Compute`].
    pub fn set_uniform_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Buffer) {
        assert_ne!(stage, ShaderStage::Compute, "Compute resources are bound on the compute state");
        self.resources.set_uniform_buffer(stage, index, buffer);
    }

    /// Make the full `extent` the viewport, with the scissor following it.
    pub fn reset_viewport(&mut self, extent: vk::Extent2D) {
        self.viewport = Some(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        self.scissor = None;
    }

    pub fn bound_textures(&self) -> impl Iterator<Item = &Texture> {
        self.resources.textures()
    }

    /// Record the pending state into `cmd` before a draw inside `render_pass`.
    /// # Errors
    /// Fails with [`Error::NoPipelineCache`] if a pipeline was set but `pipelines` is `None`.
    pub fn prepare_for_draw(&mut self, cmd: &mut CmdBuffer, pipelines: Option<&dyn PipelineStateCache>, render_pass: vk::RenderPass) -> Result<()> {
        if let Some(key) = self.pipeline {
            let pipelines = pipelines.ok_or(Error::NoPipelineCache)?;
            let pipeline = pipelines.get_or_create_graphics_pipeline(key, render_pass)?;
            cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
        self.resources.flush(cmd)?;
        if let Some(viewport) = &self.viewport {
            cmd.set_viewport(viewport);
            let scissor = self.scissor.unwrap_or(vk::Rect2D {
                offset: vk::Offset2D {
                    x: viewport.x as i32,
                    y: viewport.y as i32,
                },
                extent: vk::Extent2D {
                    width: viewport.width as u32,
                    height: viewport.height as u32,
                },
            });
            cmd.set_scissor(&scissor);
        }
        cmd.set_stencil_reference(self.stencil_ref);
        Ok(())
    }

    /// Forget everything recorded so far. Bindings must be flushed again on the next command buffer.
    pub fn invalidate(&mut self) {
        self.resources.dirty = true;
    }
}

/// Pending state for dispatches.
#[derive(Debug, Default)]
pub struct PendingComputeState {
    shader: Option<u64>,
    resources: BoundResources,
}

impl PendingComputeState {
    pub fn set_shader(&mut self, shader: u64) {
        self.shader = Some(shader);
    }

    pub fn set_texture(&mut self, index: u32, texture: Texture) {
        self.resources
            .set_texture(ShaderStage::Compute, index, texture);
    }

    pub fn set_uniform_buffer(&mut self, index: u32, buffer: Buffer) {
        self.resources
            .set_uniform_buffer(ShaderStage::Compute, index, buffer);
    }

    pub fn bound_textures(&self) -> impl Iterator<Item = &Texture> {
        self.resources.textures()
    }

    /// Record the pending state into `cmd` before a dispatch.
    /// # Errors
    /// - Fails with [`Error::NoPipelineCache`] if `pipelines` is `None`.
    /// - Fails with [`Error::Uncategorized`] if no compute shader was set.
    pub fn prepare_for_dispatch(&mut self, cmd: &mut CmdBuffer, pipelines: Option<&dyn PipelineStateCache>) -> Result<()> {
        let shader = self
            .shader
            .ok_or(Error::Uncategorized("No compute shader set before dispatch"))?;
        let pipelines = pipelines.ok_or(Error::NoPipelineCache)?;
        let pipeline = pipelines.get_or_create_compute_pipeline(shader)?;
        cmd.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline);
        self.resources.flush(cmd)
    }

    pub fn invalidate(&mut self) {
        self.resources.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn rebinding_the_same_texture_stays_clean() {
        let texture = Texture::color_2d(vk::Image::from_raw(1), vk::Format::R8G8B8A8_UNORM, 4, 4);
        let mut state = PendingGfxState::default();
        state.set_texture(ShaderStage::Fragment, 0, texture);
        assert!(state.resources.dirty);
        state.resources.dirty = false;
        state.set_texture(ShaderStage::Fragment, 0, texture);
        assert!(!state.resources.dirty);
        state.set_texture(ShaderStage::Vertex, 0, texture);
        assert!(state.resources.dirty);
        assert_eq!(state.bound_textures().count(), 2);
    }

    #[test]
    #[should_panic(expected = "Compute resources")]
    fn compute_stage_rejected_on_graphics_state() {
        let buffer = Buffer::new(vk::Buffer::from_raw(1), 16, vk::BufferUsageFlags::UNIFORM_BUFFER);
        PendingGfxState::default().set_uniform_buffer(ShaderStage::Compute, 0, buffer);
    }
}
