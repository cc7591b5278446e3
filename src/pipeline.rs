//! Pipeline creation is left to the application. Deimos only needs to turn the pending pipeline state into a
//! `VkPipeline` before a draw or dispatch, which goes through the [`PipelineStateCache`] trait.

use anyhow::Result;
use ash::vk;

/// Creates pipelines on demand and caches them.
///
/// `key` is an application-chosen identifier of the pipeline state, passed to
/// [`CommandListContext::set_graphics_pipeline`](crate::CommandListContext::set_graphics_pipeline) and
/// [`CommandListContext::set_compute_shader`](crate::CommandListContext::set_compute_shader).
pub trait PipelineStateCache: Send + Sync {
    /// Get the graphics pipeline for `key`, compatible with `render_pass`.
    fn get_or_create_graphics_pipeline(&self, key: u64, render_pass: vk::RenderPass) -> Result<vk::Pipeline>;

    /// Get the compute pipeline for `shader`.
    fn get_or_create_compute_pipeline(&self, shader: u64) -> Result<vk::Pipeline>;
}
