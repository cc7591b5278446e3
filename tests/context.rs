use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use deimos::prelude::*;

mod framework;

fn main_pass(texture: Texture) -> RenderPassInfo {
    RenderPassInfo::new().color(ColorRenderTarget::new(texture, RenderTargetActions::CLEAR_STORE))
}

#[derive(Debug)]
struct CountingPipelines {
    pipeline: vk::Pipeline,
    graphics: AtomicUsize,
    compute: AtomicUsize,
}

impl CountingPipelines {
    fn new(driver: &RecordingDriver) -> Self {
        Self {
            pipeline: driver.create_pipeline(),
            graphics: AtomicUsize::new(0),
            compute: AtomicUsize::new(0),
        }
    }
}

impl PipelineStateCache for CountingPipelines {
    fn get_or_create_graphics_pipeline(&self, _key: u64, render_pass: vk::RenderPass) -> Result<vk::Pipeline> {
        assert_ne!(render_pass, vk::RenderPass::null());
        self.graphics.fetch_add(1, Ordering::Relaxed);
        Ok(self.pipeline)
    }

    fn get_or_create_compute_pipeline(&self, _shader: u64) -> Result<vk::Pipeline> {
        self.compute.fetch_add(1, Ordering::Relaxed);
        Ok(self.pipeline)
    }
}

#[test]
pub fn submission_waits_for_safe_point() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;
    ctx.draw(3, 1, 0, 0)?;
    ctx.submit_commands_hint()?;
    assert!(context.driver.submissions().is_empty(), "Nothing can be submitted inside a render pass.");
    assert!(ctx.has_pending_safe_point_submit());

    ctx.end_render_pass()?;
    assert_eq!(context.driver.submissions().len(), 1);
    assert!(!ctx.has_pending_safe_point_submit());
    assert!(ctx.manager().has_pending_active_cmd_buffer());
    Ok(())
}

#[test]
pub fn hint_outside_render_pass_submits_right_away() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.submit_commands_hint()?;
    assert_eq!(context.driver.submissions().len(), 1);
    assert!(!ctx.has_pending_safe_point_submit());
    Ok(())
}

#[test]
pub fn uploads_are_submitted_first() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    // SAFETY: Only used for comparison.
    let upload = unsafe { ctx.upload_cmd_buffer()?.handle() };
    let active = unsafe { ctx.active_cmd_buffer()?.handle() };
    ctx.submit_commands_hint()?;

    let submissions = context.driver.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].command_buffers, vec![upload]);
    assert_eq!(submissions[1].command_buffers, vec![active]);
    assert!(!ctx.manager().has_pending_upload_cmd_buffer());
    Ok(())
}

#[test]
pub fn submit_after_every_render_pass() -> Result<()> {
    let context = framework::make_context_with_settings(|settings| settings.submit_after_every_end_render_pass(true))?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(64, 64);
    ctx.begin_render_pass(&main_pass(texture), "first")?;
    ctx.end_render_pass()?;
    ctx.begin_render_pass(&main_pass(texture), "second")?;
    ctx.end_render_pass()?;
    assert_eq!(context.driver.submissions().len(), 2);
    Ok(())
}

#[test]
pub fn empty_render_targets_start_no_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(0, 64);
    let targets = RenderTargetsInfo {
        color: vec![RenderTargetView::new(texture, LoadAction::Clear, StoreAction::Store)],
        ..Default::default()
    };
    ctx.set_render_targets(&targets)?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Outside);
    assert_eq!(ctx.layouts().render_pass_count()?, 0);
    assert!(ctx.render_targets().is_none());
    Ok(())
}

#[test]
pub fn emulated_pass_pushes_a_default_viewport() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let targets = RenderTargetsInfo {
        color: vec![RenderTargetView::new(context.color_target(320, 240), LoadAction::Clear, StoreAction::Store)],
        ..Default::default()
    };
    ctx.set_render_targets(&targets)?;
    ctx.draw(3, 1, 0, 0)?;
    ctx.draw(3, 1, 0, 0)?;

    let commands = context.recorded(&ctx)?;
    let viewports: Vec<_> = commands
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::SetViewport(viewport) => Some(*viewport),
            _ => None,
        })
        .collect();
    assert_eq!(viewports.len(), 1, "Redundant viewport changes are skipped.");
    assert_eq!(viewports[0].width, 320.0);
    assert_eq!(viewports[0].height, 240.0);
    assert!(commands.iter().any(|command| matches!(
        command,
        RecordedCommand::SetScissor(vk::Rect2D {
            extent: vk::Extent2D { width: 320, height: 240 },
            ..
        })
    )));
    Ok(())
}

#[test]
pub fn pipelines_come_from_the_cache() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.set_graphics_pipeline(7);
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;
    let err = ctx.draw(3, 1, 0, 0).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoPipelineCache)));

    let pipelines = Arc::new(CountingPipelines::new(&context.driver));
    ctx.set_pipeline_cache(pipelines.clone());
    ctx.draw(3, 1, 0, 0)?;
    ctx.draw_indexed(6, 1, 0, 0, 0)?;
    assert_eq!(pipelines.graphics.load(Ordering::Relaxed), 2);
    let binds = context
        .recorded(&ctx)?
        .iter()
        .filter(|command| matches!(command, RecordedCommand::BindPipeline { .. }))
        .count();
    assert_eq!(binds, 1, "Binding the same pipeline twice is skipped.");
    ctx.end_render_pass()?;

    ctx.set_compute_shader(3);
    ctx.dispatch(8, 8, 1)?;
    assert_eq!(pipelines.compute.load(Ordering::Relaxed), 1);
    assert!(context
        .recorded(&ctx)?
        .iter()
        .any(|command| matches!(command, RecordedCommand::Dispatch { x: 8, y: 8, z: 1 })));
    Ok(())
}

#[test]
pub fn dispatch_without_shader_fails() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.set_pipeline_cache(Arc::new(CountingPipelines::new(&context.driver)));
    assert!(ctx.dispatch(1, 1, 1).is_err());
    Ok(())
}

#[test]
pub fn bound_resources_allocate_descriptor_sets() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(16, 16);
    let other = context.color_target(16, 16);
    let uniforms = Buffer::new(context.driver.create_buffer(), 256, vk::BufferUsageFlags::UNIFORM_BUFFER);
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;

    ctx.set_shader_texture(ShaderStage::Fragment, 0, texture);
    ctx.set_shader_uniform_buffer(ShaderStage::Vertex, 0, uniforms);
    ctx.draw(3, 1, 0, 0)?;
    assert_eq!(ctx.active_cmd_buffer()?.allocated_descriptor_sets(), 1);
    ctx.draw(3, 1, 0, 0)?;
    assert_eq!(ctx.active_cmd_buffer()?.allocated_descriptor_sets(), 1);

    ctx.set_shader_texture(ShaderStage::Fragment, 0, other);
    ctx.draw(3, 1, 0, 0)?;
    assert_eq!(ctx.active_cmd_buffer()?.allocated_descriptor_sets(), 2);
    ctx.end_render_pass()?;
    Ok(())
}

#[test]
pub fn descriptor_pools_return_after_retirement() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.begin_frame()?;
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;
    ctx.end_render_pass()?;
    ctx.submit_commands_hint()?;
    assert_eq!(context.device.descriptor_pools().cached_count()?, 0);

    context.driver.complete_submissions();
    ctx.end_frame()?;
    ctx.begin_frame()?;
    assert_eq!(context.device.descriptor_pools().cached_count()?, 1);
    Ok(())
}

#[test]
pub fn deferred_deletion_waits_for_frames() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(64, 64);
    let targets = RenderTargetsInfo {
        color: vec![RenderTargetView::new(texture, LoadAction::Clear, StoreAction::Store)],
        ..Default::default()
    };

    ctx.begin_frame()?;
    ctx.set_render_targets(&targets)?;
    ctx.set_render_targets(&RenderTargetsInfo::default())?;
    ctx.submit_commands_hint()?;
    ctx.layouts_mut().notify_deleted_render_target(texture.image)?;
    ctx.end_frame()?;
    assert_eq!(context.driver.live_objects(ObjectKind::Framebuffer), 1);

    context.driver.complete_submissions();
    for _ in 0..3 {
        ctx.begin_frame()?;
        ctx.end_frame()?;
    }
    assert_eq!(context.driver.live_objects(ObjectKind::Framebuffer), 0);
    assert_eq!(context.driver.live_objects(ObjectKind::ImageView), 0);
    assert_eq!(context.device.deferred_deletion().pending_count()?, 0);
    Ok(())
}

#[test]
pub fn deferred_context_merges_into_immediate() -> Result<()> {
    let context = framework::make_context()?;
    let mut immediate = context.immediate()?;
    let mut deferred = context.deferred()?;
    let shared = context.color_target(64, 64);
    immediate.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[shared])?;

    deferred.begin_deferred(&immediate);
    assert_eq!(deferred.layouts().layout(shared.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    let target = context.color_target(64, 64);
    deferred.set_render_targets(&RenderTargetsInfo {
        color: vec![RenderTargetView::new(target, LoadAction::Clear, StoreAction::Store)],
        ..Default::default()
    })?;
    deferred.draw(3, 1, 0, 0)?;
    deferred.finish_into(&mut immediate)?;

    assert_eq!(context.driver.submissions().len(), 1);
    assert_eq!(immediate.layouts().layout(target.image), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(immediate.layouts().render_pass_count()?, 1);
    assert_eq!(immediate.layouts().framebuffer_count()?, 1);
    Ok(())
}

#[test]
pub fn clears_leave_textures_as_transfer_destination() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(16, 16);
    let depth = context.depth_target(16, 16);
    ctx.clear_color_texture(&color, [1.0, 0.0, 0.0, 1.0])?;
    ctx.clear_depth_stencil_texture(&depth, 1.0, 0)?;
    assert_eq!(ctx.layouts().layout(color.image), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    let clears = context
        .recorded(&ctx)?
        .iter()
        .filter(|command| {
            matches!(
                command,
                RecordedCommand::ClearColorImage { layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL, .. }
                    | RecordedCommand::ClearDepthStencilImage { layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL, .. }
            )
        })
        .count();
    assert_eq!(clears, 2);
    Ok(())
}

#[test]
pub fn heavy_weight_barrier_after_render_pass() -> Result<()> {
    let context = framework::make_context_with_settings(|settings| settings.heavy_weight_barriers(HEAVY_WEIGHT_BARRIER_AFTER_RENDER_PASS))?;
    let mut ctx = context.immediate()?;
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;
    ctx.end_render_pass()?;
    let commands = context.recorded(&ctx)?;
    let end = commands
        .iter()
        .position(|command| matches!(command, RecordedCommand::EndRenderPass))
        .unwrap();
    match &commands[end + 1] {
        RecordedCommand::PipelineBarrier {
            src_stage,
            dst_stage,
            memory,
            ..
        } => {
            assert_eq!(*src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
            assert_eq!(*dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
            assert_eq!(memory.len(), 1);
        }
        other => panic!("Expected a full barrier after the render pass, got {other:?}"),
    }
    Ok(())
}

#[cfg(feature = "debug-markers")]
#[test]
pub fn render_passes_are_labeled() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    ctx.push_event("frame")?;
    ctx.begin_render_pass(&main_pass(context.color_target(64, 64)), "main")?;
    ctx.end_render_pass()?;
    ctx.pop_event()?;
    let labels: Vec<_> = context
        .recorded(&ctx)?
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::BeginDebugLabel(name) => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(labels, vec!["frame".to_owned(), "main".to_owned()]);
    Ok(())
}

#[test]
#[should_panic(expected = "Draws must be recorded inside a render pass")]
pub fn draw_outside_render_pass_panics() {
    let context = framework::make_context().unwrap();
    let mut ctx = context.immediate().unwrap();
    ctx.draw(3, 1, 0, 0).unwrap();
}

#[test]
#[should_panic(expected = "Only the immediate context has frame boundaries")]
pub fn deferred_context_has_no_frames() {
    let context = framework::make_context().unwrap();
    let mut ctx = context.deferred().unwrap();
    ctx.begin_frame().unwrap();
}
