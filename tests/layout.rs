use anyhow::Result;

use deimos::prelude::*;

mod framework;

fn color_targets(texture: Texture, mip: u32, load: LoadAction) -> RenderTargetsInfo {
    let mut view = RenderTargetView::new(texture, load, StoreAction::Store);
    view.mip_index = mip;
    RenderTargetsInfo {
        color: vec![view],
        ..Default::default()
    }
}

fn count_barriers(commands: &[RecordedCommand]) -> usize {
    commands
        .iter()
        .filter(|command| matches!(command, RecordedCommand::PipelineBarrier { .. }))
        .count()
}

#[test]
pub fn untracked_images_are_undefined() -> Result<()> {
    let context = framework::make_context()?;
    let ctx = context.immediate()?;
    let image = context.driver.create_image();
    assert_eq!(ctx.layouts().layout(image), vk::ImageLayout::UNDEFINED);
    assert_eq!(ctx.layouts().find_layout(image), None);
    Ok(())
}

#[test]
pub fn find_or_add_layout_keeps_the_first_layout() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let image = context.driver.create_image();
    let layouts = ctx.layouts_mut();
    assert_eq!(layouts.find_or_add_layout(image, vk::ImageLayout::GENERAL), vk::ImageLayout::GENERAL);
    assert_eq!(layouts.find_or_add_layout(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL), vk::ImageLayout::GENERAL);
    assert_eq!(layouts.find_layout(image), Some(vk::ImageLayout::GENERAL));

    layouts.set_layout(image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(
        layouts.find_or_add_layout(image, vk::ImageLayout::GENERAL),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
    Ok(())
}

#[test]
pub fn layouts_follow_texture_transitions() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    let storage = context
        .color_target(64, 64)
        .with_usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED);
    let depth = context.depth_target(64, 64);

    ctx.transition_textures(TransitionAccess::Writable, TransitionPipeline::GfxToGfx, &[color, storage, depth])?;
    assert_eq!(ctx.layouts().layout(color.image), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(ctx.layouts().layout(storage.image), vk::ImageLayout::GENERAL);
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[color, storage, depth])?;
    assert_eq!(ctx.layouts().layout(color.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(ctx.layouts().layout(storage.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);

    // Already readable, nothing to record.
    let before = count_barriers(&context.recorded(&ctx)?);
    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[color])?;
    assert_eq!(count_barriers(&context.recorded(&ctx)?), before);
    Ok(())
}

#[test]
pub fn reading_a_bound_target_ends_the_render_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    let unrelated = context.color_target(16, 16);
    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[unrelated])?;
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Emulated);

    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[unrelated])?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Emulated, "Unbound textures keep the pass alive.");

    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[color])?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Outside);
    assert_eq!(ctx.layouts().layout(color.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    Ok(())
}

#[test]
pub fn same_targets_keep_the_render_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Load))?;
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Load))?;
    let begins = context
        .recorded(&ctx)?
        .iter()
        .filter(|command| matches!(command, RecordedCommand::BeginRenderPass { .. }))
        .count();
    assert_eq!(begins, 1, "A compatible render pass should not be restarted.");

    // Clearing in a pass that was begun with a load needs a new render pass.
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    let begins = context
        .recorded(&ctx)?
        .iter()
        .filter(|command| matches!(command, RecordedCommand::BeginRenderPass { .. }))
        .count();
    assert_eq!(begins, 2);
    Ok(())
}

#[test]
pub fn clearing_again_restarts_the_render_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    let begins = context
        .recorded(&ctx)?
        .iter()
        .filter(|command| matches!(command, RecordedCommand::BeginRenderPass { .. }))
        .count();
    assert_eq!(begins, 2, "Every requested clear needs its own render pass.");
    Ok(())
}

#[test]
pub fn render_target_barriers_cover_every_mip() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(128, 128).with_mips(4);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    ctx.transition_textures(TransitionAccess::Readable, TransitionPipeline::GfxToGfx, &[color])?;

    let barriers = context
        .recorded(&ctx)?
        .into_iter()
        .filter_map(|command| match command {
            RecordedCommand::PipelineBarrier { images, .. } => Some(images),
            _ => None,
        })
        .flatten()
        .filter(|barrier| barrier.image == color.image)
        .collect::<Vec<_>>();
    assert_eq!(barriers.len(), 2);
    assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(barriers[1].old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    for barrier in &barriers {
        assert_eq!(barrier.range.base_mip, 0);
        assert_eq!(barrier.range.mip_count, 4, "The whole image is tracked with one layout.");
    }
    Ok(())
}

#[test]
pub fn mip_targets_share_one_render_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(128, 128).with_mips(3);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Load))?;
    ctx.set_render_targets(&color_targets(color, 1, LoadAction::Load))?;
    assert_eq!(ctx.layouts().render_pass_count()?, 1);
    assert_eq!(ctx.layouts().framebuffer_count()?, 2);

    let framebuffer = ctx.layouts().current_framebuffer().unwrap().clone();
    assert_eq!(framebuffer.render_area().extent, vk::Extent2D { width: 64, height: 64 });
    let view = context
        .driver
        .image_view_description(framebuffer.views()[0])
        .unwrap();
    assert_eq!(view.range.base_mip, 1);
    assert_eq!(view.range.mip_count, 1);
    Ok(())
}

#[test]
pub fn deleted_render_target_drops_its_framebuffers() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(128, 128).with_mips(2);
    let other = context.color_target(128, 128);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    ctx.set_render_targets(&color_targets(color, 1, LoadAction::Clear))?;
    ctx.set_render_targets(&color_targets(other, 0, LoadAction::Clear))?;
    ctx.set_render_targets(&RenderTargetsInfo::default())?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Outside);
    assert_eq!(ctx.layouts().framebuffer_count()?, 3);
    assert_eq!(ctx.layouts().framebuffer_key_count()?, 2);

    assert_eq!(ctx.layouts_mut().notify_deleted_render_target(color.image)?, 2);
    assert_eq!(ctx.layouts().framebuffer_count()?, 1);
    // The mip 1 key only held framebuffers of the deleted target.
    assert_eq!(ctx.layouts().framebuffer_key_count()?, 1);
    assert_eq!(ctx.layouts().find_layout(color.image), None);
    // Destruction waits for the GPU.
    assert_eq!(context.driver.live_objects(ObjectKind::Framebuffer), 3);
    assert_eq!(context.device.deferred_deletion().pending_count()?, 4);
    Ok(())
}

#[test]
#[should_panic(expected = "deleted while bound")]
pub fn deleting_a_bound_target_panics() {
    let context = framework::make_context().unwrap();
    let mut ctx = context.immediate().unwrap();
    let color = context.color_target(64, 64);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))
        .unwrap();
    ctx.layouts_mut()
        .notify_deleted_render_target(color.image)
        .unwrap();
}

#[test]
pub fn depth_stencil_modes() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let depth = context.depth_target(64, 64);
    ctx.transition_depth_stencil(ExclusiveDepthStencil::DEPTH_WRITE_STENCIL_WRITE, &depth)?;
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    ctx.transition_depth_stencil(ExclusiveDepthStencil::DEPTH_READ_STENCIL_WRITE, &depth)?;
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL);
    ctx.transition_depth_stencil(ExclusiveDepthStencil::DEPTH_READ_STENCIL_READ, &depth)?;
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
    Ok(())
}

#[test]
pub fn depth_transition_ends_an_emulated_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    let depth = context.depth_target(64, 64);
    ctx.set_render_targets(&color_targets(color, 0, LoadAction::Clear))?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Emulated);

    ctx.transition_depth_stencil(ExclusiveDepthStencil::DEPTH_READ_STENCIL_READ, &depth)?;
    assert_eq!(ctx.layouts().state(), RenderPassState::Outside);
    assert_eq!(ctx.layouts().layout(depth.image), vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);

    let commands = context.recorded(&ctx)?;
    let end = commands
        .iter()
        .rposition(|command| matches!(command, RecordedCommand::EndRenderPass))
        .expect("The emulated pass should have ended.");
    let barrier = commands
        .iter()
        .rposition(|command| matches!(command, RecordedCommand::PipelineBarrier { .. }))
        .unwrap();
    assert!(barrier > end, "The depth barrier must be recorded outside the render pass.");
    Ok(())
}

#[test]
pub fn generate_mips_tracks_every_mip() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(64, 64).with_mips(3);
    ctx.transition_textures(TransitionAccess::Writable, TransitionPipeline::GfxToGfx, &[texture])?;

    let pass = |mip: u32| {
        RenderPassInfo::new()
            .color(ColorRenderTarget::new(texture, RenderTargetActions::DONT_LOAD_STORE).with_mip(mip))
            .generating_mips(true)
    };
    ctx.begin_render_pass(&pass(1), "mip 1")?;
    let mips = ctx.layouts().generate_mips_info();
    assert_eq!(mips.layout(texture.image, 0, 0), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    assert_eq!(mips.layout(texture.image, 0, 1), Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
    assert_eq!(mips.layout(texture.image, 0, 2), Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
    ctx.end_render_pass()?;
    assert_eq!(
        ctx.layouts()
            .generate_mips_info()
            .layout(texture.image, 0, 1),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );

    ctx.begin_render_pass(&pass(2), "mip 2")?;
    ctx.end_render_pass()?;
    assert!(!ctx.layouts().generate_mips_info().is_active());
    assert_eq!(ctx.layouts().layout(texture.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    Ok(())
}

#[test]
pub fn setting_render_targets_forgets_interrupted_mip_generation() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context.color_target(64, 64).with_mips(3);
    let other = context.color_target(64, 64);
    ctx.transition_textures(TransitionAccess::Writable, TransitionPipeline::GfxToGfx, &[texture])?;
    let info = RenderPassInfo::new()
        .color(ColorRenderTarget::new(texture, RenderTargetActions::DONT_LOAD_STORE).with_mip(1))
        .generating_mips(true);
    ctx.begin_render_pass(&info, "mip 1")?;
    ctx.end_render_pass()?;
    assert!(ctx.layouts().generate_mips_info().is_active());

    ctx.set_render_targets(&color_targets(other, 0, LoadAction::Clear))?;
    assert!(!ctx.layouts().generate_mips_info().is_active());
    assert_eq!(ctx.layouts().generate_mips_info().layout(texture.image, 0, 1), None);
    Ok(())
}

#[test]
#[should_panic(expected = "mip index above zero")]
pub fn generate_mips_into_mip_zero_panics() {
    let context = framework::make_context().unwrap();
    let mut ctx = context.immediate().unwrap();
    let texture = context.color_target(64, 64).with_mips(2);
    let info = RenderPassInfo::new()
        .color(ColorRenderTarget::new(texture, RenderTargetActions::DONT_LOAD_STORE))
        .generating_mips(true);
    ctx.begin_render_pass(&info, "mip 0").unwrap();
}

#[test]
pub fn resolve_target_is_copied_at_end_of_pass() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let color = context.color_target(64, 64);
    let readback = context.color_target(64, 64).with_cpu_readback(true);
    let info = RenderPassInfo::new().color(ColorRenderTarget::new(color, RenderTargetActions::CLEAR_STORE).with_resolve_target(readback));
    ctx.begin_render_pass(&info, "resolve")?;
    ctx.end_render_pass()?;

    let commands = context.recorded(&ctx)?;
    let copy = commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::CopyImage(copy) => Some(*copy),
            _ => None,
        })
        .expect("A copy into the resolve target should be recorded.");
    assert_eq!(copy.src_image, color.image);
    assert_eq!(copy.dst_image, readback.image);
    assert_eq!(copy.region.extent.width, 64);
    assert_eq!(ctx.layouts().layout(color.image), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(ctx.layouts().layout(readback.image), vk::ImageLayout::GENERAL);
    Ok(())
}

#[test]
pub fn uav_transitions_on_one_queue() -> Result<()> {
    let context = framework::make_context()?;
    let mut ctx = context.immediate()?;
    let texture = context
        .color_target(32, 32)
        .with_usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED);
    let buffer = Buffer::new(context.driver.create_buffer(), 256, vk::BufferUsageFlags::STORAGE_BUFFER);
    let uavs = [UnorderedAccessView::Texture(texture), UnorderedAccessView::StructuredBuffer(buffer)];

    ctx.transition_uavs(TransitionAccess::Writable, TransitionPipeline::GfxToCompute, &uavs, None)?;
    assert_eq!(ctx.layouts().layout(texture.image), vk::ImageLayout::GENERAL);
    ctx.transition_uavs(TransitionAccess::Readable, TransitionPipeline::ComputeToGfx, &uavs, None)?;
    assert_eq!(ctx.layouts().layout(texture.image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let commands = context.recorded(&ctx)?;
    assert_eq!(count_barriers(&commands), 2);
    let RecordedCommand::PipelineBarrier { src_stage, dst_stage, buffers, .. } = &commands[commands.len() - 1] else {
        panic!("Expected a pipeline barrier");
    };
    assert_eq!(*src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    assert_eq!(*dst_stage, vk::PipelineStageFlags::ALL_GRAPHICS);
    assert_eq!(buffers[0].dst_access, vk::AccessFlags::SHADER_READ);

    ctx.transition_uavs(TransitionAccess::RWNoBarrier, TransitionPipeline::ComputeToCompute, &uavs, None)?;
    assert_eq!(count_barriers(&context.recorded(&ctx)?), 2);
    Ok(())
}

#[test]
pub fn uav_ownership_moves_between_queues() -> Result<()> {
    let context = framework::make_context()?;
    let mut gfx = context.immediate()?;
    let mut compute = context.compute()?;
    let buffer = Buffer::new(context.driver.create_buffer(), 256, vk::BufferUsageFlags::STORAGE_BUFFER);
    let uavs = [UnorderedAccessView::StructuredBuffer(buffer)];

    compute.transition_uavs(TransitionAccess::Readable, TransitionPipeline::ComputeToGfx, &uavs, Some(&mut gfx))?;

    let submissions = context.driver.submissions();
    assert_eq!(submissions.len(), 1, "The release half is submitted right away.");
    assert_eq!(submissions[0].signal_semaphores.len(), 1);
    let release = submissions[0].commands[0]
        .iter()
        .find_map(|command| match command {
            RecordedCommand::PipelineBarrier { buffers, .. } => Some(buffers[0]),
            _ => None,
        })
        .unwrap();
    assert_eq!(release.src_queue_family, 1);
    assert_eq!(release.dst_queue_family, 0);

    let cmd = gfx.active_cmd_buffer()?;
    assert_eq!(cmd.wait_semaphores().len(), 1);
    // Only the waiting command buffer holds on to the semaphore.
    assert_eq!(context.device.semaphore_refs(cmd.wait_semaphores()[0])?, 1);
    Ok(())
}
