#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use deimos::prelude::*;

/// A headless device and queue, backed by a [`RecordingDriver`].
#[derive(Clone, Debug)]
pub struct Context {
    pub driver: Arc<RecordingDriver>,
    pub device: Device,
    pub queue: Arc<Queue>,
}

impl Context {
    /// Create the immediate context of the graphics queue.
    pub fn immediate(&self) -> Result<CommandListContext> {
        CommandListContext::new_immediate(self.device.clone(), self.queue.clone())
    }

    pub fn deferred(&self) -> Result<CommandListContext> {
        CommandListContext::new_deferred(self.device.clone(), self.queue.clone())
    }

    /// Create a context on a second queue family, as used for async compute.
    pub fn compute(&self) -> Result<CommandListContext> {
        let queue = Arc::new(Queue::new(self.device.clone(), 1, 0)?);
        CommandListContext::new_immediate(self.device.clone(), queue)
    }

    pub fn color_target(&self, width: u32, height: u32) -> Texture {
        Texture::color_2d(self.driver.create_image(), vk::Format::R8G8B8A8_UNORM, width, height)
    }

    pub fn depth_target(&self, width: u32, height: u32) -> Texture {
        Texture::depth_stencil_2d(self.driver.create_image(), vk::Format::D24_UNORM_S8_UINT, width, height)
    }

    /// Commands recorded so far into the active command buffer of `ctx`.
    pub fn recorded(&self, ctx: &CommandListContext) -> Result<Vec<RecordedCommand>> {
        // SAFETY: Only used to look up recorded commands.
        let handle = unsafe { ctx.active_cmd_buffer()?.handle() };
        Ok(self.driver.commands_for(handle))
    }
}

/// Creates a headless deimos context ready for automated tests
pub fn make_context() -> Result<Context> {
    make_context_with_settings(|settings| settings)
}

pub fn make_context_with_settings<F: FnOnce(ContextSettingsBuilder) -> ContextSettingsBuilder>(callback: F) -> Result<Context> {
    let _ = pretty_env_logger::try_init();
    let settings = callback(ContextSettingsBuilder::new().num_buffered_frames(2)).build();
    let driver = Arc::new(RecordingDriver::new());
    let info = DeviceInfo {
        compute_family: Some(1),
        ..Default::default()
    };
    let device = Device::new(driver.clone(), info, settings)?;
    let queue = Arc::new(Queue::new(device.clone(), info.graphics_family, 0)?);
    Ok(Context {
        driver,
        device,
        queue,
    })
}
