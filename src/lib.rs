//! Vulkan command buffer lifecycle, image layout tracking and render pass caching.
//!
//! Deimos manages the part of a Vulkan renderer where ordering mistakes hurt the most: command buffers moving
//! through their state machine, fences deciding when a buffer may be recycled, images moving between layouts,
//! and render passes and framebuffers being created on demand and cached.
//!
//! To get started, the easiest way is to simply
//! ```
//! // Import all types at once.
//! use deimos::prelude::*;
//! // Or under a namespace.
//! use deimos::prelude as dm;
//! ```
//!
//! # Example
//!
//! All native calls go through the [`Driver`](crate::Driver) trait. [`AshDriver`](crate::AshDriver) talks to a real
//! device, [`RecordingDriver`](crate::RecordingDriver) is a headless implementation that records every command, which is
//! what we use here.
//! ```
//! use std::sync::Arc;
//! use deimos::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let driver = Arc::new(RecordingDriver::new());
//! let settings = ContextSettingsBuilder::new()
//!     .num_buffered_frames(2)
//!     .build();
//! let device = Device::new(driver.clone(), DeviceInfo::default(), settings)?;
//! let queue = Arc::new(Queue::new(device.clone(), 0, 0)?);
//! let mut ctx = CommandListContext::new_immediate(device.clone(), queue)?;
//!
//! let color = Texture::color_2d(driver.create_image(), vk::Format::R8G8B8A8_UNORM, 128, 128);
//! let info = RenderPassInfo::new().color(ColorRenderTarget::new(color, RenderTargetActions::CLEAR_STORE));
//! ctx.begin_frame()?;
//! ctx.begin_render_pass(&info, "main")?;
//! ctx.draw(3, 1, 0, 0)?;
//! ctx.end_render_pass()?;
//! ctx.submit_commands_hint()?;
//! ctx.end_frame()?;
//! # Ok(())
//! # }
//! ```
//! For further details, check out the following modules
//! - [`command_buffer`] for the command buffer state machine, its pool and the manager handing out buffers.
//! - [`transition`] for the image layout tracker and the render pass/framebuffer cache.
//! - [`context`] for the command list context tying everything together.
//! - [`driver`] for the native API seam.
//! - [`sync`] for fences and semaphores.

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod command_buffer;
pub mod context;
pub mod core;
pub mod deferred_delete;
pub mod descriptor;
pub mod driver;
pub mod pipeline;
pub mod render_pass;
pub mod sync;
pub mod transition;

static_assertions::assert_impl_all!(Device: Send, Sync, Clone);
static_assertions::assert_impl_all!(Queue: Send, Sync);
static_assertions::assert_impl_all!(CommandBufferManager: Send);
static_assertions::assert_impl_all!(TransitionAndLayoutManager: Send);
