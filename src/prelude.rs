pub use ash::vk;

pub use crate::core::device::{Device, DeviceInfo};
pub use crate::core::error::Error;
pub use crate::core::queue::{Queue, SubmissionMarker};
pub use crate::core::settings::*;

pub use crate::driver::*;

pub use crate::sync::fence::*;
pub use crate::sync::semaphore::*;

pub use crate::command_buffer::manager::{CmdBufferGuard, CommandBufferManager};
pub use crate::command_buffer::pool::CommandBufferPool;
pub use crate::command_buffer::{CmdBuffer, CmdBufferId, CmdBufferState};

pub use crate::render_pass::layout::RenderTargetLayout;
pub use crate::render_pass::targets::*;
pub use crate::render_pass::{Framebuffer, RenderPass};

pub use crate::transition::barrier::{ImageLayoutBarrier, PendingBarrier};
pub use crate::transition::pending::{GatheredBarriers, PendingTransition, TransitionAccess, TransitionPipeline};
pub use crate::transition::{GenerateMipsInfo, RenderPassState, TransitionAndLayoutManager};

pub use crate::context::pending_state::{PendingComputeState, PendingGfxState, ShaderStage};
pub use crate::context::CommandListContext;

pub use crate::deferred_delete::{DeferredDeletionQueue, DeferredResource};
pub use crate::descriptor::{DescriptorPoolSet, DescriptorPoolsManager};
pub use crate::pipeline::PipelineStateCache;
