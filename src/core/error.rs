//! Exposes the deimos error type

use std::sync::PoisonError;
use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// Error type that deimos can return.
///
/// Note that misuse of the command buffer or render pass state machines is never reported through this type.
/// Those are bugs in the calling renderer and panic instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic Vulkan error type.
    #[error("Vulkan error: `{0}`")]
    VkError(vk::Result),
    /// The device was lost. There is no way to recover from this, applications should shut down.
    #[error("Device lost")]
    DeviceLost,
    /// A fence did not signal within the allowed time. This almost always means the GPU hung.
    #[error("Fence not signaled after {timeout:?}, the GPU is likely hung.")]
    FenceTimeout {
        /// How long we waited.
        timeout: Duration,
    },
    /// A draw or dispatch needs a pipeline, but no pipeline cache was set on the context.
    #[error("No pipeline cache set")]
    NoPipelineCache,
    /// Poisoned mutex
    #[error("Poisoned mutex")]
    PoisonError,
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl Error {
    /// Whether this error means the device can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeviceLost | Error::FenceTimeout { .. })
    }
}

impl From<vk::Result> for Error {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            other => Error::VkError(other),
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}
