//! The sync module provides the primitives used to order work between the CPU and GPU, and between submissions.
//!
//! - The [`fence`] module provides a wrapper around `VkFence` objects, used for CPU-GPU sync. Fences are recycled through
//! a pool owned by the [`Device`](crate::Device). It also provides [`SignalCounter`](fence::SignalCounter), which counts
//! how many times a command buffer's fence was observed signaled.
//! - The [`semaphore`] module provides an arena of reference counted `VkSemaphore` objects, used for GPU-GPU sync.

pub mod fence;
pub mod semaphore;
