//! Tunables for the command buffer manager, the layout tracker and the command list context.

use std::time::Duration;

/// Bit in [`ContextSettings::heavy_weight_barriers`] that inserts a full memory barrier after every render pass.
pub const HEAVY_WEIGHT_BARRIER_AFTER_RENDER_PASS: u32 = 1;

/// Settings shared by everything created from one [`Device`](crate::Device).
/// Use [`ContextSettingsBuilder`] to construct these.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Submit the active command buffer every time a render pass ends. Very slow, useful to narrow down GPU crashes.
    pub submit_after_every_end_render_pass: bool,
    /// Minimum time between two scans for idle command buffers.
    pub free_unused_interval: Duration,
    /// A command buffer that has been ready for begin for longer than this gets its memory freed.
    pub unused_cmd_buffer_threshold: Duration,
    /// Default timeout used when waiting on command buffer fences.
    pub fence_wait_timeout: Duration,
    /// Number of frames an object queued for deletion must survive before it is destroyed.
    pub num_buffered_frames: u64,
    /// Write timestamps at the start and end of every command buffer.
    pub profile_cmd_buffers: bool,
    /// Use separate read-only layouts for the depth and stencil aspects.
    pub mixed_depth_stencil_layouts: bool,
    /// Bit mask of debug barriers to insert. See [`HEAVY_WEIGHT_BARRIER_AFTER_RENDER_PASS`].
    pub heavy_weight_barriers: u32,
    /// Wait on the fence after every submission.
    pub wait_idle_on_submit: bool,
    /// Maximum number of descriptor sets allocated from a single descriptor pool.
    pub descriptor_pool_max_sets: u32,
    /// Frames a released descriptor pool set stays cached before it is destroyed.
    pub descriptor_pool_gc_frames: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            submit_after_every_end_render_pass: false,
            free_unused_interval: Duration::from_secs(1),
            unused_cmd_buffer_threshold: Duration::from_secs(10),
            fence_wait_timeout: Duration::from_secs(60),
            num_buffered_frames: 2,
            profile_cmd_buffers: false,
            mixed_depth_stencil_layouts: true,
            heavy_weight_barriers: 0,
            wait_idle_on_submit: false,
            descriptor_pool_max_sets: 256,
            descriptor_pool_gc_frames: 30,
        }
    }
}

impl ContextSettings {
    pub fn heavy_weight_barrier_after_render_pass(&self) -> bool {
        self.heavy_weight_barriers & HEAVY_WEIGHT_BARRIER_AFTER_RENDER_PASS != 0
    }
}

/// Context settings builder.
/// # Example
/// ```
/// use std::time::Duration;
/// use deimos::prelude::*;
///
/// let settings = ContextSettingsBuilder::new()
///     .fence_wait_timeout(Duration::from_secs(5))
///     .profile_cmd_buffers(true)
///     .build();
/// assert_eq!(settings.num_buffered_frames, 2);
/// ```
#[derive(Debug, Default)]
pub struct ContextSettingsBuilder {
    inner: ContextSettings,
}

impl ContextSettingsBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_after_every_end_render_pass(mut self, enabled: bool) -> Self {
        self.inner.submit_after_every_end_render_pass = enabled;
        self
    }

    pub fn free_unused_interval(mut self, interval: Duration) -> Self {
        self.inner.free_unused_interval = interval;
        self
    }

    pub fn unused_cmd_buffer_threshold(mut self, threshold: Duration) -> Self {
        self.inner.unused_cmd_buffer_threshold = threshold;
        self
    }

    pub fn fence_wait_timeout(mut self, timeout: Duration) -> Self {
        self.inner.fence_wait_timeout = timeout;
        self
    }

    /// Number of frames that may be in flight at once. Must be at least one.
    pub fn num_buffered_frames(mut self, frames: u64) -> Self {
        self.inner.num_buffered_frames = frames.max(1);
        self
    }

    pub fn profile_cmd_buffers(mut self, enabled: bool) -> Self {
        self.inner.profile_cmd_buffers = enabled;
        self
    }

    /// Only enable this if the device supports `VK_KHR_maintenance2` or Vulkan 1.1.
    pub fn mixed_depth_stencil_layouts(mut self, enabled: bool) -> Self {
        self.inner.mixed_depth_stencil_layouts = enabled;
        self
    }

    pub fn heavy_weight_barriers(mut self, mask: u32) -> Self {
        self.inner.heavy_weight_barriers = mask;
        self
    }

    pub fn wait_idle_on_submit(mut self, enabled: bool) -> Self {
        self.inner.wait_idle_on_submit = enabled;
        self
    }

    pub fn descriptor_pool_max_sets(mut self, max_sets: u32) -> Self {
        self.inner.descriptor_pool_max_sets = max_sets.max(1);
        self
    }

    pub fn descriptor_pool_gc_frames(mut self, frames: u64) -> Self {
        self.inner.descriptor_pool_gc_frames = frames;
        self
    }

    /// Build the settings.
    pub fn build(self) -> ContextSettings {
        self.inner
    }
}
