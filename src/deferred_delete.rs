//! Delayed destruction of native objects.
//!
//! Objects such as render passes or framebuffers may still be referenced by command buffers that are executing when
//! the owner lets go of them. Instead of destroying them immediately, they are pushed onto a [`DeferredDeletionQueue`]
//! together with the current frame number and the last submission made on the device. An entry is only destroyed once
//! enough frames have passed *and* that submission has retired.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use ash::vk;

use crate::{Driver, Error, SubmissionMarker};

/// A native object waiting to be destroyed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeferredResource {
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    ImageView(vk::ImageView),
    Semaphore(vk::Semaphore),
    QueryPool(vk::QueryPool),
    DescriptorPool(vk::DescriptorPool),
}

impl DeferredResource {
    fn destroy(self, driver: &dyn Driver) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying deferred {self:?}");
        match self {
            DeferredResource::RenderPass(handle) => driver.destroy_render_pass(handle),
            DeferredResource::Framebuffer(handle) => driver.destroy_framebuffer(handle),
            DeferredResource::ImageView(handle) => driver.destroy_image_view(handle),
            DeferredResource::Semaphore(handle) => driver.destroy_semaphore(handle),
            DeferredResource::QueryPool(handle) => driver.destroy_query_pool(handle),
            DeferredResource::DescriptorPool(handle) => driver.destroy_descriptor_pool(handle),
        }
    }
}

#[derive(Debug)]
struct Entry {
    resource: DeferredResource,
    frame: u64,
    submission: Option<SubmissionMarker>,
}

/// Queue of native objects to destroy once the GPU can no longer reference them.
#[derive(Debug)]
pub struct DeferredDeletionQueue {
    frame: AtomicU64,
    num_buffered_frames: u64,
    entries: Mutex<Vec<Entry>>,
}

impl DeferredDeletionQueue {
    /// Entries must survive `num_buffered_frames` frame boundaries before they can be destroyed.
    pub fn new(num_buffered_frames: u64) -> Self {
        Self {
            frame: AtomicU64::new(0),
            num_buffered_frames,
            entries: Mutex::default(),
        }
    }

    /// Queue a resource for destruction. `submission` is the most recent submission that may reference it.
    pub fn enqueue(&self, resource: DeferredResource, submission: Option<SubmissionMarker>) -> Result<()> {
        let mut entries = self.entries.lock().map_err(Error::from)?;
        entries.push(Entry {
            resource,
            frame: self.frame_number(),
            submission,
        });
        Ok(())
    }

    /// Called once per frame. Returns the new frame number.
    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn frame_number(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Destroy every entry that is safe to destroy, or all of them if `immediately` is set. Returns the number of
    /// destroyed objects.
    pub fn release_resources(&self, driver: &dyn Driver, immediately: bool) -> Result<usize> {
        let frame = self.frame_number();
        let mut entries = self.entries.lock().map_err(Error::from)?;
        let before = entries.len();
        entries.retain(|entry| {
            let retired = entry
                .submission
                .as_ref()
                .map_or(true, |submission| submission.is_retired());
            let release = immediately || (frame > entry.frame + self.num_buffered_frames && retired);
            if release {
                entry.resource.destroy(driver);
            }
            !release
        });
        Ok(before - entries.len())
    }

    /// Number of entries still waiting.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.entries.lock().map_err(Error::from)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectKind, RecordingDriver, RenderPassDescription, SignalCounter};

    #[test]
    fn entries_wait_for_frames_and_submission() -> Result<()> {
        let driver = RecordingDriver::new();
        let queue = DeferredDeletionQueue::new(2);
        let counter = SignalCounter::new();
        let render_pass = driver.create_render_pass(&RenderPassDescription::default())?;
        queue.enqueue(DeferredResource::RenderPass(render_pass), Some(SubmissionMarker::new(counter.clone())))?;

        for _ in 0..3 {
            queue.advance_frame();
            assert_eq!(queue.release_resources(&driver, false)?, 0);
        }
        // Enough frames have passed, but the submission is still in flight.
        assert_eq!(queue.pending_count()?, 1);
        counter.increment();
        assert_eq!(queue.release_resources(&driver, false)?, 1);
        assert_eq!(driver.live_objects(ObjectKind::RenderPass), 0);
        Ok(())
    }

    #[test]
    fn immediate_release_ignores_frames() -> Result<()> {
        let driver = RecordingDriver::new();
        let queue = DeferredDeletionQueue::new(2);
        let render_pass = driver.create_render_pass(&RenderPassDescription::default())?;
        queue.enqueue(DeferredResource::RenderPass(render_pass), None)?;
        assert_eq!(queue.release_resources(&driver, false)?, 0);
        assert_eq!(queue.release_resources(&driver, true)?, 1);
        Ok(())
    }
}
