use std::ops::Deref;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;

use crate::descriptor::{DescriptorPoolSet, DescriptorPoolsManager};
use crate::{ContextSettings, DeferredDeletionQueue, DeferredResource, Driver, Error, Fence, SemaphoreArena, SemaphoreId, SubmissionMarker};

/// Properties of the device that deimos needs to know about. Bootstrapping the device is up to the application.
#[derive(Debug, Copy, Clone)]
pub struct DeviceInfo {
    /// Queue family used for graphics work.
    pub graphics_family: u32,
    /// Queue family of a dedicated async compute queue, if the application uses one.
    pub compute_family: Option<u32>,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    pub timestamp_valid_bits: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            graphics_family: 0,
            compute_family: None,
            timestamp_period: 1.0,
            timestamp_valid_bits: 64,
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct DeviceInner {
    #[derivative(Debug = "ignore")]
    driver: Arc<dyn Driver>,
    info: DeviceInfo,
    settings: ContextSettings,
    free_fences: Mutex<Vec<vk::Fence>>,
    semaphores: Mutex<SemaphoreArena>,
    deferred_deletion: DeferredDeletionQueue,
    descriptor_pools: DescriptorPoolsManager,
    last_submission: Mutex<Option<SubmissionMarker>>,
}

/// The device owns everything that is shared between contexts: the driver, fence and semaphore pools,
/// the deferred deletion queue and the descriptor pool manager.
/// Internal state is wrapped in an `Arc<DeviceInner>`, so this is safe to clone.
///
/// The device dereferences to the [`Driver`], so native calls can be made directly on it.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a new device on top of a driver.
    pub fn new(driver: Arc<dyn Driver>, info: DeviceInfo, settings: ContextSettings) -> Result<Self> {
        info!(
            "Creating device (graphics family {}, compute family {:?}, {} buffered frames)",
            info.graphics_family, info.compute_family, settings.num_buffered_frames
        );
        Ok(Device {
            inner: Arc::new(DeviceInner {
                driver,
                info,
                deferred_deletion: DeferredDeletionQueue::new(settings.num_buffered_frames),
                descriptor_pools: DescriptorPoolsManager::new(settings.descriptor_pool_max_sets, settings.descriptor_pool_gc_frames),
                settings,
                free_fences: Mutex::default(),
                semaphores: Mutex::default(),
                last_submission: Mutex::default(),
            }),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.inner.settings
    }

    /// Get the driver as a trait object.
    pub fn driver(&self) -> &dyn Driver {
        self.inner.driver.as_ref()
    }

    /// Wait for the device to be completely idle.
    /// This should not be used as a synchronization measure, except on exit.
    pub fn wait_idle(&self) -> Result<()> {
        Ok(self.inner.driver.device_wait_idle().map_err(Error::from)?)
    }

    /// Get an unsignaled fence from the fence pool, creating one if the pool is empty.
    pub fn allocate_fence(&self) -> Result<Fence> {
        let pooled = self
            .inner
            .free_fences
            .lock()
            .map_err(Error::from)?
            .pop();
        let handle = match pooled {
            Some(handle) => handle,
            None => {
                let handle = self.inner.driver.create_fence(false)?;
                #[cfg(feature = "log-objects")]
                trace!("Created new VkFence {handle:p}");
                handle
            }
        };
        Ok(Fence::from_pool(self.clone(), handle))
    }

    /// Called by [`Fence`] on drop.
    pub(crate) fn release_fence(&self, handle: vk::Fence) {
        // A fence that can't be reset can't be reused either.
        if let Err(err) = self.inner.driver.reset_fence(handle) {
            error!("Failed to reset fence {handle:p}: {err}");
            self.inner.driver.destroy_fence(handle);
            return;
        }
        match self.inner.free_fences.lock() {
            Ok(mut free) => free.push(handle),
            Err(_) => self.inner.driver.destroy_fence(handle),
        }
    }

    /// Create a semaphore with a single reference.
    pub fn create_semaphore(&self) -> Result<SemaphoreId> {
        let mut arena = self.inner.semaphores.lock().map_err(Error::from)?;
        arena.create(self.inner.driver.as_ref())
    }

    pub fn add_semaphore_ref(&self, id: SemaphoreId) -> Result<()> {
        let mut arena = self.inner.semaphores.lock().map_err(Error::from)?;
        arena.add_ref(id);
        Ok(())
    }

    /// Drop a reference. Once the last reference is gone, the semaphore is queued for deferred deletion.
    pub fn release_semaphore(&self, id: SemaphoreId) -> Result<()> {
        let released = {
            let mut arena = self.inner.semaphores.lock().map_err(Error::from)?;
            arena.release(id)
        };
        if let Some(handle) = released {
            self.deferred_delete(DeferredResource::Semaphore(handle))?;
        }
        Ok(())
    }

    pub fn semaphore_handle(&self, id: SemaphoreId) -> Result<vk::Semaphore> {
        let arena = self.inner.semaphores.lock().map_err(Error::from)?;
        Ok(arena.handle(id))
    }

    pub fn semaphore_refs(&self, id: SemaphoreId) -> Result<u32> {
        let arena = self.inner.semaphores.lock().map_err(Error::from)?;
        Ok(arena.refs(id))
    }

    pub fn deferred_deletion(&self) -> &DeferredDeletionQueue {
        &self.inner.deferred_deletion
    }

    /// Queue a native object for destruction once no in-flight submission can reference it.
    pub fn deferred_delete(&self, resource: DeferredResource) -> Result<()> {
        let submission = self.last_submission()?;
        self.inner.deferred_deletion.enqueue(resource, submission)
    }

    pub fn descriptor_pools(&self) -> &DescriptorPoolsManager {
        &self.inner.descriptor_pools
    }

    /// Return a descriptor pool set to the manager, stamped with the current frame.
    pub(crate) fn release_descriptor_pool_set(&self, set: DescriptorPoolSet) -> Result<()> {
        let frame = self.inner.deferred_deletion.frame_number();
        self.inner
            .descriptor_pools
            .release_pool_set(self.inner.driver.as_ref(), set, frame)
    }

    /// The most recent submission made on any queue of this device.
    pub fn last_submission(&self) -> Result<Option<SubmissionMarker>> {
        Ok(self
            .inner
            .last_submission
            .lock()
            .map_err(Error::from)?
            .clone())
    }

    pub(crate) fn set_last_submission(&self, marker: SubmissionMarker) -> Result<()> {
        *self
            .inner
            .last_submission
            .lock()
            .map_err(Error::from)? = Some(marker);
        Ok(())
    }
}

impl Deref for Device {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        self.inner.driver.as_ref()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let driver = self.driver.as_ref();
        if let Err(err) = self.deferred_deletion.release_resources(driver, true) {
            error!("Failed to flush deferred deletion queue: {err}");
        }
        self.descriptor_pools.destroy_all(driver);
        match self.semaphores.get_mut() {
            Ok(arena) => arena.destroy_all(driver),
            Err(_) => error!("Semaphore arena poisoned, leaking semaphores"),
        }
        match self.free_fences.get_mut() {
            Ok(fences) => {
                for fence in fences.drain(..) {
                    driver.destroy_fence(fence);
                }
            }
            Err(_) => error!("Fence pool poisoned, leaking fences"),
        }
    }
}
