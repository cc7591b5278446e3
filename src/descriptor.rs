//! Descriptor pool management.
//!
//! Every command buffer that allocates descriptor sets gets its own [`DescriptorPoolSet`]. The set is acquired the
//! first time the command buffer needs it and released once the command buffer's fence signals, at which point every
//! descriptor set allocated from it is no longer referenced by the GPU and the pools can be reset wholesale.
//! Released sets are cached by the [`DescriptorPoolsManager`] and destroyed if they stay unused for too long.

use std::sync::Mutex;

use anyhow::Result;
use ash::vk;

use crate::{Driver, Error};

/// A growable group of descriptor pools owned by one command buffer at a time.
#[derive(Debug)]
pub struct DescriptorPoolSet {
    pools: Vec<vk::DescriptorPool>,
    max_sets: u32,
    /// Index of the pool new sets are allocated from.
    current: usize,
    used_in_current: u32,
    allocated: u32,
    last_used_frame: u64,
}

impl DescriptorPoolSet {
    fn new(max_sets: u32) -> Self {
        Self {
            pools: Vec::new(),
            max_sets,
            current: 0,
            used_in_current: 0,
            allocated: 0,
            last_used_frame: 0,
        }
    }

    /// Reserve room for one descriptor set and return the pool to allocate it from. Pools are created lazily,
    /// a new one is added when all existing pools are exhausted.
    pub fn allocate(&mut self, driver: &dyn Driver) -> Result<vk::DescriptorPool> {
        if !self.pools.is_empty() && self.used_in_current >= self.max_sets {
            self.current += 1;
            self.used_in_current = 0;
        }
        if self.current == self.pools.len() {
            let pool = driver.create_descriptor_pool(self.max_sets)?;
            #[cfg(feature = "log-objects")]
            trace!("Created new VkDescriptorPool {pool:p}");
            self.pools.push(pool);
        }
        self.used_in_current += 1;
        self.allocated += 1;
        Ok(self.pools[self.current])
    }

    pub fn pools(&self) -> &[vk::DescriptorPool] {
        &self.pools
    }

    /// Number of sets allocated since this set was last reset.
    pub fn allocated_sets(&self) -> u32 {
        self.allocated
    }

    fn reset(&mut self, driver: &dyn Driver) -> Result<()> {
        for pool in &self.pools {
            driver.reset_descriptor_pool(*pool).map_err(Error::from)?;
        }
        self.current = 0;
        self.used_in_current = 0;
        self.allocated = 0;
        Ok(())
    }

    fn destroy(self, driver: &dyn Driver) {
        for pool in self.pools {
            driver.destroy_descriptor_pool(pool);
        }
    }
}

/// Hands out [`DescriptorPoolSet`]s and garbage collects unused ones.
#[derive(Debug)]
pub struct DescriptorPoolsManager {
    max_sets: u32,
    gc_frames: u64,
    free: Mutex<Vec<DescriptorPoolSet>>,
}

impl DescriptorPoolsManager {
    pub fn new(max_sets: u32, gc_frames: u64) -> Self {
        Self {
            max_sets,
            gc_frames,
            free: Mutex::default(),
        }
    }

    /// Get a pool set, reusing a previously released one if possible.
    pub fn acquire_pool_set_container(&self) -> Result<DescriptorPoolSet> {
        let mut free = self.free.lock().map_err(Error::from)?;
        Ok(free
            .pop()
            .unwrap_or_else(|| DescriptorPoolSet::new(self.max_sets)))
    }

    /// Return a pool set. Its pools are reset, so no descriptor set allocated from it may still be in use.
    pub fn release_pool_set(&self, driver: &dyn Driver, mut set: DescriptorPoolSet, frame: u64) -> Result<()> {
        set.reset(driver)?;
        set.last_used_frame = frame;
        let mut free = self.free.lock().map_err(Error::from)?;
        free.push(set);
        Ok(())
    }

    /// Destroy cached pool sets that were last released more than `gc_frames` frames ago. Returns how many were destroyed.
    pub fn gc(&self, driver: &dyn Driver, frame: u64) -> Result<usize> {
        let mut free = self.free.lock().map_err(Error::from)?;
        let (expired, kept): (Vec<_>, Vec<_>) = free
            .drain(..)
            .partition(|set| set.last_used_frame + self.gc_frames < frame);
        *free = kept;
        let count = expired.len();
        for set in expired {
            set.destroy(driver);
        }
        Ok(count)
    }

    /// Number of released pool sets waiting to be reused.
    pub fn cached_count(&self) -> Result<usize> {
        Ok(self.free.lock().map_err(Error::from)?.len())
    }

    pub(crate) fn destroy_all(&self, driver: &dyn Driver) {
        let mut free = self.free.lock().unwrap_or_else(|poison| poison.into_inner());
        for set in free.drain(..) {
            set.destroy(driver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectKind, RecordingDriver};

    #[test]
    fn exhausted_pools_grow_and_are_reused_after_reset() -> Result<()> {
        let driver = RecordingDriver::new();
        let manager = DescriptorPoolsManager::new(2, 30);
        let mut set = manager.acquire_pool_set_container()?;
        for _ in 0..5 {
            set.allocate(&driver)?;
        }
        assert_eq!(set.pools().len(), 3);
        assert_eq!(set.allocated_sets(), 5);

        manager.release_pool_set(&driver, set, 0)?;
        let mut set = manager.acquire_pool_set_container()?;
        assert_eq!(set.allocated_sets(), 0);
        // Reset pools are reused before any new one is created.
        let first = set.allocate(&driver)?;
        assert_eq!(first, set.pools()[0]);
        assert_eq!(driver.live_objects(ObjectKind::DescriptorPool), 3);
        manager.release_pool_set(&driver, set, 0)?;
        manager.destroy_all(&driver);
        assert_eq!(driver.live_objects(ObjectKind::DescriptorPool), 0);
        Ok(())
    }

    #[test]
    fn gc_destroys_old_sets() -> Result<()> {
        let driver = RecordingDriver::new();
        let manager = DescriptorPoolsManager::new(4, 3);
        let mut set = manager.acquire_pool_set_container()?;
        set.allocate(&driver)?;
        manager.release_pool_set(&driver, set, 1)?;
        assert_eq!(manager.gc(&driver, 4)?, 0);
        assert_eq!(manager.gc(&driver, 5)?, 1);
        assert_eq!(driver.live_objects(ObjectKind::DescriptorPool), 0);
        Ok(())
    }
}
