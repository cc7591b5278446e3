//! Reference counted semaphores.
//!
//! A semaphore handed to [`CmdBuffer::add_wait_semaphore`](crate::CmdBuffer::add_wait_semaphore) gains a reference that
//! is dropped once the command buffer's fence signals. Semaphores live in an arena and are referred to by a small
//! [`SemaphoreId`]. When the last reference is released the native semaphore is queued for deletion and the slot is
//! recycled with a new generation, so stale ids are detected.

use anyhow::Result;
use ash::vk;

use crate::Driver;

/// Handle to a semaphore in a [`SemaphoreArena`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SemaphoreId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    handle: vk::Semaphore,
    generation: u32,
    refs: u32,
}

/// Arena of reference counted semaphores.
#[derive(Debug, Default)]
pub struct SemaphoreArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SemaphoreArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: SemaphoreId) -> &Slot {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "Use of stale semaphore id {id:?}");
        assert!(slot.refs > 0, "Use of released semaphore {id:?}");
        slot
    }

    fn slot_mut(&mut self, id: SemaphoreId) -> &mut Slot {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "Use of stale semaphore id {id:?}");
        assert!(slot.refs > 0, "Use of released semaphore {id:?}");
        slot
    }

    /// Create a new semaphore with a reference count of one.
    pub fn create(&mut self, driver: &dyn Driver) -> Result<SemaphoreId> {
        let handle = driver.create_semaphore()?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkSemaphore {handle:p}");
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.handle = handle;
                slot.refs = 1;
                Ok(SemaphoreId {
                    index,
                    generation: slot.generation,
                })
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    handle,
                    generation: 0,
                    refs: 1,
                });
                Ok(SemaphoreId {
                    index,
                    generation: 0,
                })
            }
        }
    }

    pub fn add_ref(&mut self, id: SemaphoreId) {
        self.slot_mut(id).refs += 1;
    }

    /// Drop one reference. Returns the native handle if this was the last one, the caller is responsible for
    /// destroying it once the GPU is done with it.
    pub fn release(&mut self, id: SemaphoreId) -> Option<vk::Semaphore> {
        let slot = self.slot_mut(id);
        slot.refs -= 1;
        if slot.refs > 0 {
            return None;
        }
        let handle = std::mem::replace(&mut slot.handle, vk::Semaphore::null());
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(handle)
    }

    pub fn handle(&self, id: SemaphoreId) -> vk::Semaphore {
        self.slot(id).handle
    }

    pub fn refs(&self, id: SemaphoreId) -> u32 {
        self.slot(id).refs
    }

    /// Number of semaphores with at least one reference.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Destroy every semaphore still alive. Only valid once the device is idle.
    pub(crate) fn destroy_all(&mut self, driver: &dyn Driver) {
        for slot in self.slots.iter_mut().filter(|slot| slot.refs > 0) {
            warn!("Destroying semaphore {:p} with {} outstanding references", slot.handle, slot.refs);
            driver.destroy_semaphore(slot.handle);
            slot.refs = 0;
        }
        self.slots.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordingDriver;

    #[test]
    fn released_slots_are_recycled_with_new_generation() -> Result<()> {
        let driver = RecordingDriver::new();
        let mut arena = SemaphoreArena::new();
        let first = arena.create(&driver)?;
        arena.add_ref(first);
        assert_eq!(arena.refs(first), 2);
        assert!(arena.release(first).is_none());
        let handle = arena.release(first);
        assert!(handle.is_some());
        assert_eq!(arena.live_count(), 0);
        driver.destroy_semaphore(handle.unwrap());

        let second = arena.create(&driver)?;
        assert_ne!(first, second);
        assert_eq!(arena.live_count(), 1);
        arena.destroy_all(&driver);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "stale semaphore")]
    fn stale_ids_panic() {
        let driver = RecordingDriver::new();
        let mut arena = SemaphoreArena::new();
        let id = arena.create(&driver).unwrap();
        let _ = arena.release(id);
        let _ = arena.create(&driver).unwrap();
        arena.add_ref(id);
    }
}
