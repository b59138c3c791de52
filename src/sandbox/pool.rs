use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Slots {
    free: Mutex<Vec<u32>>,
    available: Condvar,
}

/// Bounded set of numbered execution slots
///
/// Every live sandbox owns one slot exclusively; the slot id doubles as the
/// isolate box id. Slots go back to the pool when their guard is dropped.
#[derive(Clone)]
pub struct SlotPool {
    slots: Arc<Slots>,
    size: u32,
}

impl SlotPool {
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Slots {
                free: Mutex::new((0..size).rev().collect()),
                available: Condvar::new(),
            }),
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Blocks until a slot is free
    pub fn acquire(&self) -> SlotGuard {
        let mut free = self.slots.free.lock();
        loop {
            if let Some(id) = free.pop() {
                return SlotGuard {
                    id,
                    slots: Arc::clone(&self.slots),
                };
            }
            self.slots.available.wait(&mut free);
        }
    }

    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let id = self.slots.free.lock().pop()?;
        Some(SlotGuard {
            id,
            slots: Arc::clone(&self.slots),
        })
    }
}

pub struct SlotGuard {
    id: u32,
    slots: Arc<Slots>,
}

impl SlotGuard {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("id", &self.id).finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.free.lock().push(self.id);
        self.slots.available.notify_one();
    }
}
