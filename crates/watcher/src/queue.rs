//! Growable circular queue bridging the notification thread and the poller
//!
//! The notification thread pushes decoded records; the polling consumer pops
//! them. Capacity grows geometrically when full and never shrinks, so a burst
//! of a given size only pays for allocation the first time it is seen.

use crate::record::{ChangeRecord, FileAction};
use parking_lot::Mutex;

/// Default number of slots allocated up front
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Default capacity multiplier applied when the queue is full
pub const DEFAULT_GROW_RATE: usize = 2;

/// Thread-safe FIFO of [`ChangeRecord`]s
pub struct EventQueue {
    ring: Mutex<Ring>,
    grow_rate: usize,
}

/// Ring storage, only touched with the lock held
struct Ring {
    slots: Vec<Option<ChangeRecord>>,
    count: usize,
    front: usize,
}

impl EventQueue {
    /// Create a queue with the given initial capacity and growth multiplier.
    ///
    /// Both values are clamped to their minimum useful value (1 and 2).
    pub fn new(initial_capacity: usize, grow_rate: usize) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: empty_slots(capacity),
                count: 0,
                front: 0,
            }),
            grow_rate: grow_rate.max(2),
        }
    }

    /// Append a record at the back, growing the storage if it is full.
    pub fn push(&self, record: ChangeRecord) {
        let mut ring = self.ring.lock();
        if ring.count == ring.slots.len() {
            ring.grow(self.grow_rate);
        }
        let back = (ring.front + ring.count) % ring.slots.len();
        ring.slots[back] = Some(record);
        ring.count += 1;
    }

    /// Pop the front record.
    ///
    /// A lone `RenamedFrom` record is withheld: its `RenamedTo` sibling is
    /// about to be pushed, and handing out half a rename would mislead the
    /// consumer. Once anything else is queued behind it, it pops normally.
    pub fn pop(&self) -> Option<ChangeRecord> {
        let mut ring = self.ring.lock();
        if ring.count == 0 {
            return None;
        }

        let front = ring.front;
        let split_rename = ring.count == 1
            && matches!(&ring.slots[front], Some(r) if r.action == FileAction::RenamedFrom);
        if split_rename {
            return None;
        }

        let record = ring.slots[front].take();
        ring.front = (front + 1) % ring.slots.len();
        ring.count -= 1;
        record
    }

    /// Number of queued records, including a withheld split rename
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot count
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY, DEFAULT_GROW_RATE)
    }
}

impl Ring {
    /// Reallocate at `grow_rate` times the capacity, moving records so the
    /// logical front lands at slot 0.
    fn grow(&mut self, grow_rate: usize) {
        let old_capacity = self.slots.len();
        let mut slots = empty_slots(old_capacity * grow_rate);

        // Walk in logical order; this unwraps a wrapped ring in one pass.
        for (i, slot) in slots.iter_mut().take(self.count).enumerate() {
            let index = (self.front + i) % old_capacity;
            *slot = self.slots[index].take();
        }

        tracing::debug!(
            "Event queue grew from {} to {} slots",
            old_capacity,
            slots.len()
        );

        self.slots = slots;
        self.front = 0;
    }
}

fn empty_slots(capacity: usize) -> Vec<Option<ChangeRecord>> {
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || None);
    slots
}
