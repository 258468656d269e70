//! Fixed pool of reader slots.
//!
//! Each slot is mutated by exactly one reader (its cursor) and inspected by
//! the writer (backpressure minimum, overrun flagging). Allocation and release
//! happen under the stream's attach mutex; everything else is atomic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::index::{self, Index};

#[derive(Default)]
pub(crate) struct ReaderSlot {
    pub(crate) cursor: AtomicU64,
    /// Holds back a Blockable writer while live.
    pub(crate) backpressure: AtomicBool,
    pub(crate) overrun: AtomicBool,
    pub(crate) live: AtomicBool,
}

pub(crate) struct SlotTable {
    slots: Box<[ReaderSlot]>,
}

impl SlotTable {
    pub(crate) fn new(max_readers: usize) -> Self {
        let slots = (0..max_readers).map(|_| ReaderSlot::default()).collect();
        Self { slots }
    }

    pub(crate) fn get(&self, id: usize) -> &ReaderSlot {
        &self.slots[id]
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot. Caller holds the attach mutex.
    pub(crate) fn claim(&self, cursor: Index, backpressure: bool) -> Option<usize> {
        let id = self
            .slots
            .iter()
            .position(|slot| !slot.live.load(Ordering::Acquire))?;
        let slot = &self.slots[id];
        slot.cursor.store(cursor, Ordering::SeqCst);
        slot.overrun.store(false, Ordering::SeqCst);
        slot.backpressure.store(backpressure, Ordering::SeqCst);
        slot.live.store(true, Ordering::SeqCst);
        Some(id)
    }

    /// Return a slot to the pool. Caller holds the attach mutex.
    pub(crate) fn release(&self, id: usize) {
        let slot = &self.slots[id];
        slot.backpressure.store(false, Ordering::SeqCst);
        slot.live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.live.load(Ordering::Acquire))
            .count()
    }

    /// Smallest cursor among live backpressure readers, if any.
    pub(crate) fn min_backpressure_cursor(&self) -> Option<Index> {
        self.slots
            .iter()
            .filter(|slot| {
                slot.live.load(Ordering::SeqCst) && slot.backpressure.load(Ordering::SeqCst)
            })
            .map(|slot| slot.cursor.load(Ordering::SeqCst))
            .min()
    }

    /// Flag every live reader that `write_end` has lapped. Returns how many
    /// were newly flagged.
    pub(crate) fn flag_overruns(&self, write_end: Index, capacity: usize) -> usize {
        let mut flagged = 0;
        for slot in self.slots.iter() {
            if !slot.live.load(Ordering::SeqCst) {
                continue;
            }
            let cursor = slot.cursor.load(Ordering::SeqCst);
            if index::is_overrun(cursor, write_end, capacity)
                && !slot.overrun.swap(true, Ordering::SeqCst)
            {
                flagged += 1;
            }
        }
        flagged
    }
}
