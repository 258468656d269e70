//! Absolute index arithmetic.
//!
//! Every public position is an absolute word index counted from stream
//! creation. Physical offsets only exist inside [`super::buffer`].

/// Monotonic count of words written since the stream was created.
pub type Index = u64;

/// Oldest index still physically present once the writer has reserved
/// everything below `write_end`.
#[inline]
pub fn oldest_retained(write_end: Index, capacity: usize) -> Index {
    write_end.saturating_sub(capacity as Index)
}

/// `true` if a reader positioned at `cursor` has been lapped.
#[inline]
pub fn is_overrun(cursor: Index, write_end: Index, capacity: usize) -> bool {
    cursor < oldest_retained(write_end, capacity)
}

/// Maps an absolute index to its word slot in a ring of `capacity` words.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotMapper {
    capacity: usize,
    mask: Option<u64>,
}

impl SlotMapper {
    pub(crate) fn new(capacity: usize) -> Self {
        let mask = capacity
            .is_power_of_two()
            .then(|| capacity as u64 - 1);
        Self { capacity, mask }
    }

    #[inline]
    pub(crate) fn slot(&self, index: Index) -> usize {
        match self.mask {
            Some(mask) => (index & mask) as usize,
            None => (index % self.capacity as u64) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_retained_saturates_before_first_lap() {
        assert_eq!(oldest_retained(50, 100), 0);
        assert_eq!(oldest_retained(100, 100), 0);
        assert_eq!(oldest_retained(130, 100), 30);
    }

    #[test]
    fn overrun_is_strictly_below_window() {
        assert!(!is_overrun(30, 130, 100));
        assert!(is_overrun(29, 130, 100));
        assert!(!is_overrun(0, 100, 100));
    }

    #[test]
    fn slot_mapping_masks_power_of_two() {
        let m = SlotMapper::new(64);
        assert_eq!(m.slot(0), 0);
        assert_eq!(m.slot(65), 1);
        assert_eq!(m.slot(128 + 63), 63);
    }

    #[test]
    fn slot_mapping_modulo_otherwise() {
        let m = SlotMapper::new(100);
        assert_eq!(m.slot(130), 30);
        assert_eq!(m.slot(99), 99);
        assert_eq!(m.slot(200), 0);
    }
}
