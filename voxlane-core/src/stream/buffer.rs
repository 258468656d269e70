//! Backing buffer: a fixed ring of fixed-width words.
//!
//! Words are stored as `AtomicU8` so the writer can overwrite a slot while a
//! lagging reader copies it without any lock on the payload. A copy that races
//! with an overwrite is detected afterwards by the reader through cursor
//! comparison and reported as an overrun; the bytes themselves are never
//! trusted in that case.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, VoxlaneError};

use super::index::{Index, SlotMapper};

/// Fixed geometry of a stream, chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Capacity in words.
    pub capacity: usize,
    /// Bytes per word (one sample frame).
    pub word_size: usize,
    /// Maximum number of simultaneously attached readers.
    pub max_readers: usize,
}

impl BufferLayout {
    /// Validate the creation parameters.
    ///
    /// # Errors
    /// `InvalidConfig` when any value is zero or the payload size overflows.
    pub fn new(capacity: usize, word_size: usize, max_readers: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VoxlaneError::InvalidConfig("capacity must be non-zero".into()));
        }
        if word_size == 0 {
            return Err(VoxlaneError::InvalidConfig("word size must be non-zero".into()));
        }
        if max_readers == 0 {
            return Err(VoxlaneError::InvalidConfig(
                "max readers must be non-zero".into(),
            ));
        }
        let layout = Self {
            capacity,
            word_size,
            max_readers,
        };
        layout.data_len()?;
        Ok(layout)
    }

    /// Payload size in bytes.
    pub fn data_len(&self) -> Result<usize> {
        self.capacity.checked_mul(self.word_size).ok_or_else(|| {
            VoxlaneError::InvalidConfig(format!(
                "{} words of {} bytes overflows usize",
                self.capacity, self.word_size
            ))
        })
    }

    /// Byte count needed to hold `words` words.
    #[inline]
    pub fn bytes_for(&self, words: usize) -> usize {
        words.saturating_mul(self.word_size)
    }
}

pub(crate) struct BackingBuffer {
    layout: BufferLayout,
    mapper: SlotMapper,
    data: Box<[AtomicU8]>,
}

impl BackingBuffer {
    pub(crate) fn new(layout: BufferLayout) -> Result<Self> {
        let len = layout.data_len()?;
        let data = (0..len).map(|_| AtomicU8::new(0)).collect();
        Ok(Self {
            layout,
            mapper: SlotMapper::new(layout.capacity),
            data,
        })
    }

    pub(crate) fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Store `src` (a whole number of words, at most `capacity`) starting at
    /// absolute index `start`, wrapping around the end of the ring.
    pub(crate) fn store(&self, start: Index, src: &[u8]) {
        debug_assert_eq!(src.len() % self.layout.word_size, 0);
        debug_assert!(src.len() <= self.data.len());
        let (head, tail) = self.regions(start, src.len());
        for (dst, byte) in self.data[head.0..head.1].iter().zip(src) {
            dst.store(*byte, Ordering::Relaxed);
        }
        let split = head.1 - head.0;
        for (dst, byte) in self.data[tail.0..tail.1].iter().zip(&src[split..]) {
            dst.store(*byte, Ordering::Relaxed);
        }
    }

    /// Copy words starting at absolute index `start` into `dst`.
    pub(crate) fn load(&self, start: Index, dst: &mut [u8]) {
        debug_assert_eq!(dst.len() % self.layout.word_size, 0);
        debug_assert!(dst.len() <= self.data.len());
        let (head, tail) = self.regions(start, dst.len());
        let split = head.1 - head.0;
        let (first, second) = dst.split_at_mut(split);
        for (out, src) in first.iter_mut().zip(&self.data[head.0..head.1]) {
            *out = src.load(Ordering::Relaxed);
        }
        for (out, src) in second.iter_mut().zip(&self.data[tail.0..tail.1]) {
            *out = src.load(Ordering::Relaxed);
        }
    }

    /// Byte ranges `[a, b)` covering `len` bytes from `start`: the run up to
    /// the physical end, then the wrapped run from offset zero.
    fn regions(&self, start: Index, len: usize) -> ((usize, usize), (usize, usize)) {
        let offset = self.mapper.slot(start) * self.layout.word_size;
        let first = len.min(self.data.len() - offset);
        ((offset, offset + first), (0, len - first))
    }
}
