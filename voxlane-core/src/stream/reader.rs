//! Consumer handles.
//!
//! Each reader owns one slot of the stream's reader table and advances its
//! own cursor; readers never observe or disturb each other.

use std::fmt;
use std::sync::{
    atomic::{fence, AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, VoxlaneError};

use super::index::{self, Index};
use super::slots::ReaderSlot;
use super::Shared;

/// What `read` does when nothing new has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReaderPolicy {
    /// Park until data arrives, the stream closes, or an overrun occurs.
    Blocking,
    /// Return immediately with whatever is available, possibly nothing.
    Nonblocking,
}

/// Where a new reader's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartPolicy {
    /// At the current write cursor: only words written from now on.
    Now,
    /// At the oldest index still retained.
    OldestAvailable,
    /// At an explicit absolute index inside the retained window.
    AbsoluteIndex(Index),
}

/// Seek target for [`Reader::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    /// An absolute index.
    Absolute(Index),
    /// `n` words after the reader's cursor.
    Forward(u64),
    /// `n` words before the reader's cursor.
    Backward(u64),
    /// `n` words before the write cursor.
    BeforeWriter(u64),
}

impl Seek {
    /// Resolve against the reader's cursor and the write cursor. `Err` carries
    /// the saturated target when the arithmetic leaves the index space.
    fn resolve(self, cursor: Index, write_cursor: Index) -> std::result::Result<Index, Index> {
        match self {
            Seek::Absolute(index) => Ok(index),
            Seek::Forward(n) => cursor.checked_add(n).ok_or(Index::MAX),
            Seek::Backward(n) => cursor.checked_sub(n).ok_or(0),
            Seek::BeforeWriter(n) => write_cursor.checked_sub(n).ok_or(0),
        }
    }
}

/// Consumer handle bound to one reader slot.
///
/// Methods take `&self`: a handle may be shared so another thread can
/// `close()` it while a Blocking `read` is parked. Calls on one handle are
/// serialised. Dropping the reader closes it and frees the slot.
pub struct Reader {
    shared: Arc<Shared>,
    id: usize,
    policy: ReaderPolicy,
    closed: AtomicBool,
    /// Held for the duration of `read`/`seek` on this handle.
    inflight: Mutex<()>,
}

impl Reader {
    pub(crate) fn new(shared: Arc<Shared>, id: usize, policy: ReaderPolicy) -> Self {
        Self {
            shared,
            id,
            policy,
            closed: AtomicBool::new(false),
            inflight: Mutex::new(()),
        }
    }

    fn slot(&self) -> &ReaderSlot {
        self.shared.slots.get(self.id)
    }

    /// Read up to `max_count` words into `into`, starting at this reader's
    /// cursor.
    ///
    /// Returns the number of words read. `0` from a Blocking reader means the
    /// stream is closed and fully drained; from a Nonblocking reader it also
    /// means "nothing yet". A `max_count` of zero returns `0` at once under
    /// either policy and says nothing about end-of-stream; it still reports
    /// a pending overrun.
    ///
    /// # Errors
    /// - `Overrun { resume_at }` if the writer lapped this reader. Reported
    ///   once; the cursor now sits at `resume_at` and the next read starts
    ///   there.
    /// - `ReaderClosed` after `close()`, including for a call parked in a
    ///   Blocking read when another thread closes the handle.
    /// - `ShortBuffer` if `into` holds fewer than `max_count` words.
    pub fn read(&self, into: &mut [u8], max_count: usize) -> Result<usize> {
        let layout = *self.shared.layout();
        let needed = layout.bytes_for(max_count);
        if into.len() < needed {
            return Err(VoxlaneError::ShortBuffer {
                needed,
                provided: into.len(),
            });
        }

        let _inflight = self.inflight.lock();
        self.ensure_open()?;
        let slot = self.slot();

        let (cursor, available) = loop {
            let cursor = slot.cursor.load(Ordering::SeqCst);
            self.consume_overrun(cursor)?;
            if max_count == 0 {
                return Ok(0);
            }

            let available = self.shared.committed().saturating_sub(cursor);
            if available > 0 {
                break (cursor, available);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                // The final commit may have landed between the two loads.
                if self.shared.committed() > cursor {
                    continue;
                }
                return Ok(0);
            }

            match self.policy {
                ReaderPolicy::Nonblocking => return Ok(0),
                ReaderPolicy::Blocking => {
                    self.shared.wait_for_data(|| {
                        !self.closed.load(Ordering::SeqCst)
                            && !slot.overrun.load(Ordering::SeqCst)
                            && !self.shared.closed.load(Ordering::SeqCst)
                            && self.shared.committed() == cursor
                    });
                    self.ensure_open()?;
                }
            }
        };

        let n = available
            .min(max_count as Index)
            .min(layout.capacity as Index) as usize;
        self.shared
            .buffer
            .load(cursor, &mut into[..layout.bytes_for(n)]);

        // Pairs with the writer's release fence: if any copied byte came from
        // a later overwrite, this load sees that write's `write_end`.
        fence(Ordering::Acquire);
        let write_end = self.shared.write_end.load(Ordering::Relaxed);
        if index::is_overrun(cursor, write_end, layout.capacity) {
            return Err(self.resync(index::oldest_retained(write_end, layout.capacity)));
        }

        slot.cursor.store(cursor + n as Index, Ordering::SeqCst);
        self.shared.wake_writers();
        Ok(n)
    }

    /// Consume the overrun flag. The window check is authoritative: a flag
    /// raised against a cursor that has since moved on is dropped.
    fn consume_overrun(&self, cursor: Index) -> Result<()> {
        self.slot().overrun.swap(false, Ordering::SeqCst);
        let write_end = self.shared.write_end.load(Ordering::SeqCst);
        let capacity = self.shared.capacity();
        if index::is_overrun(cursor, write_end, capacity) {
            return Err(self.resync(index::oldest_retained(write_end, capacity)));
        }
        Ok(())
    }

    fn resync(&self, resume_at: Index) -> VoxlaneError {
        let slot = self.slot();
        let lost = resume_at.saturating_sub(slot.cursor.load(Ordering::SeqCst));
        slot.cursor.store(resume_at, Ordering::SeqCst);
        slot.overrun.store(false, Ordering::SeqCst);
        self.shared.stats.overruns.fetch_add(1, Ordering::Relaxed);
        warn!(reader = self.id, resume_at, lost, "reader overrun");
        self.shared.wake_writers();
        VoxlaneError::Overrun { resume_at }
    }

    /// Move the cursor. Clears any pending overrun.
    ///
    /// # Errors
    /// `InvalidIndex` if the target lies before the oldest retained word or
    /// after the write cursor; `ReaderClosed` after `close()`.
    pub fn seek(&self, to: Seek) -> Result<Index> {
        let _inflight = self.inflight.lock();
        self.ensure_open()?;
        let slot = self.slot();

        // Backpressure writers check space under the same lock, so a backward
        // seek cannot race an in-flight commit.
        let attach = self.shared.attach.lock();
        let cursor = slot.cursor.load(Ordering::SeqCst);
        let newest = self.shared.committed();
        let oldest = self.shared.oldest();
        let target = match to.resolve(cursor, newest) {
            Ok(target) if (oldest..=newest).contains(&target) => target,
            Ok(index) | Err(index) => {
                return Err(VoxlaneError::InvalidIndex {
                    index,
                    oldest,
                    newest,
                })
            }
        };

        slot.overrun.store(false, Ordering::SeqCst);
        slot.cursor.store(target, Ordering::SeqCst);
        drop(attach);
        debug!(reader = self.id, from = cursor, to = target, "reader seek");
        if target > cursor {
            self.shared.wake_writers();
        }
        Ok(target)
    }

    /// Absolute index of the next word this reader will return.
    pub fn tell(&self) -> Index {
        self.slot().cursor.load(Ordering::SeqCst)
    }

    /// Committed words not yet read (may include words already lapped).
    pub fn available(&self) -> u64 {
        self.shared.committed().saturating_sub(self.tell())
    }

    /// `true` if the writer has flagged this reader since its last read/seek.
    pub fn overrun_pending(&self) -> bool {
        self.slot().overrun.load(Ordering::SeqCst)
    }

    /// Slot number within the stream's reader table.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn policy(&self) -> ReaderPolicy {
        self.policy
    }

    pub fn word_size(&self) -> usize {
        self.shared.layout().word_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the reader and free its slot. A `read` parked on another thread
    /// returns `ReaderClosed`. Idempotent; never affects other readers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_all();
        // Wait out an in-flight call on this handle; it is already unblocked.
        drop(self.inflight.lock());
        self.shared.release_reader(self.id);
        info!(reader = self.id, "reader closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoxlaneError::ReaderClosed);
        }
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("cursor", &self.tell())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Stream, WriterPolicy};

    fn words(range: std::ops::Range<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn nonblocking_read_returns_zero_when_empty() {
        let stream = Stream::create(8, 1, 1).expect("stream");
        let _writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 4).expect("read"), 0);
        assert!(!stream.is_closed());
    }

    #[test]
    fn reads_in_index_order_across_wrap() {
        let stream = Stream::create(4, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");
        let mut buf = [0u8; 4];

        writer.write(&words(0..3), 3).expect("write");
        assert_eq!(reader.read(&mut buf, 4).expect("read"), 3);
        assert_eq!(&buf[..3], &[0, 1, 2]);

        writer.write(&words(3..6), 3).expect("write");
        assert_eq!(reader.read(&mut buf, 4).expect("read"), 3);
        assert_eq!(&buf[..3], &[3, 4, 5]);
        assert_eq!(reader.tell(), 6);
    }

    #[test]
    fn overrun_is_reported_once_then_resumes_at_oldest() {
        let stream = Stream::create(4, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");

        writer.write(&words(0..10), 10).expect("write");
        assert!(reader.overrun_pending());

        let mut buf = [0u8; 8];
        match reader.read(&mut buf, 8) {
            Err(VoxlaneError::Overrun { resume_at }) => assert_eq!(resume_at, 6),
            other => panic!("expected overrun, got {other:?}"),
        }
        assert!(!reader.overrun_pending());
        assert_eq!(reader.tell(), 6);

        assert_eq!(reader.read(&mut buf, 8).expect("read after overrun"), 4);
        assert_eq!(&buf[..4], &[6, 7, 8, 9]);
        assert_eq!(stream.stats().overruns, 1);
    }

    #[test]
    fn seek_validates_window() {
        let stream = Stream::create(4, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");
        writer.write(&words(0..6), 6).expect("write");

        assert!(matches!(
            reader.seek(Seek::Absolute(1)),
            Err(VoxlaneError::InvalidIndex { index: 1, oldest: 2, newest: 6 })
        ));
        assert!(matches!(
            reader.seek(Seek::Absolute(7)),
            Err(VoxlaneError::InvalidIndex { .. })
        ));
        assert!(matches!(
            reader.seek(Seek::Backward(1)),
            Err(VoxlaneError::InvalidIndex { index: 0, .. })
        ));
        assert!(matches!(
            reader.seek(Seek::Forward(u64::MAX)),
            Err(VoxlaneError::InvalidIndex { index: Index::MAX, .. })
        ));

        assert_eq!(reader.seek(Seek::Absolute(3)).expect("seek"), 3);
        assert_eq!(reader.seek(Seek::Forward(2)).expect("seek"), 5);
        assert_eq!(reader.seek(Seek::Backward(3)).expect("seek"), 2);
        assert_eq!(reader.seek(Seek::BeforeWriter(1)).expect("seek"), 5);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 4).expect("read"), 1);
        assert_eq!(buf[0], 5);
    }

    #[test]
    fn seek_clears_pending_overrun() {
        let stream = Stream::create(4, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");
        writer.write(&words(0..9), 9).expect("write");
        assert!(reader.overrun_pending());

        assert_eq!(reader.seek(Seek::BeforeWriter(2)).expect("seek"), 7);
        assert!(!reader.overrun_pending());
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf, 4).expect("read"), 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[test]
    fn closed_reader_rejects_calls_and_others_continue() {
        let stream = Stream::create(8, 1, 2).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let a = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("a");
        let b = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("b");
        writer.write(&words(0..4), 4).expect("write");

        a.close();
        a.close();
        let mut buf = [0u8; 4];
        assert!(matches!(a.read(&mut buf, 4), Err(VoxlaneError::ReaderClosed)));
        assert!(matches!(a.seek(Seek::Absolute(0)), Err(VoxlaneError::ReaderClosed)));
        assert_eq!(b.read(&mut buf, 4).expect("b unaffected"), 4);
    }

    #[test]
    fn closed_and_drained_reads_zero() {
        let stream = Stream::create(8, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Blocking, StartPolicy::Now)
            .expect("reader");
        writer.write(&words(0..3), 3).expect("write");
        writer.close();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf, 8).expect("drain"), 3);
        assert_eq!(reader.read(&mut buf, 8).expect("end of stream"), 0);
    }

    #[test]
    fn zero_count_read_returns_without_waiting() {
        let stream = Stream::create(4, 1, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let reader = stream
            .create_reader(ReaderPolicy::Blocking, StartPolicy::Now)
            .expect("reader");

        // Open and empty: a Blocking read of one word would park here.
        assert_eq!(reader.read(&mut [], 0).expect("zero count"), 0);
        assert!(!stream.is_closed());

        writer.write(&words(0..6), 6).expect("write");
        assert!(matches!(
            reader.read(&mut [], 0),
            Err(VoxlaneError::Overrun { resume_at: 2 })
        ));
        assert_eq!(reader.read(&mut [], 0).expect("zero count"), 0);
        assert_eq!(reader.tell(), 2);
    }

    #[test]
    fn short_destination_is_rejected() {
        let stream = Stream::create(8, 2, 1).expect("stream");
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("reader");
        let mut buf = [0u8; 3];
        assert!(matches!(
            reader.read(&mut buf, 2),
            Err(VoxlaneError::ShortBuffer { needed: 4, provided: 3 })
        ));
    }
}
