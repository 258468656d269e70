//! Shared audio data stream: one writer, many independent readers.
//!
//! ## Layout
//!
//! ```text
//!            write_end (reserved) ─┐
//!      write_start (committed) ─┐  │
//!                               ▼  ▼
//! ... | oldest ...... readable | in flux | ...
//!     ▲
//!     └─ write_end − capacity
//! ```
//!
//! Readers see `[oldest, write_start)`. A reader whose cursor falls below
//! `write_end − capacity` has been lapped: its next `read`/`seek` reports
//! [`VoxlaneError::Overrun`] and resynchronises at the oldest retained word.
//!
//! ## Synchronisation
//!
//! Cursors are atomics and the payload is lock-free (see [`buffer`]). The only
//! mutexes are:
//! - `attach`: reader-slot allocation and writer attachment. Writers that
//!   respect backpressure also hold it from the space check through the
//!   commit, and readers hold it while seeking, so no reader can appear
//!   behind a commit that did not account for it;
//! - `write_lock`: serialises writes across a forced writer replacement;
//! - `signal`: paired with the `data_ready` / `space_ready` condvars for the
//!   Blocking reader and Blockable writer policies. Waiter counters let the
//!   write path skip it entirely when nobody is parked.

pub mod buffer;
pub mod index;
pub mod reader;
mod slots;
pub mod writer;

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::error::{Result, VoxlaneError};

pub use buffer::BufferLayout;
pub use index::Index;
pub use reader::{Reader, ReaderPolicy, Seek, StartPolicy};
pub use writer::{Writer, WriterPolicy};

use buffer::BackingBuffer;
use slots::SlotTable;

/// Which readers hold back a Blockable (or Nonblocking / AllOrNothing) writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backpressure {
    /// Only readers created with [`ReaderPolicy::Blocking`].
    #[default]
    BlockingReaders,
    /// Every attached reader.
    AllReaders,
}

/// Counters for observability. All updates are `Relaxed`.
#[derive(Default)]
pub struct StreamStats {
    pub words_written: AtomicU64,
    pub writes: AtomicU64,
    pub overruns: AtomicU64,
    pub writer_waits: AtomicU64,
    pub readers_attached: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            words_written: self.words_written.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            writer_waits: self.writer_waits.load(Ordering::Relaxed),
            readers_attached: self.readers_attached.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatsSnapshot {
    pub words_written: u64,
    pub writes: u64,
    pub overruns: u64,
    pub writer_waits: u64,
    pub readers_attached: u64,
}

struct AttachState {
    /// Epoch of the open writer, if one is attached.
    writer: Option<u64>,
}

/// State shared by the `Stream` handle, its writer and its readers.
pub(crate) struct Shared {
    pub(crate) buffer: BackingBuffer,
    pub(crate) slots: SlotTable,
    backpressure: Backpressure,
    /// Words below this index are committed and readable.
    pub(crate) write_start: AtomicU64,
    /// Words below this index may be mid-overwrite.
    pub(crate) write_end: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) writer_epoch: AtomicU64,
    attach: Mutex<AttachState>,
    pub(crate) write_lock: Mutex<()>,
    signal: Mutex<()>,
    data_ready: Condvar,
    space_ready: Condvar,
    waiting_readers: AtomicUsize,
    waiting_writers: AtomicUsize,
    pub(crate) stats: StreamStats,
}

impl Shared {
    pub(crate) fn layout(&self) -> &BufferLayout {
        self.buffer.layout()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout().capacity
    }

    pub(crate) fn committed(&self) -> Index {
        self.write_start.load(Ordering::SeqCst)
    }

    pub(crate) fn oldest(&self) -> Index {
        index::oldest_retained(self.write_end.load(Ordering::SeqCst), self.capacity())
    }

    /// Words a backpressure-respecting writer may commit right now. Unbounded
    /// when no reader exerts backpressure.
    pub(crate) fn space_available(&self) -> usize {
        let capacity = self.capacity();
        match self.slots.min_backpressure_cursor() {
            None => usize::MAX,
            Some(min) => {
                let unread = self.committed().saturating_sub(min);
                capacity.saturating_sub(usize::try_from(unread).unwrap_or(usize::MAX))
            }
        }
    }

    /// Park the calling reader while `still_waiting` holds.
    pub(crate) fn wait_for_data(&self, mut still_waiting: impl FnMut() -> bool) {
        let mut guard = self.signal.lock();
        self.waiting_readers.fetch_add(1, Ordering::SeqCst);
        while still_waiting() {
            self.data_ready.wait(&mut guard);
        }
        self.waiting_readers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Park the calling writer while `still_waiting` holds.
    pub(crate) fn wait_for_space(&self, mut still_waiting: impl FnMut() -> bool) {
        let mut guard = self.signal.lock();
        self.waiting_writers.fetch_add(1, Ordering::SeqCst);
        while still_waiting() {
            self.space_ready.wait(&mut guard);
        }
        self.waiting_writers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn wake_readers(&self) {
        if self.waiting_readers.load(Ordering::SeqCst) > 0 {
            let _guard = self.signal.lock();
            self.data_ready.notify_all();
        }
    }

    pub(crate) fn wake_writers(&self) {
        if self.waiting_writers.load(Ordering::SeqCst) > 0 {
            let _guard = self.signal.lock();
            self.space_ready.notify_all();
        }
    }

    /// Unconditional wake-up used by close and writer replacement.
    pub(crate) fn wake_all(&self) {
        let _guard = self.signal.lock();
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Detach the writer with `epoch` and mark the stream closed. Returns
    /// `false` if that writer had already been displaced.
    pub(crate) fn detach_writer(&self, epoch: u64) -> bool {
        let mut attach = self.attach.lock();
        if attach.writer != Some(epoch) {
            return false;
        }
        attach.writer = None;
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) fn release_reader(&self, id: usize) {
        {
            let _attach = self.attach.lock();
            self.slots.release(id);
        }
        self.wake_writers();
    }
}

/// Shared handle to one circular audio stream.
///
/// Cloning is cheap (`Arc`). The backing memory is released once the last
/// `Stream`, `Writer` and `Reader` derived from it are dropped.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    /// Create a stream of `capacity` words, each `word_size` bytes, with room
    /// for `max_readers` concurrent readers.
    ///
    /// # Errors
    /// `InvalidConfig` when any argument is zero.
    pub fn create(capacity: usize, word_size: usize, max_readers: usize) -> Result<Self> {
        Self::build(
            BufferLayout::new(capacity, word_size, max_readers)?,
            Backpressure::default(),
        )
    }

    /// Create a stream from configuration.
    pub fn with_config(config: &StreamConfig) -> Result<Self> {
        Self::build(
            BufferLayout::new(config.capacity_words, config.word_size, config.max_readers)?,
            config.backpressure,
        )
    }

    fn build(layout: BufferLayout, backpressure: Backpressure) -> Result<Self> {
        let buffer = BackingBuffer::new(layout)?;
        info!(
            capacity = layout.capacity,
            word_size = layout.word_size,
            max_readers = layout.max_readers,
            ?backpressure,
            "stream created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                buffer,
                slots: SlotTable::new(layout.max_readers),
                backpressure,
                write_start: AtomicU64::new(0),
                write_end: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                writer_epoch: AtomicU64::new(0),
                attach: Mutex::new(AttachState { writer: None }),
                write_lock: Mutex::new(()),
                signal: Mutex::new(()),
                data_ready: Condvar::new(),
                space_ready: Condvar::new(),
                waiting_readers: AtomicUsize::new(0),
                waiting_writers: AtomicUsize::new(0),
                stats: StreamStats::default(),
            }),
        })
    }

    /// Attach the single writer.
    ///
    /// # Errors
    /// `WriterAlreadyExists` while another writer is attached and open.
    pub fn create_writer(&self, policy: WriterPolicy) -> Result<Writer> {
        let mut attach = self.shared.attach.lock();
        if attach.writer.is_some() {
            warn!(?policy, "writer rejected: one is already attached");
            return Err(VoxlaneError::WriterAlreadyExists);
        }
        Ok(self.attach_writer(&mut attach, policy))
    }

    /// Attach a writer, displacing any current one. The displaced writer's
    /// subsequent calls fail with `StreamClosed`.
    pub fn replace_writer(&self, policy: WriterPolicy) -> Writer {
        let writer = {
            let mut attach = self.shared.attach.lock();
            if let Some(old) = attach.writer {
                info!(displaced_epoch = old, "replacing attached writer");
            }
            self.attach_writer(&mut attach, policy)
        };
        // A displaced writer may be parked waiting for space.
        self.shared.wake_all();
        writer
    }

    fn attach_writer(&self, attach: &mut AttachState, policy: WriterPolicy) -> Writer {
        let epoch = self.shared.writer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        attach.writer = Some(epoch);
        self.shared.closed.store(false, Ordering::SeqCst);
        info!(?policy, epoch, "writer attached");
        Writer::new(Arc::clone(&self.shared), policy, epoch)
    }

    /// Attach a reader in a free slot.
    ///
    /// # Errors
    /// - `NoFreeReaderSlot` when every slot is live.
    /// - `InvalidIndex` when `start` names an index outside the retained window.
    pub fn create_reader(&self, policy: ReaderPolicy, start: StartPolicy) -> Result<Reader> {
        let id = {
            // Backpressure commits are excluded while the cursor is chosen.
            let _attach = self.shared.attach.lock();
            let newest = self.shared.committed();
            let oldest = self.shared.oldest();
            let cursor = match start {
                StartPolicy::Now => newest,
                StartPolicy::OldestAvailable => oldest,
                StartPolicy::AbsoluteIndex(index) => {
                    if index < oldest || index > newest {
                        return Err(VoxlaneError::InvalidIndex {
                            index,
                            oldest,
                            newest,
                        });
                    }
                    index
                }
            };
            let backpressure = match self.shared.backpressure {
                Backpressure::AllReaders => true,
                Backpressure::BlockingReaders => policy == ReaderPolicy::Blocking,
            };
            self.shared
                .slots
                .claim(cursor, backpressure)
                .ok_or_else(|| {
                    warn!(?policy, "reader rejected: no free slot");
                    VoxlaneError::NoFreeReaderSlot {
                        max_readers: self.shared.slots.len(),
                    }
                })?
        };
        self.shared
            .stats
            .readers_attached
            .fetch_add(1, Ordering::Relaxed);
        let reader = Reader::new(Arc::clone(&self.shared), id, policy);
        info!(reader = id, ?policy, ?start, cursor = reader.tell(), "reader attached");
        Ok(reader)
    }

    /// Committed write cursor: the index of the next word to be written.
    pub fn write_cursor(&self) -> Index {
        self.shared.committed()
    }

    /// Oldest index still physically present.
    pub fn oldest_index(&self) -> Index {
        self.shared.oldest()
    }

    /// `true` once the attached writer has closed (until a new one attaches).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn has_writer(&self) -> bool {
        self.shared.attach.lock().writer.is_some()
    }

    pub fn layout(&self) -> BufferLayout {
        *self.shared.layout()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn word_size(&self) -> usize {
        self.shared.layout().word_size
    }

    pub fn max_readers(&self) -> usize {
        self.shared.layout().max_readers
    }

    pub fn active_readers(&self) -> usize {
        self.shared.slots.live_count()
    }

    pub fn backpressure(&self) -> Backpressure {
        self.shared.backpressure
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("layout", self.shared.layout())
            .field("write_cursor", &self.write_cursor())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_zero_parameters() {
        assert!(matches!(
            Stream::create(0, 2, 1),
            Err(VoxlaneError::InvalidConfig(_))
        ));
        assert!(matches!(
            Stream::create(16, 0, 1),
            Err(VoxlaneError::InvalidConfig(_))
        ));
        assert!(matches!(
            Stream::create(16, 2, 0),
            Err(VoxlaneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn new_stream_is_zeroed() {
        let stream = Stream::create(16, 2, 2).expect("stream");
        assert_eq!(stream.write_cursor(), 0);
        assert_eq!(stream.oldest_index(), 0);
        assert!(!stream.is_closed());
        assert!(!stream.has_writer());
        assert_eq!(stream.active_readers(), 0);
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let stream = Stream::create(16, 2, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("first writer");
        assert!(matches!(
            stream.create_writer(WriterPolicy::Nonblockable),
            Err(VoxlaneError::WriterAlreadyExists)
        ));

        writer.close();
        let _second = stream
            .create_writer(WriterPolicy::Blockable)
            .expect("closed writer can be replaced");
        assert!(!stream.is_closed());
    }

    #[test]
    fn dropped_writer_frees_the_attachment() {
        let stream = Stream::create(16, 2, 1).expect("stream");
        drop(stream.create_writer(WriterPolicy::Nonblockable).expect("writer"));
        assert!(stream.is_closed());
        assert!(stream.create_writer(WriterPolicy::Nonblockable).is_ok());
    }

    #[test]
    fn reader_slots_are_bounded_and_reused() {
        let stream = Stream::create(16, 2, 2).expect("stream");
        let a = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("a");
        let _b = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("b");
        assert!(matches!(
            stream.create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now),
            Err(VoxlaneError::NoFreeReaderSlot { max_readers: 2 })
        ));

        a.close();
        assert_eq!(stream.active_readers(), 1);
        let c = stream
            .create_reader(ReaderPolicy::Blocking, StartPolicy::Now)
            .expect("slot reused");
        assert_eq!(c.id(), 0);
        assert_eq!(stream.stats().readers_attached, 3);
    }

    #[test]
    fn absolute_start_must_be_retained() {
        let stream = Stream::create(8, 1, 2).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        writer.write(&[0u8; 12], 12).expect("write");
        assert_eq!(stream.oldest_index(), 4);

        assert!(matches!(
            stream.create_reader(ReaderPolicy::Nonblocking, StartPolicy::AbsoluteIndex(3)),
            Err(VoxlaneError::InvalidIndex { index: 3, oldest: 4, newest: 12 })
        ));
        assert!(matches!(
            stream.create_reader(ReaderPolicy::Nonblocking, StartPolicy::AbsoluteIndex(13)),
            Err(VoxlaneError::InvalidIndex { .. })
        ));
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::AbsoluteIndex(6))
            .expect("retained index");
        assert_eq!(reader.tell(), 6);
    }

    #[test]
    fn start_policies_pick_expected_cursor() {
        let stream = Stream::create(100, 2, 3).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        writer.write(&[0u8; 260], 130).expect("write");

        let now = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("now");
        let oldest = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::OldestAvailable)
            .expect("oldest");
        assert_eq!(now.tell(), 130);
        assert_eq!(oldest.tell(), 30);
    }

    #[test]
    fn streams_are_independent() {
        let a = Stream::create(8, 1, 1).expect("a");
        let b = Stream::create(8, 1, 1).expect("b");
        let wa = a.create_writer(WriterPolicy::Nonblockable).expect("wa");
        let _wb = b.create_writer(WriterPolicy::Nonblockable).expect("wb");
        wa.write(&[1, 2, 3], 3).expect("write");
        assert_eq!(a.write_cursor(), 3);
        assert_eq!(b.write_cursor(), 0);
    }
}
