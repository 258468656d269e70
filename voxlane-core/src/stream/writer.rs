//! The single producer handle.

use std::fmt;
use std::sync::{
    atomic::{fence, AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, VoxlaneError};

use super::{Index, Shared};

/// How the writer behaves when unread data would be overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterPolicy {
    /// Always writes everything immediately. Lapped readers get an overrun.
    /// The right choice for a live capture callback.
    Nonblockable,
    /// Blocks until every word fits behind the backpressure readers.
    Blockable,
    /// Writes whatever fits behind the backpressure readers and returns the
    /// short count without waiting.
    Nonblocking,
    /// Writes all words if they fit right now, otherwise none.
    AllOrNothing,
}

/// Producer handle. At most one open writer is attached to a stream.
///
/// Methods take `&self` so the handle can be shared (e.g. `Arc<Writer>`) and
/// closed from another thread while a Blockable `write` is parked.
/// Dropping the writer closes it.
pub struct Writer {
    shared: Arc<Shared>,
    policy: WriterPolicy,
    epoch: u64,
    closed: AtomicBool,
    /// Held for the duration of a `write` on this handle.
    inflight: Mutex<()>,
}

impl Writer {
    pub(crate) fn new(shared: Arc<Shared>, policy: WriterPolicy, epoch: u64) -> Self {
        Self {
            shared,
            policy,
            epoch,
            closed: AtomicBool::new(false),
            inflight: Mutex::new(()),
        }
    }

    /// Write `count` words from `frames`.
    ///
    /// Returns the number of words accepted; the write cursor advances by
    /// exactly that amount.
    ///
    /// # Errors
    /// - `ShortBuffer` if `frames` holds fewer than `count` words.
    /// - `StreamClosed` after `close()`, or once this writer was displaced.
    pub fn write(&self, frames: &[u8], count: usize) -> Result<usize> {
        let needed = self.shared.layout().bytes_for(count);
        if frames.len() < needed {
            return Err(VoxlaneError::ShortBuffer {
                needed,
                provided: frames.len(),
            });
        }

        let _inflight = self.inflight.lock();
        let _serial = self.shared.write_lock.lock();
        if !self.is_open() {
            return Err(VoxlaneError::StreamClosed);
        }
        if count == 0 {
            return Ok(0);
        }
        let frames = &frames[..needed];

        let written = match self.policy {
            WriterPolicy::Nonblockable => {
                self.commit(frames);
                count
            }
            WriterPolicy::AllOrNothing => {
                let _admit = self.shared.attach.lock();
                if self.shared.space_available() < count {
                    0
                } else {
                    self.commit(frames);
                    count
                }
            }
            WriterPolicy::Nonblocking => self.commit_available(frames, count),
            WriterPolicy::Blockable => self.write_blocking(frames, count)?,
        };

        if written < count {
            debug!(
                requested = count,
                written,
                policy = ?self.policy,
                "short write"
            );
        }
        Ok(written)
    }

    fn write_blocking(&self, frames: &[u8], count: usize) -> Result<usize> {
        let word_size = self.shared.layout().word_size;
        let mut written = 0;
        while written < count {
            let n = self.commit_available(&frames[written * word_size..], count - written);
            if n > 0 {
                written += n;
                continue;
            }
            self.shared
                .stats
                .writer_waits
                .fetch_add(1, Ordering::Relaxed);
            self.shared
                .wait_for_space(|| self.is_open() && self.shared.space_available() == 0);
            if !self.is_open() {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(VoxlaneError::StreamClosed)
                };
            }
        }
        Ok(written)
    }

    /// Commit as many of `count` words as fit behind the backpressure readers.
    ///
    /// The attach lock is held from the space check through the commit, so a
    /// reader attaching concurrently is either counted here or starts after
    /// this commit.
    fn commit_available(&self, frames: &[u8], count: usize) -> usize {
        let _admit = self.shared.attach.lock();
        let n = self.shared.space_available().min(count);
        if n > 0 {
            self.commit(&frames[..self.shared.layout().bytes_for(n)]);
        }
        n
    }

    /// Publish `bytes` (a whole number of words) at the write cursor.
    ///
    /// `write_end` is advanced before any byte is stored and `write_start`
    /// only after the last one, so a reader that re-checks `write_end` after
    /// copying can tell whether its words were overwritten under it.
    fn commit(&self, bytes: &[u8]) {
        let shared = &*self.shared;
        let word_size = shared.layout().word_size;
        let capacity = shared.capacity();
        let count = (bytes.len() / word_size) as Index;

        let start = shared.write_start.load(Ordering::Relaxed);
        let end = start + count;
        shared.write_end.store(end, Ordering::Relaxed);
        fence(Ordering::Release);

        let lapped = shared.slots.flag_overruns(end, capacity);

        // Only the newest `capacity` words of an oversized write survive.
        let keep = bytes.len().min(shared.layout().bytes_for(capacity));
        let skipped = count - (keep / word_size) as Index;
        shared
            .buffer
            .store(start + skipped, &bytes[bytes.len() - keep..]);

        shared.write_start.store(end, Ordering::SeqCst);
        shared
            .stats
            .words_written
            .fetch_add(count, Ordering::Relaxed);
        shared.stats.writes.fetch_add(1, Ordering::Relaxed);
        if lapped > 0 {
            debug!(lapped, write_cursor = end, "writer lapped readers");
        }
        shared.wake_readers();
    }

    /// Close the writer. Blocked readers wake and observe end-of-stream once
    /// drained; a `write` parked on another thread returns. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_all();
        // Wait out an in-flight write on this handle; it is already unblocked.
        drop(self.inflight.lock());
        if self.shared.detach_writer(self.epoch) {
            info!(
                epoch = self.epoch,
                write_cursor = self.shared.committed(),
                "writer closed"
            );
        }
        self.shared.wake_all();
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.shared.writer_epoch.load(Ordering::SeqCst) == self.epoch
    }

    /// Current write cursor.
    pub fn tell(&self) -> Index {
        self.shared.committed()
    }

    pub fn policy(&self) -> WriterPolicy {
        self.policy
    }

    pub fn word_size(&self) -> usize {
        self.shared.layout().word_size
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("policy", &self.policy)
            .field("epoch", &self.epoch)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
