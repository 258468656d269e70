//! Blocking detector loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Blocking read of up to `chunk_words` words from the stream reader
//! 2. Decode PCM16 → AudioChunk tagged with its absolute begin index
//! 3. KeywordSpotter::process
//! 4. Broadcast DetectionEvent on the channel
//! ```
//!
//! `Overrun` resets the spotter and continues from the resume index; end of
//! stream flushes the spotter and publishes `StreamClosed`. The loop runs on
//! its own thread; `stop` unblocks it by closing the reader.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use super::{AudioChunk, Detection, KeywordSpotter};
use crate::error::VoxlaneError;
use crate::events::{DetectionEvent, DetectorState, DetectorStateEvent};
use crate::stream::Reader;

#[derive(Default)]
pub struct DetectorDiagnostics {
    pub reads: AtomicUsize,
    pub words_in: AtomicUsize,
    pub overruns: AtomicUsize,
    pub detections: AtomicUsize,
}

impl DetectorDiagnostics {
    pub fn reset(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.words_in.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.detections.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            words_in: self.words_in.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub reads: usize,
    pub words_in: usize,
    pub overruns: usize,
    pub detections: usize,
}

/// All context the worker needs.
pub struct WorkerContext {
    pub reader: Arc<Reader>,
    pub spotter: Box<dyn KeywordSpotter>,
    pub sample_rate: u32,
    pub chunk_words: usize,
    pub running: Arc<AtomicBool>,
    pub detection_tx: broadcast::Sender<DetectionEvent>,
    pub state_tx: broadcast::Sender<DetectorStateEvent>,
    pub state: Arc<Mutex<DetectorState>>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<DetectorDiagnostics>,
}

impl WorkerContext {
    fn set_state(&self, state: DetectorState, detail: Option<String>) {
        *self.state.lock() = state;
        let _ = self.state_tx.send(DetectorStateEvent { state, detail });
    }

    fn emit(&self, detection: Detection) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.diagnostics.detections.fetch_add(1, Ordering::Relaxed);
        info!(
            keyword = %detection.keyword,
            begin = detection.begin_index,
            end = detection.end_index,
            "keyword detected"
        );
        let _ = self.detection_tx.send(DetectionEvent {
            seq,
            keyword: detection.keyword,
            begin_index: detection.begin_index,
            end_index: detection.end_index,
        });
    }
}

/// Run the detector loop until the stream drains, the reader is closed, or
/// `ctx.running` is cleared.
pub fn run(mut ctx: WorkerContext) {
    let span = info_span!("detector", reader = ctx.reader.id());
    let _enter = span.enter();
    info!(cursor = ctx.reader.tell(), "detector started");

    let word_size = ctx.reader.word_size();
    // Scratch buffer reused each iteration.
    let mut raw = vec![0u8; ctx.chunk_words * word_size];

    loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Pull words ─────────────────────────────────────────────────
        let begin_index = ctx.reader.tell();
        let n = match ctx.reader.read(&mut raw, ctx.chunk_words) {
            Ok(0) => {
                if let Some(detection) = ctx.spotter.flush() {
                    ctx.emit(detection);
                }
                info!(cursor = ctx.reader.tell(), "stream drained, detector idle");
                ctx.set_state(DetectorState::StreamClosed, None);
                break;
            }
            Ok(n) => n,
            Err(VoxlaneError::Overrun { resume_at }) => {
                ctx.diagnostics.overruns.fetch_add(1, Ordering::Relaxed);
                warn!(resume_at, "detector lapped by writer, resetting spotter");
                ctx.spotter.reset();
                continue;
            }
            Err(VoxlaneError::ReaderClosed) => {
                debug!("reader closed, detector stopping");
                break;
            }
            Err(e) => {
                error!("detector read failed: {e}");
                ctx.set_state(DetectorState::Error, Some(e.to_string()));
                break;
            }
        };
        ctx.diagnostics.reads.fetch_add(1, Ordering::Relaxed);
        ctx.diagnostics.words_in.fetch_add(n, Ordering::Relaxed);

        // ── 2. Decode ─────────────────────────────────────────────────────
        let chunk = AudioChunk::from_pcm16(&raw[..n * word_size], ctx.sample_rate, begin_index);

        // ── 3. Spot ───────────────────────────────────────────────────────
        if let Some(detection) = ctx.spotter.process(&chunk) {
            ctx.emit(detection);
        }
    }

    info!("detector stopped");
}
