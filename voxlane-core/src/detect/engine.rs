//! `KeywordDetector`: lifecycle controller for one detector worker.
//!
//! ## Lifecycle
//!
//! ```text
//! KeywordDetector::new()
//!     └─► start(&stream, spotter) → reader attached at "now", worker thread
//!         spawned, state = Active
//!         ├─► writer closes        → worker drains, state = StreamClosed
//!         └─► stop()               → reader closed, worker joined
//! ```
//!
//! `start()`/`stop()` return an error in the wrong state rather than
//! panicking. A detector may be restarted on the same or another stream.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::worker::{self, DetectorDiagnostics, DiagnosticsSnapshot, WorkerContext};
use super::{KeywordSpotter, PCM16_WORD_SIZE};
use crate::config::DetectorConfig;
use crate::error::{Result, VoxlaneError};
use crate::events::{DetectionEvent, DetectorState, DetectorStateEvent};
use crate::stream::{Reader, ReaderPolicy, StartPolicy, Stream};

/// Broadcast channel capacity: detection events buffered for slow consumers.
const BROADCAST_CAP: usize = 64;

struct Running {
    reader: Arc<Reader>,
    handle: JoinHandle<()>,
}

/// Owns one Blocking reader on a stream and the thread that feeds it to a
/// [`KeywordSpotter`].
///
/// `Send + Sync`; wrap in `Arc` to share with event-forwarding tasks.
pub struct KeywordDetector {
    config: DetectorConfig,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<DetectorState>>,
    detection_tx: broadcast::Sender<DetectionEvent>,
    state_tx: broadcast::Sender<DetectorStateEvent>,
    /// Monotonically increasing detection sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<DetectorDiagnostics>,
    worker: Mutex<Option<Running>>,
}

impl KeywordDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let (detection_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(DetectorState::StreamClosed)),
            detection_tx,
            state_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(DetectorDiagnostics::default()),
            worker: Mutex::new(None),
        }
    }

    /// Attach to `stream` and start spotting on new audio.
    ///
    /// # Errors
    /// - `AlreadyRunning` if a worker is active.
    /// - `IncompatibleFormat` unless the stream carries 16-bit mono words.
    /// - `NoFreeReaderSlot` if the stream has no free reader slot.
    pub fn start(&self, stream: &Stream, spotter: Box<dyn KeywordSpotter>) -> Result<()> {
        let mut current = self.worker.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(VoxlaneError::AlreadyRunning);
        }
        if stream.word_size() != PCM16_WORD_SIZE {
            return Err(VoxlaneError::IncompatibleFormat(format!(
                "detector needs {PCM16_WORD_SIZE}-byte PCM16 mono words, stream has {}",
                stream.word_size()
            )));
        }
        // Reap a worker that exited on its own (stream drained).
        if let Some(previous) = current.take() {
            let _ = previous.handle.join();
        }

        let reader = Arc::new(stream.create_reader(ReaderPolicy::Blocking, StartPolicy::Now)?);
        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);
        self.set_state(DetectorState::Active, None);

        let ctx = WorkerContext {
            reader: Arc::clone(&reader),
            spotter,
            sample_rate: self.config.sample_rate,
            chunk_words: self.config.chunk_words.max(1),
            running: Arc::clone(&self.running),
            detection_tx: self.detection_tx.clone(),
            state_tx: self.state_tx.clone(),
            state: Arc::clone(&self.state),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name(format!("kwd-{}", self.config.keyword))
            .spawn(move || {
                worker::run(ctx);
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                self.set_state(DetectorState::Error, Some(e.to_string()));
                VoxlaneError::Io(e)
            })?;

        info!(keyword = %self.config.keyword, reader = reader.id(), "detector started");
        *current = Some(Running { reader, handle });
        Ok(())
    }

    /// Stop the worker and release its reader slot.
    ///
    /// # Errors
    /// - `NotRunning` if no worker is active.
    /// - `Other` if the worker thread panicked; the state becomes `Error`.
    pub fn stop(&self) -> Result<()> {
        let mut current = self.worker.lock();
        let was_running = self.running.swap(false, Ordering::SeqCst);
        // A worker that exited on its own still holds its reader slot.
        let mut panicked = false;
        if let Some(Running { reader, handle }) = current.take() {
            reader.close();
            panicked = handle.join().is_err();
        }
        if panicked {
            warn!("detector worker panicked");
            self.set_state(DetectorState::Error, Some("detector worker panicked".into()));
            return Err(VoxlaneError::Other(anyhow::anyhow!(
                "detector worker for \"{}\" panicked",
                self.config.keyword
            )));
        }
        if !was_running {
            return Err(VoxlaneError::NotRunning);
        }
        self.set_state(DetectorState::StreamClosed, None);
        info!("detector stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current detector state (snapshot).
    pub fn state(&self) -> DetectorState {
        *self.state.lock()
    }

    /// Subscribe to keyword detections.
    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionEvent> {
        self.detection_tx.subscribe()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<DetectorStateEvent> {
        self.state_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn set_state(&self, state: DetectorState, detail: Option<String>) {
        *self.state.lock() = state;
        let _ = self.state_tx.send(DetectorStateEvent { state, detail });
    }
}

impl Drop for KeywordDetector {
    fn drop(&mut self) {
        if let Some(Running { reader, handle }) = self.worker.get_mut().take() {
            self.running.store(false, Ordering::SeqCst);
            reader.close();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::detect::{AudioChunk, Detection, EnergySpotter};
    use crate::stream::WriterPolicy;

    #[test]
    fn rejects_non_pcm16_streams() {
        let stream = Stream::create(64, 4, 1).expect("stream");
        let detector = KeywordDetector::new(DetectorConfig::default());
        assert!(matches!(
            detector.start(&stream, Box::new(EnergySpotter::default())),
            Err(VoxlaneError::IncompatibleFormat(_))
        ));
        assert_eq!(detector.state(), DetectorState::StreamClosed);
    }

    #[test]
    fn start_stop_is_guarded() {
        let stream = Stream::create(64, 2, 1).expect("stream");
        let detector = KeywordDetector::new(DetectorConfig::default());
        assert!(matches!(detector.stop(), Err(VoxlaneError::NotRunning)));

        detector
            .start(&stream, Box::new(EnergySpotter::default()))
            .expect("start");
        assert_eq!(detector.state(), DetectorState::Active);
        assert_eq!(stream.active_readers(), 1);
        assert!(matches!(
            detector.start(&stream, Box::new(EnergySpotter::default())),
            Err(VoxlaneError::AlreadyRunning)
        ));

        detector.stop().expect("stop");
        assert_eq!(stream.active_readers(), 0);
        assert!(!detector.is_running());
    }

    struct PanickingSpotter;

    impl KeywordSpotter for PanickingSpotter {
        fn process(&mut self, _chunk: &AudioChunk) -> Option<Detection> {
            panic!("spotter failure");
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn worker_panic_is_reported_by_stop() {
        let stream = Stream::create(64, 2, 1).expect("stream");
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .expect("writer");
        let detector = KeywordDetector::new(DetectorConfig::default());
        detector
            .start(&stream, Box::new(PanickingSpotter))
            .expect("start");

        writer.write(&[0u8; 32], 16).expect("write");
        let deadline = Instant::now() + Duration::from_secs(5);
        while detector.diagnostics_snapshot().reads == 0 {
            assert!(Instant::now() < deadline, "worker never read");
            thread::sleep(Duration::from_millis(2));
        }

        let err = detector.stop().expect_err("panic must surface");
        assert!(matches!(err, VoxlaneError::Other(_)));
        assert!(err.to_string().contains("panicked"));
        assert_eq!(detector.state(), DetectorState::Error);
        assert_eq!(stream.active_readers(), 0);
        assert!(matches!(detector.stop(), Err(VoxlaneError::NotRunning)));
    }

    #[test]
    fn no_free_slot_is_surfaced() {
        let stream = Stream::create(64, 2, 1).expect("stream");
        let _occupant = stream
            .create_reader(ReaderPolicy::Nonblocking, StartPolicy::Now)
            .expect("occupant");
        let detector = KeywordDetector::new(DetectorConfig::default());
        assert!(matches!(
            detector.start(&stream, Box::new(EnergySpotter::default())),
            Err(VoxlaneError::NoFreeReaderSlot { .. })
        ));
        assert!(!detector.is_running());
    }
}
