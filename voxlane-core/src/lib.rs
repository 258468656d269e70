//! # voxlane-core
//!
//! Shared audio data stream for voice-interaction clients: one writer, many
//! independent readers, absolute indices.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture ─┐
//! WAV file → write_wav_file ─┴→ Writer ─→ Stream (circular, C words)
//!                                            │
//!                     ┌──────────────────────┼──────────────────────┐
//!                  Reader                 Reader                 Reader
//!               (KeywordDetector)      (cloud upload)         (local VAD…)
//!                     │
//!      broadcast::Sender<DetectionEvent { begin_index, end_index }>
//! ```
//!
//! Every word has an absolute index, so a detection reported by one reader
//! can be replayed by another that seeks to `begin_index`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod stream;

// Convenience re-exports for downstream crates
pub use config::{DetectorConfig, StreamConfig, VoxlaneConfig};
pub use detect::{EnergySpotter, KeywordDetector, KeywordSpotter};
pub use error::{Result, VoxlaneError};
pub use events::{DetectionEvent, DetectorState, DetectorStateEvent};
pub use stream::{
    Backpressure, BufferLayout, Index, Reader, ReaderPolicy, Seek, StartPolicy, Stream, Writer,
    WriterPolicy,
};
