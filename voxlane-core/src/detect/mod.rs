//! Keyword detection on top of a stream reader.
//!
//! The `KeywordSpotter` trait is the extensibility point: a vendor engine, a
//! neural model or the bundled [`EnergySpotter`] plug into the same worker
//! loop without touching the stream. Spotters see absolute indices, so a
//! detection can be correlated with the stream after the fact (e.g. to stream
//! audio from `begin_index` to the cloud).

pub mod energy;
pub mod engine;
pub mod worker;

pub use energy::EnergySpotter;
pub use engine::KeywordDetector;

use crate::stream::Index;

/// Bytes per word the detectors accept: 16-bit little-endian mono PCM.
pub const PCM16_WORD_SIZE: usize = 2;

/// A contiguous block of mono samples and where it sits in the stream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Samples normalised to [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Absolute index of `samples[0]`.
    pub begin_index: Index,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, begin_index: Index) -> Self {
        Self {
            samples,
            sample_rate,
            begin_index,
        }
    }

    /// Decode little-endian 16-bit PCM words.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32, begin_index: Index) -> Self {
        let samples = bytes
            .chunks_exact(PCM16_WORD_SIZE)
            .map(|w| i16::from_le_bytes([w[0], w[1]]) as f32 / 32768.0)
            .collect();
        Self::new(samples, sample_rate, begin_index)
    }

    /// Absolute index one past the last sample.
    pub fn end_index(&self) -> Index {
        self.begin_index + self.samples.len() as Index
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A keyword located in absolute stream indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub keyword: String,
    pub begin_index: Index,
    pub end_index: Index,
}

/// Contract for keyword recognition backends.
///
/// Implementors are stateful; the worker calls `reset` whenever the stream
/// skips (overrun) so no detection straddles a gap.
pub trait KeywordSpotter: Send + 'static {
    /// Feed the next chunk. Chunks arrive in index order without gaps, except
    /// across a `reset`.
    fn process(&mut self, chunk: &AudioChunk) -> Option<Detection>;

    /// Report a detection still in progress at end of stream, if any.
    fn flush(&mut self) -> Option<Detection> {
        None
    }

    /// Discard all internal recognition state.
    fn reset(&mut self);
}
