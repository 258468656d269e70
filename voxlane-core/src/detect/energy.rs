//! Energy-based reference spotter: RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming chunk.
//! 2. If RMS ≥ `threshold` → open (or extend) a burst ending at this chunk,
//!    reload the hangover counter.
//! 3. If RMS < `threshold` and the hangover counter > 0 → keep the burst open,
//!    decrement the counter (tolerates short gaps between syllables).
//! 4. Otherwise close the burst. Bursts of at least `min_words` are reported
//!    with the absolute indices of their first and last loud words.
//!
//! This stands in for a real keyword engine: it exercises the detector
//! plumbing and index bookkeeping without any recognition model.

use super::{AudioChunk, Detection, KeywordSpotter};
use crate::config::DetectorConfig;
use crate::stream::Index;

#[derive(Debug, Clone)]
pub struct EnergySpotter {
    keyword: String,
    /// RMS amplitude threshold for activity.
    threshold: f32,
    /// Quiet chunks tolerated inside one burst.
    hangover_chunks: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
    /// Shortest burst reported, in words.
    min_words: u64,
    /// Index of the first loud word of the open burst.
    burst_begin: Option<Index>,
    /// One past the last loud word of the open burst.
    burst_end: Index,
}

impl EnergySpotter {
    pub fn new(
        keyword: impl Into<String>,
        threshold: f32,
        hangover_chunks: u32,
        min_words: u64,
    ) -> Self {
        Self {
            keyword: keyword.into(),
            threshold,
            hangover_chunks,
            hangover_counter: 0,
            min_words,
            burst_begin: None,
            burst_end: 0,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.keyword.clone(),
            config.energy_threshold,
            config.hangover_chunks,
            config.min_detection_words,
        )
    }

    /// Compute the root-mean-square of a sample slice.
    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    fn close_burst(&mut self) -> Option<Detection> {
        let begin = self.burst_begin.take()?;
        self.hangover_counter = 0;
        (self.burst_end - begin >= self.min_words).then(|| Detection {
            keyword: self.keyword.clone(),
            begin_index: begin,
            end_index: self.burst_end,
        })
    }
}

impl Default for EnergySpotter {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

impl KeywordSpotter for EnergySpotter {
    fn process(&mut self, chunk: &AudioChunk) -> Option<Detection> {
        if chunk.is_empty() {
            return None;
        }
        let rms = Self::rms(&chunk.samples);

        if rms >= self.threshold {
            self.burst_begin.get_or_insert(chunk.begin_index);
            self.burst_end = chunk.end_index();
            self.hangover_counter = self.hangover_chunks;
            None
        } else if self.burst_begin.is_some() && self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            None
        } else {
            self.close_burst()
        }
    }

    fn flush(&mut self) -> Option<Detection> {
        self.close_burst()
    }

    fn reset(&mut self) {
        self.burst_begin = None;
        self.hangover_counter = 0;
    }
}
