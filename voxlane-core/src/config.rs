//! Configuration (JSON file, camelCase keys, every field optional).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::stream::Backpressure;

/// Upper bound on reader slots accepted from configuration.
pub const MAX_READER_SLOTS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct VoxlaneConfig {
    pub stream: StreamConfig,
    pub detector: DetectorConfig,
}

/// Geometry and backpressure of a shared stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct StreamConfig {
    /// Capacity in words. Default: 2^18 (≈16 s of 16 kHz mono).
    pub capacity_words: usize,
    /// Bytes per word. Default: 2 (16-bit mono PCM).
    pub word_size: usize,
    /// Maximum simultaneous readers. Default: 10.
    pub max_readers: usize,
    /// Readers a Blockable writer waits for.
    pub backpressure: Backpressure,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity_words: 1 << 18,
            word_size: 2,
            max_readers: 10,
            backpressure: Backpressure::BlockingReaders,
        }
    }
}

/// Settings for the energy keyword detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct DetectorConfig {
    /// Label reported with each detection.
    pub keyword: String,
    /// Sample rate of the stream in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Words pulled per read. Default: 320 (20 ms at 16 kHz).
    pub chunk_words: usize,
    /// RMS level (normalised to [0, 1]) that counts as activity. Default: 0.02.
    pub energy_threshold: f32,
    /// Quiet chunks tolerated inside one detection. Default: 8.
    pub hangover_chunks: u32,
    /// Shortest burst reported, in words. Default: 3200 (200 ms).
    pub min_detection_words: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keyword: "wake".into(),
            sample_rate: 16_000,
            chunk_words: 320,
            energy_threshold: 0.02,
            hangover_chunks: 8,
            min_detection_words: 3_200,
        }
    }
}

impl VoxlaneConfig {
    /// Clamp every field into a usable range.
    pub fn normalize(&mut self) {
        let stream = &mut self.stream;
        stream.capacity_words = stream.capacity_words.max(1);
        stream.word_size = stream.word_size.clamp(1, 64);
        stream.max_readers = stream.max_readers.clamp(1, MAX_READER_SLOTS);

        let detector = &mut self.detector;
        let keyword = detector.keyword.trim();
        detector.keyword = if keyword.is_empty() {
            DetectorConfig::default().keyword
        } else {
            keyword.to_string()
        };
        detector.sample_rate = detector.sample_rate.clamp(8_000, 192_000);
        detector.chunk_words = detector.chunk_words.clamp(16, stream.capacity_words.max(16));
        detector.energy_threshold = if detector.energy_threshold.is_finite() {
            detector.energy_threshold.clamp(0.0001, 1.0)
        } else {
            DetectorConfig::default().energy_threshold
        };
        detector.hangover_chunks = detector.hangover_chunks.min(1_000);
    }
}

/// Parse configuration from a JSON string and normalise it.
pub fn parse_config(raw: &str) -> Result<VoxlaneConfig> {
    let mut config: VoxlaneConfig = serde_json::from_str(raw)?;
    config.normalize();
    Ok(config)
}

/// Load configuration from `path`. A missing or malformed file yields the
/// defaults.
pub fn load_config(path: &Path) -> VoxlaneConfig {
    let loaded = fs::read_to_string(path)
        .map_err(crate::error::VoxlaneError::from)
        .and_then(|raw| parse_config(&raw));
    match loaded {
        Ok(config) => {
            info!(path = %path.display(), "configuration loaded");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), "using default configuration: {e}");
            let mut config = VoxlaneConfig::default();
            config.normalize();
            config
        }
    }
}

pub fn save_config(path: &Path, config: &VoxlaneConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_field_defaults() {
        let config = parse_config(r#"{ "stream": { "capacityWords": 100 } }"#)
            .expect("parse config");
        assert_eq!(config.stream.capacity_words, 100);
        assert_eq!(config.stream.word_size, 2);
        assert_eq!(config.stream.backpressure, Backpressure::BlockingReaders);
        assert_eq!(config.detector, {
            let mut d = DetectorConfig::default();
            d.chunk_words = 100;
            d
        });
    }

    #[test]
    fn backpressure_uses_camel_case() {
        let config = parse_config(r#"{ "stream": { "backpressure": "allReaders" } }"#)
            .expect("parse config");
        assert_eq!(config.stream.backpressure, Backpressure::AllReaders);
        assert!(parse_config(r#"{ "stream": { "backpressure": "AllReaders" } }"#).is_err());
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut config = VoxlaneConfig::default();
        config.stream.capacity_words = 0;
        config.stream.max_readers = 1_000;
        config.detector.keyword = "   ".into();
        config.detector.energy_threshold = f32::NAN;
        config.normalize();

        assert_eq!(config.stream.capacity_words, 1);
        assert_eq!(config.stream.max_readers, MAX_READER_SLOTS);
        assert_eq!(config.detector.keyword, "wake");
        assert_eq!(config.detector.energy_threshold, 0.02);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("voxlane.json");
        let mut config = VoxlaneConfig::default();
        config.stream.max_readers = 3;
        config.detector.keyword = "hey".into();

        save_config(&path, &config).expect("save");
        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("absent.json"));
        assert_eq!(config, VoxlaneConfig::default());
    }
}
