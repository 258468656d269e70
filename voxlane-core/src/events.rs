//! Events published by keyword detectors.
//!
//! All types serialise with camelCase fields so they can be forwarded to an
//! orchestration layer (e.g. to open a dialogue turn at `beginIndex`).

use serde::{Deserialize, Serialize};

use crate::stream::Index;

// ---------------------------------------------------------------------------
// Detection events
// ---------------------------------------------------------------------------

/// A keyword was spotted in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Keyword label reported by the spotter.
    pub keyword: String,
    /// Absolute index of the first word of the keyword.
    pub begin_index: Index,
    /// Absolute index one past the last word of the keyword.
    pub end_index: Index,
}

// ---------------------------------------------------------------------------
// Detector state events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStateEvent {
    pub state: DetectorState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Lifecycle of a keyword detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectorState {
    /// Not attached to an open stream, or the stream's writer closed and
    /// every word has been consumed.
    StreamClosed,
    /// Reading from the stream.
    Active,
    /// Stopped after an unrecoverable error.
    Error,
}
