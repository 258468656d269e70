use thiserror::Error;

use crate::stream::Index;

/// All errors produced by voxlane-core.
#[derive(Debug, Error)]
pub enum VoxlaneError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a writer is already attached to this stream")]
    WriterAlreadyExists,

    #[error("all {max_readers} reader slots are in use")]
    NoFreeReaderSlot { max_readers: usize },

    #[error("stream is closed for this writer")]
    StreamClosed,

    #[error("reader has been closed")]
    ReaderClosed,

    /// The reader was lapped by the writer. Its cursor now sits at `resume_at`.
    #[error("reader overrun, resuming at index {resume_at}")]
    Overrun { resume_at: Index },

    #[error("index {index} outside retained window [{oldest}, {newest}]")]
    InvalidIndex {
        index: Index,
        oldest: Index,
        newest: Index,
    },

    #[error("buffer too small: need {needed} bytes, got {provided}")]
    ShortBuffer { needed: usize, provided: usize },

    #[error("incompatible audio format: {0}")]
    IncompatibleFormat(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("detector is already running")]
    AlreadyRunning,

    #[error("detector is not running")]
    NotRunning,

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxlaneError>;
