use thiserror::Error;

use crate::spec::CacheKey;

/// Library error type for pipeline setup and control.
#[derive(Debug, Error)]
pub enum Error {
    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A decode worker thread could not be started.
    #[error("failed to spawn decode worker {name}: {origin}")]
    Spawn {
        name: String,
        origin: std::io::Error,
    },

    /// The coordinator task has stopped and no longer accepts commands.
    #[error("coordinator is no longer running")]
    CoordinatorClosed,
}

/// Terminal failure delivered to watchers in place of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("fetch of {origin} failed: {reason}")]
    FetchFailed { origin: String, reason: String },

    #[error("decode of {key} failed: {reason}")]
    DecodeFailed { key: String, reason: String },

    /// The request was withdrawn; not a real failure.
    #[error("request cancelled")]
    Cancelled,

    /// Soft condition: every resident entry is pinned and the cache sits over budget.
    #[error("cache over budget: {resident} resident bytes, budget {budget}")]
    BudgetExceeded { resident: usize, budget: usize },
}

impl LoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failures of the pixel decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("resize: {0}")]
    Resize(String),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("source contains no image data")]
    Empty,

    #[error("decoder panicked: {0}")]
    Panicked(String),
}

impl DecodeError {
    pub fn into_load_error(self, key: &CacheKey) -> LoadError {
        LoadError::DecodeFailed {
            key: key.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Misuse of the reference-count table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("reference released for {0} but none is held")]
    RefUnderflow(String),
}
