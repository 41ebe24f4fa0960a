//! Error types for stratavec
//!
//! Every fallible operation in the index layer returns [`IndexError`].
//! Failures raised by the engine are converted at the component boundary,
//! so callers only ever see this taxonomy.

use std::io;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Error taxonomy of the index layer
#[derive(Debug, Error)]
pub enum IndexError {
    /// No sub-index is present (nothing built or loaded)
    #[error("index is empty")]
    EmptyIndex,

    /// Operation requires a trained index
    #[error("index is not trained")]
    NotTrained,

    /// Training was requested on an index that is already trained
    #[error("index is already trained")]
    AlreadyTrained,

    /// Missing required parameter, unsupported encoding, or inconsistent
    /// filter/partition state
    #[error("invalid args: {0}")]
    InvalidArgs(String),

    /// A serialized blob is missing, truncated, or internally inconsistent
    #[error("invalid serialized blob: {0}")]
    InvalidSerializedBlob(String),

    /// The engine could not identify the serialized index type
    #[error("invalid serialized index type: {0}")]
    UnrecognizedIndexType(String),

    /// Any failure raised inside the engine, message preserved
    #[error("inner engine error: {0}")]
    InnerEngine(String),

    /// Operation not supported by this index variant
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A label is outside the store's label space
    #[error("unknown label: {label}")]
    UnknownLabel {
        /// The offending external label
        label: i64,
    },

    /// Query or data dimension does not match the index
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension of the index
        expected: usize,
        /// Dimension that was supplied
        got: usize,
    },

    /// Requested metric differs from the metric the index was built with
    #[error("invalid metric type: {0}")]
    InvalidMetricType(String),

    /// I/O error while reading a serialized index from disk
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IndexError {
    /// Shorthand for [`IndexError::InvalidArgs`]
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        IndexError::InvalidArgs(msg.into())
    }

    /// Check if this error was caused by caller input rather than engine state
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            IndexError::InvalidArgs(_)
                | IndexError::UnknownLabel { .. }
                | IndexError::DimensionMismatch { .. }
                | IndexError::InvalidMetricType(_)
        )
    }

    /// Check if this error came from decoding a persisted index
    pub fn is_deserialization_error(&self) -> bool {
        matches!(
            self,
            IndexError::InvalidSerializedBlob(_) | IndexError::UnrecognizedIndexType(_)
        )
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::InvalidArgs(format!("malformed config: {}", e))
    }
}
