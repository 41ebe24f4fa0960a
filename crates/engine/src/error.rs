//! Error types for the HNSW engine

use stratavec_core::IndexError;
use thiserror::Error;

/// Errors raised inside the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Serialized blob does not start with a known index fourcc
    #[error("Index type 0x{fourcc:08x} (\"{name}\") not recognized")]
    UnrecognizedType {
        /// The fourcc read from the blob
        fourcc: u32,
        /// Printable rendering of the fourcc
        name: String,
    },

    /// Serialized blob is truncated or inconsistent
    #[error("Corrupt index data: {0}")]
    Corrupt(String),

    /// Vector dimension does not match the index
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension of the index
        expected: usize,
        /// Dimension supplied
        got: usize,
    },

    /// Quantizer could not be trained on the supplied rows
    #[error("Training failed: {0}")]
    Training(String),

    /// Parameter outside the range the engine supports
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Storage attached to a graph does not describe the same rows
    #[error("Storage mismatch: {0}")]
    StorageMismatch(String),

    /// Operation not available for this storage kind
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Conversion to IndexError
// =============================================================================

impl From<EngineError> for IndexError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnrecognizedType { .. } => IndexError::UnrecognizedIndexType(e.to_string()),
            EngineError::DimensionMismatch { expected, got } => {
                IndexError::DimensionMismatch { expected, got }
            }
            EngineError::Unsupported(msg) => IndexError::NotImplemented(msg),
            other => IndexError::InnerEngine(other.to_string()),
        }
    }
}
