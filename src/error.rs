//! Error types for modaldb.
//!
//! A single error enum covers the whole engine; adapter errors propagate
//! unchanged. Validation errors are raised at the API boundary before any
//! state is mutated.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A vector's length does not match the configured store dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The configured dimension.
        expected: usize,
        /// The offending vector's length.
        actual: usize,
    },

    /// The adapter does not implement the configured distance metric.
    #[error("metric {metric} is not supported by index '{index}'")]
    UnsupportedMetric {
        /// Name of the rejecting index algorithm.
        index: String,
        /// The requested metric, as displayed.
        metric: String,
    },

    /// The adapter rejects an optional operation (mutation, range search).
    #[error("{index} does not support {operation}")]
    UnsupportedOperation {
        /// Name of the rejecting index algorithm.
        index: String,
        /// The rejected operation.
        operation: &'static str,
    },

    /// Search was attempted on an untrained index with no fallback data.
    #[error("index is not trained; call train_index() or build_index() first")]
    NotTrained,

    /// Invalid configuration: zero dimension, contradictory parameters,
    /// or an unknown algorithm name.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A persisted artifact failed structural validation.
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// Batch inputs with misaligned lengths.
    #[error("input size mismatch: {0}")]
    InputSizeMismatch(String),

    /// Underlying I/O failure during save or load.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a dimension check against a configured dimension.
    pub fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(Error::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dimension_ok() {
        assert!(Error::check_dimension(4, 4).is_ok());
    }

    #[test]
    fn test_check_dimension_mismatch() {
        let err = Error::check_dimension(4, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(err.to_string(), "dimension mismatch: expected 4, got 3");
    }

    #[test]
    fn test_unsupported_operation_message() {
        let err = Error::UnsupportedOperation {
            index: "hnsw".into(),
            operation: "range search",
        };
        assert_eq!(err.to_string(), "hnsw does not support range search");
    }
}
