//! Error types for detector training, scoring and persistence.
//!
//! Errors fall into three families:
//!
//! - configuration errors ([`WardenError::Config`], [`WardenError::Unsupported`],
//!   [`WardenError::InvalidHyperparameter`]) surfaced to the user unchanged,
//! - numerical errors ([`WardenError::NonFiniteScore`]) raised instead of
//!   propagating NaN/Inf into downstream metrics,
//! - state errors ([`WardenError::State`], [`WardenError::MissingKey`]) which
//!   signal a broken caller contract.

use thiserror::Error;

/// Main error type for warden operations.
///
/// # Examples
///
/// ```
/// use warden::error::WardenError;
///
/// let err = WardenError::Unsupported("layerwise scores for finetuning".into());
/// assert!(err.to_string().contains("Unsupported operation"));
/// ```
#[derive(Debug, Error)]
pub enum WardenError {
    /// Missing or contradictory configuration (e.g. no trusted data supplied).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation does not exist for this detector kind.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A score came out as NaN or infinite.
    #[error("Non-finite score in {context}: {value}")]
    NonFiniteScore {
        /// Where the value was produced
        context: String,
        /// The offending value
        value: f64,
    },

    /// Accumulator or detector used out of order (update after finalize, ...).
    #[error("Invalid state: {0}")]
    State(String),

    /// A persisted detector state lacks a required tensor.
    #[error("Missing required key '{0}' in detector state")]
    MissingKey(String),

    /// Matrix/vector dimensions don't match for the operation.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensions description
        expected: String,
        /// Actual dimensions found
        actual: String,
    },

    /// Nothing to compute on.
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Invalid hyperparameter value provided.
    #[error("Invalid hyperparameter: {param} = {value}, expected {constraint}")]
    InvalidHyperparameter {
        /// Parameter name
        param: String,
        /// Provided value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// Invalid or corrupt detector file.
    #[error("Invalid detector file: {0}")]
    Format(String),

    /// Detector file written by a newer format.
    #[error("Unsupported format version: found {found}, supported {supported}")]
    UnsupportedVersion {
        /// Version found in the file
        found: String,
        /// Version this build reads
        supported: String,
    },

    /// Tensor payload digest does not match the header.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest recorded in the header
        expected: String,
        /// Digest of the data actually read
        actual: String,
    },

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Create a dimension mismatch error with descriptive context
    #[must_use]
    pub fn dimension_mismatch(context: &str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            expected: format!("{context}={expected}"),
            actual: format!("{actual}"),
        }
    }

    /// Create a non-finite score error
    #[must_use]
    pub fn non_finite(context: impl Into<String>, value: f64) -> Self {
        Self::NonFiniteScore {
            context: context.into(),
            value,
        }
    }

    /// Whether the error is a numerical (non-finite score) failure.
    #[must_use]
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::NonFiniteScore { .. })
    }
}

/// Convenience type alias for Results.
pub type Result<T> = std::result::Result<T, WardenError>;
