//! Error types for 8-bit optimizer operations.

use thiserror::Error;

/// Result type alias for 8-bit optimizer operations.
pub type Result<T> = std::result::Result<T, OptimError>;

/// A persisted state field that could not be decoded.
///
/// Carries enough context for the caller to decide between aborting the load
/// and resetting the affected parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    /// Id of the parameter whose state entry failed.
    pub param_id: usize,
    /// State field that failed (`exp_avg`, `exp_avg_sq`, ...).
    pub field: String,
    /// Keys observed in the offending payload (empty for non-object values).
    pub observed_keys: Vec<String>,
    /// Why the payload was rejected.
    pub reason: String,
}

impl std::fmt::Display for ImportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "param {} field '{}': {} (keys={:?})",
            self.param_id, self.field, self.reason, self.observed_keys
        )
    }
}

/// Errors that can occur while building, stepping or persisting the optimizer.
#[derive(Debug, Error)]
pub enum OptimError {
    /// Invalid hyperparameter or construction argument.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A moment field is neither a live quantized tensor nor a known encoding.
    #[error(
        "state corruption: param {param_id} field '{field}' has unsupported shape (keys={observed_keys:?})"
    )]
    StateCorruption {
        /// Parameter id.
        param_id: usize,
        /// Offending state field.
        field: String,
        /// Keys observed in the raw payload.
        observed_keys: Vec<String>,
    },

    /// A persisted payload could not be decoded.
    #[error("import error: {0}")]
    Import(ImportFailure),

    /// A persisted quantized snapshot failed validation.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Unknown parameter id or a parameter that does not support the operation.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A buffer to be quantized holds NaN or infinite values.
    #[error("non-finite values: {0}")]
    NonFinite(String),

    /// Element type not supported by the requested operation.
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// Shape mismatch between a buffer and its owning parameter.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ImportFailure> for OptimError {
    fn from(failure: ImportFailure) -> Self {
        Self::Import(failure)
    }
}
