//! Error types for gampoi_transform

use thiserror::Error;

/// Main error type for transformation operations
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Invalid input kind: {reason}")]
    InvalidInputKind { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Invalid size factors: {reason}")]
    InvalidSizeFactor { reason: String },

    #[error("Unsupported residual kind '{kind}'. Use one of: pearson, randomized_quantile, deviance, working, response, quantile")]
    UnsupportedResidualKind { kind: String },

    #[error("Model fit failed: {reason}")]
    ModelFit { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for transformation operations
pub type Result<T> = std::result::Result<T, TransformError>;
