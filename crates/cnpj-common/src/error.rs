//! Error types shared across the CNPJ workspace

use thiserror::Error;

/// Result type alias for CNPJ operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Failures that are not specific to a single pipeline stage
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Period not found: {0}")]
    PeriodNotFound(String),

    #[error("Invalid period format: {0} (expected YYYY-MM)")]
    InvalidPeriod(String),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Log file not found in {0}")]
    LogNotFound(String),
}

impl EtlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
