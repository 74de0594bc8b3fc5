//! Error types shared by all processing stages

use thiserror::Error;

/// Errors returned by mask estimation, despiking and event-response extraction
#[derive(Debug, Error)]
pub enum QcError {
    /// Invalid parameters or a statistics routine that cannot produce a value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Input data that cannot be processed (degenerate, empty or non-finite)
    #[error("Data error: {0}")]
    Data(String),

    /// Arrays whose shapes do not agree
    #[error("Input shape error in {context}: expected {expected}, found {found}")]
    InputShape {
        context: String,
        expected: String,
        found: String,
    },

    /// File or NIfTI read/write failure
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QcError {
    pub(crate) fn shape(context: &str, expected: impl ToString, found: impl ToString) -> Self {
        QcError::InputShape {
            context: context.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QcError>;
