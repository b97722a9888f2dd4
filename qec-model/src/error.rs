//! Error types for model validation.

/// Error types for principle and conflict data.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Principle data is malformed
    #[error("Invalid principle: {0}")]
    InvalidPrinciple(String),

    /// Conflict data is malformed
    #[error("Invalid conflict: {0}")]
    InvalidConflict(String),

    /// Criterion text could not be translated
    #[error("Invalid criterion: {0}")]
    InvalidCriterion(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
