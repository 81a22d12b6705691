use thiserror::Error;

#[derive(Debug, Error)]
pub enum StructuringError {
    #[error("Invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Date error: {0}")]
    DateError(String),

    #[error("Optimization infeasible: {0}")]
    OptimizationInfeasible(String),

    #[error("Run cancelled before any structure was found")]
    Cancelled,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StructuringError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StructuringError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StructuringError {
    fn from(e: serde_json::Error) -> Self {
        StructuringError::SerializationError(e.to_string())
    }
}
