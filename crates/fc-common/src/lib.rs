//! Shared error types for the change-stream processing stack.

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("change stream error: {0}")]
    ChangeStream(#[from] mongodb::error::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("document field access error: {0}")]
    FieldAccess(#[from] bson::document::ValueAccessError),
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
