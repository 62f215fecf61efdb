use thiserror::Error;

/// Errors from storage operations (used by trait definitions in weft-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("conflict: {0}")]
    Conflict(String),
}
