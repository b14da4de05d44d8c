//! Typed error type for the memory crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The external backend failed (connection, storage, ...).
    #[error("memory backend error: {0}")]
    Backend(String),

    /// A stored value did not decode into the expected record shape.
    #[error("memory serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
