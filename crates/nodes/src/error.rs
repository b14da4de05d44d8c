//! Collaborator-level error type.

use thiserror::Error;

/// Errors returned by tools, model providers and sandboxes.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: transport or availability problem; retried with back-off.
/// - `Fatal`: permanent failure; surfaced immediately.
/// - `SandboxViolation`: the sandbox refused the code; never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Transient failure; the engine may try again.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The sandbox rejected the code (disallowed import, resource limit, ...).
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
