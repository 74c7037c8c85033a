//! # Encoder Error Types
//!
//! All errors that can occur while rendering a model into rows.

use flight_wire::WireError;
use thiserror::Error;

/// A computation supplied by the application failed.
///
/// Returned by component callables and deferred futures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UpstreamError {
    /// Message surfaced to the client (unless redacted).
    pub message: String,
}

impl UpstreamError {
    /// Creates an upstream error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur while encoding a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A function value that the client manifest does not know.
    #[error("function {0:?} is not registered in the client manifest")]
    UnregisteredFunction(String),

    /// A back reference whose target was already dropped.
    #[error("back reference target was dropped before encoding")]
    DanglingBackRef,

    /// A deferred value whose future was taken by another request.
    #[error("deferred value was already consumed by another request")]
    DeferredConsumed,

    /// Too many deferred tasks outstanding at once.
    #[error("pending task limit of {0} exceeded")]
    TooManyTasks(usize),

    /// The application's computation failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The request was aborted from outside.
    #[error("request aborted: {0}")]
    Aborted(String),

    /// A deferred task panicked.
    #[error("deferred task panicked")]
    TaskPanicked,

    /// `run` was called on a request that already ran.
    #[error("request already started")]
    AlreadyStarted,

    /// The chunk writer refused a chunk.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl EncodeError {
    /// Returns true for errors raised by the value being encoded rather than
    /// by the request machinery.
    #[must_use]
    pub const fn is_subtree_failure(&self) -> bool {
        matches!(
            self,
            Self::UnregisteredFunction(_)
                | Self::DanglingBackRef
                | Self::DeferredConsumed
                | Self::TooManyTasks(_)
                | Self::Upstream(_)
        )
    }
}

/// Result type for encoder operations.
pub type EncodeResult<T> = Result<T, EncodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_transparent() {
        let err = EncodeError::from(UpstreamError::new("boom"));
        assert_eq!(err.to_string(), "boom");
        assert!(err.is_subtree_failure());
    }

    #[test]
    fn test_machinery_errors_are_not_subtree_failures() {
        assert!(!EncodeError::Aborted("shutdown".into()).is_subtree_failure());
        assert!(!EncodeError::Wire(WireError::Closed).is_subtree_failure());
    }
}
