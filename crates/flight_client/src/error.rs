//! # Decoder Error Types
//!
//! Every error here is `Clone`: one rejection is delivered to every waiter
//! of an id and to every value blocked on it.

use flight_wire::{ErrorSummary, ProtocolError, RefId};
use thiserror::Error;

/// Errors raised by a module loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleLoadError {
    /// The loader does not know the locator.
    #[error("module {0:?} not found")]
    NotFound(String),

    /// The loader found the module but could not load it.
    #[error("loading module {locator:?} failed: {reason}")]
    Failed {
        /// Module locator.
        locator: String,
        /// Loader message.
        reason: String,
    },

    /// The load was cancelled before it finished.
    #[error("loading module {0:?} was cancelled")]
    Cancelled(String),
}

/// Why an id was rejected, or why a response failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The server reported an error for the id.
    #[error("{}", .0.message)]
    Remote(ErrorSummary),

    /// The module behind a client reference failed to load.
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),

    /// The stream broke the wire contract.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The stream ended before the id resolved.
    #[error("incomplete stream: id {0} never resolved")]
    IncompleteStream(RefId),

    /// The transport failed.
    #[error("stream failed: {0}")]
    Transport(String),

    /// The consumer aborted the response.
    #[error("response aborted: {0}")]
    Aborted(String),

    /// Bytes arrived after the response closed.
    #[error("response already closed")]
    Closed,
}

impl DecodeError {
    /// Digest attached by the server, for remote errors.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        match self {
            Self::Remote(summary) => summary.digest.as_deref(),
            _ => None,
        }
    }
}

/// Result type for decoder operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
