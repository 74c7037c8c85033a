//! # Wire Error Types
//!
//! Errors raised while framing rows (`WireError`), while interpreting an
//! incoming stream (`ProtocolError`) and while loading configuration files
//! (`ConfigError`).

use thiserror::Error;

use crate::id::RefId;

/// Errors raised by the chunk writer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The writer was closed, normally or with an error.
    #[error("chunk writer is closed")]
    Closed,

    /// A chunk was submitted with a sequence number that does not increase.
    #[error("chunk sequence {got} submitted after {previous}")]
    OutOfOrder {
        /// Last accepted sequence number.
        previous: u64,
        /// Rejected sequence number.
        got: u64,
    },
}

/// Result type for writer operations.
pub type WireResult<T> = Result<T, WireError>;

/// Violations of the wire contract.
///
/// A protocol error is always fatal to the response that observed it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The row id is not a hexadecimal integer.
    #[error("malformed row id after {rows} complete rows")]
    MalformedId {
        /// Number of rows parsed before the failure.
        rows: u64,
    },

    /// A length-delimited segment carries a malformed length.
    #[error("malformed segment length in row {0}")]
    MalformedLength(RefId),

    /// A row, a declared segment length or an outlined value grew past the
    /// configured limit.
    #[error("row {id} exceeds the maximum row length of {max} bytes")]
    RowTooLong {
        /// Row id.
        id: RefId,
        /// Configured limit.
        max: usize,
    },

    /// The payload is not valid JSON.
    #[error("row {id}: invalid JSON payload: {reason}")]
    InvalidJson {
        /// Row id.
        id: RefId,
        /// Parser message.
        reason: String,
    },

    /// A `$`-prefixed string that is not a known sentinel.
    #[error("unknown sentinel {0:?}")]
    UnknownSentinel(String),

    /// A second resolution for an id that is already settled.
    #[error("id {0} resolved more than once")]
    DuplicateResolution(RefId),

    /// A placeholder row for an id whose content already arrived.
    #[error("placeholder for id {0} arrived after its content")]
    LatePlaceholder(RefId),

    /// A placeholder row with a payload.
    #[error("placeholder row {0} carries a payload")]
    PlaceholderPayload(RefId),

    /// A text segment that is not UTF-8.
    #[error("text segments of row {0} are not valid UTF-8")]
    InvalidUtf8(RefId),

    /// Text and binary segments mixed for one id.
    #[error("row {0} mixes text and binary segments")]
    MixedSegments(RefId),

    /// A lookup for an id that never appeared before the stream closed.
    #[error("reference to unknown id {0} after the stream closed")]
    UnknownReference(RefId),

    /// The stream ended in the middle of a row.
    #[error("stream ended in the middle of a row")]
    TruncatedRow,
}

/// Result type for decoding operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while loading TOML configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {reason}")]
    Io {
        /// Path that was read.
        path: String,
        /// OS error message.
        reason: String,
    },

    /// The document is not valid TOML for the expected shape.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl ConfigError {
    /// Wraps an I/O failure for `path`.
    #[must_use]
    pub fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
