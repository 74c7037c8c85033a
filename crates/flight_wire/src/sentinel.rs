//! # String Sentinels
//!
//! JSON payloads carry references and values JSON cannot express as strings
//! starting with `$`:
//!
//! ```text
//! "$1f"         blocking reference to id 0x1f
//! "$@1f"        deferred reference to id 0x1f (non-blocking)
//! "$$text"      the literal string "$text"
//! "$NaN"  "$Infinity"  "$-Infinity"  "$-0"
//! "$undefined"
//! ```

use std::borrow::Cow;

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::RefId;

/// Sentinel for the absent value.
pub const UNDEFINED: &str = "$undefined";

/// A decoded `$`-prefixed string.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sentinel<'a> {
    /// Blocking reference to another id.
    Reference(RefId),
    /// Deferred (non-blocking) reference to another id.
    Deferred(RefId),
    /// Literal string that started with `$` before escaping.
    Escaped(&'a str),
    /// A float JSON cannot carry.
    Float(f64),
    /// The absent value.
    Undefined,
}

impl<'a> Sentinel<'a> {
    /// Classifies a JSON string.
    ///
    /// Returns `Ok(None)` for plain strings.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownSentinel`] for unrecognised `$` forms.
    pub fn parse(text: &'a str) -> ProtocolResult<Option<Self>> {
        let Some(rest) = text.strip_prefix('$') else {
            return Ok(None);
        };
        let sentinel = match rest {
            "NaN" => Self::Float(f64::NAN),
            "Infinity" => Self::Float(f64::INFINITY),
            "-Infinity" => Self::Float(f64::NEG_INFINITY),
            "-0" => Self::Float(-0.0),
            "undefined" => Self::Undefined,
            _ if rest.starts_with('$') => Self::Escaped(&text[1..]),
            _ => {
                if let Some(hex) = rest.strip_prefix('@') {
                    RefId::from_hex(hex).map(Self::Deferred)
                } else {
                    RefId::from_hex(rest).map(Self::Reference)
                }
                .ok_or_else(|| ProtocolError::UnknownSentinel(text.to_owned()))?
            }
        };
        Ok(Some(sentinel))
    }
}

/// Encodes a blocking reference.
#[must_use]
pub fn reference(id: RefId) -> String {
    format!("${id}")
}

/// Encodes a deferred reference.
#[must_use]
pub fn deferred(id: RefId) -> String {
    format!("$@{id}")
}

/// Escapes a plain string so it never reads as a sentinel.
#[must_use]
pub fn escape(text: &str) -> Cow<'_, str> {
    if text.starts_with('$') {
        Cow::Owned(format!("${text}"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Returns the sentinel for floats JSON cannot represent, if any.
#[must_use]
pub fn float(value: f64) -> Option<&'static str> {
    if value.is_nan() {
        Some("$NaN")
    } else if value == f64::INFINITY {
        Some("$Infinity")
    } else if value == f64::NEG_INFINITY {
        Some("$-Infinity")
    } else if value == 0.0 && value.is_sign_negative() {
        Some("$-0")
    } else {
        None
    }
}
