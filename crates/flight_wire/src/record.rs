//! # Records and Chunks
//!
//! A [`Row`] is one record on the wire. A [`Chunk`] is a row stamped with the
//! per-request sequence number it was emitted under.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::RefId;

/// Kind of a wire record, selected by the tag byte after the colon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// JSON content (no tag byte).
    Model,
    /// Client reference metadata (`I`).
    ClientReference,
    /// Placeholder for content that follows later (`P`).
    Placeholder,
    /// Error summary (`E`).
    Error,
    /// Length-delimited UTF-8 text segment (`T`).
    Text,
    /// Length-delimited binary segment (`B`).
    Binary,
}

impl RecordKind {
    /// Returns the tag byte, or `None` for plain content rows.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> Option<u8> {
        match self {
            Self::Model => None,
            Self::ClientReference => Some(b'I'),
            Self::Placeholder => Some(b'P'),
            Self::Error => Some(b'E'),
            Self::Text => Some(b'T'),
            Self::Binary => Some(b'B'),
        }
    }

    /// Maps a tag byte to its kind. Any other byte starts a content row.
    #[inline]
    #[must_use]
    pub const fn from_tag(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(Self::ClientReference),
            b'P' => Some(Self::Placeholder),
            b'E' => Some(Self::Error),
            b'T' => Some(Self::Text),
            b'B' => Some(Self::Binary),
            _ => None,
        }
    }

    /// Returns true for kinds framed by a hex length instead of a newline.
    #[inline]
    #[must_use]
    pub const fn is_length_delimited(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// One record on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    /// Id the record applies to.
    pub id: RefId,
    /// Payload interpretation.
    pub kind: RecordKind,
    /// Raw payload (without tag, length prefix or trailing newline).
    pub payload: Vec<u8>,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub fn new(id: RefId, kind: RecordKind, payload: Vec<u8>) -> Self {
        Self { id, kind, payload }
    }

    /// Content row carrying a JSON value.
    #[must_use]
    pub fn model(id: RefId, json: &serde_json::Value) -> Self {
        Self::new(id, RecordKind::Model, json.to_string().into_bytes())
    }

    /// Placeholder row.
    #[must_use]
    pub fn placeholder(id: RefId) -> Self {
        Self::new(id, RecordKind::Placeholder, Vec::new())
    }

    /// Error row.
    #[must_use]
    pub fn error(id: RefId, summary: &ErrorSummary) -> Self {
        Self::new(id, RecordKind::Error, summary.to_json_bytes())
    }

    /// Client reference row.
    #[must_use]
    pub fn client_reference(id: RefId, metadata: &ClientReferenceMetadata) -> Self {
        Self::new(id, RecordKind::ClientReference, metadata.to_json_bytes())
    }

    /// Number of bytes this row occupies once framed.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let id_digits = hex_digits(u64::from(self.id.get()));
        let tag = usize::from(self.kind.tag().is_some());
        if self.kind.is_length_delimited() {
            id_digits + 1 + tag + hex_digits(self.payload.len() as u64) + 1 + self.payload.len()
        } else {
            id_digits + 1 + tag + self.payload.len() + 1
        }
    }

    /// Appends the framed row to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(format!("{}:", self.id).as_bytes());
        if let Some(tag) = self.kind.tag() {
            out.push(tag);
        }
        if self.kind.is_length_delimited() {
            out.extend_from_slice(format!("{:x},", self.payload.len()).as_bytes());
            out.extend_from_slice(&self.payload);
        } else {
            out.extend_from_slice(&self.payload);
            out.push(b'\n');
        }
    }

    /// Returns the framed row as a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Parses the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] when the payload does not parse.
    pub fn json(&self) -> ProtocolResult<serde_json::Value> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::InvalidJson {
            id: self.id,
            reason: e.to_string(),
        })
    }
}

/// A row emitted under a per-request sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Strictly increasing per request.
    pub sequence: u64,
    /// The record.
    pub row: Row,
}

impl Chunk {
    /// Creates a chunk.
    #[must_use]
    pub const fn new(sequence: u64, row: Row) -> Self {
        Self { sequence, row }
    }

    /// Record kind of the wrapped row.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.row.kind
    }
}

/// Serializable summary carried by `E` rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Human readable message (possibly redacted).
    pub message: String,
    /// Opaque digest that lets the server correlate the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ErrorSummary {
    /// Creates a summary without digest.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            digest: None,
        }
    }

    /// Sets the digest.
    #[must_use]
    pub fn with_digest(mut self, digest: Option<String>) -> Self {
        self.digest = digest;
        self
    }

    fn to_json_bytes(&self) -> Vec<u8> {
        // A struct of two strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Metadata carried by `I` rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientReferenceMetadata {
    /// Module locator, understood only by the module loader.
    pub id: String,
    /// Named export within the module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Bound arguments, encoded like any other content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bound: Vec<serde_json::Value>,
}

impl ClientReferenceMetadata {
    fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

const fn hex_digits(mut value: u64) -> usize {
    let mut digits = 1;
    while value >= 16 {
        value /= 16;
        digits += 1;
    }
    digits
}
