//! # Incremental Row Parser
//!
//! Splits an arbitrarily chunked byte stream back into [`Row`]s.
//!
//! ## States
//!
//! ```text
//!   Id ──':'──> Tag ──I/P/E──────────> ByNewline ──'\n'──> (row) ──> Id
//!                │ ──T/B──> Length ──','──> ByLength ──len──> (row) ──> Id
//!                └─other byte (first JSON byte)──> ByNewline
//! ```
//!
//! Transport chunks may end anywhere, including inside the id, the length
//! prefix or a multi-byte UTF-8 sequence; the parser keeps the partial state
//! until the next call to [`RowParser::feed`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::{hex_value, RefId};
use crate::record::{RecordKind, Row};
use crate::DEFAULT_MAX_ROW_LENGTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    /// Reading hex digits of the id.
    Id,
    /// Expecting the tag byte (or the first content byte).
    Tag,
    /// Reading the hex length of a segment.
    Length,
    /// Collecting payload until a newline.
    ByNewline,
    /// Collecting exactly `remaining` payload bytes.
    ByLength { remaining: usize },
}

/// Incremental parser for the row grammar.
pub struct RowParser {
    state: ParseState,
    id: u32,
    id_digits: usize,
    kind: RecordKind,
    length: usize,
    length_digits: usize,
    buffer: Vec<u8>,
    max_row_length: usize,
    rows_parsed: u64,
}

impl RowParser {
    /// Creates a parser with the default row length limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_row_length(DEFAULT_MAX_ROW_LENGTH)
    }

    /// Creates a parser that rejects rows, and declared segment lengths,
    /// longer than `max_row_length` bytes.
    #[must_use]
    pub fn with_max_row_length(max_row_length: usize) -> Self {
        Self {
            state: ParseState::Id,
            id: 0,
            id_digits: 0,
            kind: RecordKind::Model,
            length: 0,
            length_digits: 0,
            buffer: Vec::new(),
            max_row_length,
            rows_parsed: 0,
        }
    }

    /// Number of complete rows produced so far.
    #[inline]
    #[must_use]
    pub const fn rows_parsed(&self) -> u64 {
        self.rows_parsed
    }

    /// Returns true when no row is partially buffered.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::Id && self.id_digits == 0
    }

    /// Feeds one transport chunk, appending every completed row to `rows`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for malformed ids, lengths or oversized
    /// rows. The parser must not be fed again after an error.
    pub fn feed(&mut self, mut bytes: &[u8], rows: &mut Vec<Row>) -> ProtocolResult<()> {
        while !bytes.is_empty() {
            match self.state {
                ParseState::Id => {
                    let byte = bytes[0];
                    bytes = &bytes[1..];
                    if byte == b':' && self.id_digits > 0 {
                        self.state = ParseState::Tag;
                    } else if byte == b'\n' && self.id_digits == 0 {
                        // Blank line between rows.
                    } else {
                        self.id = RefId::push_hex_digit(self.id, byte)
                            .filter(|_| self.id_digits < 8)
                            .ok_or(ProtocolError::MalformedId {
                                rows: self.rows_parsed,
                            })?;
                        self.id_digits += 1;
                    }
                }
                ParseState::Tag => {
                    let byte = bytes[0];
                    match RecordKind::from_tag(byte) {
                        Some(kind) => {
                            bytes = &bytes[1..];
                            self.kind = kind;
                            self.state = if kind.is_length_delimited() {
                                self.length = 0;
                                self.length_digits = 0;
                                ParseState::Length
                            } else {
                                ParseState::ByNewline
                            };
                        }
                        None => {
                            // The byte belongs to the JSON payload.
                            self.kind = RecordKind::Model;
                            self.state = ParseState::ByNewline;
                        }
                    }
                }
                ParseState::Length => {
                    let byte = bytes[0];
                    bytes = &bytes[1..];
                    if byte == b',' && self.length_digits > 0 {
                        if self.length == 0 {
                            self.emit(rows);
                        } else {
                            self.buffer.reserve(self.length);
                            self.state = ParseState::ByLength {
                                remaining: self.length,
                            };
                        }
                    } else {
                        let digit = hex_value(byte)
                            .ok_or(ProtocolError::MalformedLength(RefId(self.id)))?;
                        self.length = self
                            .length
                            .checked_mul(16)
                            .and_then(|l| l.checked_add(usize::from(digit)))
                            .ok_or(ProtocolError::MalformedLength(RefId(self.id)))?;
                        self.length_digits += 1;
                        // Checked before anything is allocated for the segment.
                        if self.length > self.max_row_length {
                            return Err(ProtocolError::RowTooLong {
                                id: RefId(self.id),
                                max: self.max_row_length,
                            });
                        }
                    }
                }
                ParseState::ByNewline => {
                    match bytes.iter().position(|&b| b == b'\n') {
                        Some(end) => {
                            self.append(&bytes[..end])?;
                            bytes = &bytes[end + 1..];
                            self.emit(rows);
                        }
                        None => {
                            self.append(bytes)?;
                            bytes = &[];
                        }
                    }
                }
                ParseState::ByLength { remaining } => {
                    let take = remaining.min(bytes.len());
                    self.buffer.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if take == remaining {
                        self.emit(rows);
                    } else {
                        self.state = ParseState::ByLength {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }
        Ok(())
    }

    /// Verifies that the stream ended on a row boundary.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TruncatedRow`] when a row is half-read.
    pub fn finish(&self) -> ProtocolResult<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedRow)
        }
    }

    fn append(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        if self.buffer.len() + bytes.len() > self.max_row_length {
            return Err(ProtocolError::RowTooLong {
                id: RefId(self.id),
                max: self.max_row_length,
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn emit(&mut self, rows: &mut Vec<Row>) {
        let payload = std::mem::take(&mut self.buffer);
        rows.push(Row::new(RefId(self.id), self.kind, payload));
        self.rows_parsed += 1;
        self.state = ParseState::Id;
        self.id = 0;
        self.id_digits = 0;
    }
}

impl Default for RowParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ErrorSummary;
    use serde_json::json;

    fn parse_all(bytes: &[u8]) -> Vec<Row> {
        let mut parser = RowParser::new();
        let mut rows = Vec::new();
        parser.feed(bytes, &mut rows).unwrap();
        assert!(parser.finish().is_ok());
        rows
    }

    #[test]
    fn test_parse_mixed_rows() {
        let mut stream = Vec::new();
        Row::placeholder(RefId(1)).encode_into(&mut stream);
        Row::new(RefId(2), RecordKind::Text, b"a\nb".to_vec()).encode_into(&mut stream);
        Row::new(RefId(2), RecordKind::Text, Vec::new()).encode_into(&mut stream);
        Row::model(RefId(0), &json!({"x": "$1"})).encode_into(&mut stream);
        Row::error(RefId(1), &ErrorSummary::new("boom")).encode_into(&mut stream);

        let rows = parse_all(&stream);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].kind, RecordKind::Placeholder);
        assert!(rows[0].payload.is_empty());
        assert_eq!(rows[1].payload, b"a\nb");
        assert!(rows[2].payload.is_empty());
        assert_eq!(rows[3].id, RefId::ROOT);
        assert_eq!(rows[3].json().unwrap(), json!({"x": "$1"}));
        assert_eq!(rows[4].kind, RecordKind::Error);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut stream = Vec::new();
        Row::model(RefId(0x1a), &json!([1, 2, 3])).encode_into(&mut stream);
        Row::new(RefId(0x1b), RecordKind::Binary, vec![0, 10, 255]).encode_into(&mut stream);

        let mut parser = RowParser::new();
        let mut rows = Vec::new();
        for byte in &stream {
            parser.feed(std::slice::from_ref(byte), &mut rows).unwrap();
        }
        assert!(parser.is_idle());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, RefId(0x1a));
        assert_eq!(rows[1].payload, vec![0, 10, 255]);
        assert_eq!(parser.rows_parsed(), 2);
    }

    #[test]
    fn test_truncated_stream() {
        let mut parser = RowParser::new();
        let mut rows = Vec::new();
        parser.feed(b"0:{\"a\":", &mut rows).unwrap();
        assert!(rows.is_empty());
        assert_eq!(parser.finish(), Err(ProtocolError::TruncatedRow));
    }

    #[test]
    fn test_malformed_id() {
        let mut parser = RowParser::new();
        let mut rows = Vec::new();
        assert!(matches!(
            parser.feed(b"zz:P\n", &mut rows),
            Err(ProtocolError::MalformedId { .. })
        ));
    }

    #[test]
    fn test_row_too_long() {
        let mut parser = RowParser::with_max_row_length(8);
        let mut rows = Vec::new();
        assert!(matches!(
            parser.feed(b"0:\"0123456789\"\n", &mut rows),
            Err(ProtocolError::RowTooLong { .. })
        ));
    }

    #[test]
    fn test_oversized_segment_length_is_rejected() {
        let mut parser = RowParser::new();
        let mut rows = Vec::new();
        assert_eq!(
            parser.feed(b"1:Tffffffffffffff,", &mut rows),
            Err(ProtocolError::RowTooLong {
                id: RefId(1),
                max: DEFAULT_MAX_ROW_LENGTH,
            })
        );
        assert!(rows.is_empty());

        let mut parser = RowParser::with_max_row_length(4);
        assert!(parser.feed(b"2:B4,abcd", &mut rows).is_ok());
        assert!(matches!(
            parser.feed(b"3:B5,", &mut rows),
            Err(ProtocolError::RowTooLong { max: 4, .. })
        ));
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let rows = parse_all(b"\n1:P\n\n");
        assert_eq!(rows.len(), 1);
    }
}
