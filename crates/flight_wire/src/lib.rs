//! # Flight Wire Format
//!
//! Row-oriented framing shared by the encoder (`flight_server`) and the
//! decoder (`flight_client`).
//!
//! ## Row Structure
//!
//! ```text
//! ┌──────────┬───┬─────┬──────────────────────────────┬────┐
//! │ id (hex) │ : │ tag │ payload                      │ \n │
//! └──────────┴───┴─────┴──────────────────────────────┴────┘
//!
//!   <id>:<json>\n              content
//!   <id>:I<json>\n             client reference metadata
//!   <id>:P\n                   placeholder
//!   <id>:E<json>\n             error summary
//!   <id>:T<hex-len>,<bytes>    text segment   (length-delimited, no newline)
//!   <id>:B<hex-len>,<bytes>    binary segment (length-delimited, no newline)
//! ```
//!
//! A zero-length `T`/`B` segment terminates the outlined value for its id.
//!
//! ## Design Philosophy
//!
//! - Rows are self-delimiting, so transport chunks may split them anywhere
//! - Every emitted row carries a per-request sequence number
//! - The writer never reorders or drops rows, it only reports backpressure

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod id;
pub mod parser;
pub mod record;
pub mod sentinel;
pub mod sink;
pub mod writer;

pub use error::{ConfigError, ConfigResult, ProtocolError, ProtocolResult, WireError, WireResult};
pub use id::RefId;
pub use parser::RowParser;
pub use record::{Chunk, ClientReferenceMetadata, ErrorSummary, RecordKind, Row};
pub use sentinel::Sentinel;
pub use sink::{channel, ByteSink, ChannelSink, Drained, Frame, VecSink};
pub use writer::{ChunkWriter, WriterState, WriterStats};

/// Default maximum length of a newline-terminated row (16 MiB).
pub const DEFAULT_MAX_ROW_LENGTH: usize = 16 * 1024 * 1024;
