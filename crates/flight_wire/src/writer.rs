//! # Chunk Writer
//!
//! Frames [`Chunk`]s into bytes and pushes them to a [`ByteSink`].
//!
//! ## Guarantees
//!
//! - Chunks reach the sink in submission order, never reordered or dropped
//! - Sequence numbers must strictly increase
//! - After `close` or `close_with_error` nothing else is accepted

use crate::error::{WireError, WireResult};
use crate::record::Chunk;
use crate::sink::ByteSink;

/// Lifecycle of a writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting chunks.
    Open,
    /// Closed normally.
    Closed,
    /// Closed with an error.
    Errored(String),
}

/// Writer statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Chunks written.
    pub chunks: u64,
    /// Bytes pushed to the sink.
    pub bytes: u64,
    /// Times the sink reported backpressure.
    pub pauses: u64,
}

/// Turns chunks into framed bytes for a sink.
pub struct ChunkWriter<S: ByteSink> {
    sink: S,
    state: WriterState,
    last_sequence: Option<u64>,
    paused: bool,
    scratch: Vec<u8>,
    stats: WriterStats,
}

impl<S: ByteSink> ChunkWriter<S> {
    /// Wraps a sink.
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: WriterState::Open,
            last_sequence: None,
            paused: false,
            scratch: Vec::with_capacity(256),
            stats: WriterStats::default(),
        }
    }

    /// Writes one chunk.
    ///
    /// Returns `true` when the sink can take more right away, `false` when
    /// the caller should wait on [`ChunkWriter::drained`].
    ///
    /// # Errors
    ///
    /// [`WireError::Closed`] once closed, [`WireError::OutOfOrder`] when the
    /// sequence number does not increase.
    pub fn write(&mut self, chunk: &Chunk) -> WireResult<bool> {
        if self.state != WriterState::Open {
            tracing::warn!(sequence = chunk.sequence, "write after close");
            return Err(WireError::Closed);
        }
        if let Some(previous) = self.last_sequence {
            if chunk.sequence <= previous {
                return Err(WireError::OutOfOrder {
                    previous,
                    got: chunk.sequence,
                });
            }
        }
        self.last_sequence = Some(chunk.sequence);

        self.scratch.clear();
        chunk.row.encode_into(&mut self.scratch);
        let accepted = self.sink.push(&self.scratch);

        self.stats.chunks += 1;
        self.stats.bytes += self.scratch.len() as u64;
        tracing::trace!(
            sequence = chunk.sequence,
            id = %chunk.row.id,
            kind = ?chunk.row.kind,
            bytes = self.scratch.len(),
            "chunk written"
        );

        if !accepted && !self.paused {
            self.paused = true;
            self.stats.pauses += 1;
        }
        Ok(accepted)
    }

    /// Returns true while the sink asked the producer to pause.
    #[inline]
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Waits until a paused sink can take more bytes.
    pub async fn drained(&mut self) {
        if self.paused {
            self.sink.drained().await;
            self.paused = false;
        }
    }

    /// Flushes the sink.
    ///
    /// # Errors
    ///
    /// [`WireError::Closed`] once closed.
    pub fn flush(&mut self) -> WireResult<()> {
        if self.state != WriterState::Open {
            return Err(WireError::Closed);
        }
        self.sink.flush();
        Ok(())
    }

    /// Ends the stream normally.
    ///
    /// # Errors
    ///
    /// [`WireError::Closed`] when already closed.
    pub fn close(&mut self) -> WireResult<()> {
        if self.state != WriterState::Open {
            return Err(WireError::Closed);
        }
        self.sink.flush();
        self.sink.close();
        self.state = WriterState::Closed;
        tracing::debug!(chunks = self.stats.chunks, bytes = self.stats.bytes, "writer closed");
        Ok(())
    }

    /// Ends the stream with an error and notifies the sink.
    ///
    /// Closing an already closed writer is a no-op.
    pub fn close_with_error(&mut self, error: &str) {
        if self.state != WriterState::Open {
            return;
        }
        self.sink.destroy(error);
        self.state = WriterState::Errored(error.to_owned());
        tracing::warn!(error, "writer closed with error");
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> &WriterState {
        &self.state
    }

    /// Statistics so far.
    #[must_use]
    pub const fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Borrows the sink.
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Unwraps the sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RefId;
    use crate::record::Row;
    use crate::sink::VecSink;

    fn chunk(sequence: u64, id: u32) -> Chunk {
        Chunk::new(sequence, Row::placeholder(RefId(id)))
    }

    #[test]
    fn test_writes_in_order() {
        let mut writer = ChunkWriter::new(VecSink::new());
        assert!(writer.write(&chunk(1, 1)).unwrap());
        assert!(writer.write(&chunk(2, 2)).unwrap());
        writer.close().unwrap();

        assert_eq!(writer.sink().bytes(), b"1:P\n2:P\n");
        assert!(writer.sink().is_closed());
        assert_eq!(writer.stats().chunks, 2);
    }

    #[test]
    fn test_rejects_non_increasing_sequence() {
        let mut writer = ChunkWriter::new(VecSink::new());
        writer.write(&chunk(5, 1)).unwrap();
        assert_eq!(
            writer.write(&chunk(5, 2)),
            Err(WireError::OutOfOrder { previous: 5, got: 5 })
        );
    }

    #[test]
    fn test_close_with_error_blocks_further_writes() {
        let mut writer = ChunkWriter::new(VecSink::new());
        writer.write(&chunk(1, 1)).unwrap();
        writer.close_with_error("boom");

        assert_eq!(writer.write(&chunk(2, 2)), Err(WireError::Closed));
        assert_eq!(writer.state(), &WriterState::Errored("boom".into()));
        assert_eq!(writer.sink().error(), Some("boom"));
        assert_eq!(writer.sink().bytes(), b"1:P\n");
    }

    #[tokio::test]
    async fn test_backpressure_round_trip() {
        let mut writer = ChunkWriter::new(VecSink::with_high_water_mark(4));
        assert!(!writer.write(&chunk(1, 1)).unwrap());
        assert!(writer.is_paused());
        writer.drained().await;
        assert!(!writer.is_paused());
        assert_eq!(writer.stats().pauses, 1);
    }
}
