//! # Byte Sinks
//!
//! The transport boundary of the encoder: framed rows are pushed into a
//! [`ByteSink`], which reports whether it can take more right away.
//!
//! ## Implementations
//!
//! - [`VecSink`]: in-memory buffer with an optional high-water mark
//! - [`ChannelSink`]: bounded `tokio::mpsc` channel that parks overflow
//!   instead of dropping it

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

/// Future returned by [`ByteSink::drained`].
pub type Drained<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Destination for encoded bytes.
pub trait ByteSink: Send {
    /// Pushes bytes. Returns `false` when the producer should pause until
    /// [`ByteSink::drained`] completes. The bytes are accepted either way.
    fn push(&mut self, bytes: &[u8]) -> bool;

    /// Completes once a paused sink can accept more bytes.
    fn drained(&mut self) -> Drained<'_> {
        Box::pin(std::future::ready(()))
    }

    /// Forwards buffered bytes to the underlying transport, if it buffers.
    fn flush(&mut self) {}

    /// Signals the normal end of the stream.
    fn close(&mut self) {}

    /// Signals that the stream failed; no further bytes will follow.
    fn destroy(&mut self, error: &str);
}

/// In-memory sink, mainly for tests and recording streams to disk.
#[derive(Debug, Default)]
pub struct VecSink {
    bytes: Vec<u8>,
    high_water_mark: Option<usize>,
    since_drain: usize,
    closed: bool,
    error: Option<String>,
}

impl VecSink {
    /// Creates an unbounded sink that never reports backpressure.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that reports backpressure once `limit` bytes were
    /// pushed since the last drain.
    #[must_use]
    pub fn with_high_water_mark(limit: usize) -> Self {
        Self {
            high_water_mark: Some(limit),
            ..Self::default()
        }
    }

    /// Everything pushed so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Takes the buffer, leaving the sink empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Returns true after a normal close.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Error passed to [`ByteSink::destroy`], if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl ByteSink for VecSink {
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.bytes.extend_from_slice(bytes);
        self.since_drain += bytes.len();
        self.high_water_mark
            .map_or(true, |limit| self.since_drain < limit)
    }

    fn drained(&mut self) -> Drained<'_> {
        self.since_drain = 0;
        Box::pin(std::future::ready(()))
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn destroy(&mut self, error: &str) {
        self.error = Some(error.to_owned());
    }
}

/// Item carried by a [`ChannelSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Encoded row bytes.
    Data(Vec<u8>),
    /// The producer failed; the stream ends after this frame.
    Error(String),
}

/// Sink backed by a bounded `tokio::mpsc` channel.
///
/// When the channel is full the bytes are parked in an overflow queue and
/// `push` reports backpressure; [`ByteSink::drained`] moves the overflow into
/// the channel as capacity frees up. Nothing is dropped while the receiver
/// is alive.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Frame>>,
    overflow: VecDeque<Vec<u8>>,
}

/// Creates a channel sink and the receiver the consumer reads frames from.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            tx: Some(tx),
            overflow: VecDeque::new(),
        },
        rx,
    )
}

impl ChannelSink {
    /// Number of frames parked because the channel was full.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }
}

impl ByteSink for ChannelSink {
    fn push(&mut self, bytes: &[u8]) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if !self.overflow.is_empty() {
            self.overflow.push_back(bytes.to_vec());
            return false;
        }
        match tx.try_send(Frame::Data(bytes.to_vec())) {
            Ok(()) => tx.capacity() > 0,
            Err(mpsc::error::TrySendError::Full(Frame::Data(data))) => {
                self.overflow.push_back(data);
                false
            }
            Err(mpsc::error::TrySendError::Full(Frame::Error(_))) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("channel sink receiver dropped, discarding output");
                self.tx = None;
                false
            }
        }
    }

    fn drained(&mut self) -> Drained<'_> {
        Box::pin(async move {
            let Some(tx) = &self.tx else {
                self.overflow.clear();
                return;
            };
            // A frame leaves the overflow queue only once a slot is reserved,
            // so dropping this future mid-drain loses nothing.
            while !self.overflow.is_empty() {
                let Ok(permit) = tx.reserve().await else {
                    tracing::warn!("channel sink receiver dropped while draining");
                    self.overflow.clear();
                    self.tx = None;
                    return;
                };
                if let Some(data) = self.overflow.pop_front() {
                    permit.send(Frame::Data(data));
                }
            }
        })
    }

    fn close(&mut self) {
        let Some(tx) = self.tx.take() else {
            self.overflow.clear();
            return;
        };
        let pending: VecDeque<Frame> = self.overflow.drain(..).map(Frame::Data).collect();
        deliver(tx, pending);
    }

    fn destroy(&mut self, error: &str) {
        let Some(tx) = self.tx.take() else {
            self.overflow.clear();
            return;
        };
        let mut pending: VecDeque<Frame> = self.overflow.drain(..).map(Frame::Data).collect();
        pending.push_back(Frame::Error(error.to_owned()));
        deliver(tx, pending);
    }
}

/// Sends `pending` in order. Whatever does not fit in the channel right now
/// is handed to the runtime, so the receiver still sees every frame before
/// the channel closes.
fn deliver(tx: mpsc::Sender<Frame>, mut pending: VecDeque<Frame>) {
    while let Some(frame) = pending.pop_front() {
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                pending.push_front(frame);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(
                    undelivered = pending.len() + 1,
                    "channel sink receiver dropped, discarding output"
                );
                return;
            }
        }
    }
    if pending.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                for frame in pending {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(_) => tracing::warn!(
            undelivered = pending.len(),
            "channel sink could not deliver its remaining frames"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_sink_high_water_mark() {
        let mut sink = VecSink::with_high_water_mark(4);
        assert!(sink.push(b"ab"));
        assert!(!sink.push(b"cd"));
        assert_eq!(sink.bytes(), b"abcd");
    }

    #[tokio::test]
    async fn test_vec_sink_drain_resets_pressure() {
        let mut sink = VecSink::with_high_water_mark(2);
        assert!(!sink.push(b"ab"));
        sink.drained().await;
        assert!(sink.push(b"c"));
    }

    #[test]
    fn test_vec_sink_destroy() {
        let mut sink = VecSink::new();
        sink.destroy("boom");
        assert_eq!(sink.error(), Some("boom"));
        assert!(!sink.is_closed());
    }

    #[tokio::test]
    async fn test_channel_sink_parks_overflow() {
        let (mut sink, mut rx) = channel(1);
        assert!(!sink.push(b"one"));
        assert!(!sink.push(b"two"));
        assert_eq!(sink.overflow_len(), 1);

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            frames
        });

        sink.drained().await;
        assert_eq!(sink.overflow_len(), 0);
        sink.close();

        let frames = reader.await.unwrap();
        assert_eq!(
            frames,
            vec![Frame::Data(b"one".to_vec()), Frame::Data(b"two".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_destroy_delivers_parked_frames() {
        let (mut sink, mut rx) = channel(1);
        assert!(!sink.push(b"a"));
        assert!(!sink.push(b"b"));
        sink.destroy("failed");

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                Frame::Data(b"a".to_vec()),
                Frame::Data(b"b".to_vec()),
                Frame::Error("failed".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_close_delivers_parked_frames() {
        let (mut sink, mut rx) = channel(1);
        assert!(!sink.push(b"a"));
        assert!(!sink.push(b"b"));
        assert!(!sink.push(b"c"));
        assert_eq!(sink.overflow_len(), 2);
        sink.close();
        assert_eq!(sink.overflow_len(), 0);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                Frame::Data(b"a".to_vec()),
                Frame::Data(b"b".to_vec()),
                Frame::Data(b"c".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_drain_survives_cancellation() {
        let (mut sink, mut rx) = channel(1);
        assert!(!sink.push(b"a"));
        assert!(!sink.push(b"b"));

        // The channel is full, so the drain stalls and is dropped unfinished.
        let stalled =
            tokio::time::timeout(std::time::Duration::from_millis(5), sink.drained()).await;
        assert!(stalled.is_err());
        assert_eq!(sink.overflow_len(), 1);

        assert_eq!(rx.recv().await, Some(Frame::Data(b"a".to_vec())));
        sink.drained().await;
        assert_eq!(sink.overflow_len(), 0);
        assert_eq!(rx.recv().await, Some(Frame::Data(b"b".to_vec())));
    }

    #[tokio::test]
    async fn test_channel_sink_destroy_sends_error() {
        let (mut sink, mut rx) = channel(4);
        assert!(sink.push(b"x"));
        sink.destroy("failed");
        assert_eq!(rx.recv().await, Some(Frame::Data(b"x".to_vec())));
        assert_eq!(rx.recv().await, Some(Frame::Error("failed".into())));
        assert_eq!(rx.recv().await, None);
    }
}
