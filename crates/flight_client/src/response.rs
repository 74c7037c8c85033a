//! # Response
//!
//! Decoder-side session. Bytes go in through [`Response::process_bytes`] in
//! whatever pieces the transport delivers; values come out through
//! [`Handle`]s that settle as rows arrive.
//!
//! ## Lifecycle
//!
//! ```text
//!            process_bytes*            close()
//!   Open ───────────────────> Open ──────────────> Closed(Ok)
//!     │                        │
//!     │ ProtocolError          │ close_with_error() / abort()
//!     └────────────────────────┴─────────────────> Closed(Err)
//! ```
//!
//! A protocol violation is fatal: every unsettled id is rejected with it and
//! module loads are cancelled. A clean close rejects only the ids still
//! waiting for rows; module loads already started are allowed to finish.
//!
//! ## Ownership
//!
//! `Response` is a cheap clone over shared state. Background module loads
//! hold the state weakly, so dropping the last `Response` stops every
//! callback. Handles keep working after the drop: settled ids keep their
//! value, pending ones report [`DecodeError::Aborted`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use flight_wire::{
    ClientReferenceMetadata, ErrorSummary, Frame, ProtocolError, ProtocolResult, RecordKind,
    RefId, Row, RowParser,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DecoderConfig;
use crate::error::{DecodeError, DecodeResult, ModuleLoadError};
use crate::loader::{Module, ModuleRegistry};
use crate::table::{DecoderTable, Handle, SlotState};

/// Lifecycle of a [`Response`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Accepting bytes.
    Open,
    /// Finished, cleanly or with the error that ended it.
    Closed(Result<(), DecodeError>),
}

impl ResponseStatus {
    /// Returns true while bytes are accepted.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The error that ended the response, if any.
    #[must_use]
    pub fn error(&self) -> Option<&DecodeError> {
        match self {
            Self::Closed(Err(error)) => Some(error),
            _ => None,
        }
    }
}

/// Counters for a [`Response`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseStats {
    /// Rows decoded.
    pub rows: u64,
    /// Bytes fed.
    pub bytes: u64,
    /// Ids known to the table.
    pub ids: usize,
    /// Ids not settled yet.
    pub pending: usize,
    /// Module loads running in the background.
    pub loads_in_flight: usize,
}

struct Inner {
    parser: RowParser,
    table: DecoderTable,
    registry: ModuleRegistry,
    loads: HashMap<RefId, JoinHandle<()>>,
    status: ResponseStatus,
    config: DecoderConfig,
    root: Handle,
    bytes: u64,
    this: Weak<Mutex<Inner>>,
}

/// Decoder session for one row stream.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Mutex<Inner>>,
}

impl Response {
    /// Creates a response that loads client references through `registry`.
    #[must_use]
    pub fn new(registry: ModuleRegistry) -> Self {
        Self::with_config(registry, DecoderConfig::default())
    }

    /// Creates a response with explicit tunables.
    #[must_use]
    pub fn with_config(registry: ModuleRegistry, config: DecoderConfig) -> Self {
        let inner = Arc::new_cyclic(|this| {
            let (table, root) = DecoderTable::with_root();
            let table = table.with_max_value_length(config.max_row_length);
            Mutex::new(Inner {
                parser: RowParser::with_max_row_length(config.max_row_length),
                table,
                registry,
                loads: HashMap::new(),
                status: ResponseStatus::Open,
                config,
                root,
                bytes: 0,
                this: this.clone(),
            })
        });
        Self { inner }
    }

    /// Feeds one transport chunk. Rows may be split across calls anywhere.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Protocol`] when the bytes break the wire contract (the
    /// response is then closed with that error), or [`DecodeError::Closed`]
    /// after the response closed.
    pub fn process_bytes(&self, bytes: &[u8]) -> DecodeResult<()> {
        self.inner.lock().process_bytes(bytes)
    }

    /// Marks the end of the stream. Ids still waiting for rows are rejected
    /// with [`DecodeError::IncompleteStream`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::TruncatedRow`] when the stream ended inside a row, or
    /// the error that already ended the response.
    pub fn close(&self) -> DecodeResult<()> {
        self.inner.lock().close()
    }

    /// Ends the response because the transport failed. Every unsettled id
    /// is rejected with [`DecodeError::Transport`].
    pub fn close_with_error(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.status.is_open() {
            inner.shutdown(DecodeError::Transport(reason.to_owned()));
        }
    }

    /// Abandons the response. Every unsettled id, module loads included, is
    /// rejected with [`DecodeError::Aborted`].
    pub fn abort(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.status.error().is_none() {
            tracing::warn!(reason, "response aborted");
            inner.shutdown(DecodeError::Aborted(reason.to_owned()));
        }
    }

    /// Handle on the root value (id 0).
    #[must_use]
    pub fn root(&self) -> Handle {
        self.inner.lock().root.clone()
    }

    /// Handle on any id.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownReference`] for an id never seen before the
    /// response closed.
    pub fn handle(&self, id: RefId) -> DecodeResult<Handle> {
        Ok(self.inner.lock().table.handle(id)?)
    }

    /// State of `id`, if the stream mentioned it.
    #[must_use]
    pub fn state(&self, id: RefId) -> Option<SlotState> {
        self.inner.lock().table.state(id)
    }

    /// Ids not settled yet, ascending.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<RefId> {
        self.inner.lock().table.pending_ids()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        self.inner.lock().status.clone()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> ResponseStats {
        let inner = self.inner.lock();
        ResponseStats {
            rows: inner.parser.rows_parsed(),
            bytes: inner.bytes,
            ids: inner.table.len(),
            pending: inner.table.pending_ids().len(),
            loads_in_flight: inner.loads.len(),
        }
    }

    /// Drives the response from the receiving end of a
    /// [`flight_wire::channel`] until the producer finishes, then closes it.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Transport`] when the producer sent an error frame,
    /// otherwise as [`Response::process_bytes`] and [`Response::close`].
    pub async fn consume(&self, mut frames: mpsc::Receiver<Frame>) -> DecodeResult<()> {
        while let Some(frame) = frames.recv().await {
            match frame {
                Frame::Data(bytes) => self.process_bytes(&bytes)?,
                Frame::Error(reason) => {
                    self.close_with_error(&reason);
                    return Err(DecodeError::Transport(reason));
                }
            }
        }
        self.close()
    }

    /// Drives the response from a byte reader until end of file, then closes
    /// it.
    ///
    /// # Errors
    ///
    /// [`DecodeError::Transport`] when reading fails, otherwise as
    /// [`Response::process_bytes`] and [`Response::close`].
    pub async fn read_from<R: AsyncRead + Unpin>(&self, mut reader: R) -> DecodeResult<()> {
        let size = self.inner.lock().config.read_buffer_size;
        let mut buffer = vec![0_u8; size];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => self.process_bytes(&buffer[..n])?,
                Err(error) => {
                    let reason = error.to_string();
                    self.close_with_error(&reason);
                    return Err(DecodeError::Transport(reason));
                }
            }
        }
        self.close()
    }
}

impl Inner {
    fn process_bytes(&mut self, bytes: &[u8]) -> DecodeResult<()> {
        if !self.status.is_open() {
            return Err(DecodeError::Closed);
        }
        self.bytes += bytes.len() as u64;

        let mut rows = Vec::new();
        let parsed = self.parser.feed(bytes, &mut rows);
        for row in rows {
            if let Err(error) = self.apply(row) {
                return Err(self.fail(error));
            }
        }
        if let Err(error) = parsed {
            return Err(self.fail(error));
        }
        self.table.settle();
        Ok(())
    }

    fn apply(&mut self, row: Row) -> ProtocolResult<()> {
        let id = row.id;
        tracing::debug!(%id, kind = ?row.kind, len = row.payload.len(), "row decoded");
        match row.kind {
            RecordKind::Model => {
                let json = row.json()?;
                let mut deps = Vec::new();
                let value = self.table.decode(&json, &mut deps)?;
                self.table.register(id, value, deps)
            }
            RecordKind::Placeholder => {
                if !row.payload.is_empty() {
                    return Err(ProtocolError::PlaceholderPayload(id));
                }
                self.table.placeholder(id)
            }
            RecordKind::Error => {
                let summary: ErrorSummary = payload(&row)?;
                self.table.reject(id, DecodeError::Remote(summary))
            }
            RecordKind::Text | RecordKind::Binary => self.table.segment(id, row.kind, &row.payload),
            RecordKind::ClientReference => {
                let metadata: ClientReferenceMetadata = payload(&row)?;
                let mut deps = Vec::new();
                let bound = metadata
                    .bound
                    .iter()
                    .map(|arg| self.table.decode(arg, &mut deps))
                    .collect::<ProtocolResult<Vec<_>>>()?;
                let locator = metadata.id;
                self.table
                    .begin_load(id, locator.clone(), metadata.name, bound, deps)?;
                self.start_load(id, locator);
                Ok(())
            }
        }
    }

    fn start_load(&mut self, id: RefId, locator: String) {
        if let Some(result) = self.registry.try_require(&locator) {
            self.table.finish_load(id, result);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.table.finish_load(
                id,
                Err(ModuleLoadError::Failed {
                    locator,
                    reason: "no async runtime to load the module on".into(),
                }),
            );
            return;
        };
        let registry = self.registry.clone();
        let this = self.this.clone();
        let task = runtime.spawn(async move {
            let result = registry.require(&locator).await;
            if let Some(inner) = this.upgrade() {
                inner.lock().on_module_loaded(id, result);
            }
        });
        self.loads.insert(id, task);
    }

    fn on_module_loaded(&mut self, id: RefId, result: Result<Module, ModuleLoadError>) {
        self.loads.remove(&id);
        self.table.finish_load(id, result);
    }

    fn close(&mut self) -> DecodeResult<()> {
        match &self.status {
            ResponseStatus::Open => {}
            ResponseStatus::Closed(result) => return result.clone(),
        }
        if let Err(error) = self.parser.finish() {
            return Err(self.fail(error));
        }
        let incomplete = self.table.close();
        tracing::info!(
            rows = self.parser.rows_parsed(),
            bytes = self.bytes,
            incomplete = incomplete.len(),
            "response closed"
        );
        self.status = ResponseStatus::Closed(Ok(()));
        Ok(())
    }

    fn fail(&mut self, error: ProtocolError) -> DecodeError {
        tracing::warn!(%error, "protocol violation, closing response");
        let error = DecodeError::Protocol(error);
        self.shutdown(error.clone());
        error
    }

    fn shutdown(&mut self, error: DecodeError) {
        self.table.fail_all(&error);
        for (_, task) in self.loads.drain() {
            task.abort();
        }
        self.status = ResponseStatus::Closed(Err(error));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, task) in self.loads.drain() {
            task.abort();
        }
    }
}

fn payload<T: DeserializeOwned>(row: &Row) -> ProtocolResult<T> {
    serde_json::from_slice(&row.payload).map_err(|e| ProtocolError::InvalidJson {
        id: row.id,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::loader::StaticModuleLoader;
    use serde_json::json;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(
            StaticModuleLoader::new()
                .with_module("mod", Module::new("button"))
                .with_latency(Duration::from_millis(1)),
        )
    }

    fn root_json(response: &Response) -> serde_json::Value {
        match response.root().state() {
            SlotState::Resolved(value) => value.expand(),
            other => panic!("root not resolved: {other:?}"),
        }
    }

    #[test]
    fn test_rows_split_anywhere() {
        let stream = b"1:\"hi\"\n0:{\"a\":\"$1\",\"n\":\"$NaN\"}\n";
        for split in 0..stream.len() {
            let response = Response::new(registry());
            response.process_bytes(&stream[..split]).unwrap();
            response.process_bytes(&stream[split..]).unwrap();
            let root = root_json(&response);
            assert_eq!(root["a"], json!("hi"), "split at {split}");
            assert_eq!(root["n"], json!("$NaN"));
        }
    }

    #[test]
    fn test_placeholder_then_content() {
        let response = Response::new(registry());
        response.process_bytes(b"0:[\"$@1\"]\n1:P\n").unwrap();
        assert_eq!(root_json(&response), json!(["$@1"]));
        assert_eq!(response.pending_ids(), vec![RefId(1)]);

        response.process_bytes(b"1:{\"done\":true}\n").unwrap();
        assert_eq!(root_json(&response), json!([{"done": true}]));
        assert!(response.pending_ids().is_empty());
    }

    #[test]
    fn test_error_row_rejects_id() {
        let response = Response::new(registry());
        response
            .process_bytes(b"1:E{\"message\":\"boom\",\"digest\":\"d1\"}\n0:{\"x\":\"$@1\"}\n")
            .unwrap();
        match response.state(RefId(1)) {
            Some(SlotState::Rejected(error)) => {
                assert_eq!(error.to_string(), "boom");
                assert_eq!(error.digest(), Some("d1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(root_json(&response), json!({"x": {"$error": "boom"}}));
    }

    #[test]
    fn test_duplicate_content_is_fatal() {
        let response = Response::new(registry());
        response.process_bytes(b"0:[\"$1\"]\n").unwrap();
        let error = response.process_bytes(b"2:1\n2:2\n").unwrap_err();

        assert_eq!(
            error,
            DecodeError::Protocol(ProtocolError::DuplicateResolution(RefId(2)))
        );
        assert_eq!(response.status().error(), Some(&error));
        assert!(response.pending_ids().is_empty());
        assert!(matches!(
            response.root().state(),
            SlotState::Rejected(DecodeError::Protocol(_))
        ));
        assert_eq!(response.process_bytes(b"3:1\n"), Err(DecodeError::Closed));
    }

    #[test]
    fn test_placeholder_after_content_is_fatal() {
        let response = Response::new(registry());
        let error = response.process_bytes(b"1:1\n1:P\n").unwrap_err();
        assert_eq!(
            error,
            DecodeError::Protocol(ProtocolError::LatePlaceholder(RefId(1)))
        );
    }

    #[test]
    fn test_close_rejects_pending_ids() {
        let response = Response::new(registry());
        response
            .process_bytes(b"0:{\"a\":\"$@1\",\"b\":\"$@2\",\"c\":\"$@3\"}\n2:P\n3:true\n")
            .unwrap();
        response.close().unwrap();

        assert_eq!(response.status(), ResponseStatus::Closed(Ok(())));
        for id in [1, 2] {
            assert!(matches!(
                response.state(RefId(id)),
                Some(SlotState::Rejected(DecodeError::IncompleteStream(r))) if r == RefId(id)
            ));
        }
        assert!(matches!(response.state(RefId(3)), Some(SlotState::Resolved(_))));
        assert!(matches!(
            response.handle(RefId(9)),
            Err(DecodeError::Protocol(ProtocolError::UnknownReference(_)))
        ));
        response.close().unwrap();
    }

    #[test]
    fn test_oversized_segment_is_fatal() {
        let response = Response::new(registry());
        let error = response.process_bytes(b"1:Tffffffffffffff,").unwrap_err();
        assert!(matches!(
            error,
            DecodeError::Protocol(ProtocolError::RowTooLong { id, .. }) if id == RefId(1)
        ));
        assert!(response.status().error().is_some());
    }

    #[test]
    fn test_outlined_value_is_capped_across_segments() {
        let config = DecoderConfig {
            max_row_length: 8,
            ..DecoderConfig::default()
        };
        let response = Response::with_config(registry(), config);
        response.process_bytes(b"1:T6,abcdef").unwrap();
        assert_eq!(
            response.process_bytes(b"1:T6,ghijkl"),
            Err(DecodeError::Protocol(ProtocolError::RowTooLong {
                id: RefId(1),
                max: 8,
            }))
        );
    }

    #[test]
    fn test_truncated_stream() {
        let response = Response::new(registry());
        response.process_bytes(b"0:{\"a\":").unwrap();
        assert_eq!(
            response.close(),
            Err(DecodeError::Protocol(ProtocolError::TruncatedRow))
        );
    }

    #[test]
    fn test_without_runtime_module_load_fails() {
        let response = Response::new(registry());
        response
            .process_bytes(b"1:I{\"id\":\"mod\"}\n0:\"$1\"\n")
            .unwrap();
        assert!(matches!(
            response.root().state(),
            SlotState::Rejected(DecodeError::ModuleLoad(ModuleLoadError::Failed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_client_reference_loads_module() {
        let response = Response::new(registry());
        response
            .process_bytes(b"1:I{\"id\":\"mod\",\"name\":\"Button\",\"bound\":[\"$2\"]}\n2:7\n0:{\"b\":\"$1\"}\n")
            .unwrap();
        response.close().unwrap();
        assert!(response.root().is_pending());
        assert_eq!(response.stats().loads_in_flight, 1);

        let root = response.root().settled().await.unwrap();
        assert_eq!(
            root.expand(),
            json!({"b": {"$client": "mod", "export": "Button", "bound": [7]}})
        );
        assert_eq!(response.stats().loads_in_flight, 0);
    }

    #[tokio::test]
    async fn test_missing_module_rejects() {
        let response = Response::new(registry());
        response.process_bytes(b"0:I{\"id\":\"nope\"}\n").unwrap();
        let error = response.root().settled().await.unwrap_err();
        assert_eq!(
            error,
            DecodeError::ModuleLoad(ModuleLoadError::NotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_drop_stops_callbacks() {
        let response = Response::new(registry());
        response.process_bytes(b"0:I{\"id\":\"mod\"}\n").unwrap();
        let root = response.root();
        drop(response);

        assert!(matches!(root.settled().await, Err(DecodeError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_abort_rejects_loads() {
        let response = Response::new(registry());
        response.process_bytes(b"0:I{\"id\":\"mod\"}\n").unwrap();
        response.abort("user left");

        assert_eq!(
            response.root().settled().await.unwrap_err(),
            DecodeError::Aborted("user left".into())
        );
        assert_eq!(response.stats().loads_in_flight, 0);
    }

    #[tokio::test]
    async fn test_consume_channel_frames() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Frame::Data(b"0:[\"$@1\"]\n1:".to_vec())).await.unwrap();
        tx.send(Frame::Data(b"P\n".to_vec())).await.unwrap();
        tx.send(Frame::Error("connection reset".into())).await.unwrap();
        drop(tx);

        let response = Response::new(registry());
        let result = response.consume(rx).await;
        assert_eq!(result, Err(DecodeError::Transport("connection reset".into())));
        assert!(matches!(
            response.state(RefId(1)),
            Some(SlotState::Rejected(DecodeError::Transport(reason))) if reason == "connection reset"
        ));
    }

    #[tokio::test]
    async fn test_read_from_bytes() {
        let config = DecoderConfig {
            read_buffer_size: 3,
            ..DecoderConfig::default()
        };
        let response = Response::with_config(registry(), config);
        let stream: &[u8] = b"1:T5,hello1:T0,0:{\"s\":\"$1\"}\n";
        response.read_from(stream).await.unwrap();

        assert_eq!(root_json(&response), json!({"s": "hello"}));
        let stats = response.stats();
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.bytes, stream.len() as u64);
        assert_eq!(stats.pending, 0);
    }
}
