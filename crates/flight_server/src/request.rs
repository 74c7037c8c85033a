//! # Request
//!
//! Renders one [`Model`] into a row stream and drives its deferred work to
//! completion.
//!
//! ## Lifecycle
//!
//! ```text
//!   run() ──> render root (id 0) ──> loop ─┬─ flush queued rows while the sink accepts
//!                                          ├─ abort signal      -> E rows, destroy sink
//!                                          ├─ sink drained      -> resume flushing
//!                                          └─ deferred settled  -> render it, emit row
//!            no tasks, no queued rows ──> close
//! ```
//!
//! Rows are queued with their sequence number at the moment they are
//! produced, so completion order decides emission order across ids while the
//! placeholder of an id always precedes its resolution.
//!
//! ## Failure Scopes
//!
//! Every [`Model::Boundary`] opens a scope. A failure is handled by the
//! nearest enclosing boundary: its id gets an `E` row, its outstanding tasks
//! are cancelled with an "aborted" `E` row each, and nothing outside the
//! scope changes. A failure with no enclosing boundary aborts the request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use flight_wire::{
    sentinel, ByteSink, Chunk, ChunkWriter, ClientReferenceMetadata, ErrorSummary, RecordKind,
    RefId, Row, VecSink, WriterStats,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::{AbortHandle as TaskHandle, JoinError, JoinSet};

use crate::cache::RequestCache;
use crate::config::{ClientManifest, EncoderConfig, REDACTED_MESSAGE};
use crate::context::{Owner, RenderContext};
use crate::error::{EncodeError, EncodeResult, UpstreamError};
use crate::model::{ClientReference, Component, Deferred, Model};
use crate::table::{Interned, Interning, ReferenceTable};

/// Message of the `E` rows written for tasks cancelled by a failed boundary.
pub const ABORTED_MESSAGE: &str = "aborted";

/// Hook that turns an error into a digest the server can correlate later.
pub type ErrorHook = Arc<dyn Fn(&EncodeError) -> Option<String> + Send + Sync>;

/// Per-request settings.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Encoder tunables.
    pub config: EncoderConfig,
    /// Functions serializable as client references.
    pub manifest: Arc<ClientManifest>,
    /// Digest hook called for every error row.
    pub on_error: Option<ErrorHook>,
}

impl RequestOptions {
    /// Sets the encoder tunables.
    #[must_use]
    pub fn with_config(mut self, config: EncoderConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the client manifest.
    #[must_use]
    pub fn with_manifest(mut self, manifest: ClientManifest) -> Self {
        self.manifest = Arc::new(manifest);
        self
    }

    /// Sets the digest hook.
    #[must_use]
    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EncodeError) -> Option<String> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

#[derive(Default)]
struct AbortInner {
    notify: Notify,
    reason: Mutex<Option<String>>,
}

/// Cloneable handle that aborts a running request from outside.
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    /// Aborts the request. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
            drop(slot);
            self.inner.notify.notify_one();
        }
    }

    /// Returns true once [`AbortHandle::abort`] was called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    /// The abort reason, if aborted.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    async fn aborted(&self) {
        self.inner.notify.notified().await;
    }
}

/// Lifecycle of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Created, `run` not called yet.
    Pending,
    /// `run` in progress.
    Running,
    /// Every id settled and the stream closed.
    Completed,
    /// The request aborted and the sink was destroyed.
    Aborted,
}

/// State of one deferred task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on its future.
    Pending,
    /// Future settled, content being rendered.
    Emitting,
    /// Content row queued.
    Completed,
    /// Error row queued.
    Errored,
}

/// Counters reported when a request finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestSummary {
    /// Rows emitted.
    pub rows: u64,
    /// Ids minted, including the root.
    pub ids: u32,
    /// Bytes pushed to the sink.
    pub bytes: u64,
    /// `E` rows among `rows`.
    pub error_rows: u64,
    /// Deferred tasks scheduled.
    pub deferred: u64,
    /// Times the sink applied backpressure.
    pub pauses: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScopeId(usize);

const ROOT_SCOPE: ScopeId = ScopeId(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScopePhase {
    Rendering,
    Waiting,
    Revealed,
    Failed,
}

struct Scope {
    boundary: Option<RefId>,
    parent: Option<ScopeId>,
    pending: usize,
    content: Option<Value>,
    phase: ScopePhase,
}

impl Scope {
    const fn root() -> Self {
        Self {
            boundary: None,
            parent: None,
            pending: 0,
            content: None,
            phase: ScopePhase::Rendering,
        }
    }

    const fn boundary(id: RefId, parent: ScopeId) -> Self {
        Self {
            boundary: Some(id),
            parent: Some(parent),
            pending: 0,
            content: None,
            phase: ScopePhase::Rendering,
        }
    }

    const fn is_open(&self) -> bool {
        matches!(self.phase, ScopePhase::Rendering | ScopePhase::Waiting)
    }
}

struct PendingTask {
    scope: ScopeId,
    owner: Option<Owner>,
    handle: TaskHandle,
}

type TaskOutput = (RefId, Result<Model, UpstreamError>);

enum Event {
    Aborted,
    Drained,
    Joined(Result<TaskOutput, JoinError>),
}

/// Encoder-side session state.
pub struct Request<S: ByteSink> {
    root: Option<Model>,
    writer: ChunkWriter<S>,
    config: EncoderConfig,
    manifest: Arc<ClientManifest>,
    on_error: Option<ErrorHook>,
    table: ReferenceTable,
    cache: Arc<RequestCache>,
    sequence: u64,
    outbound: VecDeque<Chunk>,
    tasks: JoinSet<TaskOutput>,
    pending: HashMap<RefId, PendingTask>,
    states: HashMap<RefId, TaskState>,
    scopes: Vec<Scope>,
    abort: AbortHandle,
    root_emitted: bool,
    status: RequestStatus,
    error_rows: u64,
    deferred: u64,
}

impl<S: ByteSink> Request<S> {
    /// Creates a request with default options.
    #[must_use]
    pub fn new(root: Model, sink: S) -> Self {
        Self::with_options(root, sink, RequestOptions::default())
    }

    /// Creates a request.
    #[must_use]
    pub fn with_options(root: Model, sink: S, options: RequestOptions) -> Self {
        Self {
            root: Some(root),
            writer: ChunkWriter::new(sink),
            config: options.config,
            manifest: options.manifest,
            on_error: options.on_error,
            table: ReferenceTable::new(),
            cache: Arc::new(RequestCache::new()),
            sequence: 0,
            outbound: VecDeque::new(),
            tasks: JoinSet::new(),
            pending: HashMap::new(),
            states: HashMap::new(),
            scopes: vec![Scope::root()],
            abort: AbortHandle::default(),
            root_emitted: false,
            status: RequestStatus::Pending,
            error_rows: 0,
            deferred: 0,
        }
    }

    /// Handle that aborts this request from another task.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> RequestStatus {
        self.status
    }

    /// State of the deferred task behind `id`.
    #[must_use]
    pub fn task_state(&self, id: RefId) -> Option<TaskState> {
        self.states.get(&id).copied()
    }

    /// The per-request cache.
    #[must_use]
    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Writer statistics so far.
    #[must_use]
    pub const fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Borrows the sink.
    #[must_use]
    pub const fn sink(&self) -> &S {
        self.writer.sink()
    }

    /// Unwraps the sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.writer.into_sink()
    }

    /// Renders the root and drives every deferred task to completion.
    ///
    /// # Errors
    ///
    /// Returns the error that aborted the request: a failure outside every
    /// boundary, an external abort or a panicking task. The sink has been
    /// destroyed by then.
    pub async fn run(&mut self) -> EncodeResult<RequestSummary> {
        let Some(root) = self.root.take() else {
            return Err(EncodeError::AlreadyStarted);
        };
        self.status = RequestStatus::Running;
        tracing::info!(root = root.kind(), "request started");

        let rendered = {
            let mut ctx = RenderContext::new(Arc::clone(&self.cache));
            self.render(&root, ROOT_SCOPE, &mut ctx)
        };
        match rendered {
            Ok(json) => {
                self.enqueue(Row::model(RefId::ROOT, &json));
                self.root_emitted = true;
            }
            Err(err) => return Err(self.abort_request(err)),
        }
        drop(root);

        loop {
            if let Some(reason) = self.abort.reason() {
                return Err(self.abort_request(EncodeError::Aborted(reason)));
            }
            if let Err(err) = self.flush_outbound() {
                return Err(self.abort_request(err));
            }
            if self.outbound.is_empty() && self.tasks.is_empty() {
                break;
            }

            let event = tokio::select! {
                biased;
                () = self.abort.aborted() => Event::Aborted,
                () = self.writer.drained(), if self.writer.is_paused() => Event::Drained,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    Event::Joined(joined)
                }
            };

            let step = match event {
                Event::Aborted => Err(EncodeError::Aborted(
                    self.abort.reason().unwrap_or_default(),
                )),
                Event::Drained => Ok(()),
                Event::Joined(Ok((id, outcome))) => self.complete(id, outcome),
                Event::Joined(Err(err)) if err.is_cancelled() => Ok(()),
                Event::Joined(Err(_)) => Err(EncodeError::TaskPanicked),
            };
            if let Err(err) = step {
                return Err(self.abort_request(err));
            }
        }

        self.writer.drained().await;
        self.writer.close()?;
        self.status = RequestStatus::Completed;

        let summary = self.summary();
        tracing::info!(
            rows = summary.rows,
            ids = summary.ids,
            bytes = summary.bytes,
            errors = summary.error_rows,
            "request completed"
        );
        Ok(summary)
    }

    /// Counters so far.
    #[must_use]
    pub fn summary(&self) -> RequestSummary {
        let stats = self.writer.stats();
        RequestSummary {
            rows: self.sequence,
            ids: self.table.ids_allocated(),
            bytes: stats.bytes,
            error_rows: self.error_rows,
            deferred: self.deferred,
            pauses: stats.pauses,
        }
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    fn render(&mut self, model: &Model, scope: ScopeId, ctx: &mut RenderContext) -> EncodeResult<Value> {
        match model {
            Model::Null => Ok(Value::Null),
            Model::Undefined => Ok(Value::String(sentinel::UNDEFINED.to_owned())),
            Model::Bool(b) => Ok(Value::Bool(*b)),
            Model::Int(i) => Ok(Value::from(*i)),
            Model::Float(x) => Ok(sentinel::float(*x).map_or_else(
                || serde_json::Number::from_f64(*x).map_or(Value::Null, Value::Number),
                |special| Value::String(special.to_owned()),
            )),
            Model::String(text) if text.len() > self.config.outline_text_threshold => {
                Ok(self.outline(RecordKind::Text, text.as_bytes()))
            }
            Model::String(text) => Ok(Value::String(sentinel::escape(text).into_owned())),
            Model::Bytes(bytes) => Ok(self.outline(RecordKind::Binary, bytes)),
            Model::Sequence(items) => items
                .iter()
                .map(|item| self.render(item, scope, ctx))
                .collect::<EncodeResult<Vec<_>>>()
                .map(Value::Array),
            Model::Mapping(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.render(value, scope, ctx)?);
                }
                Ok(Value::Object(map))
            }
            Model::Shared(shared) => self.render_shared(shared, scope, ctx),
            Model::BackRef(target) => match self.table.lookup_weak(target) {
                Some(id) => Ok(reference(id)),
                None => match target.upgrade() {
                    Some(shared) => self.render_shared(&shared, scope, ctx),
                    None => Err(EncodeError::DanglingBackRef),
                },
            },
            Model::ClientRef(client) => self.render_client(client, scope, ctx),
            Model::Function(name) => {
                let entry = self
                    .manifest
                    .resolve(name)
                    .ok_or_else(|| EncodeError::UnregisteredFunction(name.clone()))?;
                let client = Arc::new(ClientReference::new(
                    entry.locator.clone(),
                    entry.export.as_deref(),
                ));
                self.render_client(&client, scope, ctx)
            }
            Model::Component(component) => self.render_component(component, scope, ctx),
            Model::Deferred(deferred) => self.schedule(deferred, scope, ctx),
            Model::Boundary(child) => Ok(self.render_boundary(child, scope, ctx)),
        }
    }

    fn render_shared(
        &mut self,
        shared: &Arc<Model>,
        scope: ScopeId,
        ctx: &mut RenderContext,
    ) -> EncodeResult<Value> {
        let id = match self.table.intern(&Interned::Model(Arc::clone(shared))) {
            Interning::Existing(id) => return Ok(reference(id)),
            Interning::Fresh(id) => id,
        };
        match self.render(shared, scope, ctx) {
            Ok(json) => {
                self.enqueue(Row::model(id, &json));
                Ok(reference(id))
            }
            Err(err) => {
                self.emit_error(id, &err);
                Err(err)
            }
        }
    }

    fn render_client(
        &mut self,
        client: &Arc<ClientReference>,
        scope: ScopeId,
        ctx: &mut RenderContext,
    ) -> EncodeResult<Value> {
        let id = match self.table.intern(&Interned::Client(Arc::clone(client))) {
            Interning::Existing(id) => return Ok(reference(id)),
            Interning::Fresh(id) => id,
        };
        let bound = client
            .bound
            .iter()
            .map(|arg| self.render(arg, scope, ctx))
            .collect::<EncodeResult<Vec<_>>>();
        match bound {
            Ok(bound) => {
                let metadata = ClientReferenceMetadata {
                    id: client.locator.clone(),
                    name: client.export.clone(),
                    bound,
                };
                self.enqueue(Row::client_reference(id, &metadata));
                Ok(reference(id))
            }
            Err(err) => {
                self.emit_error(id, &err);
                Err(err)
            }
        }
    }

    fn render_component(
        &mut self,
        component: &Component,
        scope: ScopeId,
        ctx: &mut RenderContext,
    ) -> EncodeResult<Value> {
        tracing::trace!(component = %component.name, "evaluating component");
        let previous = ctx.enter(&component.name);
        let result = (component.render)(ctx, &component.props)
            .map_err(EncodeError::from)
            .and_then(|output| self.render(&output, scope, ctx));
        ctx.restore(previous);
        result
    }

    fn schedule(
        &mut self,
        deferred: &Arc<Deferred>,
        scope: ScopeId,
        ctx: &RenderContext,
    ) -> EncodeResult<Value> {
        let id = match self.table.intern(&Interned::Deferred(Arc::clone(deferred))) {
            Interning::Existing(id) => return Ok(deferred_reference(id)),
            Interning::Fresh(id) => id,
        };
        self.deferred += 1;

        let future = match self.config.max_pending_tasks {
            Some(limit) if self.pending.len() >= limit => Err(EncodeError::TooManyTasks(limit)),
            _ => deferred.take().ok_or(EncodeError::DeferredConsumed),
        };
        let future = match future {
            Ok(future) => future,
            Err(err) => {
                self.states.insert(id, TaskState::Errored);
                self.emit_error(id, &err);
                return Err(err);
            }
        };

        self.enqueue(Row::placeholder(id));
        let handle = self.tasks.spawn(async move { (id, future.await) });
        self.pending.insert(
            id,
            PendingTask {
                scope,
                owner: ctx.owner().cloned(),
                handle,
            },
        );
        self.states.insert(id, TaskState::Pending);
        self.scopes[scope.0].pending += 1;
        Ok(deferred_reference(id))
    }

    fn render_boundary(&mut self, child: &Model, parent: ScopeId, ctx: &mut RenderContext) -> Value {
        let id = self.table.allocate();
        let scope = ScopeId(self.scopes.len());
        self.scopes.push(Scope::boundary(id, parent));

        match self.render(child, scope, ctx) {
            Ok(json) if self.scopes[scope.0].pending == 0 => {
                self.scopes[scope.0].phase = ScopePhase::Revealed;
                self.enqueue(Row::model(id, &json));
            }
            Ok(json) => {
                let state = &mut self.scopes[scope.0];
                state.phase = ScopePhase::Waiting;
                state.content = Some(json);
                self.enqueue(Row::placeholder(id));
            }
            Err(err) => self.fail_scope(scope, &err),
        }
        deferred_reference(id)
    }

    fn outline(&mut self, kind: RecordKind, bytes: &[u8]) -> Value {
        let id = self.table.allocate();
        for segment in bytes.chunks(self.config.text_segment_size.max(1)) {
            self.enqueue(Row::new(id, kind, segment.to_vec()));
        }
        self.enqueue(Row::new(id, kind, Vec::new()));
        reference(id)
    }

    // -------------------------------------------------------------------------
    // Completion and failure
    // -------------------------------------------------------------------------

    fn complete(&mut self, id: RefId, outcome: Result<Model, UpstreamError>) -> EncodeResult<()> {
        let Some(task) = self.pending.remove(&id) else {
            return Ok(());
        };
        self.scopes[task.scope.0].pending -= 1;
        self.states.insert(id, TaskState::Emitting);

        let mut ctx = RenderContext::with_owner(Arc::clone(&self.cache), task.owner);
        let rendered = outcome
            .map_err(EncodeError::from)
            .and_then(|model| self.render(&model, task.scope, &mut ctx));
        match rendered {
            Ok(json) => {
                self.enqueue(Row::model(id, &json));
                self.states.insert(id, TaskState::Completed);
                self.try_reveal(task.scope);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(%id, error = %err, "deferred value failed");
                self.emit_error(id, &err);
                self.states.insert(id, TaskState::Errored);
                self.fail(task.scope, err)
            }
        }
    }

    fn try_reveal(&mut self, scope: ScopeId) {
        let state = &mut self.scopes[scope.0];
        if state.pending > 0 || state.phase != ScopePhase::Waiting {
            return;
        }
        let (Some(id), Some(content)) = (state.boundary, state.content.take()) else {
            return;
        };
        state.phase = ScopePhase::Revealed;
        tracing::debug!(boundary = %id, "boundary revealed");
        self.enqueue(Row::model(id, &content));
    }

    fn fail(&mut self, scope: ScopeId, err: EncodeError) -> EncodeResult<()> {
        if self.scopes[scope.0].boundary.is_none() || !err.is_subtree_failure() {
            return Err(err);
        }
        self.fail_scope(scope, &err);
        Ok(())
    }

    fn fail_scope(&mut self, scope: ScopeId, err: &EncodeError) {
        let Some(boundary) = self.scopes[scope.0].boundary else {
            return;
        };
        if !self.scopes[scope.0].is_open() {
            return;
        }
        tracing::warn!(%boundary, error = %err, "boundary failed");
        self.emit_error(boundary, err);
        self.scopes[scope.0].phase = ScopePhase::Failed;
        self.scopes[scope.0].content = None;

        let aborted = ErrorSummary::new(ABORTED_MESSAGE);
        let nested: Vec<ScopeId> = (0..self.scopes.len())
            .map(ScopeId)
            .filter(|&s| self.is_within(s, scope) && self.scopes[s.0].is_open())
            .collect();
        for s in nested {
            self.scopes[s.0].phase = ScopePhase::Failed;
            self.scopes[s.0].content = None;
            if let Some(id) = self.scopes[s.0].boundary {
                self.enqueue(Row::error(id, &aborted));
            }
        }

        let mut cancelled: Vec<RefId> = self
            .pending
            .iter()
            .filter(|(_, task)| task.scope == scope || self.is_within(task.scope, scope))
            .map(|(id, _)| *id)
            .collect();
        cancelled.sort_unstable();
        for id in cancelled {
            if let Some(task) = self.pending.remove(&id) {
                task.handle.abort();
                self.scopes[task.scope.0].pending -= 1;
                self.states.insert(id, TaskState::Errored);
                self.enqueue(Row::error(id, &aborted));
            }
        }
    }

    fn is_within(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut current = self.scopes[scope.0].parent;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.scopes[parent.0].parent;
        }
        false
    }

    fn abort_request(&mut self, err: EncodeError) -> EncodeError {
        tracing::warn!(error = %err, "request aborted");
        self.tasks.abort_all();
        let summary = self.summarize(&err);

        let mut outstanding: Vec<RefId> = self.pending.drain().map(|(id, _)| id).collect();
        for id in &outstanding {
            self.states.insert(*id, TaskState::Errored);
        }
        for scope in &mut self.scopes {
            if scope.is_open() {
                scope.phase = ScopePhase::Failed;
                outstanding.extend(scope.boundary);
            }
        }
        if !self.root_emitted {
            outstanding.push(RefId::ROOT);
        }
        outstanding.sort_unstable();
        outstanding.dedup();
        for id in outstanding {
            self.enqueue(Row::error(id, &summary));
        }

        // Backpressure no longer matters: everything queued goes out before
        // the sink is destroyed.
        while let Some(chunk) = self.outbound.pop_front() {
            if self.writer.write(&chunk).is_err() {
                break;
            }
        }
        self.writer.close_with_error(&summary.message);
        self.status = RequestStatus::Aborted;
        err
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    fn emit_error(&mut self, id: RefId, err: &EncodeError) {
        let summary = self.summarize(err);
        self.enqueue(Row::error(id, &summary));
    }

    fn summarize(&self, err: &EncodeError) -> ErrorSummary {
        let digest = self.on_error.as_ref().and_then(|hook| hook(err));
        let message = if self.config.redact_error_messages {
            REDACTED_MESSAGE.to_owned()
        } else {
            err.to_string()
        };
        ErrorSummary::new(message).with_digest(digest)
    }

    fn enqueue(&mut self, row: Row) {
        self.sequence += 1;
        if row.kind == RecordKind::Error {
            self.error_rows += 1;
        }
        tracing::debug!(sequence = self.sequence, id = %row.id, kind = ?row.kind, "row queued");
        self.outbound.push_back(Chunk::new(self.sequence, row));
    }

    fn flush_outbound(&mut self) -> EncodeResult<()> {
        while !self.writer.is_paused() {
            let Some(chunk) = self.outbound.pop_front() else {
                break;
            };
            self.writer.write(&chunk)?;
        }
        Ok(())
    }
}

fn reference(id: RefId) -> Value {
    Value::String(sentinel::reference(id))
}

fn deferred_reference(id: RefId) -> Value {
    Value::String(sentinel::deferred(id))
}

/// Runs a request into memory and returns its outcome with the bytes written.
pub async fn render_to_bytes(
    root: Model,
    options: RequestOptions,
) -> (EncodeResult<RequestSummary>, Vec<u8>) {
    let mut request = Request::with_options(root, VecSink::new(), options);
    let result = request.run().await;
    (result, request.into_sink().take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rows(bytes: &[u8]) -> Vec<Row> {
        let mut parser = flight_wire::RowParser::new();
        let mut rows = Vec::new();
        parser.feed(bytes, &mut rows).unwrap();
        rows
    }

    fn text(row: &Row) -> String {
        String::from_utf8(row.payload.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_primitives_inline() {
        let root = Model::mapping([
            ("n", Model::Null),
            ("u", Model::Undefined),
            ("f", Model::Float(f64::NAN)),
            ("s", Model::from("$money")),
        ]);
        let (result, bytes) = render_to_bytes(root, RequestOptions::default()).await;
        let summary = result.unwrap();

        assert_eq!(summary.rows, 1);
        assert_eq!(
            bytes,
            b"0:{\"n\":null,\"u\":\"$undefined\",\"f\":\"$NaN\",\"s\":\"$$money\"}\n"
        );
    }

    #[tokio::test]
    async fn test_shared_object_is_outlined_once() {
        let shared = Model::shared(Model::mapping([("name", Model::from("x"))]));
        let root = Model::mapping([("b", shared.clone()), ("c", shared)]);
        let (result, bytes) = render_to_bytes(root, RequestOptions::default()).await;
        result.unwrap();

        let rows = rows(&bytes);
        assert_eq!(rows.len(), 2);
        assert_eq!(text(&rows[0]), "{\"name\":\"x\"}");
        assert_eq!(rows[1].id, RefId::ROOT);
        assert_eq!(text(&rows[1]), "{\"b\":\"$1\",\"c\":\"$1\"}");
    }

    #[tokio::test]
    async fn test_deferred_emits_placeholder_then_content() {
        let root = Model::mapping([("later", Model::resolved(Model::Int(7)))]);
        let (result, bytes) = render_to_bytes(root, RequestOptions::default()).await;
        assert_eq!(result.unwrap().deferred, 1);

        let rows = rows(&bytes);
        assert_eq!(rows[0].kind, RecordKind::Placeholder);
        assert_eq!(rows[1].id, RefId::ROOT);
        assert_eq!(text(&rows[1]), "{\"later\":\"$@1\"}");
        assert_eq!((rows[2].id, text(&rows[2])), (RefId(1), "7".to_owned()));
    }

    #[tokio::test]
    async fn test_long_strings_are_segmented() {
        let config = EncoderConfig {
            outline_text_threshold: 4,
            text_segment_size: 3,
            ..EncoderConfig::default()
        };
        let root = Model::from("abcdefg");
        let options = RequestOptions::default().with_config(config);
        let (result, bytes) = render_to_bytes(root, options).await;
        result.unwrap();

        assert_eq!(bytes, b"1:T3,abc1:T3,def1:T1,g1:T0,0:\"$1\"\n");
    }

    #[tokio::test]
    async fn test_unregistered_function_aborts_without_boundary() {
        let root = Model::mapping([("action", Model::Function("like".into()))]);
        let mut request = Request::new(root, VecSink::new());
        let err = request.run().await.unwrap_err();

        assert_eq!(err, EncodeError::UnregisteredFunction("like".into()));
        assert_eq!(request.status(), RequestStatus::Aborted);
        assert!(request.sink().error().is_some());
        let rows = rows(request.sink().bytes());
        assert_eq!(rows.last().unwrap().kind, RecordKind::Error);
        assert_eq!(rows.last().unwrap().id, RefId::ROOT);
    }

    #[tokio::test]
    async fn test_registered_function_becomes_client_reference() {
        let manifest = ClientManifest::new().with_function("like", "actions.js", Some("like"));
        let root = Model::sequence([Model::Function("like".into()), Model::Function("like".into())]);
        let options = RequestOptions::default().with_manifest(manifest);
        let (result, bytes) = render_to_bytes(root, options).await;
        result.unwrap();

        assert_eq!(
            bytes,
            b"1:I{\"id\":\"actions.js\",\"name\":\"like\"}\n0:[\"$1\",\"$1\"]\n"
        );
    }

    #[tokio::test]
    async fn test_owner_is_restored_after_each_component() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str, seen: Arc<Mutex<Vec<String>>>, child: Model| {
            Model::component(name, Model::Null, move |ctx, _| {
                seen.lock().push(ctx.owner().map(Owner::path).unwrap_or_default());
                Ok(child.clone())
            })
        };
        let leaf = record("Leaf", Arc::clone(&seen), Model::Null);
        let page = record(
            "Page",
            Arc::clone(&seen),
            Model::sequence([leaf, Model::Int(1)]),
        );

        let mut request = Request::new(Model::sequence([page.clone(), page]), VecSink::new());
        request.run().await.unwrap();
        // The second Page is top-level again, so the owner was restored.
        assert_eq!(
            *seen.lock(),
            vec!["Page", "Page > Leaf", "Page", "Page > Leaf"]
        );
    }

    #[tokio::test]
    async fn test_deferred_resumes_with_captured_owner() {
        let seen = Arc::new(Mutex::new(None));
        let probe = {
            let seen = Arc::clone(&seen);
            Model::component("Probe", Model::Null, move |ctx, _| {
                *seen.lock() = ctx.owner().map(Owner::path);
                Ok(Model::Null)
            })
        };
        let card = Model::component("Card", Model::Null, move |_, _| {
            Ok(Model::resolved(probe.clone()))
        });

        let mut request = Request::new(card, VecSink::new());
        request.run().await.unwrap();
        // Probe ran inside the continuation scheduled by Card.
        assert_eq!(seen.lock().as_deref(), Some("Card > Probe"));
        assert_eq!(request.task_state(RefId(1)), Some(TaskState::Completed));
    }

    #[tokio::test]
    async fn test_boundary_reveals_after_its_tasks() {
        let slow = Model::deferred(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Model::Int(1))
        });
        let root = Model::mapping([
            ("b", Model::boundary(Model::mapping([("x", slow)]))),
            ("y", Model::Int(42)),
        ]);
        let (result, bytes) = render_to_bytes(root, RequestOptions::default()).await;
        result.unwrap();

        let rows = rows(&bytes);
        let kinds: Vec<(RefId, RecordKind)> = rows.iter().map(|r| (r.id, r.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (RefId(2), RecordKind::Placeholder),
                (RefId(1), RecordKind::Placeholder),
                (RefId::ROOT, RecordKind::Model),
                (RefId(2), RecordKind::Model),
                (RefId(1), RecordKind::Model),
            ]
        );
        assert_eq!(text(&rows[4]), "{\"x\":\"$@2\"}");
    }

    #[tokio::test]
    async fn test_boundary_failure_cancels_siblings_in_scope() {
        let never = Model::deferred(std::future::pending());
        let root = Model::mapping([
            (
                "b",
                Model::boundary(Model::sequence([never, Model::rejected("boom")])),
            ),
            ("y", Model::Int(42)),
        ]);
        let digests = RequestOptions::default().with_error_hook(|_| Some("d1".into()));
        let (result, bytes) = render_to_bytes(root, digests).await;
        let summary = result.unwrap();

        let rows = rows(&bytes);
        let errors: Vec<(RefId, String)> = rows
            .iter()
            .filter(|r| r.kind == RecordKind::Error)
            .map(|r| (r.id, text(r)))
            .collect();
        assert_eq!(
            errors,
            vec![
                (RefId(3), "{\"message\":\"boom\",\"digest\":\"d1\"}".to_owned()),
                (RefId(1), "{\"message\":\"boom\",\"digest\":\"d1\"}".to_owned()),
                (RefId(2), "{\"message\":\"aborted\"}".to_owned()),
            ]
        );
        assert_eq!(summary.error_rows, 3);
    }

    #[tokio::test]
    async fn test_deferred_shared_across_boundary_follows_its_first_scope() {
        let never = Model::deferred(std::future::pending());
        let root = Model::mapping([
            (
                "b",
                Model::boundary(Model::sequence([never.clone(), Model::rejected("boom")])),
            ),
            ("outside", never),
        ]);
        let (result, bytes) = render_to_bytes(root, RequestOptions::default()).await;
        result.unwrap();

        let rows = rows(&bytes);
        let root_row = rows.iter().find(|r| r.id == RefId::ROOT).unwrap();
        assert_eq!(text(root_row), "{\"b\":\"$@1\",\"outside\":\"$@2\"}");

        // The shared id belongs to the boundary that scheduled it first, so
        // the outside reader sees it cancelled too.
        let shared_error = rows
            .iter()
            .find(|r| r.id == RefId(2) && r.kind == RecordKind::Error)
            .unwrap();
        assert_eq!(text(shared_error), "{\"message\":\"aborted\"}");
    }

    #[tokio::test]
    async fn test_rejection_without_boundary_destroys_sink() {
        let root = Model::mapping([("x", Model::rejected("boom"))]);
        let mut request = Request::new(root, VecSink::new());
        let err = request.run().await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(request.sink().error(), Some("boom"));
        assert!(!request.sink().is_closed());
    }

    #[tokio::test]
    async fn test_external_abort() {
        let root = Model::mapping([("x", Model::deferred(std::future::pending()))]);
        let mut request = Request::new(root, VecSink::new());
        let handle = request.abort_handle();
        handle.abort("client went away");

        let err = request.run().await.unwrap_err();
        assert_eq!(err, EncodeError::Aborted("client went away".into()));
        assert!(handle.is_aborted());
        let rows = rows(request.sink().bytes());
        let last = rows.last().unwrap();
        assert_eq!((last.id, last.kind), (RefId(1), RecordKind::Error));
    }

    #[tokio::test]
    async fn test_redacted_messages_keep_digest() {
        let root = Model::boundary(Model::rejected("secret"));
        let options = RequestOptions::default()
            .with_config(EncoderConfig::production())
            .with_error_hook(|_| Some("abc".into()));
        let (result, bytes) = render_to_bytes(root, options).await;
        result.unwrap();

        let output = String::from_utf8(bytes).unwrap();
        assert!(!output.contains("secret"));
        assert!(output.contains("\"digest\":\"abc\""));
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let mut request = Request::new(Model::Null, VecSink::new());
        request.run().await.unwrap();
        assert_eq!(request.run().await, Err(EncodeError::AlreadyStarted));
    }
}
