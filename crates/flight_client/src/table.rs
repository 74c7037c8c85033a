//! # Decoder Reference Table
//!
//! Mirrors the encoder's ids. Each id owns a single-assignment [`Slot`] that
//! goes `Pending -> Resolved | Rejected` exactly once and can be observed by
//! polling ([`Reference::state`]) or by subscription ([`Handle::settled`]).
//!
//! ## Phases
//!
//! ```text
//!                  ┌──── P ────┐
//!   Unseen ────────┴──> Placeholder ──┬── content ──> Blocked ──deps ok──> Resolved
//!                                     ├── T/B ──────> Streaming ──0,───> Resolved
//!                                     ├── I ────────> Loading ──module─> Blocked
//!                                     └── E ─────────────────────────────> Rejected
//! ```
//!
//! A blocked value is reported resolved once every id it references with a
//! blocking `$<id>` is resolved or blocked only on resolvable ids, so cycles
//! among delivered rows resolve together. A rejected dependency rejects every
//! value blocked on it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use flight_wire::{
    ProtocolError, ProtocolResult, RecordKind, RefId, Sentinel, DEFAULT_MAX_ROW_LENGTH,
};
use tokio::sync::watch;

use crate::error::{DecodeError, DecodeResult, ModuleLoadError};
use crate::loader::Module;
use crate::value::{ClientModule, Value};

/// Observable state of one id.
#[derive(Clone, Debug)]
pub enum SlotState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved(Value),
    /// Settled with an error.
    Rejected(DecodeError),
}

impl SlotState {
    /// Returns true while unsettled.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// The outcome, or `None` while pending.
    #[must_use]
    pub fn into_result(self) -> Option<DecodeResult<Value>> {
        match self {
            Self::Pending => None,
            Self::Resolved(value) => Some(Ok(value)),
            Self::Rejected(error) => Some(Err(error)),
        }
    }
}

/// Single-assignment cell for one id.
pub struct Slot {
    id: RefId,
    tx: watch::Sender<SlotState>,
}

impl Slot {
    fn new(id: RefId) -> Self {
        let (tx, _) = watch::channel(SlotState::Pending);
        Self { id, tx }
    }

    fn state(&self) -> SlotState {
        self.tx.borrow().clone()
    }

    fn settle(&self, state: SlotState) {
        self.tx.send_replace(state);
    }
}

/// Weak link to an id, embedded in decoded values.
#[derive(Clone)]
pub struct Reference {
    id: RefId,
    slot: Weak<Slot>,
}

impl Reference {
    /// Target id.
    #[must_use]
    pub const fn id(&self) -> RefId {
        self.id
    }

    /// Current state, or `None` once the response was dropped.
    #[must_use]
    pub fn state(&self) -> Option<SlotState> {
        self.slot.upgrade().map(|slot| slot.state())
    }

    /// The value, if resolved.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match self.state()? {
            SlotState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Subscribes to the target, or `None` once the response was dropped.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.slot.upgrade().map(|slot| Handle {
            id: self.id,
            rx: slot.tx.subscribe(),
        })
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference(${})", self.id)
    }
}

/// Subscription to one id.
#[derive(Clone)]
pub struct Handle {
    id: RefId,
    rx: watch::Receiver<SlotState>,
}

impl Handle {
    /// Target id.
    #[must_use]
    pub const fn id(&self) -> RefId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.rx.borrow().clone()
    }

    /// Returns true while unsettled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_pending()
    }

    /// Waits until the id settles.
    ///
    /// # Errors
    ///
    /// The rejection, or [`DecodeError::Aborted`] when the response is
    /// dropped while the id is still pending.
    pub async fn settled(&self) -> DecodeResult<Value> {
        let mut rx = self.rx.clone();
        let state = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(DecodeError::Aborted("response dropped".into())),
        };
        state
            .into_result()
            .unwrap_or_else(|| Err(DecodeError::Aborted("response dropped".into())))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("state", &*self.rx.borrow())
            .finish()
    }
}

enum Phase {
    Unseen,
    Placeholder,
    Streaming {
        kind: RecordKind,
        buffer: Vec<u8>,
    },
    Loading {
        locator: String,
        export: Option<String>,
        bound: Vec<Value>,
        deps: Vec<RefId>,
    },
    Blocked {
        value: Value,
        deps: Vec<RefId>,
    },
    Resolved,
    Rejected(DecodeError),
}

impl Phase {
    const fn is_settled(&self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected(_))
    }

    const fn accepts_resolution(&self) -> bool {
        matches!(self, Self::Unseen | Self::Placeholder)
    }
}

struct Entry {
    slot: Arc<Slot>,
    phase: Phase,
}

/// Decoder-side id table.
pub struct DecoderTable {
    entries: HashMap<RefId, Entry>,
    blocked: BTreeSet<RefId>,
    closed: bool,
    max_value_length: usize,
}

impl DecoderTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            blocked: BTreeSet::new(),
            closed: false,
            max_value_length: DEFAULT_MAX_ROW_LENGTH,
        }
    }

    /// Limits the size of a value assembled from `T`/`B` segments.
    #[must_use]
    pub fn with_max_value_length(mut self, max_value_length: usize) -> Self {
        self.max_value_length = max_value_length;
        self
    }

    /// Creates an empty table whose root slot already exists, with a handle
    /// on it.
    #[must_use]
    pub fn with_root() -> (Self, Handle) {
        let slot = Arc::new(Slot::new(RefId::ROOT));
        let handle = Handle {
            id: RefId::ROOT,
            rx: slot.tx.subscribe(),
        };
        let mut table = Self::new();
        table.entries.insert(
            RefId::ROOT,
            Entry {
                slot,
                phase: Phase::Unseen,
            },
        );
        (table, handle)
    }

    /// Weak reference to `id`, creating a pending slot for an id not seen
    /// yet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownReference`] for an unseen id after close.
    pub fn lookup(&mut self, id: RefId) -> ProtocolResult<Reference> {
        let entry = self.entry(id)?;
        Ok(Reference {
            id,
            slot: Arc::downgrade(&entry.slot),
        })
    }

    /// Subscription to `id`, creating a pending slot for an id not seen yet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownReference`] for an unseen id after close.
    pub fn handle(&mut self, id: RefId) -> ProtocolResult<Handle> {
        let entry = self.entry(id)?;
        Ok(Handle {
            id,
            rx: entry.slot.tx.subscribe(),
        })
    }

    /// Stores the content of `id`. It is reported resolved once every id in
    /// `deps` can resolve; call [`DecoderTable::settle`] afterwards.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateResolution`] when `id` already has content.
    pub fn register(&mut self, id: RefId, value: Value, deps: Vec<RefId>) -> ProtocolResult<()> {
        self.accept(id)?.phase = Phase::Blocked { value, deps };
        self.blocked.insert(id);
        Ok(())
    }

    /// Rejects `id` with an error reported by the server.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateResolution`] when `id` already has content.
    pub fn reject(&mut self, id: RefId, error: DecodeError) -> ProtocolResult<()> {
        self.accept(id)?;
        self.settle_rejected(id, error);
        Ok(())
    }

    /// Records a placeholder row.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::LatePlaceholder`] when content already arrived.
    pub fn placeholder(&mut self, id: RefId) -> ProtocolResult<()> {
        let entry = self.entry(id)?;
        match entry.phase {
            Phase::Unseen => {
                entry.phase = Phase::Placeholder;
                Ok(())
            }
            Phase::Placeholder => Ok(()),
            _ => Err(ProtocolError::LatePlaceholder(id)),
        }
    }

    /// Appends one `T`/`B` segment. An empty segment completes the value.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MixedSegments`], [`ProtocolError::InvalidUtf8`],
    /// [`ProtocolError::DuplicateResolution`], or
    /// [`ProtocolError::RowTooLong`] once the value outgrows its limit.
    pub fn segment(&mut self, id: RefId, kind: RecordKind, bytes: &[u8]) -> ProtocolResult<()> {
        let max = self.max_value_length;
        let entry = self.entry(id)?;
        let too_long = ProtocolError::RowTooLong { id, max };
        match &mut entry.phase {
            phase if phase.accepts_resolution() => {
                if bytes.len() > max {
                    return Err(too_long);
                }
                *phase = Phase::Streaming {
                    kind,
                    buffer: bytes.to_vec(),
                };
            }
            Phase::Streaming { kind: current, buffer } if *current == kind => {
                if buffer.len() + bytes.len() > max {
                    return Err(too_long);
                }
                buffer.extend_from_slice(bytes);
            }
            Phase::Streaming { .. } => return Err(ProtocolError::MixedSegments(id)),
            _ => return Err(ProtocolError::DuplicateResolution(id)),
        }
        if !bytes.is_empty() {
            return Ok(());
        }

        let Phase::Streaming { buffer, .. } = std::mem::replace(&mut entry.phase, Phase::Resolved)
        else {
            return Ok(());
        };
        let value = if kind == RecordKind::Text {
            match String::from_utf8(buffer) {
                Ok(text) => Value::String(text),
                Err(_) => {
                    let error = ProtocolError::InvalidUtf8(id);
                    entry.phase = Phase::Rejected(DecodeError::Protocol(error.clone()));
                    entry
                        .slot
                        .settle(SlotState::Rejected(DecodeError::Protocol(error.clone())));
                    return Err(error);
                }
            }
        } else {
            Value::Bytes(buffer)
        };
        entry.slot.settle(SlotState::Resolved(value));
        Ok(())
    }

    /// Records a client reference whose module is being loaded.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateResolution`] when `id` already has content.
    pub fn begin_load(
        &mut self,
        id: RefId,
        locator: String,
        export: Option<String>,
        bound: Vec<Value>,
        deps: Vec<RefId>,
    ) -> ProtocolResult<()> {
        self.accept(id)?.phase = Phase::Loading {
            locator,
            export,
            bound,
            deps,
        };
        Ok(())
    }

    /// Completes a module load started by [`DecoderTable::begin_load`] and
    /// settles. Ignored when the id is no longer loading.
    pub fn finish_load(&mut self, id: RefId, result: Result<Module, ModuleLoadError>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !matches!(entry.phase, Phase::Loading { .. }) {
            return;
        }
        match result {
            Ok(module) => {
                let Phase::Loading {
                    locator,
                    export,
                    bound,
                    deps,
                } = std::mem::replace(&mut entry.phase, Phase::Unseen)
                else {
                    return;
                };
                tracing::debug!(%id, locator, "client reference loaded");
                let client = ClientModule {
                    locator,
                    export,
                    bound,
                    module,
                };
                entry.phase = Phase::Blocked {
                    value: Value::Client(Arc::new(client)),
                    deps,
                };
                self.blocked.insert(id);
            }
            Err(error) => {
                tracing::warn!(%id, %error, "client reference failed to load");
                self.settle_rejected(id, DecodeError::ModuleLoad(error));
            }
        }
        self.settle();
    }

    /// Resolves every blocked value that can resolve and rejects every value
    /// blocked on a rejected id.
    pub fn settle(&mut self) {
        loop {
            let doomed: Vec<(RefId, DecodeError)> = self
                .blocked
                .iter()
                .filter_map(|&id| {
                    self.deps_of(id)
                        .iter()
                        .find_map(|&dep| self.rejection(dep))
                        .map(|error| (id, error))
                })
                .collect();
            if doomed.is_empty() {
                break;
            }
            for (id, error) in doomed {
                self.settle_rejected(id, error);
            }
        }

        let mut stuck: HashSet<RefId> = HashSet::new();
        loop {
            let newly: Vec<RefId> = self
                .blocked
                .iter()
                .copied()
                .filter(|id| !stuck.contains(id))
                .filter(|&id| {
                    self.deps_of(id)
                        .iter()
                        .any(|dep| stuck.contains(dep) || !self.can_resolve(*dep))
                })
                .collect();
            if newly.is_empty() {
                break;
            }
            stuck.extend(newly);
        }

        let ready: Vec<RefId> = self
            .blocked
            .iter()
            .copied()
            .filter(|id| !stuck.contains(id))
            .collect();
        for id in ready {
            self.blocked.remove(&id);
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Phase::Blocked { value, .. } =
                    std::mem::replace(&mut entry.phase, Phase::Resolved)
                {
                    tracing::trace!(%id, "resolved");
                    entry.slot.settle(SlotState::Resolved(value));
                }
            }
        }
    }

    /// Marks the stream finished: ids still waiting for rows are rejected
    /// with [`DecodeError::IncompleteStream`], and lookups of unseen ids fail
    /// from now on. Module loads in flight continue.
    ///
    /// Returns the ids rejected directly.
    pub fn close(&mut self) -> Vec<RefId> {
        self.closed = true;
        let mut incomplete: Vec<RefId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.phase,
                    Phase::Unseen | Phase::Placeholder | Phase::Streaming { .. }
                )
            })
            .map(|(id, _)| *id)
            .collect();
        incomplete.sort_unstable();
        for &id in &incomplete {
            self.settle_rejected(id, DecodeError::IncompleteStream(id));
        }
        self.settle();
        incomplete
    }

    /// Rejects every unsettled id, module loads included, with `error`.
    pub fn fail_all(&mut self, error: &DecodeError) {
        self.closed = true;
        let ids = self.pending_ids();
        for id in ids {
            self.settle_rejected(id, error.clone());
        }
    }

    /// Unsettled ids, ascending.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<RefId> {
        let mut ids: Vec<RefId> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.phase.is_settled())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// State of `id`, if the table knows it.
    #[must_use]
    pub fn state(&self, id: RefId) -> Option<SlotState> {
        self.entries.get(&id).map(|entry| entry.slot.state())
    }

    /// Number of ids known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no id is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes a JSON payload, pushing every blocking reference onto `deps`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownSentinel`] for malformed `$` strings, or
    /// [`ProtocolError::UnknownReference`] after close.
    pub fn decode(
        &mut self,
        json: &serde_json::Value,
        deps: &mut Vec<RefId>,
    ) -> ProtocolResult<Value> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => n
                .as_i64()
                .map_or_else(|| Value::Float(n.as_f64().unwrap_or(f64::NAN)), Value::Int),
            Json::String(text) => match Sentinel::parse(text)? {
                None => Value::String(text.clone()),
                Some(Sentinel::Reference(id)) => {
                    deps.push(id);
                    Value::Ref(self.lookup(id)?)
                }
                Some(Sentinel::Deferred(id)) => Value::Deferred(self.lookup(id)?),
                Some(Sentinel::Escaped(literal)) => Value::String(literal.to_owned()),
                Some(Sentinel::Float(x)) => Value::Float(x),
                Some(Sentinel::Undefined) => Value::Undefined,
            },
            Json::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.decode(item, deps))
                    .collect::<ProtocolResult<_>>()?,
            ),
            Json::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| Ok::<_, ProtocolError>((key.clone(), self.decode(item, deps)?)))
                    .collect::<ProtocolResult<_>>()?,
            ),
        })
    }

    fn entry(&mut self, id: RefId) -> ProtocolResult<&mut Entry> {
        if self.closed && !self.entries.contains_key(&id) {
            return Err(ProtocolError::UnknownReference(id));
        }
        Ok(self.entries.entry(id).or_insert_with(|| Entry {
            slot: Arc::new(Slot::new(id)),
            phase: Phase::Unseen,
        }))
    }

    fn accept(&mut self, id: RefId) -> ProtocolResult<&mut Entry> {
        let entry = self.entry(id)?;
        if entry.phase.accepts_resolution() {
            Ok(entry)
        } else {
            Err(ProtocolError::DuplicateResolution(id))
        }
    }

    fn settle_rejected(&mut self, id: RefId, error: DecodeError) {
        self.blocked.remove(&id);
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.phase.is_settled() {
                return;
            }
            tracing::trace!(%id, %error, "rejected");
            entry.phase = Phase::Rejected(error.clone());
            entry.slot.settle(SlotState::Rejected(error));
        }
    }

    fn deps_of(&self, id: RefId) -> &[RefId] {
        match self.entries.get(&id).map(|entry| &entry.phase) {
            Some(Phase::Blocked { deps, .. }) => deps,
            _ => &[],
        }
    }

    fn can_resolve(&self, id: RefId) -> bool {
        matches!(
            self.entries.get(&id).map(|entry| &entry.phase),
            Some(Phase::Resolved | Phase::Blocked { .. })
        )
    }

    fn rejection(&self, id: RefId) -> Option<DecodeError> {
        match &self.entries.get(&id)?.phase {
            Phase::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }
}

impl Default for DecoderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
