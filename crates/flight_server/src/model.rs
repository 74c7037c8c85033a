//! # Encoder Input Model
//!
//! The closed set of values a request can render.
//!
//! ## Identity
//!
//! ```text
//! Shared(Arc<Model>)   outlined, deduplicated by pointer   -> "$<id>"
//! BackRef(Weak<Model>) points at a Shared already in flight -> "$<id>"
//! ClientRef(Arc<..>)   deduplicated by pointer, and by
//!                      (locator, export) when unbound       -> "$<id>"
//! Deferred(Arc<..>)    deduplicated by pointer               -> "$@<id>"
//! Boundary(Box<..>)    fresh id every time                   -> "$@<id>"
//! ```
//!
//! Everything else is written inline. Cycles are built with
//! [`Arc::new_cyclic`] and a `BackRef` to the enclosing `Shared`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::RenderContext;
use crate::error::UpstreamError;

/// Signature of a component callable.
pub type RenderFn =
    dyn Fn(&mut RenderContext, &Model) -> Result<Model, UpstreamError> + Send + Sync;

/// Future produced by a deferred value.
pub type ModelFuture = Pin<Box<dyn Future<Output = Result<Model, UpstreamError>> + Send>>;

/// A value the encoder can render.
#[derive(Clone)]
pub enum Model {
    /// JSON `null`.
    Null,
    /// The absent value, distinct from `null`.
    Undefined,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float, including the values JSON cannot carry.
    Float(f64),
    /// Text. Long strings are outlined as text segments.
    String(String),
    /// Binary data, always outlined as binary segments.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Sequence(Vec<Model>),
    /// Keyed mapping, written in insertion order.
    Mapping(Vec<(String, Model)>),
    /// Object with identity, outlined on first sight.
    Shared(Arc<Model>),
    /// Non-owning pointer to a shared object, for cycles.
    BackRef(Weak<Model>),
    /// Code the receiver loads through its module loader.
    ClientRef(Arc<ClientReference>),
    /// A named server function, serializable through the client manifest.
    Function(String),
    /// Callable evaluated by the encoder; its output takes its place.
    Component(Arc<Component>),
    /// Value that resolves asynchronously.
    ///
    /// One id per `Deferred` per request. The task belongs to the scope that
    /// first renders it: if that boundary fails, the id is rejected with
    /// "aborted" for every other place that references it as well.
    Deferred(Arc<Deferred>),
    /// Subtree isolating failures from the rest of the result.
    Boundary(Box<Model>),
}

impl Model {
    /// Wraps a model so it is outlined and deduplicated by identity.
    #[must_use]
    pub fn shared(model: Self) -> Self {
        Self::Shared(Arc::new(model))
    }

    /// Builds a mapping from key/value pairs.
    #[must_use]
    pub fn mapping<K: Into<String>>(entries: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Builds a sequence.
    #[must_use]
    pub fn sequence(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Sequence(items.into_iter().collect())
    }

    /// Client reference without bound arguments.
    #[must_use]
    pub fn client_ref(locator: impl Into<String>, export: Option<&str>) -> Self {
        Self::ClientRef(Arc::new(ClientReference::new(locator, export)))
    }

    /// Component with a callable and props.
    #[must_use]
    pub fn component<F>(name: impl Into<String>, props: Self, render: F) -> Self
    where
        F: Fn(&mut RenderContext, &Model) -> Result<Model, UpstreamError> + Send + Sync + 'static,
    {
        Self::Component(Arc::new(Component {
            name: name.into(),
            props,
            render: Arc::new(render),
        }))
    }

    /// Deferred value backed by a future.
    #[must_use]
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Model, UpstreamError>> + Send + 'static,
    {
        Self::Deferred(Arc::new(Deferred::new(future)))
    }

    /// Deferred value that is already resolved.
    #[must_use]
    pub fn resolved(model: Self) -> Self {
        Self::deferred(std::future::ready(Ok(model)))
    }

    /// Deferred value that is already rejected.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        let error = UpstreamError::new(message);
        Self::deferred(std::future::ready(Err(error)))
    }

    /// Wraps a subtree in a failure boundary.
    #[must_use]
    pub fn boundary(child: Self) -> Self {
        Self::Boundary(Box::new(child))
    }

    /// Short name of the variant, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Shared(_) => "shared",
            Self::BackRef(_) => "back-ref",
            Self::ClientRef(_) => "client-ref",
            Self::Function(_) => "function",
            Self::Component(_) => "component",
            Self::Deferred(_) => "deferred",
            Self::Boundary(_) => "boundary",
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Undefined => f.write_str("Undefined"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Self::Sequence(items) => f.debug_list().entries(items).finish(),
            Self::Mapping(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            // Shared subtrees may be cyclic.
            Self::Shared(arc) => write!(f, "Shared({:p})", Arc::as_ptr(arc)),
            Self::BackRef(weak) => write!(f, "BackRef({:p})", weak.as_ptr()),
            Self::ClientRef(client) => write!(f, "ClientRef({:?})", client.locator),
            Self::Function(name) => write!(f, "Function({name:?})"),
            Self::Component(component) => write!(f, "Component({:?})", component.name),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Boundary(child) => f.debug_tuple("Boundary").field(child).finish(),
        }
    }
}

impl From<bool> for Model {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Model {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Model {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Model {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Model {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Model {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for Model {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Pointer to code the receiver must load.
#[derive(Clone, Debug)]
pub struct ClientReference {
    /// Module locator, opaque to the encoder.
    pub locator: String,
    /// Named export within the module.
    pub export: Option<String>,
    /// Arguments bound on the server.
    pub bound: Vec<Model>,
}

impl ClientReference {
    /// Reference without bound arguments.
    #[must_use]
    pub fn new(locator: impl Into<String>, export: Option<&str>) -> Self {
        Self {
            locator: locator.into(),
            export: export.map(str::to_owned),
            bound: Vec::new(),
        }
    }

    /// Adds bound arguments.
    #[must_use]
    pub fn bind(mut self, args: impl IntoIterator<Item = Model>) -> Self {
        self.bound.extend(args);
        self
    }

    /// Dedup key for unbound references.
    pub(crate) fn key(&self) -> Option<(String, Option<String>)> {
        self.bound
            .is_empty()
            .then(|| (self.locator.clone(), self.export.clone()))
    }
}

/// A callable the encoder evaluates in place.
pub struct Component {
    /// Display name; becomes the owner while the callable runs.
    pub name: String,
    /// Props passed to the callable.
    pub props: Model,
    /// The callable.
    pub render: Arc<RenderFn>,
}

/// A value backed by a future, consumed by the first request that renders it.
pub struct Deferred {
    future: Mutex<Option<ModelFuture>>,
}

impl Deferred {
    /// Wraps a future.
    #[must_use]
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Model, UpstreamError>> + Send + 'static,
    {
        Self {
            future: Mutex::new(Some(Box::pin(future))),
        }
    }

    /// Takes the future out. Returns `None` once taken.
    pub(crate) fn take(&self) -> Option<ModelFuture> {
        self.future.lock().take()
    }
}
