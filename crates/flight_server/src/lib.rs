//! # Flight Server
//!
//! The encoder half of Flight: renders a [`Model`] tree into rows.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Request                             │
//! ├──────────────────┬──────────────────┬────────────────────────┤
//! │  ReferenceTable  │  RenderContext   │  JoinSet<deferred>     │
//! │  identity -> id  │  owner + cache   │  completion order      │
//! └────────┬─────────┴──────────────────┴───────────┬────────────┘
//!          │ rows, stamped with sequence numbers    │
//!          ▼                                        ▼
//!                   ChunkWriter ──> ByteSink
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use flight_server::{render_to_bytes, Model, RequestOptions};
//!
//! let shared = Model::shared(Model::from("hello"));
//! let root = Model::mapping([("a", shared.clone()), ("b", shared)]);
//! let (summary, bytes) = render_to_bytes(root, RequestOptions::default()).await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod request;
pub mod table;

pub use cache::RequestCache;
pub use config::{ClientManifest, EncoderConfig, ManifestEntry, REDACTED_MESSAGE};
pub use context::{Owner, RenderContext};
pub use error::{EncodeError, EncodeResult, UpstreamError};
pub use model::{ClientReference, Component, Deferred, Model, ModelFuture, RenderFn};
pub use request::{
    render_to_bytes, AbortHandle, ErrorHook, Request, RequestOptions, RequestStatus,
    RequestSummary, TaskState, ABORTED_MESSAGE,
};
pub use table::{Interned, Interning, ReferenceTable};
