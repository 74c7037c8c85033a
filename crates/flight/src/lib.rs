//! # Flight
//!
//! Streaming component serialization: a server renders a tree of values,
//! some of them still being computed, into a stream of rows; a client
//! rebuilds the tree while the rows arrive.
//!
//! ## Crates
//!
//! ```text
//! ┌─────────────────┐   rows    ┌─────────────────┐
//! │  flight_server  │ ────────> │  flight_client  │
//! │  Model, Request │           │ Response, Value │
//! └────────┬────────┘           └────────┬────────┘
//!          └──────────┬──────────────────┘
//!              ┌──────┴──────┐
//!              │ flight_wire │  row grammar, parser, writer, sinks
//!              └─────────────┘
//! ```
//!
//! This crate re-exports all three and adds [`pipe`], which runs a request
//! straight into a response over a bounded in-memory channel.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub use flight_client as client;
pub use flight_server as server;
pub use flight_wire as wire;

pub use flight_client::{
    DecodeError, DecodeResult, DecoderConfig, Handle, Module, ModuleLoadError, ModuleLoader,
    ModuleRegistry, Response, ResponseStatus, SlotState, StaticModuleLoader, Value,
};
pub use flight_server::{
    ClientManifest, EncodeError, EncodeResult, EncoderConfig, Model, Request, RequestOptions,
    RequestSummary, UpstreamError,
};
pub use flight_wire::{RefId, RowParser};

/// Result of [`pipe`].
#[derive(Debug)]
pub struct PipeOutcome {
    /// How the request ended.
    pub encoded: EncodeResult<RequestSummary>,
    /// How the response consumed the stream.
    pub decoded: DecodeResult<()>,
}

/// Renders `root` into `response` through a channel holding at most
/// `capacity` frames. Backpressure is real: the encoder pauses whenever the
/// decoder falls behind.
pub async fn pipe(
    root: Model,
    options: RequestOptions,
    response: &Response,
    capacity: usize,
) -> PipeOutcome {
    let (sink, frames) = flight_wire::channel(capacity);
    let encode = async move {
        let mut request = Request::with_options(root, sink, options);
        request.run().await
    };
    let (encoded, decoded) = tokio::join!(encode, response.consume(frames));
    tracing::debug!(
        encoded = encoded.is_ok(),
        decoded = decoded.is_ok(),
        "pipe finished"
    );
    PipeOutcome { encoded, decoded }
}
