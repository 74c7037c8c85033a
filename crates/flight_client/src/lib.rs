//! # Flight Client
//!
//! The decoder half of Flight: rebuilds a value tree from a row stream that
//! may arrive in arbitrary pieces.
//!
//! ## Architecture
//!
//! ```text
//!   bytes ──> RowParser ──> rows ──> DecoderTable ──> Slot per id ──> Handle
//!                                        │
//!                                        │ I rows
//!                                        ▼
//!                                 ModuleRegistry ──> ModuleLoader
//!                                 (shared, one load per locator)
//! ```
//!
//! Every id settles exactly once. Values link to other ids through
//! [`Reference`]s that hold their targets weakly, so cyclic trees decode
//! without leaking.
//!
//! ## Example
//!
//! ```rust,ignore
//! use flight_client::{ModuleRegistry, Response, StaticModuleLoader};
//!
//! let response = Response::new(ModuleRegistry::new(StaticModuleLoader::new()));
//! response.process_bytes(b"1:\"hi\"\n0:{\"greeting\":\"$1\"}\n")?;
//! response.close()?;
//! let root = response.root().settled().await?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod loader;
pub mod response;
pub mod table;
pub mod value;

pub use config::DecoderConfig;
pub use error::{DecodeError, DecodeResult, ModuleLoadError};
pub use loader::{
    LoadFuture, Module, ModuleLoader, ModuleRegistry, PreloadTask, StaticModuleLoader,
};
pub use response::{Response, ResponseStats, ResponseStatus};
pub use table::{DecoderTable, Handle, Reference, SlotState};
pub use value::{ClientModule, Value};
