//! # Encoder Reference Table
//!
//! Assigns ids in first-use order and memoizes objects by identity.
//!
//! ## Design
//!
//! ```text
//! identity (pointer) ──> RefId        HashMap, O(1)
//! (locator, export)  ──> RefId        unbound client references only
//! retained           ──> Vec<Interned> strong clones
//! ```
//!
//! The table keeps a strong clone of everything it interns for the lifetime
//! of the request, so an address can never be reused by a different object
//! while its id is live.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use flight_wire::RefId;

use crate::model::{ClientReference, Deferred, Model};

/// An object with identity.
#[derive(Clone)]
pub enum Interned {
    /// A shared model node.
    Model(Arc<Model>),
    /// A client reference.
    Client(Arc<ClientReference>),
    /// A deferred value.
    Deferred(Arc<Deferred>),
}

impl Interned {
    fn identity(&self) -> usize {
        match self {
            Self::Model(arc) => Arc::as_ptr(arc) as usize,
            Self::Client(arc) => Arc::as_ptr(arc) as usize,
            Self::Deferred(arc) => Arc::as_ptr(arc) as usize,
        }
    }
}

/// Outcome of [`ReferenceTable::intern`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interning {
    /// First sight; the caller must emit the content.
    Fresh(RefId),
    /// Seen before; the caller writes a reference only.
    Existing(RefId),
}

impl Interning {
    /// The id either way.
    #[must_use]
    pub const fn id(self) -> RefId {
        match self {
            Self::Fresh(id) | Self::Existing(id) => id,
        }
    }
}

/// Per-request identity table.
pub struct ReferenceTable {
    next: RefId,
    by_identity: HashMap<usize, RefId>,
    by_client_key: HashMap<(String, Option<String>), RefId>,
    retained: Vec<Interned>,
}

impl ReferenceTable {
    /// Creates a table. Id 0 is reserved for the root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: RefId::ROOT.next(),
            by_identity: HashMap::new(),
            by_client_key: HashMap::new(),
            retained: Vec::new(),
        }
    }

    /// Mints a fresh id that is not tied to any object.
    pub fn allocate(&mut self) -> RefId {
        let id = self.next;
        self.next = id.next();
        id
    }

    /// Returns the id of `value`, interning it on first sight.
    pub fn intern(&mut self, value: &Interned) -> Interning {
        let identity = value.identity();
        if let Some(&id) = self.by_identity.get(&identity) {
            return Interning::Existing(id);
        }

        let key = match value {
            Interned::Client(client) => client.key(),
            _ => None,
        };
        if let Some(key) = &key {
            if let Some(&id) = self.by_client_key.get(key) {
                self.by_identity.insert(identity, id);
                self.retained.push(value.clone());
                return Interning::Existing(id);
            }
        }

        let id = self.allocate();
        self.by_identity.insert(identity, id);
        if let Some(key) = key {
            self.by_client_key.insert(key, id);
        }
        self.retained.push(value.clone());
        Interning::Fresh(id)
    }

    /// Id already assigned to the target of a back reference.
    #[must_use]
    pub fn lookup_weak(&self, target: &Weak<Model>) -> Option<RefId> {
        self.by_identity.get(&(target.as_ptr() as usize)).copied()
    }

    /// Number of ids minted, including the root.
    #[must_use]
    pub const fn ids_allocated(&self) -> u32 {
        self.next.get()
    }

    /// Number of distinct objects interned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    /// Returns true when nothing was interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }
}

impl Default for ReferenceTable {
    fn default() -> Self {
        Self::new()
    }
}
