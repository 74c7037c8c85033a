//! # Decoded Values
//!
//! The tree a response rebuilds. Links between ids are [`Reference`]s, which
//! hold their target weakly: a decoded tree never keeps the response's slots
//! alive, and cyclic graphs need no strong cycles.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use flight_wire::{sentinel, RefId};

use crate::loader::Module;
use crate::table::{Reference, SlotState};

/// A decoded value.
#[derive(Clone, Debug)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// The absent value.
    Undefined,
    /// Boolean.
    Bool(bool),
    /// Integer that fits `i64`.
    Int(i64),
    /// Any other number, including non-finite values.
    Float(f64),
    /// Text.
    String(String),
    /// Binary data from `B` segments.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Keyed mapping.
    Object(BTreeMap<String, Value>),
    /// Blocking link to another id; resolved whenever the embedding value is.
    Ref(Reference),
    /// Non-blocking link to another id that may still be pending.
    Deferred(Reference),
    /// A loaded client reference.
    Client(Arc<ClientModule>),
}

/// A client reference whose module finished loading.
pub struct ClientModule {
    /// Module locator.
    pub locator: String,
    /// Named export.
    pub export: Option<String>,
    /// Arguments bound by the server.
    pub bound: Vec<Value>,
    /// The loaded module.
    pub module: Module,
}

impl fmt::Debug for ClientModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientModule")
            .field("locator", &self.locator)
            .field("export", &self.export)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl Value {
    /// Member of an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Element of an array.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Value> {
        match self {
            Self::Array(items) => items.get(index),
            _ => None,
        }
    }

    /// Text, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer, if this is one.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The reference, for `Ref` and `Deferred` values.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Ref(r) | Self::Deferred(r) => Some(r),
            _ => None,
        }
    }

    /// Follows references until a non-reference value, if every hop is
    /// resolved.
    #[must_use]
    pub fn resolved(&self) -> Option<Value> {
        let mut current = self.clone();
        let mut seen = HashSet::new();
        while let Some(reference) = current.as_reference() {
            if !seen.insert(reference.id()) {
                return None;
            }
            current = reference.value()?;
        }
        Some(current)
    }

    /// Converts the tree to JSON for display and comparison.
    ///
    /// Resolved references are inlined. Values JSON cannot show inline use
    /// the wire's sentinels: a pending reference becomes `"$@<id>"`, a
    /// reference back into a value being expanded becomes `"$<id>"`, and a
    /// rejected one becomes `{"$error": message}`.
    #[must_use]
    pub fn expand(&self) -> serde_json::Value {
        self.expand_with(&mut Vec::new())
    }

    fn expand_with(&self, path: &mut Vec<RefId>) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Undefined => Json::String(sentinel::UNDEFINED.to_owned()),
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(x) => sentinel::float(*x).map_or_else(
                || serde_json::Number::from_f64(*x).map_or(Json::Null, Json::Number),
                |special| Json::String(special.to_owned()),
            ),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            Self::Array(items) => Json::Array(items.iter().map(|v| v.expand_with(path)).collect()),
            Self::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.expand_with(path)))
                    .collect(),
            ),
            Self::Ref(reference) | Self::Deferred(reference) => {
                let id = reference.id();
                if path.contains(&id) {
                    return Json::String(sentinel::reference(id));
                }
                match reference.state() {
                    Some(SlotState::Resolved(value)) => {
                        path.push(id);
                        let expanded = value.expand_with(path);
                        path.pop();
                        expanded
                    }
                    Some(SlotState::Rejected(error)) => {
                        serde_json::json!({ "$error": error.to_string() })
                    }
                    Some(SlotState::Pending) | None => Json::String(sentinel::deferred(id)),
                }
            }
            Self::Client(client) => {
                let mut map = serde_json::Map::new();
                map.insert("$client".into(), Json::String(client.locator.clone()));
                if let Some(export) = &client.export {
                    map.insert("export".into(), Json::String(export.clone()));
                }
                if !client.bound.is_empty() {
                    let bound = client.bound.iter().map(|v| v.expand_with(path)).collect();
                    map.insert("bound".into(), Json::Array(bound));
                }
                Json::Object(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_plain_tree() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), Value::Int(1));
        map.insert("b".to_owned(), Value::Float(f64::INFINITY));
        map.insert("c".to_owned(), Value::Array(vec![Value::Undefined, Value::Null]));
        let value = Value::Object(map);

        assert_eq!(
            value.expand(),
            json!({"a": 1, "b": "$Infinity", "c": ["$undefined", null]})
        );
        assert_eq!(value.get("a").and_then(Value::as_i64), Some(1));
        assert!(value.get("c").and_then(|c| c.at(1)).is_some());
    }

    #[test]
    fn test_client_expansion() {
        let client = Value::Client(Arc::new(ClientModule {
            locator: "mod".into(),
            export: Some("Button".into()),
            bound: Vec::new(),
            module: Module::new(()),
        }));
        assert_eq!(client.expand(), json!({"$client": "mod", "export": "Button"}));
        assert!(client.resolved().is_some());
    }
}
