//! # Parameter Store
//!
//! An ordered, string-keyed store of tagged values. Used both for a
//! message's user parameters/properties and for a link's default
//! properties. Insertion order is preserved and is load-bearing: the
//! persistence log and the wire packet descriptor both walk entries in
//! the order they were inserted, and callers rely on reading them back
//! in that same order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single tagged value carried by a [`ParameterStore`] entry.
///
/// ## Wire and Log Tags
///
/// Tag values mirror the encoding in the packet descriptor and the
/// persistence log (spec-level tag table):
/// - `0` int32 parameter, `1` float32 parameter, `2` string parameter,
///   `3` bytes parameter
/// - `10` int32 property, `11` float32 property, `12` string property
///
/// Whether an entry is a "parameter" or a "property" is not encoded in
/// `Parameter` itself — it is determined by which [`ParameterStore`]
/// (message parameters vs. message properties) holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    Int32(i32),
    Float32(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl Parameter {
    /// Descriptor tag for this value when stored as a message parameter.
    pub fn parameter_tag(&self) -> u8 {
        match self {
            Parameter::Int32(_) => 0,
            Parameter::Float32(_) => 1,
            Parameter::String(_) => 2,
            Parameter::Bytes(_) => 3,
        }
    }

    /// Descriptor tag for this value when stored as a message property.
    ///
    /// Bytes values are never valid properties (only parameters and
    /// wire-level properties carry int/float/string), so this returns
    /// `None` for a `Bytes` variant rather than panicking — a caller can
    /// insert one into a message's properties (nothing in the type system
    /// forbids it), and that must not abort the process on publish.
    pub fn property_tag(&self) -> Option<u8> {
        match self {
            Parameter::Int32(_) => Some(10),
            Parameter::Float32(_) => Some(11),
            Parameter::String(_) => Some(12),
            Parameter::Bytes(_) => None,
        }
    }
}

/// Ordered string-keyed store of [`Parameter`] values.
///
/// Backed by an insertion-ordered vector plus a key→index map for O(1)
/// lookup, rather than a `HashMap`, because encode/decode and persistence
/// round-trips depend on stable iteration order. Serializes as the plain
/// entry list; the index is transient and rebuilt on deserialize so
/// callers never have to remember to do it themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    entries: Vec<(String, Parameter)>,
    index: HashMap<String, usize>,
}

impl Serialize for ParameterStore {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParameterStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let entries = Vec::<(String, Parameter)>::deserialize(deserializer)?;
        let mut store = ParameterStore {
            entries,
            index: HashMap::new(),
        };
        store.rebuild_index();
        Ok(store)
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite a value. A re-insert under an existing key
    /// overwrites the value in place, keeping its original position —
    /// this matches the behavior needed for link default properties,
    /// which are inserted once and never need to move.
    pub fn insert(&mut self, key: impl Into<String>, value: Parameter) {
        let key = key.into();
        if let Some(&idx) = self.index.get(&key) {
            self.entries[idx].1 = value;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, value));
        }
    }

    /// Remove an entry by key, shifting later entries down by one and
    /// keeping the index map consistent.
    pub fn remove(&mut self, key: &str) -> Option<Parameter> {
        let idx = self.index.remove(key)?;
        let (_, value) = self.entries.remove(idx);
        for v in self.index.values_mut() {
            if *v > idx {
                *v -= 1;
            }
        }
        Some(value)
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.index.get(key).map(|&idx| &self.entries[idx].1)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Rebuild the lookup index. Required after deserializing, since the
    /// index itself is not serialized.
    pub(crate) fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), i);
        }
    }
}
