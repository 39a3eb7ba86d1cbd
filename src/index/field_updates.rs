//! Resolved per-document field value updates.
//!
//! Buffered updates name documents by term. Once a packet is applied to a
//! segment the terms are resolved to segment-local doc ids and collected in
//! a [`FieldUpdates`] container, which is what gets written as a `.upd`
//! generation and overlaid onto readers. Setting the same document twice
//! keeps the later value.

use std::collections::{BTreeMap, BTreeSet};

/// Resolved numeric and binary updates of one segment, keyed by field then
/// by doc id. A `None` value clears the document's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdates {
    numeric: BTreeMap<String, BTreeMap<u32, Option<i64>>>,
    binary: BTreeMap<String, BTreeMap<u32, Option<Vec<u8>>>>,
}

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_numeric(&mut self, field: &str, doc: u32, value: Option<i64>) {
        self.numeric
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    pub fn set_binary(&mut self, field: &str, doc: u32, value: Option<Vec<u8>>) {
        self.binary
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    pub fn numeric(&self) -> &BTreeMap<String, BTreeMap<u32, Option<i64>>> {
        &self.numeric
    }

    pub fn binary(&self) -> &BTreeMap<String, BTreeMap<u32, Option<Vec<u8>>>> {
        &self.binary
    }

    /// Whether any document is updated.
    pub fn any(&self) -> bool {
        self.numeric.values().any(|docs| !docs.is_empty())
            || self.binary.values().any(|docs| !docs.is_empty())
    }

    /// Names of the updated fields.
    pub fn fields(&self) -> BTreeSet<String> {
        self.numeric
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(field, _)| field.clone())
            .chain(
                self.binary
                    .iter()
                    .filter(|(_, docs)| !docs.is_empty())
                    .map(|(field, _)| field.clone()),
            )
            .collect()
    }

    /// Fold `other` into `self`; `other` wins where both touch a document.
    pub fn merge(&mut self, other: &FieldUpdates) {
        for (field, docs) in &other.numeric {
            let target = self.numeric.entry(field.clone()).or_default();
            for (doc, value) in docs {
                target.insert(*doc, *value);
            }
        }
        for (field, docs) in &other.binary {
            let target = self.binary.entry(field.clone()).or_default();
            for (doc, value) in docs {
                target.insert(*doc, value.clone());
            }
        }
    }

    /// Rewrite doc ids through `map`, dropping documents it does not map.
    pub fn remap<F>(&self, map: F) -> FieldUpdates
    where
        F: Fn(u32) -> Option<u32>,
    {
        let mut remapped = FieldUpdates::new();
        for (field, docs) in &self.numeric {
            for (doc, value) in docs {
                if let Some(new_doc) = map(*doc) {
                    remapped.set_numeric(field, new_doc, *value);
                }
            }
        }
        for (field, docs) in &self.binary {
            for (doc, value) in docs {
                if let Some(new_doc) = map(*doc) {
                    remapped.set_binary(field, new_doc, value.clone());
                }
            }
        }
        remapped
    }

    pub fn clear(&mut self) {
        self.numeric.clear();
        self.binary.clear();
    }
}
