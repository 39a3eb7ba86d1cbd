//! Documents, terms and field metadata.
//!
//! Text analysis is outside this crate: a `Text` field is split on
//! whitespace and each token is indexed as-is, a `Keyword` field is indexed
//! as a single term. `Numeric` and `Binary` fields are stored as per-document
//! values that can be rewritten in place with field updates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GalleyError, Result};

/// A value stored in one field of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Whitespace-tokenized, indexed text.
    Text(String),
    /// A single indexed term.
    Keyword(String),
    /// Updatable numeric doc value.
    Numeric(i64),
    /// Updatable binary doc value.
    Binary(Vec<u8>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) | FieldValue::Keyword(_) => FieldKind::Indexed,
            FieldValue::Numeric(_) => FieldKind::Numeric,
            FieldValue::Binary(_) => FieldKind::Binary,
        }
    }

    /// The terms this value contributes to the inverted index.
    pub fn tokens(&self) -> Vec<&str> {
        match self {
            FieldValue::Text(text) => text.split_whitespace().collect(),
            FieldValue::Keyword(term) => vec![term.as_str()],
            _ => Vec::new(),
        }
    }

    fn ram_bytes(&self) -> usize {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => s.len() * 2,
            FieldValue::Numeric(_) => 8,
            FieldValue::Binary(b) => b.len(),
        }
    }
}

/// A document represents a single item to be indexed.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Document {
    /// The field values for this document
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document {
            fields: BTreeMap::new(),
        }
    }

    /// Add a field value to the document, replacing any previous value.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value from the document.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Get all field values.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Approximate heap usage once buffered, used for flush triggering.
    pub fn ram_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, value)| 48 + name.len() * 2 + value.ram_bytes())
            .sum()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add a whitespace-tokenized text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add a single-term field.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document
            .add_field(name, FieldValue::Keyword(value.into()));
        self
    }

    /// Add a numeric doc-values field.
    pub fn add_numeric<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Numeric(value));
        self
    }

    /// Add a binary doc-values field.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add_field(name, FieldValue::Binary(value));
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

/// A term: a field name and one token of that field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    field: String,
    text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Payload bytes, excluding object overhead.
    pub fn bytes_len(&self) -> usize {
        self.field.len() + self.text.len()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// How a field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Indexed,
    Numeric,
    Binary,
}

impl FieldKind {
    pub fn code(self) -> u8 {
        match self {
            FieldKind::Indexed => 0,
            FieldKind::Numeric => 1,
            FieldKind::Binary => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(FieldKind::Indexed),
            1 => Ok(FieldKind::Numeric),
            2 => Ok(FieldKind::Binary),
            other => Err(GalleyError::corrupt(format!("invalid field kind {other}"))),
        }
    }
}

/// Field name to kind, per segment or index-wide.
///
/// A name keeps its kind for the lifetime of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    fields: BTreeMap<String, FieldKind>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field, failing if it is already known with another kind.
    pub fn add(&mut self, name: &str, kind: FieldKind) -> Result<()> {
        match self.fields.get(name) {
            Some(existing) if *existing != kind => Err(GalleyError::invalid_argument(format!(
                "cannot change field \"{name}\" from {existing:?} to {kind:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.fields.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn add_all(&mut self, other: &FieldInfos) -> Result<()> {
        for (name, kind) in &other.fields {
            self.add(name, *kind)?;
        }
        Ok(())
    }

    /// Register every field of a document.
    pub fn add_document(&mut self, doc: &Document) -> Result<()> {
        for (name, value) in doc.fields() {
            self.add(name, value.kind())?;
        }
        Ok(())
    }

    pub fn kind(&self, name: &str) -> Option<FieldKind> {
        self.fields.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}
