//! In-memory view of one segment's indexed data.
//!
//! A [`SegmentReader`] holds the postings and doc values of a segment as they
//! stand after every field-update generation recorded for it. Readers are
//! immutable once built and are shared through `Arc`; a segment whose field
//! values change gets a fresh reader from [`SegmentReader::with_field_updates`].
//! A [`SegmentSnapshot`] pairs a reader with the live-docs bitset current at
//! the moment it was taken.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;

use crate::document::{Document, FieldInfos, FieldKind, FieldValue, Term};
use crate::error::{GalleyError, Result};
use crate::index::field_updates::FieldUpdates;

/// Postings and doc values of one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentReader {
    name: String,
    max_doc: u32,
    fields: FieldInfos,
    postings: AHashMap<Term, Vec<u32>>,
    numeric: BTreeMap<String, Vec<Option<i64>>>,
    binary: BTreeMap<String, Vec<Option<Vec<u8>>>>,
}

impl SegmentReader {
    /// Invert `docs` into a reader for a segment called `name`. Doc ids are
    /// positions in `docs`.
    pub fn from_documents(name: &str, docs: &[Document]) -> Result<Self> {
        let max_doc = docs.len() as u32;
        let mut reader = SegmentReader {
            name: name.to_string(),
            max_doc,
            ..Default::default()
        };

        for (doc_id, doc) in docs.iter().enumerate() {
            let doc_id = doc_id as u32;
            reader.fields.add_document(doc)?;
            for (field, value) in doc.fields() {
                match value {
                    FieldValue::Text(_) | FieldValue::Keyword(_) => {
                        for token in value.tokens() {
                            let postings = reader
                                .postings
                                .entry(Term::new(field.as_str(), token))
                                .or_default();
                            if postings.last() != Some(&doc_id) {
                                postings.push(doc_id);
                            }
                        }
                    }
                    FieldValue::Numeric(v) => {
                        reader
                            .numeric
                            .entry(field.clone())
                            .or_insert_with(|| vec![None; max_doc as usize])[doc_id as usize] =
                            Some(*v);
                    }
                    FieldValue::Binary(v) => {
                        reader
                            .binary
                            .entry(field.clone())
                            .or_insert_with(|| vec![None; max_doc as usize])[doc_id as usize] =
                            Some(v.clone());
                    }
                }
            }
        }

        Ok(reader)
    }

    /// Assemble a reader from decoded parts. Every doc-values column must be
    /// `max_doc` long.
    pub fn from_parts(
        name: &str,
        max_doc: u32,
        fields: FieldInfos,
        postings: AHashMap<Term, Vec<u32>>,
        numeric: BTreeMap<String, Vec<Option<i64>>>,
        binary: BTreeMap<String, Vec<Option<Vec<u8>>>>,
    ) -> Result<Self> {
        let bad_column = numeric
            .iter()
            .map(|(field, values)| (field, values.len()))
            .chain(binary.iter().map(|(field, values)| (field, values.len())))
            .find(|(_, len)| *len != max_doc as usize);
        if let Some((field, len)) = bad_column {
            return Err(GalleyError::corrupt(format!(
                "segment {name}: field {field} has {len} values but maxDoc is {max_doc}"
            )));
        }
        if let Some((term, _)) = postings
            .iter()
            .find(|(_, docs)| docs.last().is_some_and(|d| *d >= max_doc))
        {
            return Err(GalleyError::corrupt(format!(
                "segment {name}: postings of {term} reach past maxDoc {max_doc}"
            )));
        }

        Ok(SegmentReader {
            name: name.to_string(),
            max_doc,
            fields,
            postings,
            numeric,
            binary,
        })
    }

    /// A copy of this reader with `updates` overlaid on its doc values.
    pub fn with_field_updates(&self, updates: &FieldUpdates) -> Result<SegmentReader> {
        let mut reader = self.clone();

        for (field, docs) in updates.numeric() {
            reader.fields.add(field, FieldKind::Numeric)?;
            let column = reader
                .numeric
                .entry(field.clone())
                .or_insert_with(|| vec![None; self.max_doc as usize]);
            for (doc, value) in docs {
                let slot = column.get_mut(*doc as usize).ok_or_else(|| {
                    GalleyError::corrupt(format!(
                        "update of doc {doc} is out of bounds for segment {} (maxDoc={})",
                        self.name, self.max_doc
                    ))
                })?;
                *slot = *value;
            }
        }

        for (field, docs) in updates.binary() {
            reader.fields.add(field, FieldKind::Binary)?;
            let column = reader
                .binary
                .entry(field.clone())
                .or_insert_with(|| vec![None; self.max_doc as usize]);
            for (doc, value) in docs {
                let slot = column.get_mut(*doc as usize).ok_or_else(|| {
                    GalleyError::corrupt(format!(
                        "update of doc {doc} is out of bounds for segment {} (maxDoc={})",
                        self.name, self.max_doc
                    ))
                })?;
                *slot = value.clone();
            }
        }

        Ok(reader)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn fields(&self) -> &FieldInfos {
        &self.fields
    }

    /// Doc ids containing `term`, ascending.
    pub fn postings(&self, term: &Term) -> &[u32] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of documents containing `term`, deleted ones included.
    pub fn doc_freq(&self, term: &Term) -> usize {
        self.postings(term).len()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&Term, &[u32])> {
        self.postings.iter().map(|(term, docs)| (term, docs.as_slice()))
    }

    pub fn numeric_values(&self, field: &str) -> Option<&[Option<i64>]> {
        self.numeric.get(field).map(Vec::as_slice)
    }

    pub fn binary_values(&self, field: &str) -> Option<&[Option<Vec<u8>>]> {
        self.binary.get(field).map(Vec::as_slice)
    }

    pub fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        self.numeric
            .get(field)
            .and_then(|values| values.get(doc as usize).copied().flatten())
    }

    pub fn binary_value(&self, field: &str, doc: u32) -> Option<&[u8]> {
        self.binary
            .get(field)
            .and_then(|values| values.get(doc as usize))
            .and_then(|value| value.as_deref())
    }

    pub fn numeric_columns(&self) -> &BTreeMap<String, Vec<Option<i64>>> {
        &self.numeric
    }

    pub fn binary_columns(&self) -> &BTreeMap<String, Vec<Option<Vec<u8>>>> {
        &self.binary
    }
}

/// A reader plus the live docs that were current when it was taken.
///
/// The bitset is shared, never mutated: deletes applied afterwards go to a
/// private copy owned by the segment's view.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    reader: Arc<SegmentReader>,
    live_docs: Option<Arc<BitVec>>,
    num_docs: u32,
}

impl SegmentSnapshot {
    pub fn new(reader: Arc<SegmentReader>, live_docs: Option<Arc<BitVec>>, num_docs: u32) -> Self {
        SegmentSnapshot {
            reader,
            live_docs,
            num_docs,
        }
    }

    pub fn reader(&self) -> &Arc<SegmentReader> {
        &self.reader
    }

    pub fn live_docs(&self) -> Option<&Arc<BitVec>> {
        self.live_docs.as_ref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        match &self.live_docs {
            Some(bits) => bits.get(doc as usize).unwrap_or(false),
            None => doc < self.reader.max_doc(),
        }
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn max_doc(&self) -> u32 {
        self.reader.max_doc()
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.reader.max_doc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Document> {
        vec![
            Document::builder()
                .add_text("body", "a b a")
                .add_numeric("price", 3)
                .build(),
            Document::builder()
                .add_text("body", "b")
                .add_binary("payload", vec![7])
                .build(),
        ]
    }

    #[test]
    fn test_inversion() {
        let reader = SegmentReader::from_documents("_0", &docs()).unwrap();
        assert_eq!(reader.max_doc(), 2);
        assert_eq!(reader.postings(&Term::new("body", "a")), &[0]);
        assert_eq!(reader.postings(&Term::new("body", "b")), &[0, 1]);
        assert_eq!(reader.doc_freq(&Term::new("body", "z")), 0);
        assert_eq!(reader.numeric_value("price", 0), Some(3));
        assert_eq!(reader.numeric_value("price", 1), None);
        assert_eq!(reader.binary_value("payload", 1), Some(&[7u8][..]));
        assert_eq!(reader.fields().kind("price"), Some(FieldKind::Numeric));
    }

    #[test]
    fn test_field_updates_overlay() {
        let reader = SegmentReader::from_documents("_0", &docs()).unwrap();
        let mut updates = FieldUpdates::new();
        updates.set_numeric("price", 1, Some(9));
        updates.set_numeric("price", 0, None);

        let updated = reader.with_field_updates(&updates).unwrap();
        assert_eq!(updated.numeric_value("price", 0), None);
        assert_eq!(updated.numeric_value("price", 1), Some(9));
        // the original is untouched
        assert_eq!(reader.numeric_value("price", 0), Some(3));

        let mut out_of_bounds = FieldUpdates::new();
        out_of_bounds.set_numeric("price", 5, Some(1));
        assert!(reader.with_field_updates(&out_of_bounds).is_err());
    }

    #[test]
    fn test_from_parts_validates_columns() {
        let mut numeric = BTreeMap::new();
        numeric.insert("price".to_string(), vec![Some(1)]);
        let result = SegmentReader::from_parts(
            "_1",
            2,
            FieldInfos::new(),
            AHashMap::new(),
            numeric,
            BTreeMap::new(),
        );
        assert!(matches!(result, Err(GalleyError::CorruptState(_))));
    }

    #[test]
    fn test_snapshot_liveness() {
        let reader = Arc::new(SegmentReader::from_documents("_0", &docs()).unwrap());
        let all_live = SegmentSnapshot::new(reader.clone(), None, 2);
        assert!(all_live.is_live(1));
        assert!(!all_live.is_live(2));
        assert!(!all_live.has_deletions());

        let mut bits = BitVec::from_elem(2, true);
        bits.set(0, false);
        let deleted = SegmentSnapshot::new(reader, Some(Arc::new(bits)), 1);
        assert!(!deleted.is_live(0));
        assert!(deleted.has_deletions());
    }
}
