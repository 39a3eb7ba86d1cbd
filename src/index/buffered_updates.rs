//! Buffered deletes and field updates.
//!
//! A [`BufferedUpdates`] collects edits that have not been applied to any
//! segment yet: deletes by term, by query and by doc id, plus numeric and
//! binary field updates keyed by term. Every edit carries a `doc_id_upto`
//! bound; it only affects documents that were buffered before the edit.
//! When a flush completes the buffer is frozen into an immutable
//! [`FrozenUpdates`] packet.
//!
//! Recording the same term twice keeps the larger bound, whatever order the
//! two calls arrive in. Two updates of the same field and term keep the
//! later one, and move it to the end of the field's iteration order.
//!
//! `bytes_used` approximates heap usage and is only charged when a key is
//! new, so repeated deletes of one term are billed once.

use std::collections::BTreeMap;
use std::fmt;

use ahash::AHashMap;

use crate::document::Term;
use crate::query::Query;

/// Approximate cost of one term-delete entry besides its bytes.
pub const BYTES_PER_DEL_TERM: usize = 224;
/// Approximate cost of one doc-id delete.
pub const BYTES_PER_DEL_DOCID: usize = 36;
/// Approximate cost of one query-delete entry.
pub const BYTES_PER_DEL_QUERY: usize = 80;
/// Approximate cost of the first update of a field.
pub const BYTES_PER_FIELD_UPDATES_ENTRY: usize = 120;
/// Approximate cost of one field-update entry besides its payload.
pub const BYTES_PER_UPDATE_ENTRY: usize = 76;

/// Bound used for edits that apply to every document of a segment.
pub const MAX_DOC_ID_UPTO: u32 = u32::MAX;

/// A field update addressed by term.
#[derive(Debug, Clone, PartialEq)]
pub struct DocValuesUpdate<V> {
    pub term: Term,
    pub field: String,
    /// `None` clears the value.
    pub value: Option<V>,
    pub doc_id_upto: u32,
}

impl<V> DocValuesUpdate<V> {
    pub fn new(term: Term, field: &str, value: Option<V>) -> Self {
        DocValuesUpdate {
            term,
            field: field.to_string(),
            value,
            doc_id_upto: MAX_DOC_ID_UPTO,
        }
    }
}

pub type NumericUpdate = DocValuesUpdate<i64>;
pub type BinaryUpdate = DocValuesUpdate<Vec<u8>>;

/// Payload size of an update value.
pub trait UpdateValue: Clone + fmt::Debug + Send + Sync {
    fn size_in_bytes(&self) -> usize;
}

impl UpdateValue for i64 {
    fn size_in_bytes(&self) -> usize {
        8
    }
}

impl UpdateValue for Vec<u8> {
    fn size_in_bytes(&self) -> usize {
        self.len()
    }
}

impl<V: UpdateValue> DocValuesUpdate<V> {
    fn size_in_bytes(&self) -> usize {
        self.term.bytes_len()
            + self.field.len() * 2
            + self.value.as_ref().map_or(0, UpdateValue::size_in_bytes)
    }
}

/// Updates of one field in insertion order, at most one per term.
#[derive(Debug, Clone)]
pub struct FieldUpdateQueue<V> {
    entries: Vec<Option<DocValuesUpdate<V>>>,
    index: AHashMap<Term, usize>,
}

impl<V> Default for FieldUpdateQueue<V> {
    fn default() -> Self {
        FieldUpdateQueue {
            entries: Vec::new(),
            index: AHashMap::new(),
        }
    }
}

impl<V> FieldUpdateQueue<V> {
    pub fn get(&self, term: &Term) -> Option<&DocValuesUpdate<V>> {
        self.index
            .get(term)
            .and_then(|slot| self.entries[*slot].as_ref())
    }

    /// Insert `update` as the newest entry, removing any entry for its term.
    fn push_last(&mut self, update: DocValuesUpdate<V>) {
        if let Some(slot) = self.index.remove(&update.term) {
            self.entries[slot] = None;
        }
        self.index.insert(update.term.clone(), self.entries.len());
        self.entries.push(Some(update));
    }

    pub fn iter(&self) -> impl Iterator<Item = &DocValuesUpdate<V>> {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Mutable buffer of pending edits.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    terms: AHashMap<Term, u32>,
    queries: Vec<(Box<dyn Query>, u32)>,
    query_index: AHashMap<String, usize>,
    doc_ids: Vec<u32>,
    numeric_updates: BTreeMap<String, FieldUpdateQueue<i64>>,
    binary_updates: BTreeMap<String, FieldUpdateQueue<Vec<u8>>>,
    num_term_deletes: usize,
    num_numeric_updates: usize,
    num_binary_updates: usize,
    bytes_used: usize,
}

impl BufferedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete documents containing `term` among the first `doc_id_upto`.
    pub fn add_term(&mut self, term: Term, doc_id_upto: u32) {
        let current = self.terms.get(&term).copied();
        if let Some(current) = current
            && doc_id_upto < current
        {
            // A thread that buffered documents after this delete already
            // recorded a larger bound.
            return;
        }

        let cost = BYTES_PER_DEL_TERM + term.text().len() + 2 * term.field().len();
        self.terms.insert(term, doc_id_upto);
        self.num_term_deletes += 1;
        if current.is_none() {
            self.bytes_used += cost;
        }
    }

    /// Delete documents matching `query` among the first `doc_id_upto`.
    pub fn add_query(&mut self, query: Box<dyn Query>, doc_id_upto: u32) {
        let key = query.key();
        match self.query_index.get(&key) {
            Some(slot) => self.queries[*slot] = (query, doc_id_upto),
            None => {
                self.query_index.insert(key, self.queries.len());
                self.queries.push((query, doc_id_upto));
                self.bytes_used += BYTES_PER_DEL_QUERY;
            }
        }
    }

    /// Delete one buffered document by its position.
    pub fn add_doc_id(&mut self, doc_id: u32) {
        self.doc_ids.push(doc_id);
        self.bytes_used += BYTES_PER_DEL_DOCID;
    }

    pub fn add_numeric_update(&mut self, mut update: NumericUpdate, doc_id_upto: u32) {
        let queue = match self.numeric_updates.get_mut(&update.field) {
            Some(queue) => queue,
            None => {
                self.bytes_used += BYTES_PER_FIELD_UPDATES_ENTRY;
                self.numeric_updates.entry(update.field.clone()).or_default()
            }
        };
        let existed = match queue.get(&update.term) {
            Some(current) if doc_id_upto < current.doc_id_upto => return,
            Some(_) => true,
            None => false,
        };

        update.doc_id_upto = doc_id_upto;
        let cost = BYTES_PER_UPDATE_ENTRY + update.size_in_bytes();
        queue.push_last(update);
        self.num_numeric_updates += 1;
        if !existed {
            self.bytes_used += cost;
        }
    }

    pub fn add_binary_update(&mut self, mut update: BinaryUpdate, doc_id_upto: u32) {
        let queue = match self.binary_updates.get_mut(&update.field) {
            Some(queue) => queue,
            None => {
                self.bytes_used += BYTES_PER_FIELD_UPDATES_ENTRY;
                self.binary_updates.entry(update.field.clone()).or_default()
            }
        };
        let existed = match queue.get(&update.term) {
            Some(current) if doc_id_upto < current.doc_id_upto => return,
            Some(_) => true,
            None => false,
        };

        update.doc_id_upto = doc_id_upto;
        let cost = BYTES_PER_UPDATE_ENTRY + update.size_in_bytes();
        queue.push_last(update);
        self.num_binary_updates += 1;
        if !existed {
            self.bytes_used += cost;
        }
    }

    pub fn term_upto(&self, term: &Term) -> Option<u32> {
        self.terms.get(term).copied()
    }

    /// Term deletes sorted by term.
    pub fn sorted_terms(&self) -> Vec<(Term, u32)> {
        let mut terms: Vec<(Term, u32)> = self
            .terms
            .iter()
            .map(|(term, upto)| (term.clone(), *upto))
            .collect();
        terms.sort_unstable();
        terms
    }

    pub fn queries(&self) -> &[(Box<dyn Query>, u32)] {
        &self.queries
    }

    pub fn doc_ids(&self) -> &[u32] {
        &self.doc_ids
    }

    pub fn numeric_updates(&self) -> &BTreeMap<String, FieldUpdateQueue<i64>> {
        &self.numeric_updates
    }

    pub fn binary_updates(&self) -> &BTreeMap<String, FieldUpdateQueue<Vec<u8>>> {
        &self.binary_updates
    }

    /// Term deletes recorded, repeats included.
    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    /// Distinct deleted terms.
    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn num_numeric_updates(&self) -> usize {
        self.num_numeric_updates
    }

    pub fn num_binary_updates(&self) -> usize {
        self.num_binary_updates
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.doc_ids.is_empty()
            || self.numeric_updates.values().any(|q| !q.is_empty())
            || self.binary_updates.values().any(|q| !q.is_empty())
    }

    pub fn any_field_updates(&self) -> bool {
        self.numeric_updates.values().any(|q| !q.is_empty())
            || self.binary_updates.values().any(|q| !q.is_empty())
    }

    pub fn clear(&mut self) {
        *self = BufferedUpdates::default();
    }
}

impl fmt::Display for BufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "numTerms={} numQueries={} numDocIDs={} numNumericUpdates={} numBinaryUpdates={} bytesUsed={}",
            self.terms.len(),
            self.queries.len(),
            self.doc_ids.len(),
            self.num_numeric_updates,
            self.num_binary_updates,
            self.bytes_used
        )
    }
}

/// An immutable, generation-stamped packet of edits.
///
/// A global packet applies to every segment that existed when it was
/// pushed. A segment-private packet carries the query deletes and field
/// updates of one flushed segment, bounded by `doc_id_upto`; that
/// segment's term and doc-id deletes were already applied during flush.
#[derive(Debug)]
pub struct FrozenUpdates {
    terms: Vec<(Term, u32)>,
    queries: Vec<(Box<dyn Query>, u32)>,
    numeric_updates: Vec<NumericUpdate>,
    binary_updates: Vec<BinaryUpdate>,
    num_term_deletes: usize,
    bytes_used: usize,
    generation: Option<u64>,
    is_segment_private: bool,
}

impl FrozenUpdates {
    pub fn freeze(updates: &BufferedUpdates, is_segment_private: bool) -> Self {
        let terms = if is_segment_private {
            Vec::new()
        } else {
            updates.sorted_terms()
        };
        let queries = updates.queries().to_vec();
        let numeric_updates: Vec<NumericUpdate> = updates
            .numeric_updates()
            .values()
            .flat_map(|queue| queue.iter().cloned())
            .collect();
        let binary_updates: Vec<BinaryUpdate> = updates
            .binary_updates()
            .values()
            .flat_map(|queue| queue.iter().cloned())
            .collect();

        let bytes_used = terms
            .iter()
            .map(|(term, _)| term.bytes_len() + 4)
            .sum::<usize>()
            + queries.len() * BYTES_PER_DEL_QUERY
            + numeric_updates
                .iter()
                .map(|u| BYTES_PER_UPDATE_ENTRY + u.size_in_bytes())
                .sum::<usize>()
            + binary_updates
                .iter()
                .map(|u| BYTES_PER_UPDATE_ENTRY + u.size_in_bytes())
                .sum::<usize>();

        FrozenUpdates {
            num_term_deletes: if is_segment_private {
                0
            } else {
                updates.num_term_deletes()
            },
            terms,
            queries,
            numeric_updates,
            binary_updates,
            bytes_used,
            generation: None,
            is_segment_private,
        }
    }

    /// Stamp the packet. Done once, when it is pushed to the stream.
    pub(crate) fn set_generation(&mut self, generation: u64) {
        debug_assert!(self.generation.is_none(), "generation already set");
        self.generation = Some(generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation.unwrap_or(0)
    }

    pub fn is_segment_private(&self) -> bool {
        self.is_segment_private
    }

    pub fn terms(&self) -> &[(Term, u32)] {
        &self.terms
    }

    pub fn queries(&self) -> &[(Box<dyn Query>, u32)] {
        &self.queries
    }

    pub fn numeric_updates(&self) -> &[NumericUpdate] {
        &self.numeric_updates
    }

    pub fn binary_updates(&self) -> &[BinaryUpdate] {
        &self.binary_updates
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }
}

impl fmt::Display for FrozenUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delGen={}", self.generation())?;
        if !self.terms.is_empty() {
            write!(f, " {} deleted terms", self.terms.len())?;
        }
        if !self.queries.is_empty() {
            write!(f, " {} deleted queries", self.queries.len())?;
        }
        if !self.numeric_updates.is_empty() {
            write!(f, " {} numeric updates", self.numeric_updates.len())?;
        }
        if !self.binary_updates.is_empty() {
            write!(f, " {} binary updates", self.binary_updates.len())?;
        }
        if self.is_segment_private {
            write!(f, " (private)")?;
        }
        write!(f, " bytesUsed={}", self.bytes_used)
    }
}
