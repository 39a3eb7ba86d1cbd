//! Buffering documents and edits.
//!
//! Every edit is recorded twice. The private copy is bounded by the number
//! of documents buffered so far and applies to the segment those documents
//! end up in; the global copy applies to every segment flushed before it.

use crate::document::{Document, FieldInfos, FieldKind, Term};
use crate::error::{GalleyError, Result};
use crate::index::buffered_updates::{
    BinaryUpdate, BufferedUpdates, MAX_DOC_ID_UPTO, NumericUpdate,
};
use crate::index::snapshot::IndexSnapshot;
use crate::query::Query;

use super::{EngineState, IndexWriter};

/// Documents and edits not yet flushed.
#[derive(Debug, Default)]
pub(super) struct DocumentsBuffer {
    pub(super) docs: Vec<Document>,
    /// Edits bounded by the buffered documents.
    pub(super) private: BufferedUpdates,
    /// Edits for every already flushed segment.
    pub(super) global: BufferedUpdates,
    pub(super) docs_ram: usize,
    /// Field kinds across the index, buffered documents included.
    pub(super) field_kinds: FieldInfos,
}

impl DocumentsBuffer {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn num_docs(&self) -> u32 {
        self.docs.len() as u32
    }

    pub(super) fn ram_bytes_used(&self) -> usize {
        self.docs_ram + self.private.bytes_used() + self.global.bytes_used()
    }

    pub(super) fn any_changes(&self) -> bool {
        !self.docs.is_empty() || self.private.any() || self.global.any()
    }

    /// Drop documents and edits, keeping the field kinds.
    pub(super) fn clear(&mut self) {
        self.docs.clear();
        self.private.clear();
        self.global.clear();
        self.docs_ram = 0;
    }

    fn delete_term(&mut self, term: Term) {
        self.private.add_term(term.clone(), self.num_docs());
        self.global.add_term(term, MAX_DOC_ID_UPTO);
    }

    fn check_updatable(&self, field: &str, kind: FieldKind) -> Result<()> {
        match self.field_kinds.kind(field) {
            Some(existing) if existing == kind => Ok(()),
            Some(existing) => Err(GalleyError::invalid_argument(format!(
                "field \"{field}\" is {existing:?}, not {kind:?}"
            ))),
            None => Err(GalleyError::invalid_argument(format!(
                "can only update existing {kind:?} fields; \"{field}\" does not exist"
            ))),
        }
    }
}

impl IndexWriter {
    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.add_block(None, vec![doc])
    }

    /// Add `docs` as one block: either all of them become visible or none.
    pub fn add_documents(&self, docs: Vec<Document>) -> Result<()> {
        self.add_block(None, docs)
    }

    /// Delete the documents containing `term`, then add `doc`, atomically.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<()> {
        self.add_block(Some(term), vec![doc])
    }

    /// Delete the documents containing `term`, then add `docs` as one block.
    pub fn update_documents(&self, term: Term, docs: Vec<Document>) -> Result<()> {
        self.add_block(Some(term), docs)
    }

    pub fn delete_terms<I>(&self, terms: I) -> Result<()>
    where
        I: IntoIterator<Item = Term>,
    {
        self.ensure_open(true)?;
        let mut buffer = self.inner.documents.lock();
        for term in terms {
            buffer.delete_term(term);
        }
        let flush = self.needs_flush(&buffer);
        drop(buffer);
        self.after_buffered(flush)
    }

    pub fn delete_queries(&self, queries: Vec<Box<dyn Query>>) -> Result<()> {
        self.ensure_open(true)?;
        let mut buffer = self.inner.documents.lock();
        for query in queries {
            let upto = buffer.num_docs();
            buffer.private.add_query(query.clone_box(), upto);
            buffer.global.add_query(query, MAX_DOC_ID_UPTO);
        }
        let flush = self.needs_flush(&buffer);
        drop(buffer);
        self.after_buffered(flush)
    }

    /// Set numeric field `field` of every document containing `term`.
    /// `None` clears the value. The field must already exist as numeric.
    pub fn update_numeric_value(&self, term: Term, field: &str, value: Option<i64>) -> Result<()> {
        self.ensure_open(true)?;
        let mut buffer = self.inner.documents.lock();
        buffer.check_updatable(field, FieldKind::Numeric)?;
        let upto = buffer.num_docs();
        buffer
            .private
            .add_numeric_update(NumericUpdate::new(term.clone(), field, value), upto);
        buffer
            .global
            .add_numeric_update(NumericUpdate::new(term, field, value), MAX_DOC_ID_UPTO);
        let flush = self.needs_flush(&buffer);
        drop(buffer);
        self.after_buffered(flush)
    }

    /// Set binary field `field` of every document containing `term`.
    pub fn update_binary_value(
        &self,
        term: Term,
        field: &str,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.ensure_open(true)?;
        let mut buffer = self.inner.documents.lock();
        buffer.check_updatable(field, FieldKind::Binary)?;
        let upto = buffer.num_docs();
        buffer.private.add_binary_update(
            BinaryUpdate::new(term.clone(), field, value.clone()),
            upto,
        );
        buffer
            .global
            .add_binary_update(BinaryUpdate::new(term, field, value), MAX_DOC_ID_UPTO);
        let flush = self.needs_flush(&buffer);
        drop(buffer);
        self.after_buffered(flush)
    }

    /// Delete document `doc` of `snapshot` directly, if its segment is
    /// still part of the index. Returns false when the segment was merged
    /// away or is not pooled, in which case the caller should delete by
    /// term instead.
    pub fn try_delete_document(&self, snapshot: &IndexSnapshot, doc: u32) -> Result<bool> {
        self.ensure_open(true)?;
        let Some((name, local)) = snapshot.locate(doc) else {
            return Err(GalleyError::invalid_argument(format!(
                "doc {doc} out of bounds (maxDoc={})",
                snapshot.max_doc()
            )));
        };

        let mut engine = self.inner.engine.lock();
        let state: &mut EngineState = &mut engine;
        let Some(record) = state.catalog.get_mut(name) else {
            self.message(|| format!("tryDeleteDocument: segment {name} is gone"));
            return Ok(false);
        };
        let view = match state.pool.acquire(record, false) {
            Ok(view) => view,
            Err(GalleyError::NotPooled(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let deleted = view.delete(record, local);
        let fully_deleted = view.is_fully_deleted(record);
        let written = state.pool.release(record);
        let deleted = deleted?;
        let written = written?;

        if deleted {
            if fully_deleted
                && !state.coordinator.is_merging(name)
                && !self.inner.config.keep_fully_deleted_segments
            {
                self.message(|| format!("tryDeleteDocument: drop 100% deleted segment {name}"));
                state.catalog.remove(name);
                state.pool.drop(name);
                state.checkpoint()?;
            } else if written {
                state.checkpoint()?;
            } else {
                state.changed();
            }
        }
        Ok(true)
    }

    fn add_block(&self, delete_term: Option<Term>, docs: Vec<Document>) -> Result<()> {
        self.ensure_open(true)?;
        let mut buffer = self.inner.documents.lock();

        let start = buffer.num_docs();
        let mut failure = None;
        for doc in docs {
            if let Err(err) = buffer.field_kinds.add_document(&doc) {
                failure = Some(err);
                break;
            }
            buffer.docs_ram += doc.ram_bytes();
            buffer.docs.push(doc);
        }
        if let Some(err) = failure {
            // Already buffered documents of the block stay, deleted.
            for doc in start..buffer.num_docs() {
                buffer.private.add_doc_id(doc);
            }
            return Err(err);
        }

        if let Some(term) = delete_term {
            // The delete covers everything up to, not including, the block.
            buffer.private.add_term(term.clone(), start);
            buffer.global.add_term(term, MAX_DOC_ID_UPTO);
        }

        let flush = self.needs_flush(&buffer);
        drop(buffer);
        self.after_buffered(flush)
    }

    fn needs_flush(&self, buffer: &DocumentsBuffer) -> bool {
        let config = &self.inner.config;
        if config
            .max_buffered_docs
            .is_some_and(|max| buffer.docs.len() >= max)
        {
            return true;
        }
        if config
            .max_buffered_delete_terms
            .is_some_and(|max| buffer.global.num_term_deletes() >= max)
        {
            return true;
        }
        config
            .ram_buffer_bytes()
            .is_some_and(|max| buffer.ram_bytes_used() >= max)
    }

    fn after_buffered(&self, flush: bool) -> Result<()> {
        if !flush {
            return Ok(());
        }
        self.message(|| "buffer limit reached: flushing".to_string());
        if self.flush_all(false)? {
            self.maybe_merge(crate::index::merge::MergeTrigger::SegmentFlush, None)?;
        }
        Ok(())
    }
}
