//! Mutable per-segment state held by the writer.
//!
//! A [`SegmentView`] owns the writer's working copy of one segment's live
//! docs and the field updates applied since it was opened. Deletes go into
//! a private bitset that is copied on write, so a [`SegmentSnapshot`] handed
//! out earlier keeps seeing the documents it was created with.

use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::{GalleyError, Result};
use crate::index::codec::Codec;
use crate::index::field_updates::FieldUpdates;
use crate::index::file_names::{
    FIELD_UPDATES_EXTENSION, LIVE_DOCS_EXTENSION, file_name_from_generation,
};
use crate::index::segment_reader::{SegmentReader, SegmentSnapshot};
use crate::index::segment_record::SegmentRecord;
use crate::storage::Storage;

#[derive(Debug)]
pub struct SegmentView {
    name: String,
    ref_count: u32,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    reader: Option<Arc<SegmentReader>>,
    live_docs: Option<Arc<BitVec>>,
    live_loaded: bool,
    pending_delete_count: u32,
    is_merging: bool,
    merging_updates: FieldUpdates,
}

impl SegmentView {
    /// A view holding one reference, the pool's own.
    pub fn new(record: &SegmentRecord, storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Self {
        SegmentView {
            name: record.name().to_string(),
            ref_count: 1,
            storage,
            codec,
            reader: None,
            live_docs: None,
            live_loaded: false,
            pending_delete_count: 0,
            is_merging: false,
            merging_updates: FieldUpdates::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self) {
        debug_assert!(self.ref_count > 0, "refCount underflow for {}", self.name);
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    /// Deletes applied here but not yet written to a live-docs generation.
    pub fn pending_delete_count(&self) -> u32 {
        self.pending_delete_count
    }

    /// Live documents counting pending deletes.
    pub fn num_docs(&self, record: &SegmentRecord) -> u32 {
        record.doc_count() - record.del_count() - self.pending_delete_count
    }

    pub fn is_fully_deleted(&self, record: &SegmentRecord) -> bool {
        self.num_docs(record) == 0
    }

    /// The segment's reader, opened on first use.
    pub fn reader(&mut self, record: &SegmentRecord) -> Result<Arc<SegmentReader>> {
        if let Some(reader) = &self.reader {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(self.codec.open_reader(self.storage.as_ref(), record)?);
        self.reader = Some(Arc::clone(&reader));
        Ok(reader)
    }

    fn ensure_live_docs(&mut self, record: &SegmentRecord) -> Result<()> {
        if !self.live_loaded {
            self.live_docs = if record.has_deletions() {
                Some(Arc::new(
                    self.codec.read_live_docs(self.storage.as_ref(), record)?,
                ))
            } else {
                None
            };
            self.live_loaded = true;
        }
        Ok(())
    }

    /// Current live docs, or `None` when every document is live.
    pub fn live_docs(&mut self, record: &SegmentRecord) -> Result<Option<Arc<BitVec>>> {
        self.ensure_live_docs(record)?;
        Ok(self.live_docs.clone())
    }

    pub fn is_live(&mut self, record: &SegmentRecord, doc: u32) -> Result<bool> {
        self.ensure_live_docs(record)?;
        Ok(match &self.live_docs {
            Some(bits) => bits.get(doc as usize).unwrap_or(false),
            None => doc < record.doc_count(),
        })
    }

    /// Mark `doc` deleted. Returns false when it was already deleted.
    pub fn delete(&mut self, record: &SegmentRecord, doc: u32) -> Result<bool> {
        if doc >= record.doc_count() {
            return Err(GalleyError::invalid_argument(format!(
                "doc {doc} out of bounds for segment {} (docCount={})",
                self.name,
                record.doc_count()
            )));
        }
        self.ensure_live_docs(record)?;

        let live = self
            .live_docs
            .get_or_insert_with(|| Arc::new(BitVec::from_elem(record.doc_count() as usize, true)));
        if !live.get(doc as usize).unwrap_or(false) {
            return Ok(false);
        }
        Arc::make_mut(live).set(doc as usize, false);
        self.pending_delete_count += 1;
        Ok(true)
    }

    /// Write pending deletes as the next live-docs generation of `record`.
    /// Returns whether a file was written.
    pub fn write_live_docs(&mut self, record: &mut SegmentRecord) -> Result<bool> {
        if self.pending_delete_count == 0 {
            return Ok(false);
        }
        let Some(live) = self.live_docs.clone() else {
            return Err(GalleyError::illegal_state(format!(
                "segment {} has pending deletes but no live docs",
                self.name
            )));
        };

        let generation = record.next_write_del_gen();
        if let Err(err) =
            self.codec
                .write_live_docs(self.storage.as_ref(), record, &live, generation)
        {
            // Never reuse the name of a possibly partial file.
            record.advance_next_write_del_gen();
            if let Some(file) =
                file_name_from_generation(&self.name, LIVE_DOCS_EXTENSION, generation)
                && self.storage.file_exists(&file)
                && let Err(delete) = self.storage.delete_file(&file)
            {
                log::warn!("failed to remove partial live docs {file}: {delete}");
            }
            return Err(err);
        }

        record.advance_del_gen();
        record.set_del_count(record.del_count() + self.pending_delete_count)?;
        self.pending_delete_count = 0;
        Ok(true)
    }

    /// Write `updates` as the next field-update generation of `record` and
    /// overlay them on the open reader.
    pub fn apply_field_updates(
        &mut self,
        record: &mut SegmentRecord,
        updates: &FieldUpdates,
    ) -> Result<()> {
        if !updates.any() {
            return Ok(());
        }

        let generation = record.next_write_field_infos_gen();
        if let Err(err) =
            self.codec
                .write_field_updates(self.storage.as_ref(), record, updates, generation)
        {
            record.advance_next_write_field_infos_gen();
            if let Some(file) =
                file_name_from_generation(&self.name, FIELD_UPDATES_EXTENSION, generation)
                && self.storage.file_exists(&file)
                && let Err(delete) = self.storage.delete_file(&file)
            {
                log::warn!("failed to remove partial field updates {file}: {delete}");
            }
            return Err(err);
        }
        record.advance_field_infos_gen(updates.fields());

        if let Some(reader) = &self.reader {
            self.reader = Some(Arc::new(reader.with_field_updates(updates)?));
        }
        if self.is_merging {
            self.merging_updates.merge(updates);
        }
        Ok(())
    }

    /// Reader plus the live docs as of now.
    pub fn snapshot(&mut self, record: &SegmentRecord) -> Result<SegmentSnapshot> {
        let reader = self.reader(record)?;
        let live_docs = self.live_docs(record)?;
        Ok(SegmentSnapshot::new(
            reader,
            live_docs,
            self.num_docs(record),
        ))
    }

    pub fn is_merging(&self) -> bool {
        self.is_merging
    }

    /// Start or stop collecting field updates for a running merge.
    pub fn set_merging(&mut self, merging: bool) {
        self.is_merging = merging;
        if !merging {
            self.merging_updates.clear();
        }
    }

    /// Field updates applied since the merge of this segment started.
    pub fn merging_updates(&self) -> &FieldUpdates {
        &self.merging_updates
    }

    /// Forget unwritten deletes and updates. Used on merge sources after
    /// their changes were carried over to the merged segment.
    pub fn drop_changes(&mut self) {
        self.pending_delete_count = 0;
        self.live_docs = None;
        self.live_loaded = false;
        self.is_merging = false;
        self.merging_updates.clear();
    }
}
