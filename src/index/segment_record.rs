//! Segment descriptions.
//!
//! A [`SegmentInfo`] is written once when its segment is created and never
//! changes; it is shared through an `Arc` by every catalog copy that
//! references the segment. A [`SegmentRecord`] wraps it with the metadata a
//! commit records per segment: how many documents are deleted, which
//! generation of the live-docs file is current, and which generations of
//! field updates exist.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::document::FieldInfos;
use crate::error::{GalleyError, Result};
use crate::index::file_names::{
    FIELD_UPDATES_EXTENSION, LIVE_DOCS_EXTENSION, file_name_from_generation,
};
use crate::storage::Storage;

/// Immutable description of one on-disk segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Unique name, `_` + base-36 counter.
    pub name: String,
    /// Number of document slots, deleted or not.
    pub doc_count: u32,
    /// Name of the codec that wrote the segment.
    pub codec: String,
    /// Whether the merge policy asked for a compound layout.
    pub use_compound_file: bool,
    /// Free-form provenance (source, timestamp, merge parameters).
    pub diagnostics: BTreeMap<String, String>,
    /// Files written for the segment itself, including the `.si` file.
    pub files: BTreeSet<String>,
    /// Fields present in the segment.
    pub fields: FieldInfos,
}

impl SegmentInfo {
    pub fn new(name: &str, doc_count: u32, codec: &str) -> Self {
        SegmentInfo {
            name: name.to_string(),
            doc_count,
            codec: codec.to_string(),
            use_compound_file: false,
            diagnostics: BTreeMap::new(),
            files: BTreeSet::new(),
            fields: FieldInfos::new(),
        }
    }
}

/// A segment as referenced by one catalog.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    info: Arc<SegmentInfo>,
    del_count: u32,
    del_gen: i64,
    next_write_del_gen: i64,
    field_infos_gen: i64,
    next_write_field_infos_gen: i64,
    updated_fields: BTreeMap<i64, BTreeSet<String>>,
    buffered_deletes_gen: u64,
}

impl SegmentRecord {
    /// Wrap `info` with no deletes and no field updates.
    pub fn new(info: SegmentInfo) -> Self {
        Self::with_generations(Arc::new(info), 0, -1, -1)
    }

    pub fn with_generations(
        info: Arc<SegmentInfo>,
        del_count: u32,
        del_gen: i64,
        field_infos_gen: i64,
    ) -> Self {
        SegmentRecord {
            info,
            del_count,
            del_gen,
            next_write_del_gen: if del_gen == -1 { 1 } else { del_gen + 1 },
            field_infos_gen,
            next_write_field_infos_gen: if field_infos_gen == -1 {
                1
            } else {
                field_infos_gen + 1
            },
            updated_fields: BTreeMap::new(),
            buffered_deletes_gen: 0,
        }
    }

    pub fn info(&self) -> &Arc<SegmentInfo> {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn doc_count(&self) -> u32 {
        self.info.doc_count
    }

    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    /// Live documents according to the committed delete count.
    pub fn num_docs(&self) -> u32 {
        self.info.doc_count - self.del_count
    }

    pub fn set_del_count(&mut self, del_count: u32) -> Result<()> {
        if del_count > self.info.doc_count {
            return Err(GalleyError::illegal_state(format!(
                "delCount {del_count} exceeds docCount {} for segment {}",
                self.info.doc_count, self.info.name
            )));
        }
        self.del_count = del_count;
        Ok(())
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen
    }

    /// Make the pending live-docs generation current after a successful write.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen = self.del_gen + 1;
    }

    /// Skip a generation whose write failed, so the partial file's name is
    /// never reused.
    pub fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    pub fn field_infos_gen(&self) -> i64 {
        self.field_infos_gen
    }

    pub fn next_write_field_infos_gen(&self) -> i64 {
        self.next_write_field_infos_gen
    }

    pub fn has_field_updates(&self) -> bool {
        self.field_infos_gen != -1
    }

    /// Record a successfully written field-updates generation.
    pub fn advance_field_infos_gen(&mut self, fields: BTreeSet<String>) {
        self.field_infos_gen = self.next_write_field_infos_gen;
        self.next_write_field_infos_gen = self.field_infos_gen + 1;
        self.updated_fields.insert(self.field_infos_gen, fields);
    }

    pub fn advance_next_write_field_infos_gen(&mut self) {
        self.next_write_field_infos_gen += 1;
    }

    /// Field-update generations and the fields each one touched.
    pub fn updated_fields(&self) -> &BTreeMap<i64, BTreeSet<String>> {
        &self.updated_fields
    }

    pub fn set_updated_fields(&mut self, updated: BTreeMap<i64, BTreeSet<String>>) {
        self.updated_fields = updated;
    }

    /// Generation of the last buffered-updates packet applied to this segment.
    pub fn buffered_deletes_gen(&self) -> u64 {
        self.buffered_deletes_gen
    }

    pub fn set_buffered_deletes_gen(&mut self, generation: u64) {
        self.buffered_deletes_gen = generation;
    }

    /// Current live-docs file, if any.
    pub fn live_docs_file_name(&self) -> Option<String> {
        file_name_from_generation(&self.info.name, LIVE_DOCS_EXTENSION, self.del_gen)
    }

    /// All files this record references.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        if let Some(live_docs) = self.live_docs_file_name() {
            files.insert(live_docs);
        }
        for generation in self.updated_fields.keys() {
            if let Some(name) =
                file_name_from_generation(&self.info.name, FIELD_UPDATES_EXTENSION, *generation)
            {
                files.insert(name);
            }
        }
        files
    }

    /// Total size of the referenced files.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            total += storage.file_size(&file)?;
        }
        Ok(total)
    }

    /// Whether two records describe the same commit state.
    pub fn same_commit_state(&self, other: &SegmentRecord) -> bool {
        self.info == other.info
            && self.del_count == other.del_count
            && self.del_gen == other.del_gen
            && self.field_infos_gen == other.field_infos_gen
            && self.updated_fields == other.updated_fields
    }
}

impl fmt::Display for SegmentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}):{}{}",
            self.info.name,
            self.info.codec,
            if self.info.use_compound_file { 'c' } else { 'C' },
            self.info.doc_count
        )?;
        if self.del_count > 0 {
            write!(f, "/{}", self.del_count)?;
        }
        if self.del_gen != -1 {
            write!(f, ":delGen={}", self.del_gen)?;
        }
        if self.field_infos_gen != -1 {
            write!(f, ":fieldInfosGen={}", self.field_infos_gen)?;
        }
        Ok(())
    }
}
