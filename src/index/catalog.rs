//! The segment catalog and its commit files.
//!
//! A [`SegmentCatalog`] is the ordered list of live segments plus the
//! counters a commit records (`version`, the segment-name counter and the
//! commit generation) and opaque user data. Each commit writes the catalog to
//! a new `segments_<gen>` file in two phases:
//!
//! 1. [`SegmentCatalog::prepare_commit`] writes everything except the
//!    checksum footer. A reader that finds the file fails its footer check
//!    and falls back to the previous generation.
//! 2. [`SegmentCatalog::finish_commit`] writes the footer, syncs the file and
//!    only then advances `last_generation` and rewrites the `segments.gen`
//!    hint. A failure deletes the partial file.
//!
//! The generation is advanced at the start of every attempted write, so a
//! name that was ever partially written is never reused.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{GalleyError, Result};
use crate::index::codec::CodecRegistry;
use crate::index::commit_finder::CommitFinder;
use crate::index::file_names::{
    SEGMENTS, SEGMENTS_GEN, generation_from_segments_file_name, segments_file_name,
};
use crate::index::info_stream::{InfoStream, SIS};
use crate::index::segment_record::SegmentRecord;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

/// Commit format without field updates.
pub const VERSION_40: u32 = 0;
/// Adds field-infos generations and per-generation updated fields.
pub const VERSION_46: u32 = 1;
/// Replaces the bare trailing checksum with a codec footer.
pub const VERSION_48: u32 = 2;

/// `segments.gen` written without a footer.
pub const FORMAT_SEGMENTS_GEN_47: i32 = -2;
/// `segments.gen` with a checksum footer.
pub const FORMAT_SEGMENTS_GEN_CHECKSUM: i32 = -3;

/// One segment entry as decoded from a commit, before its `.si` is loaded.
struct CommitEntry {
    name: String,
    codec: String,
    del_gen: i64,
    del_count: u32,
    field_infos_gen: i64,
    updated_fields: BTreeMap<i64, BTreeSet<String>>,
}

/// Ordered segments plus commit counters.
#[derive(Debug)]
pub struct SegmentCatalog {
    segments: Vec<SegmentRecord>,
    version: u64,
    counter: u64,
    generation: i64,
    last_generation: i64,
    user_data: BTreeMap<String, String>,
    pending: Option<StructWriter>,
}

impl Clone for SegmentCatalog {
    /// Deep copy of the committed state. A prepared commit stays with the
    /// original.
    fn clone(&self) -> Self {
        SegmentCatalog {
            segments: self.segments.clone(),
            version: self.version,
            counter: self.counter,
            generation: self.generation,
            last_generation: self.last_generation,
            user_data: self.user_data.clone(),
            pending: None,
        }
    }
}

impl Default for SegmentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCatalog {
    /// An empty catalog that has never been committed.
    pub fn new() -> Self {
        SegmentCatalog {
            segments: Vec::new(),
            version: chrono::Utc::now().timestamp_millis().max(0) as u64,
            counter: 0,
            generation: -1,
            last_generation: -1,
            user_data: BTreeMap::new(),
            pending: None,
        }
    }

    /// Read the latest commit, locating it with the retrying discovery loop.
    pub fn read(
        storage: &dyn Storage,
        codecs: &CodecRegistry,
        info_stream: &dyn InfoStream,
    ) -> Result<SegmentCatalog> {
        CommitFinder::new(storage, info_stream)
            .run(|file_name| Self::read_commit(storage, file_name, codecs))
    }

    /// Read one specific commit file.
    pub fn read_commit(
        storage: &dyn Storage,
        file_name: &str,
        codecs: &CodecRegistry,
    ) -> Result<SegmentCatalog> {
        let generation = generation_from_segments_file_name(file_name)?;
        let mut input = StructReader::open(storage, file_name)?;
        let format = input.check_header(SEGMENTS, VERSION_40, VERSION_48)?;

        let version = input.read_u64()?;
        let counter = input.read_u32()? as u64;
        let count = input.read_u32()?;
        if count as usize > input.remaining() {
            return Err(GalleyError::corrupt(format!(
                "invalid segment count {count} (resource: {file_name})"
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = input.read_string()?;
            let codec = input.read_string()?;
            let del_gen = input.read_i64()?;
            let del_count = input.read_u32()?;
            let mut field_infos_gen = -1;
            let mut updated_fields = BTreeMap::new();
            if format >= VERSION_46 {
                field_infos_gen = input.read_i64()?;
                let generations = input.read_u32()?;
                for _ in 0..generations {
                    let generation = input.read_i64()?;
                    updated_fields.insert(generation, input.read_string_set()?);
                }
            }
            entries.push(CommitEntry {
                name,
                codec,
                del_gen,
                del_count,
                field_infos_gen,
                updated_fields,
            });
        }
        let user_data = input.read_string_map()?;

        if format >= VERSION_48 {
            input.check_footer()?;
        } else {
            input.check_legacy_checksum()?;
        }

        let mut segments = Vec::with_capacity(entries.len());
        for entry in entries {
            let codec = codecs.get(&entry.codec)?;
            let info = codec.read_segment_info(storage, &entry.name)?;
            if entry.del_count > info.doc_count {
                return Err(GalleyError::corrupt(format!(
                    "invalid deletion count: {} vs docCount={} (resource: {file_name})",
                    entry.del_count, info.doc_count
                )));
            }
            let mut record = SegmentRecord::with_generations(
                Arc::new(info),
                entry.del_count,
                entry.del_gen,
                entry.field_infos_gen,
            );
            record.set_updated_fields(entry.updated_fields);
            segments.push(record);
        }

        Ok(SegmentCatalog {
            segments,
            version,
            counter,
            generation,
            last_generation: generation,
            user_data,
            pending: None,
        })
    }

    fn write_body(&self, output: &mut StructWriter, format: u32) -> Result<()> {
        output.write_header(SEGMENTS, format)?;
        output.write_u64(self.version)?;
        output.write_u32(self.counter as u32)?;
        output.write_u32(self.segments.len() as u32)?;
        for segment in &self.segments {
            output.write_string(segment.name())?;
            output.write_string(&segment.info().codec)?;
            output.write_i64(segment.del_gen())?;
            output.write_u32(segment.del_count())?;
            if format >= VERSION_46 {
                output.write_i64(segment.field_infos_gen())?;
                output.write_u32(segment.updated_fields().len() as u32)?;
                for (generation, fields) in segment.updated_fields() {
                    output.write_i64(*generation)?;
                    output.write_string_set(fields)?;
                }
            } else if segment.has_field_updates() {
                return Err(GalleyError::invalid_argument(format!(
                    "format {format} cannot record field updates of {}",
                    segment.name()
                )));
            }
        }
        output.write_string_map(&self.user_data)
    }

    /// Advance the generation and open the next commit file.
    fn start_write(&mut self, storage: &dyn Storage) -> Result<StructWriter> {
        self.generation = if self.generation == -1 {
            1
        } else {
            self.generation + 1
        };
        let file_name = self.pending_segments_file_name()?;
        StructWriter::create(storage, &file_name)
    }

    /// First phase: write the next commit file without its footer.
    pub fn prepare_commit(&mut self, storage: &dyn Storage) -> Result<()> {
        if self.pending.is_some() {
            return Err(GalleyError::illegal_state("prepareCommit was already called"));
        }

        let mut output = self.start_write(storage)?;
        match self.write_body(&mut output, VERSION_48) {
            Ok(()) => {
                self.pending = Some(output);
                Ok(())
            }
            Err(e) => {
                let file_name = output.name().to_string();
                drop(output);
                let _ = storage.delete_file(&file_name);
                Err(e)
            }
        }
    }

    /// Second phase: footer, sync, then publish. Returns the commit file name.
    pub fn finish_commit(&mut self, storage: &dyn Storage) -> Result<String> {
        let Some(mut output) = self.pending.take() else {
            return Err(GalleyError::illegal_state("prepareCommit was not called"));
        };
        let file_name = output.name().to_string();

        if let Err(e) = output.write_footer().and_then(|_| output.close()) {
            let _ = storage.delete_file(&file_name);
            return Err(e);
        }
        if let Err(e) = storage.sync(std::slice::from_ref(&file_name)) {
            let _ = storage.delete_file(&file_name);
            return Err(e);
        }

        self.last_generation = self.generation;
        write_segments_gen(storage, self.generation);
        Ok(file_name)
    }

    /// Discard a prepared commit and delete its file.
    pub fn rollback_commit(&mut self, storage: &dyn Storage) {
        if let Some(output) = self.pending.take() {
            let file_name = output.name().to_string();
            let _ = output.close();
            let _ = storage.delete_file(&file_name);
        }
    }

    /// Both phases back to back.
    pub fn commit(&mut self, storage: &dyn Storage) -> Result<String> {
        self.prepare_commit(storage)?;
        self.finish_commit(storage)
    }

    /// Write a complete commit in a pre-footer format (`VERSION_40` or
    /// `VERSION_46`) that ends with a bare checksum.
    pub fn write_legacy_commit(&mut self, storage: &dyn Storage, format: u32) -> Result<String> {
        if format >= VERSION_48 {
            return Err(GalleyError::invalid_argument(format!(
                "format {format} is not a legacy format"
            )));
        }
        let mut output = self.start_write(storage)?;
        let file_name = output.name().to_string();
        let written = self
            .write_body(&mut output, format)
            .and_then(|_| output.write_legacy_checksum())
            .and_then(|_| output.close())
            .and_then(|_| storage.sync(std::slice::from_ref(&file_name)));
        if let Err(e) = written {
            let _ = storage.delete_file(&file_name);
            return Err(e);
        }
        self.last_generation = self.generation;
        Ok(file_name)
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending.is_some()
    }

    /// Name of the last successfully written commit file.
    pub fn segments_file_name(&self) -> Option<String> {
        segments_file_name(self.last_generation)
    }

    /// Name of the commit file being written or last attempted.
    pub fn pending_segments_file_name(&self) -> Result<String> {
        segments_file_name(self.generation).ok_or_else(|| {
            GalleyError::illegal_state(format!("no commit file for generation {}", self.generation))
        })
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn last_generation(&self) -> i64 {
        self.last_generation
    }

    /// Carry over generations from a copy that was committed.
    pub fn update_generation(&mut self, other: &SegmentCatalog) {
        self.last_generation = other.last_generation;
        self.generation = other.generation;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record a logical change.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Allocate the next segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = crate::index::file_names::segment_name(self.counter);
        self.counter += 1;
        name
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn set_user_data(&mut self, user_data: BTreeMap<String, String>) {
        self.user_data = user_data;
    }

    /// Every file referenced by the catalog, optionally with its own commit
    /// file.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            if let Some(name) = self.segments_file_name() {
                files.insert(name);
            }
        }
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files
    }

    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentRecord> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn add(&mut self, record: SegmentRecord) {
        self.segments.push(record);
    }

    pub fn get(&self, name: &str) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SegmentRecord> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<SegmentRecord> {
        self.index_of(name).map(|i| self.segments.remove(i))
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Replace the segment list with `other`'s, keeping counters.
    pub fn rollback_segments(&mut self, other: &SegmentCatalog) {
        self.segments = other.segments.clone();
    }

    /// Swap merged-away segments for `target`, placing it at the position of
    /// the first merged-away segment, or at the front if none remain.
    pub fn apply_merge_changes(
        &mut self,
        merged_away: &BTreeSet<String>,
        target: SegmentRecord,
        drop_target: bool,
    ) {
        let mut target = if drop_target { None } else { Some(target) };
        let mut segments = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if merged_away.contains(segment.name()) {
                if let Some(t) = target.take() {
                    segments.push(t);
                }
            } else {
                segments.push(segment);
            }
        }
        if let Some(t) = target {
            segments.insert(0, t);
        }
        self.segments = segments;
    }

    /// Document slots across all segments, deleted ones included.
    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count() as u64).sum()
    }
}

impl fmt::Display for SegmentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .segments_file_name()
            .unwrap_or_else(|| SEGMENTS.to_string());
        write!(f, "{name}:")?;
        for segment in &self.segments {
            write!(f, " {segment}")?;
        }
        Ok(())
    }
}

/// Best-effort write of the `segments.gen` hint. Failures delete whatever
/// was written, since discovery treats the hint as optional.
pub fn write_segments_gen(storage: &dyn Storage, generation: i64) {
    let written = (|| -> Result<()> {
        let mut output = StructWriter::create(storage, SEGMENTS_GEN)?;
        output.write_i32(FORMAT_SEGMENTS_GEN_CHECKSUM)?;
        output.write_i64(generation)?;
        output.write_i64(generation)?;
        output.write_footer()?;
        output.close()?;
        storage.sync(&[SEGMENTS_GEN.to_string()])
    })();
    if written.is_err() {
        let _ = storage.delete_file(SEGMENTS_GEN);
    }
}

/// The generation recorded in `segments.gen`, or `None` when the hint is
/// absent, unreadable or inconsistent.
pub fn read_segments_gen(storage: &dyn Storage, info_stream: &dyn InfoStream) -> Option<i64> {
    let mut input = match StructReader::open(storage, SEGMENTS_GEN) {
        Ok(input) => input,
        Err(e) => {
            if info_stream.is_enabled(SIS) {
                info_stream.message(SIS, &format!("segments.gen open: {e}"));
            }
            return None;
        }
    };

    let parsed = (|| -> Result<Option<i64>> {
        let format = input.read_i32()?;
        if format != FORMAT_SEGMENTS_GEN_47 && format != FORMAT_SEGMENTS_GEN_CHECKSUM {
            return Err(GalleyError::corrupt(format!(
                "unknown segments.gen format {format}"
            )));
        }
        let gen0 = input.read_i64()?;
        let gen1 = input.read_i64()?;
        if info_stream.is_enabled(SIS) {
            info_stream.message(SIS, &format!("fallback check: {gen0}; {gen1}"));
        }
        if format == FORMAT_SEGMENTS_GEN_CHECKSUM {
            input.check_footer()?;
        } else if input.remaining() != 0 {
            return Err(GalleyError::corrupt(format!(
                "segments.gen has {} trailing bytes",
                input.remaining()
            )));
        }
        Ok((gen0 == gen1).then_some(gen0))
    })();

    match parsed {
        Ok(generation) => generation,
        Err(e) => {
            if info_stream.is_enabled(SIS) {
                info_stream.message(SIS, &format!("segments.gen ignored: {e}"));
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::Codec;
    use crate::index::codec::PlainCodec;
    use crate::index::info_stream::NoInfoStream;
    use crate::index::segment_reader::SegmentReader;
    use crate::document::Document;
    use crate::storage::memory::MemoryStorage;

    fn add_segment(storage: &MemoryStorage, catalog: &mut SegmentCatalog, docs: usize) -> String {
        let name = catalog.new_segment_name();
        let docs: Vec<Document> = (0..docs)
            .map(|i| Document::builder().add_keyword("id", i.to_string()).build())
            .collect();
        let codec = PlainCodec::new();
        let reader = SegmentReader::from_documents(&name, &docs).unwrap();
        let mut info = codec.write_segment(storage, &reader).unwrap();
        codec.write_segment_info(storage, &mut info).unwrap();
        catalog.add(SegmentRecord::new(info));
        catalog.changed();
        name
    }

    #[test]
    fn test_two_phase_commit_round_trip() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 3);
        let second = add_segment(&storage, &mut catalog, 2);
        {
            let record = catalog.get_mut(&second).unwrap();
            record.set_del_count(1).unwrap();
            record.advance_del_gen();
            record.advance_field_infos_gen(["price".to_string()].into());
        }
        catalog.set_user_data([("source".to_string(), "test".to_string())].into());

        catalog.prepare_commit(&storage).unwrap();
        assert!(catalog.has_pending_commit());
        assert!(catalog.prepare_commit(&storage).is_err());
        assert_eq!(catalog.last_generation(), -1);

        let file_name = catalog.finish_commit(&storage).unwrap();
        assert_eq!(file_name, "segments_1");
        assert_eq!(catalog.last_generation(), 1);
        assert!(storage.is_synced("segments_1"));
        assert!(storage.file_exists(SEGMENTS_GEN));

        let read = SegmentCatalog::read(&storage, &CodecRegistry::new(), &NoInfoStream).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.version(), catalog.version());
        assert_eq!(read.counter(), 2);
        assert_eq!(read.user_data(), catalog.user_data());
        assert_eq!(read.len(), 2);
        for (a, b) in read.iter().zip(catalog.iter()) {
            assert!(a.same_commit_state(b), "{a} vs {b}");
        }
        assert_eq!(read.to_string(), catalog.to_string());
    }

    #[test]
    fn test_prepared_commit_is_not_readable() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 1);
        catalog.commit(&storage).unwrap();

        add_segment(&storage, &mut catalog, 1);
        catalog.prepare_commit(&storage).unwrap();
        assert!(storage.file_exists("segments_2"));

        let read = SegmentCatalog::read(&storage, &CodecRegistry::new(), &NoInfoStream).unwrap();
        assert_eq!(read.generation(), 1);
        assert_eq!(read.len(), 1);

        catalog.rollback_commit(&storage);
        assert!(!storage.file_exists("segments_2"));
        // the generation of the abandoned attempt is not reused
        catalog.commit(&storage).unwrap();
        assert_eq!(catalog.last_generation(), 3);
    }

    #[test]
    fn test_failed_sync_keeps_previous_commit() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 1);
        catalog.commit(&storage).unwrap();

        add_segment(&storage, &mut catalog, 1);
        catalog.prepare_commit(&storage).unwrap();
        storage.fail_next_sync(1);
        assert!(catalog.finish_commit(&storage).is_err());
        assert!(!storage.file_exists("segments_2"));
        assert_eq!(catalog.last_generation(), 1);

        let read = SegmentCatalog::read(&storage, &CodecRegistry::new(), &NoInfoStream).unwrap();
        assert_eq!(read.generation(), 1);
    }

    #[test]
    fn test_legacy_formats_are_readable() {
        for format in [VERSION_40, VERSION_46] {
            let storage = MemoryStorage::new_default();
            let mut catalog = SegmentCatalog::new();
            add_segment(&storage, &mut catalog, 4);
            catalog.write_legacy_commit(&storage, format).unwrap();

            let read =
                SegmentCatalog::read(&storage, &CodecRegistry::new(), &NoInfoStream).unwrap();
            assert_eq!(read.len(), 1);
            assert_eq!(read.total_doc_count(), 4);
        }

        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        let name = add_segment(&storage, &mut catalog, 1);
        catalog
            .get_mut(&name)
            .unwrap()
            .advance_field_infos_gen(["f".to_string()].into());
        assert!(catalog.write_legacy_commit(&storage, VERSION_40).is_err());
    }

    #[test]
    fn test_corrupt_delete_count() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        let name = add_segment(&storage, &mut catalog, 2);
        catalog.commit(&storage).unwrap();

        // rewrite the segment's .si with a smaller doc count than the commit
        // claims to have deleted
        let codec = PlainCodec::new();
        let mut info = codec.read_segment_info(&storage, &name).unwrap();
        {
            let record = catalog.get_mut(&name).unwrap();
            record.set_del_count(2).unwrap();
        }
        catalog.commit(&storage).unwrap();
        info.doc_count = 1;
        codec.write_segment_info(&storage, &mut info).unwrap();

        let err = SegmentCatalog::read_commit(&storage, "segments_2", &CodecRegistry::new())
            .unwrap_err();
        assert!(matches!(err, GalleyError::CorruptState(_)));
    }

    #[test]
    fn test_unknown_codec_is_corrupt() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, 1);
        catalog.commit(&storage).unwrap();

        let err = SegmentCatalog::read_commit(&storage, "segments_1", &CodecRegistry::empty())
            .unwrap_err();
        assert!(matches!(err, GalleyError::CorruptState(_)));
    }

    #[test]
    fn test_segments_gen_hint() {
        let storage = MemoryStorage::new_default();
        assert_eq!(read_segments_gen(&storage, &NoInfoStream), None);

        write_segments_gen(&storage, 7);
        assert_eq!(read_segments_gen(&storage, &NoInfoStream), Some(7));

        storage.corrupt_file(SEGMENTS_GEN, 5).unwrap();
        assert_eq!(read_segments_gen(&storage, &NoInfoStream), None);

        // the footer-less format is still understood
        let mut output = StructWriter::create(&storage, SEGMENTS_GEN).unwrap();
        output.write_i32(FORMAT_SEGMENTS_GEN_47).unwrap();
        output.write_i64(4).unwrap();
        output.write_i64(4).unwrap();
        output.close().unwrap();
        assert_eq!(read_segments_gen(&storage, &NoInfoStream), Some(4));

        // disagreeing copies are ignored
        let mut output = StructWriter::create(&storage, SEGMENTS_GEN).unwrap();
        output.write_i32(FORMAT_SEGMENTS_GEN_47).unwrap();
        output.write_i64(4).unwrap();
        output.write_i64(5).unwrap();
        output.close().unwrap();
        assert_eq!(read_segments_gen(&storage, &NoInfoStream), None);
    }

    #[test]
    fn test_apply_merge_changes_keeps_position() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        let a = add_segment(&storage, &mut catalog, 1);
        let b = add_segment(&storage, &mut catalog, 1);
        let c = add_segment(&storage, &mut catalog, 1);
        let target = add_segment(&storage, &mut catalog, 2);
        let target_record = catalog.remove(&target).unwrap();

        let merged_away: BTreeSet<String> = [b.clone(), c.clone()].into();
        catalog.apply_merge_changes(&merged_away, target_record.clone(), false);
        let names: Vec<&str> = catalog.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec![a.as_str(), target.as_str()]);

        // all sources gone already: the target goes first
        let mut catalog2 = SegmentCatalog::new();
        catalog2.add(catalog.get(&a).unwrap().clone());
        catalog2.apply_merge_changes(&merged_away, target_record.clone(), false);
        assert_eq!(catalog2.segments()[0].name(), target);

        catalog2.apply_merge_changes(&[a.clone(), target.clone()].into(), target_record, true);
        assert!(catalog2.is_empty());
    }
}
