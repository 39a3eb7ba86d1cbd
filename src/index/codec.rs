//! Codec abstraction for per-segment files.
//!
//! The write engine never looks inside segment files. Everything it needs
//! (writing a flushed or merged segment, its `.si` descriptor, generations
//! of live docs and field updates, and opening a reader) goes through the
//! [`Codec`] trait. A commit names each segment's codec, and
//! [`CodecRegistry`] maps those names back to implementations when the
//! commit is read.

pub mod plain;

use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;

use crate::error::{GalleyError, Result};
use crate::index::field_updates::FieldUpdates;
use crate::index::segment_reader::{SegmentReader, SegmentSnapshot};
use crate::index::segment_record::{SegmentInfo, SegmentRecord};
use crate::storage::Storage;

pub use plain::{PLAIN_CODEC_NAME, PlainCodec};

/// Encoder/decoder for the files of a segment.
pub trait Codec: Send + Sync + Debug {
    /// Name recorded in commits for segments written by this codec.
    fn name(&self) -> &str;

    /// Write the data files of a new segment. The returned info lists the
    /// written files but not yet the `.si` file.
    fn write_segment(&self, storage: &dyn Storage, reader: &SegmentReader) -> Result<SegmentInfo>;

    /// Write the `.si` descriptor, adding its name to `info.files`.
    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()>;

    fn read_segment_info(&self, storage: &dyn Storage, name: &str) -> Result<SegmentInfo>;

    /// Open a reader with every field-update generation of `record` applied.
    fn open_reader(&self, storage: &dyn Storage, record: &SegmentRecord) -> Result<SegmentReader>;

    /// Write `live_docs` as generation `generation` and return the file name.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentRecord,
        live_docs: &BitVec,
        generation: i64,
    ) -> Result<String>;

    /// Read the current live-docs generation of `record`.
    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentRecord) -> Result<BitVec>;

    /// Write `updates` as field-update generation `generation` and return
    /// the file name.
    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentRecord,
        updates: &FieldUpdates,
        generation: i64,
    ) -> Result<String>;

    /// Merge the live documents of `sources`, in order, into segment
    /// `target`. `check_abort` is polled between units of work.
    fn merge(
        &self,
        storage: &dyn Storage,
        target: &str,
        sources: &[SegmentSnapshot],
        check_abort: &dyn Fn() -> Result<()>,
    ) -> Result<MergedSegment>;
}

/// Result of [`Codec::merge`].
#[derive(Debug, Clone)]
pub struct MergedSegment {
    /// Info of the merged segment, without the `.si` file.
    pub info: SegmentInfo,
    /// One map per source, from source doc id to merged doc id.
    pub doc_maps: Vec<DocMap>,
}

/// Maps one merge source's doc ids to doc ids of the merged segment.
/// Documents deleted when the merge started have no mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMap {
    map: Vec<i32>,
    mapped: u32,
}

impl DocMap {
    /// Live documents are numbered consecutively from `base`.
    pub fn from_live_docs(max_doc: u32, live_docs: Option<&BitVec>, base: u32) -> Self {
        let mut map = Vec::with_capacity(max_doc as usize);
        let mut next = base;
        for doc in 0..max_doc as usize {
            let live = live_docs.is_none_or(|bits| bits.get(doc).unwrap_or(false));
            if live {
                map.push(next as i32);
                next += 1;
            } else {
                map.push(-1);
            }
        }
        DocMap {
            map,
            mapped: next - base,
        }
    }

    pub fn get(&self, doc: u32) -> Option<u32> {
        match self.map.get(doc as usize) {
            Some(new_doc) if *new_doc >= 0 => Some(*new_doc as u32),
            _ => None,
        }
    }

    /// Source documents covered by the map.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Source documents that received a merged doc id.
    pub fn num_mapped(&self) -> u32 {
        self.mapped
    }
}

/// Codecs available for reading commits, by name.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: AHashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with no codecs.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: AHashMap::new(),
        }
    }

    /// A registry holding the built-in codecs.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PlainCodec::new()));
        registry
    }

    /// Add or replace a codec under its own name.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Resolve a codec name read from a commit.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| GalleyError::corrupt(format!("unknown codec \"{name}\"")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
