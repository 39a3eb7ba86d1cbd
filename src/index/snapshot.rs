//! Point-in-time views over all segments of an index.
//!
//! An [`IndexSnapshot`] concatenates its segments into one doc id space:
//! the documents of the first segment come first, then those of the
//! second, and so on. It holds readers and live docs that were current when
//! it was taken and never changes afterwards, no matter what the writer
//! does.

use std::sync::Arc;

use crate::document::Term;
use crate::error::Result;
use crate::index::catalog::SegmentCatalog;
use crate::index::codec::CodecRegistry;
use crate::index::info_stream::NoInfoStream;
use crate::index::segment_reader::SegmentSnapshot;
use crate::query::Query;
use crate::storage::Storage;

#[derive(Debug, Clone)]
struct SnapshotSegment {
    name: String,
    base: u32,
    snapshot: SegmentSnapshot,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    segments: Vec<SnapshotSegment>,
    max_doc: u32,
    num_docs: u32,
    version: u64,
}

impl IndexSnapshot {
    pub(crate) fn new(segments: Vec<(String, SegmentSnapshot)>, version: u64) -> Self {
        let mut base = 0;
        let mut num_docs = 0;
        let segments = segments
            .into_iter()
            .map(|(name, snapshot)| {
                let segment = SnapshotSegment {
                    name,
                    base,
                    snapshot,
                };
                base += segment.snapshot.max_doc();
                num_docs += segment.snapshot.num_docs();
                segment
            })
            .collect();
        IndexSnapshot {
            segments,
            max_doc: base,
            num_docs,
            version,
        }
    }

    /// Open the latest commit in `storage` with the built-in codecs.
    pub fn open(storage: &dyn Storage) -> Result<Self> {
        Self::open_with_codecs(storage, &CodecRegistry::new())
    }

    pub fn open_with_codecs(storage: &dyn Storage, codecs: &CodecRegistry) -> Result<Self> {
        let catalog = SegmentCatalog::read(storage, codecs, &NoInfoStream)?;
        let mut segments = Vec::with_capacity(catalog.len());
        for record in catalog.iter() {
            let codec = codecs.get(&record.info().codec)?;
            let reader = Arc::new(codec.open_reader(storage, record)?);
            let live_docs = if record.has_deletions() {
                Some(Arc::new(codec.read_live_docs(storage, record)?))
            } else {
                None
            };
            segments.push((
                record.name().to_string(),
                SegmentSnapshot::new(reader, live_docs, record.num_docs()),
            ));
        }
        Ok(Self::new(segments, catalog.version()))
    }

    /// Catalog version the snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.name.as_str()).collect()
    }

    /// Segment name and segment-local doc id of a global doc id.
    pub fn locate(&self, doc: u32) -> Option<(&str, u32)> {
        if doc >= self.max_doc {
            return None;
        }
        let idx = self.segments.partition_point(|s| s.base <= doc) - 1;
        let segment = &self.segments[idx];
        Some((segment.name.as_str(), doc - segment.base))
    }

    fn segment_of(&self, doc: u32) -> Option<(&SnapshotSegment, u32)> {
        let (_, local) = self.locate(doc)?;
        let idx = self.segments.partition_point(|s| s.base <= doc) - 1;
        Some((&self.segments[idx], local))
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.segment_of(doc)
            .is_some_and(|(segment, local)| segment.snapshot.is_live(local))
    }

    /// Live documents containing `term`.
    pub fn doc_freq(&self, term: &Term) -> usize {
        self.segments
            .iter()
            .map(|segment| {
                segment
                    .snapshot
                    .reader()
                    .postings(term)
                    .iter()
                    .filter(|doc| segment.snapshot.is_live(**doc))
                    .count()
            })
            .sum()
    }

    /// Global ids of the live documents matching `query`, ascending.
    pub fn search(&self, query: &dyn Query) -> Result<Vec<u32>> {
        let mut hits = Vec::new();
        for segment in &self.segments {
            for doc in query.doc_ids(segment.snapshot.reader())? {
                if segment.snapshot.is_live(doc) {
                    hits.push(segment.base + doc);
                }
            }
        }
        Ok(hits)
    }

    pub fn numeric_value(&self, field: &str, doc: u32) -> Option<i64> {
        let (segment, local) = self.segment_of(doc)?;
        segment.snapshot.reader().numeric_value(field, local)
    }

    pub fn binary_value(&self, field: &str, doc: u32) -> Option<&[u8]> {
        let (segment, local) = self.segment_of(doc)?;
        segment.snapshot.reader().binary_value(field, local)
    }
}
