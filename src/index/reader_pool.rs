//! Shared [`SegmentView`]s, at most one per segment.
//!
//! Applying deletes, merging and opening snapshots all need the same
//! per-segment state; the pool makes sure they see one copy. Without
//! pooling, a view is written out and dropped as soon as its last borrower
//! releases it. Once a snapshot has been opened pooling stays on, and views
//! live until they are dropped explicitly or the writer closes.

use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::codec::CodecRegistry;
use crate::index::segment_record::SegmentRecord;
use crate::index::segment_view::SegmentView;
use crate::storage::Storage;

#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    codecs: CodecRegistry,
    views: AHashMap<String, SegmentView>,
    pooling: bool,
}

impl ReaderPool {
    pub fn new(storage: Arc<dyn Storage>, codecs: CodecRegistry) -> Self {
        ReaderPool {
            storage,
            codecs,
            views: AHashMap::new(),
            pooling: false,
        }
    }

    pub fn enable_pooling(&mut self) {
        self.pooling = true;
    }

    pub fn is_pooling(&self) -> bool {
        self.pooling
    }

    /// Borrow the view of `record`, creating it when `create` is set.
    /// Every successful call must be paired with [`release`](Self::release).
    pub fn acquire(&mut self, record: &SegmentRecord, create: bool) -> Result<&mut SegmentView> {
        if !self.views.contains_key(record.name()) {
            if !create {
                return Err(GalleyError::not_pooled(record.name()));
            }
            let codec = self.codecs.get(&record.info().codec)?;
            let view = SegmentView::new(record, Arc::clone(&self.storage), codec);
            self.views.insert(record.name().to_string(), view);
        }

        self.views
            .get_mut(record.name())
            .ok_or_else(|| GalleyError::not_pooled(record.name()))?
            .inc_ref();
        debug_assert!(self.is_consistent(), "reader pool out of sync after acquire");
        self.views
            .get_mut(record.name())
            .ok_or_else(|| GalleyError::not_pooled(record.name()))
    }

    /// The pooled view of `name`, without taking a reference.
    pub fn get(&mut self, name: &str) -> Option<&mut SegmentView> {
        self.views.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    /// Pending deletes of a pooled segment; zero when it is not pooled.
    pub fn pending_delete_count(&self, name: &str) -> u32 {
        self.views
            .get(name)
            .map_or(0, SegmentView::pending_delete_count)
    }

    /// Give back a reference taken by [`acquire`](Self::acquire). Returns
    /// whether a live-docs file was written, in which case the caller must
    /// checkpoint.
    pub fn release(&mut self, record: &mut SegmentRecord) -> Result<bool> {
        let Some(view) = self.views.get_mut(record.name()) else {
            return Ok(false);
        };
        view.dec_ref();

        let written = if !self.pooling && view.ref_count() == 1 {
            let written = view.write_live_docs(record)?;
            self.views.remove(record.name());
            written
        } else {
            false
        };
        debug_assert!(self.is_consistent(), "reader pool out of sync after release");
        Ok(written)
    }

    /// Drop a view without writing its pending deletes.
    pub fn drop(&mut self, name: &str) {
        self.views.remove(name);
        debug_assert!(self.is_consistent(), "reader pool out of sync after drop");
    }

    /// Drop every view. With `persist`, pending deletes of segments still in
    /// `catalog` are written first. Every view is dropped even when a write
    /// fails; the first error is returned.
    pub fn drop_all(&mut self, catalog: &mut SegmentCatalog, persist: bool) -> Result<bool> {
        let mut first_error = None;
        let mut written = false;

        for (name, mut view) in self.views.drain() {
            if !persist {
                continue;
            }
            let Some(record) = catalog.get_mut(&name) else {
                continue;
            };
            match view.write_live_docs(record) {
                Ok(wrote) => written |= wrote,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        debug_assert!(self.is_consistent(), "reader pool out of sync after drop_all");

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Write pending deletes of every pooled segment in `catalog`, keeping
    /// the views. Returns whether anything was written.
    pub fn commit(&mut self, catalog: &mut SegmentCatalog) -> Result<bool> {
        let mut written = false;
        for (name, view) in self.views.iter_mut() {
            if let Some(record) = catalog.get_mut(name) {
                written |= view.write_live_docs(record)?;
            }
        }
        debug_assert!(self.is_consistent(), "reader pool out of sync after commit");
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Every pooled view has a live reference and, unless it belongs to a
    /// merge in flight, a segment in `catalog`.
    pub fn check_invariants(&self, catalog: &SegmentCatalog) -> bool {
        self.is_consistent()
            && self
                .views
                .iter()
                .all(|(name, view)| catalog.contains(name) || view.ref_count() > 1)
    }

    /// One view per segment, each keyed by its own name and still
    /// referenced by the pool.
    fn is_consistent(&self) -> bool {
        self.views
            .iter()
            .all(|(name, view)| view.name() == name && view.ref_count() >= 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::codec::{Codec, PlainCodec};
    use crate::index::segment_reader::SegmentReader;
    use crate::storage::memory::MemoryStorage;

    fn catalog_with_segment(storage: &MemoryStorage, docs: usize) -> SegmentCatalog {
        let codec = PlainCodec::new();
        let docs: Vec<Document> = (0..docs)
            .map(|i| Document::builder().add_keyword("id", i.to_string()).build())
            .collect();
        let mut catalog = SegmentCatalog::new();
        let name = catalog.new_segment_name();
        let reader = SegmentReader::from_documents(&name, &docs).unwrap();
        let mut info = codec.write_segment(storage, &reader).unwrap();
        codec.write_segment_info(storage, &mut info).unwrap();
        catalog.add(SegmentRecord::new(info));
        catalog
    }

    #[test]
    fn test_unpooled_release_writes_and_drops() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = catalog_with_segment(&storage, 3);
        let mut pool = ReaderPool::new(storage.clone(), CodecRegistry::new());

        let record = catalog.get("_0").unwrap().clone();
        let view = pool.acquire(&record, true).unwrap();
        assert_eq!(view.ref_count(), 2);
        view.delete(&record, 1).unwrap();
        assert_eq!(pool.pending_delete_count("_0"), 1);

        let written = pool.release(catalog.get_mut("_0").unwrap()).unwrap();
        assert!(written);
        assert!(pool.is_empty());
        assert_eq!(catalog.get("_0").unwrap().del_count(), 1);
        assert!(storage.file_exists("_0_1.liv"));
    }

    #[test]
    fn test_acquire_without_create_is_not_pooled() {
        let storage = Arc::new(MemoryStorage::new_default());
        let catalog = catalog_with_segment(&storage, 1);
        let mut pool = ReaderPool::new(storage, CodecRegistry::new());

        let err = pool.acquire(catalog.get("_0").unwrap(), false).unwrap_err();
        assert!(matches!(err, GalleyError::NotPooled(_)));
    }

    #[test]
    fn test_pooled_views_survive_release() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = catalog_with_segment(&storage, 2);
        let mut pool = ReaderPool::new(storage.clone(), CodecRegistry::new());
        pool.enable_pooling();

        let record = catalog.get("_0").unwrap().clone();
        pool.acquire(&record, true).unwrap().delete(&record, 0).unwrap();
        assert!(!pool.release(catalog.get_mut("_0").unwrap()).unwrap());
        assert!(pool.contains("_0"));
        assert!(pool.check_invariants(&catalog));
        assert_eq!(pool.pending_delete_count("_0"), 1);

        assert!(pool.commit(&mut catalog).unwrap());
        assert_eq!(pool.pending_delete_count("_0"), 0);
        assert_eq!(catalog.get("_0").unwrap().del_gen(), 1);

        pool.drop_all(&mut catalog, true).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drop_all_without_persist_discards_deletes() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = catalog_with_segment(&storage, 2);
        let mut pool = ReaderPool::new(storage.clone(), CodecRegistry::new());
        pool.enable_pooling();

        let record = catalog.get("_0").unwrap().clone();
        pool.acquire(&record, true).unwrap().delete(&record, 0).unwrap();
        assert!(!pool.drop_all(&mut catalog, false).unwrap());
        assert_eq!(catalog.get("_0").unwrap().del_count(), 0);
        assert!(!storage.file_exists("_0_1.liv"));
    }

    #[test]
    fn test_view_of_removed_segment_breaks_invariants() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = catalog_with_segment(&storage, 2);
        let mut pool = ReaderPool::new(storage, CodecRegistry::new());
        pool.enable_pooling();

        let record = catalog.get("_0").unwrap().clone();
        pool.acquire(&record, true).unwrap();
        pool.release(catalog.get_mut("_0").unwrap()).unwrap();
        assert!(pool.check_invariants(&catalog));

        catalog.remove("_0");
        assert!(!pool.check_invariants(&catalog));
        pool.drop("_0");
        assert!(pool.check_invariants(&catalog));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reader pool out of sync after release")]
    fn test_release_without_acquire_panics() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = catalog_with_segment(&storage, 1);
        let mut pool = ReaderPool::new(storage, CodecRegistry::new());
        pool.enable_pooling();

        let record = catalog.get("_0").unwrap().clone();
        pool.acquire(&record, true).unwrap();
        pool.release(catalog.get_mut("_0").unwrap()).unwrap();
        // the pool's own reference is the last one left
        let _ = pool.release(catalog.get_mut("_0").unwrap());
    }
}
