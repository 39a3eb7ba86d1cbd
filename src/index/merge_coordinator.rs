//! Bookkeeping of registered merges.
//!
//! A merge moves through `Registered` (queued in `pending`), `Running`
//! (handed to a scheduler thread) and finally `Committed` or `Aborted`.
//! While registered or running, its source segments are marked merging so
//! no second merge can claim them. All of this state lives under the
//! writer's engine lock.
//!
//! When a merge commits, everything that happened to its sources since the
//! merge took its snapshots has to be carried over to the merged segment;
//! see [`MergeCoordinator::commit_merged_deletes_and_updates`].

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashSet;

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::field_updates::FieldUpdates;
use crate::index::info_stream::{IW, InfoStream};
use crate::index::merge::{MergeProgress, MergeState, OneMerge};
use crate::index::merge_policy::MergeContext;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_record::SegmentRecord;

/// What [`MergeCoordinator::commit_merged_deletes_and_updates`] carried
/// over to the merged segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReconciliation {
    /// Documents deleted on the sources while the merge ran.
    pub carried_deletes: u32,
    /// Fields updated on the sources while the merge ran.
    pub carried_fields: Vec<String>,
    /// Whether no document of the merged segment is left.
    pub all_deleted: bool,
}

#[derive(Debug, Default)]
pub struct MergeCoordinator {
    pending: VecDeque<Arc<OneMerge>>,
    running: Vec<Arc<OneMerge>>,
    merging: AHashSet<String>,
    exceptions: Vec<Arc<OneMerge>>,
    stop_merges: bool,
}

impl MergeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `merge` unless it conflicts. Returns false when a source is
    /// already merging or no longer in `catalog`; with merges stopped the
    /// merge is aborted and `MergeAborted` returned. A source whose segment
    /// info differs from the one in `catalog` belongs to another index and
    /// fails the registration with `IllegalState`.
    pub fn register(
        &mut self,
        merge: Arc<OneMerge>,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<bool> {
        let info_stream = ctx.info_stream();
        if self.stop_merges {
            merge.abort();
            return Err(GalleyError::merge_aborted(format!("merge is aborted: {merge}")));
        }

        let mut external = None;
        for segment in merge.segments() {
            if self.merging.contains(segment.name()) {
                message(info_stream, || {
                    format!(
                        "reject merge {merge}: segment {} is already marked for merge",
                        segment.name()
                    )
                });
                return Ok(false);
            }
            if !catalog.contains(segment.name()) {
                message(info_stream, || {
                    format!(
                        "reject merge {merge}: segment {} does not exist in live infos",
                        segment.name()
                    )
                });
                return Ok(false);
            }
            if external.is_none()
                && catalog
                    .get(segment.name())
                    .is_some_and(|live| live.info() != segment.info())
            {
                external = Some(segment.name());
            }
        }
        if let Some(name) = external {
            message(info_stream, || {
                format!("reject merge {merge}: segment {name} is not in the current index")
            });
            merge.abort();
            return Err(GalleyError::illegal_state(format!(
                "segment {name} of merge {merge} is not in the current index"
            )));
        }

        let mut estimated_bytes = 0u64;
        for segment in merge.segments() {
            self.merging.insert(segment.name().to_string());
            if segment.doc_count() > 0 {
                let del_ratio =
                    ctx.num_deleted_docs(segment) as f64 / segment.doc_count() as f64;
                estimated_bytes +=
                    (ctx.size_in_bytes(segment) as f64 * (1.0 - del_ratio)) as u64;
            }
        }
        {
            let mut progress = merge.progress();
            progress.estimated_bytes = estimated_bytes;
            progress.register_done = true;
        }

        message(info_stream, || {
            format!("add merge to pendingMerges: {merge} [total {} pending]", self.pending.len() + 1)
        });
        self.pending.push_back(merge);
        Ok(true)
    }

    /// Hand the oldest pending merge to a scheduler thread.
    pub fn next_merge(&mut self) -> Option<Arc<OneMerge>> {
        let merge = self.pending.pop_front()?;
        merge.progress().state = MergeState::Running;
        self.running.push(Arc::clone(&merge));
        Some(merge)
    }

    /// Forget `merge` and release its sources.
    pub fn finish(&mut self, merge: &OneMerge) {
        self.running.retain(|m| m.id() != merge.id());
        self.pending.retain(|m| m.id() != merge.id());

        let mut progress = merge.progress();
        if progress.register_done {
            for segment in merge.segments() {
                self.merging.remove(segment.name());
            }
            progress.register_done = false;
        }
        if progress.state != MergeState::Committed {
            progress.state = MergeState::Aborted;
        }
    }

    /// Abort and drop every pending merge, returning them.
    pub fn abort_pending(&mut self) -> Vec<Arc<OneMerge>> {
        let aborted: Vec<Arc<OneMerge>> = self.pending.drain(..).collect();
        for merge in &aborted {
            merge.abort();
            self.finish(merge);
        }
        aborted
    }

    /// Ask running merges to stop. They notice at their next abort check.
    pub fn abort_running(&self) {
        for merge in &self.running {
            merge.abort();
        }
    }

    pub fn set_stop_merges(&mut self, stop: bool) {
        self.stop_merges = stop;
    }

    pub fn stop_merges(&self) -> bool {
        self.stop_merges
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Arc<OneMerge>> {
        self.pending.iter()
    }

    pub fn running(&self) -> impl Iterator<Item = &Arc<OneMerge>> {
        self.running.iter()
    }

    /// Whether `merge` is still pending or running.
    pub fn contains(&self, merge: &OneMerge) -> bool {
        self.pending.iter().chain(&self.running).any(|m| m.id() == merge.id())
    }

    pub fn is_merging(&self, name: &str) -> bool {
        self.merging.contains(name)
    }

    pub fn merging_segments(&self) -> impl Iterator<Item = &str> {
        self.merging.iter().map(String::as_str)
    }

    /// Whether a merge started by `force_merge` is still running, or
    /// pending too when `include_pending` is set.
    pub fn max_num_segments_merges_pending(&self, include_pending: bool) -> bool {
        self.running
            .iter()
            .chain(self.pending.iter().filter(|_| include_pending))
            .any(|m| m.max_num_segments().is_some())
    }

    /// Remember a failed merge for `force_merge` callers.
    pub fn record_exception(&mut self, merge: Arc<OneMerge>) {
        self.exceptions.push(merge);
    }

    pub fn exceptions(&self) -> &[Arc<OneMerge>] {
        &self.exceptions
    }

    pub fn clear_exceptions(&mut self) {
        self.exceptions.clear();
    }

    /// Carry over what happened to the sources while `merge` ran.
    ///
    /// A document that was live in the merge's snapshot but is deleted now
    /// is deleted in the merged segment, through the merge's doc map. Field
    /// updates applied to a source since the merge started are remapped the
    /// same way and written as one generation on the merged segment, the
    /// latest value per document winning.
    pub fn commit_merged_deletes_and_updates(
        &self,
        progress: &MergeProgress,
        pool: &mut ReaderPool,
        catalog: &SegmentCatalog,
        target: &mut SegmentRecord,
        info_stream: &dyn InfoStream,
    ) -> Result<MergeReconciliation> {
        let mut deletes = Vec::new();
        let mut updates = FieldUpdates::new();

        for ((source, snapshot), doc_map) in progress
            .sources
            .iter()
            .zip(&progress.snapshots)
            .zip(&progress.doc_maps)
        {
            let Some(current) = catalog.get(source.name()) else {
                return Err(GalleyError::merge_aborted(format!(
                    "segment {} disappeared while it was merged",
                    source.name()
                )));
            };
            let Some(view) = pool.get(source.name()) else {
                return Err(GalleyError::illegal_state(format!(
                    "merge source {} is not pooled",
                    source.name()
                )));
            };

            if let Some(current_live) = view.live_docs(current)? {
                for doc in 0..snapshot.max_doc() {
                    let deleted_now = !current_live.get(doc as usize).unwrap_or(false);
                    if snapshot.is_live(doc) && deleted_now {
                        if let Some(new_doc) = doc_map.get(doc) {
                            deletes.push(new_doc);
                        }
                    }
                }
            }

            let merging_updates = view.merging_updates();
            if merging_updates.any() {
                updates.merge(&merging_updates.remap(|doc| doc_map.get(doc)));
            }
        }

        let view = pool.acquire(target, true)?;
        let carried = (|| -> Result<u32> {
            let mut carried = 0;
            for doc in &deletes {
                if view.delete(target, *doc)? {
                    carried += 1;
                }
            }
            view.apply_field_updates(target, &updates)?;
            Ok(carried)
        })();
        let all_deleted = view.is_fully_deleted(target);
        let released = pool.release(target);
        let carried_deletes = carried?;
        released?;

        let carried_fields: Vec<String> = updates.fields().into_iter().collect();
        if carried_deletes > 0 || !carried_fields.is_empty() {
            message(info_stream, || {
                format!(
                    "commitMergedDeletes: {} new deletes, updated fields {carried_fields:?}",
                    carried_deletes
                )
            });
        }
        Ok(MergeReconciliation {
            carried_deletes,
            carried_fields,
            all_deleted,
        })
    }
}

fn message(info_stream: &dyn InfoStream, message: impl FnOnce() -> String) {
    if info_stream.is_enabled(IW) {
        info_stream.message(IW, &message());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::document::Document;
    use crate::index::codec::{Codec, CodecRegistry, PlainCodec};
    use crate::index::info_stream::NoInfoStream;
    use crate::index::segment_reader::SegmentReader;
    use crate::index::segment_record::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    struct TestContext;

    impl MergeContext for TestContext {
        fn num_deleted_docs(&self, record: &SegmentRecord) -> u32 {
            record.del_count()
        }

        fn is_merging(&self, _name: &str) -> bool {
            false
        }

        fn size_in_bytes(&self, _record: &SegmentRecord) -> u64 {
            100
        }

        fn info_stream(&self) -> &dyn InfoStream {
            &NoInfoStream
        }
    }

    fn add_segment(storage: &MemoryStorage, catalog: &mut SegmentCatalog, ids: &[&str]) -> String {
        let codec = PlainCodec::new();
        let name = catalog.new_segment_name();
        let docs: Vec<Document> = ids
            .iter()
            .map(|id| {
                Document::builder()
                    .add_keyword("id", *id)
                    .add_numeric("price", 10)
                    .build()
            })
            .collect();
        let reader = SegmentReader::from_documents(&name, &docs).unwrap();
        let mut info = codec.write_segment(storage, &reader).unwrap();
        codec.write_segment_info(storage, &mut info).unwrap();
        catalog.add(SegmentRecord::new(info));
        name
    }

    fn sources(catalog: &SegmentCatalog) -> Vec<SegmentRecord> {
        catalog.iter().cloned().collect()
    }

    #[test]
    fn test_register_rejects_conflicts() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        add_segment(&storage, &mut catalog, &["b"]);
        let mut coordinator = MergeCoordinator::new();

        let first = Arc::new(OneMerge::new(sources(&catalog)));
        assert!(coordinator.register(first.clone(), &catalog, &TestContext).unwrap());
        assert!(coordinator.is_merging("_0"));
        assert_eq!(first.estimated_bytes(), 200);

        let overlapping = Arc::new(OneMerge::new(vec![catalog.get("_1").unwrap().clone()]));
        assert!(!coordinator.register(overlapping, &catalog, &TestContext).unwrap());

        let missing = Arc::new(OneMerge::new(vec![SegmentRecord::new(SegmentInfo::new(
            "_9", 1, "Plain48",
        ))]));
        assert!(!coordinator.register(missing, &catalog, &TestContext).unwrap());
    }

    #[test]
    fn test_forced_merges_pending() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        let mut coordinator = MergeCoordinator::new();
        let merge = Arc::new(OneMerge::new(sources(&catalog)));
        merge.progress().max_num_segments = Some(1);
        coordinator.register(merge, &catalog, &TestContext).unwrap();

        assert!(coordinator.max_num_segments_merges_pending(true));
        assert!(!coordinator.max_num_segments_merges_pending(false));
        let running = coordinator.next_merge().unwrap();
        assert!(coordinator.max_num_segments_merges_pending(false));
        coordinator.finish(&running);
        assert!(!coordinator.max_num_segments_merges_pending(true));
    }

    #[test]
    fn test_register_fails_for_segment_of_another_index() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        add_segment(&storage, &mut catalog, &["b"]);
        let mut coordinator = MergeCoordinator::new();

        // same name as a live segment, different segment info
        let foreign = SegmentRecord::new(SegmentInfo::new("_1", 7, "Plain48"));
        let merge = Arc::new(OneMerge::new(vec![
            catalog.get("_0").unwrap().clone(),
            foreign,
        ]));
        let err = coordinator
            .register(merge.clone(), &catalog, &TestContext)
            .unwrap_err();
        assert!(matches!(err, GalleyError::IllegalState(_)), "{err}");
        assert!(!err.is_merge_aborted());
        assert!(merge.is_aborted());
        assert!(!coordinator.has_pending());
        assert!(!coordinator.is_merging("_0"));
    }

    #[test]
    fn test_next_merge_and_finish() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        let mut coordinator = MergeCoordinator::new();

        let merge = Arc::new(OneMerge::new(sources(&catalog)));
        coordinator.register(merge.clone(), &catalog, &TestContext).unwrap();
        let next = coordinator.next_merge().unwrap();
        assert_eq!(next.id(), merge.id());
        assert_eq!(next.state(), MergeState::Running);
        assert!(coordinator.has_running());
        assert!(coordinator.next_merge().is_none());

        coordinator.finish(&next);
        assert!(!coordinator.has_running());
        assert!(!coordinator.is_merging("_0"));
        assert_eq!(next.state(), MergeState::Aborted);
    }

    #[test]
    fn test_stopped_coordinator_aborts_registration() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        let mut coordinator = MergeCoordinator::new();
        coordinator.set_stop_merges(true);

        let merge = Arc::new(OneMerge::new(sources(&catalog)));
        let err = coordinator
            .register(merge.clone(), &catalog, &TestContext)
            .unwrap_err();
        assert!(err.is_merge_aborted());
        assert!(merge.is_aborted());
        assert!(!coordinator.has_pending());
    }

    #[test]
    fn test_abort_pending_releases_segments() {
        let storage = MemoryStorage::new_default();
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a"]);
        let mut coordinator = MergeCoordinator::new();
        let merge = Arc::new(OneMerge::new(sources(&catalog)));
        coordinator.register(merge.clone(), &catalog, &TestContext).unwrap();

        let aborted = coordinator.abort_pending();
        assert_eq!(aborted.len(), 1);
        assert!(merge.is_aborted());
        assert!(!coordinator.is_merging("_0"));
    }

    #[test]
    fn test_deletes_and_updates_during_merge_are_carried_over() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog, &["a", "b"]);
        add_segment(&storage, &mut catalog, &["c", "d"]);
        let mut pool = ReaderPool::new(storage.clone(), CodecRegistry::new());
        let codec = PlainCodec::new();

        // snapshots as the merge sees them
        let merge = OneMerge::new(sources(&catalog));
        let mut snapshots = Vec::new();
        for record in catalog.iter() {
            let view = pool.acquire(record, true).unwrap();
            view.set_merging(true);
            snapshots.push(view.snapshot(record).unwrap());
        }
        let target_name = catalog.new_segment_name();
        let merged = codec
            .merge(&*storage, &target_name, &snapshots, &|| Ok(()))
            .unwrap();
        let mut info = merged.info.clone();
        codec.write_segment_info(&*storage, &mut info).unwrap();
        let mut target = SegmentRecord::new(info);

        // "b" is deleted and "c" updated while the merge runs
        {
            let record = catalog.get_mut("_0").unwrap();
            let view = pool.get("_0").unwrap();
            view.delete(record, 1).unwrap();
        }
        {
            let record = catalog.get_mut("_1").unwrap();
            let view = pool.get("_1").unwrap();
            let mut updates = FieldUpdates::new();
            updates.set_numeric("price", 0, Some(99));
            view.apply_field_updates(record, &updates).unwrap();
        }

        {
            let mut progress = merge.progress();
            progress.sources = sources(&catalog);
            progress.snapshots = snapshots;
            progress.doc_maps = merged.doc_maps.clone();
        }
        let coordinator = MergeCoordinator::new();
        let outcome = coordinator
            .commit_merged_deletes_and_updates(
                &merge.progress(),
                &mut pool,
                &catalog,
                &mut target,
                &NoInfoStream,
            )
            .unwrap();

        assert_eq!(outcome.carried_deletes, 1);
        assert_eq!(outcome.carried_fields, vec!["price".to_string()]);
        assert!(!outcome.all_deleted);
        // unpooled: the target's deletes were written on release
        assert_eq!(target.del_count(), 1);
        assert!(target.has_field_updates());

        let reader = codec.open_reader(&*storage, &target).unwrap();
        assert_eq!(reader.numeric_value("price", 2), Some(99));
        assert_eq!(reader.numeric_value("price", 3), Some(10));
        let live = codec.read_live_docs(&*storage, &target).unwrap();
        assert!(!live.get(1).unwrap());
        let expected: BTreeSet<String> = ["_2.dat", "_2.si", "_2_1.liv", "_2_1.upd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(target.files(), expected);
    }
}
