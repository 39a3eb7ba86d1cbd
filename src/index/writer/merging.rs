//! Selecting, running and committing merges.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ahash::AHashSet;

use crate::error::{GalleyError, Result};
use crate::index::codec::DocMap;
use crate::index::info_stream::InfoStream;
use crate::index::merge::{MergeState, MergeTrigger, OneMerge};
use crate::index::merge_coordinator::MergeCoordinator;
use crate::index::merge_policy::MergeContext;
use crate::index::merge_scheduler::MergeSource;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_record::{SegmentInfo, SegmentRecord};
use crate::storage::Storage;
use crate::util::lock_order::RankedGuard;

use super::flush::diagnostics;
use super::{EngineState, IndexWriter};

/// Upper bound of one wait on the merge condvar before conditions are
/// checked again.
pub(super) const MERGE_WAIT: Duration = Duration::from_secs(1);

/// What the merge policy sees of the writer.
pub(super) struct EngineContext<'a> {
    storage: &'a dyn Storage,
    pool: &'a ReaderPool,
    merging: AHashSet<String>,
    info_stream: &'a dyn InfoStream,
}

impl<'a> EngineContext<'a> {
    pub(super) fn new(
        writer: &'a IndexWriter,
        pool: &'a ReaderPool,
        coordinator: &MergeCoordinator,
    ) -> Self {
        EngineContext {
            storage: writer.inner.storage.as_ref(),
            pool,
            merging: coordinator.merging_segments().map(str::to_string).collect(),
            info_stream: writer.inner.info_stream.as_ref(),
        }
    }
}

impl MergeContext for EngineContext<'_> {
    fn num_deleted_docs(&self, record: &SegmentRecord) -> u32 {
        record.del_count() + self.pool.pending_delete_count(record.name())
    }

    fn is_merging(&self, name: &str) -> bool {
        self.merging.contains(name)
    }

    fn size_in_bytes(&self, record: &SegmentRecord) -> u64 {
        record.size_in_bytes(self.storage).unwrap_or(0)
    }

    fn info_stream(&self) -> &dyn InfoStream {
        self.info_stream
    }
}

impl MergeSource for IndexWriter {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        IndexWriter::next_merge(self)
    }

    fn has_pending_merges(&self) -> bool {
        IndexWriter::has_pending_merges(self)
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        IndexWriter::merge(self, merge)
    }

    fn info_stream(&self) -> Arc<dyn InfoStream> {
        Arc::clone(&self.inner.info_stream)
    }
}

impl IndexWriter {
    /// Take the next pending merge and mark it running. Used by merge
    /// schedulers, and by callers driving merges themselves.
    pub fn next_merge(&self) -> Option<Arc<OneMerge>> {
        self.inner.engine.lock().coordinator.next_merge()
    }

    /// Run `merge` on the calling thread: take snapshots of its sources,
    /// write the merged segment and swap it into the catalog.
    ///
    /// An aborted merge is not an error, except that `force_merge` waiting
    /// on it will report it.
    pub fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let started = Instant::now();
        let result = self
            .merge_init(merge)
            .and_then(|run| if run { self.merge_middle(merge) } else { Ok(()) });
        let result = self.check_tragic(result, "merge");
        if let Err(err) = &result {
            merge.progress().error = Some(err.duplicate());
        }
        let finished = self.merge_finish(merge);
        let result = result.and(self.check_tragic(finished, "mergeFinish"));

        let forced = merge.max_num_segments().is_some();
        match result {
            Ok(()) => {
                self.message(|| {
                    format!("merge time {} msec for {merge}", started.elapsed().as_millis())
                });
                let closing = self.inner.closed.load(Ordering::Acquire)
                    || self.inner.closing.load(Ordering::Acquire);
                if !merge.is_aborted() && (forced || !closing) {
                    self.update_pending_merges(MergeTrigger::MergeFinished, merge.max_num_segments())?;
                }
                Ok(())
            }
            Err(err) => {
                if forced {
                    self.inner
                        .engine
                        .lock()
                        .coordinator
                        .record_exception(Arc::clone(merge));
                }
                if err.is_merge_aborted() {
                    self.message(|| format!("merge {merge} was aborted"));
                    Ok(())
                } else {
                    log::warn!("merge {merge} failed: {err}");
                    Err(err)
                }
            }
        }
    }

    /// Consult the merge policy and hand whatever it registered to the
    /// scheduler. Must not be called with the engine or full-flush lock
    /// held.
    pub(super) fn maybe_merge(
        &self,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Result<()> {
        self.ensure_open(false)?;
        let found = self.update_pending_merges(trigger, max_num_segments)?;
        self.inner
            .scheduler
            .merge(self.merge_source(), trigger, found)
    }

    pub(super) fn merge_source(&self) -> Arc<dyn MergeSource> {
        Arc::new(self.clone())
    }

    /// Register the merges the policy proposes. Returns whether any was
    /// registered.
    fn update_pending_merges(
        &self,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Result<bool> {
        let mut engine = self.inner.engine.lock();
        if engine.coordinator.stop_merges() || self.is_broken() {
            return Ok(false);
        }
        let state = &mut *engine;
        let ctx = EngineContext::new(self, &state.pool, &state.coordinator);
        let spec = match max_num_segments {
            Some(max) => self.inner.policy.find_forced_merges(
                &state.catalog,
                max,
                &state.segments_to_merge,
                &ctx,
            )?,
            None => self.inner.policy.find_merges(trigger, &state.catalog, &ctx)?,
        };
        let Some(spec) = spec else {
            return Ok(false);
        };

        let mut found = false;
        for merge in spec.merges {
            merge.progress().max_num_segments = max_num_segments;
            found |= state
                .coordinator
                .register(Arc::new(merge), &state.catalog, &ctx)?;
        }
        Ok(found)
    }

    /// Apply buffered edits to the sources and take their snapshots.
    /// Returns false when no source is left to merge.
    fn merge_init(&self, merge: &Arc<OneMerge>) -> Result<bool> {
        let mut engine = self.inner.engine.lock();
        merge.check_aborted()?;
        if self.is_broken() {
            return Err(GalleyError::illegal_state(
                "this writer hit an unrecoverable error; cannot merge",
            ));
        }

        let names = merge.segment_names();
        let applied = {
            let mut stream = self.inner.stream.lock();
            let state = &mut *engine;
            stream.apply_deletes_and_updates(&mut state.pool, &mut state.catalog, &names)?
        };
        if applied.any_deletes {
            engine.checkpoint()?;
        }
        if !self.inner.config.keep_fully_deleted_segments && !applied.all_deleted.is_empty() {
            for name in &applied.all_deleted {
                self.message(|| format!("drop 100% deleted segment {name} before merging"));
                engine.catalog.remove(name);
                engine.pool.drop(name);
            }
            engine.checkpoint()?;
        }

        let state = &mut *engine;
        let target_name = state.catalog.new_segment_name();
        let mut progress = merge.progress();
        progress.target = Some(SegmentRecord::new(SegmentInfo::new(
            &target_name,
            0,
            self.inner.codec.name(),
        )));
        for segment in merge.segments() {
            let Some(record) = state.catalog.get_mut(segment.name()) else {
                continue;
            };
            let view = state.pool.acquire(record, true)?;
            view.set_merging(true);
            progress.sources.push(record.clone());
            let snapshot = view.snapshot(record)?;
            progress.snapshots.push(snapshot);
        }

        if progress.sources.is_empty() {
            progress.state = MergeState::Committed;
            drop(progress);
            self.message(|| format!("merge {merge}: every source was dropped; nothing to do"));
            return Ok(false);
        }
        drop(progress);
        self.message(|| format!("merging {merge} into {target_name}"));
        Ok(true)
    }

    /// Write the merged segment, then commit it.
    fn merge_middle(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let (target_name, snapshots) = {
            let progress = merge.progress();
            let target = progress
                .target
                .as_ref()
                .map(|t| t.name().to_string())
                .ok_or_else(|| GalleyError::illegal_state("merge has no target"))?;
            (target, progress.snapshots.clone())
        };
        let storage = self.inner.storage.as_ref();
        let codec = &self.inner.codec;

        let written = (|| -> Result<(SegmentInfo, Vec<DocMap>)> {
            let check_abort = || merge.check_aborted();
            let merged = codec.merge(storage, &target_name, &snapshots, &check_abort)?;
            let mut info = merged.info;

            let mut diagnostics = diagnostics("merge");
            diagnostics.insert("mergeFactor".to_string(), snapshots.len().to_string());
            if let Some(max) = merge.max_num_segments() {
                diagnostics.insert("mergeMaxNumSegments".to_string(), max.to_string());
            }
            info.diagnostics = diagnostics;

            let bytes: u64 = info
                .files
                .iter()
                .map(|file| storage.file_size(file).unwrap_or(0))
                .sum();
            info.use_compound_file = {
                let engine = self.inner.engine.lock();
                let ctx = EngineContext::new(self, &engine.pool, &engine.coordinator);
                self.inner
                    .policy
                    .use_compound_file(&engine.catalog, bytes, &ctx)
            };
            merge.check_aborted()?;
            codec.write_segment_info(storage, &mut info)?;
            Ok((info, merged.doc_maps))
        })();

        let (info, doc_maps) = match written {
            Ok(written) => written,
            Err(err) => {
                let mut engine = self.inner.engine.lock();
                if let Err(refresh) = engine.deleter.refresh(Some(&target_name)) {
                    log::warn!("failed to remove files of merged segment {target_name}: {refresh}");
                }
                return Err(err);
            }
        };
        self.message(|| {
            format!(
                "merged segment {target_name}: docCount={} files={:?}",
                info.doc_count, info.files
            )
        });

        {
            let mut progress = merge.progress();
            progress.target = Some(SegmentRecord::new(info));
            progress.doc_maps = doc_maps;
        }
        self.commit_merge(merge)
    }

    /// Swap the sources for the merged segment, carrying over whatever
    /// happened to the sources while the merge ran.
    fn commit_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let mut engine = self.inner.engine.lock();
        let state = &mut *engine;
        let mut progress = merge.progress();
        let Some(mut target) = progress.target.take() else {
            return Err(GalleyError::illegal_state("merge has no target"));
        };

        if merge.is_aborted() {
            self.message(|| format!("commitMerge: skip: it was aborted: {merge}"));
            state.deleter.delete_new_files(&target.files());
            progress.target = Some(target);
            return Err(GalleyError::merge_aborted(format!(
                "merge is aborted: {merge}"
            )));
        }

        let reconciled = state.coordinator.commit_merged_deletes_and_updates(
            &progress,
            &mut state.pool,
            &state.catalog,
            &mut target,
            self.inner.info_stream.as_ref(),
        );
        let reconciled = match reconciled {
            Ok(reconciled) => reconciled,
            Err(err) => {
                state.pool.drop(target.name());
                progress.target = Some(target);
                return Err(err);
            }
        };

        // Edits newer than every source still have to reach the target.
        let generation = progress
            .sources
            .iter()
            .filter_map(|source| state.catalog.get(source.name()))
            .map(SegmentRecord::buffered_deletes_gen)
            .min()
            .unwrap_or(0);
        target.set_buffered_deletes_gen(generation);

        let drop_target =
            reconciled.all_deleted && !self.inner.config.keep_fully_deleted_segments;
        let merged_away: BTreeSet<String> = progress
            .sources
            .iter()
            .map(|source| source.name().to_string())
            .collect();
        for name in &merged_away {
            if let Some(view) = state.pool.get(name) {
                view.drop_changes();
            }
            state.pool.drop(name);
        }

        let target_name = target.name().to_string();
        let target_files = target.files();
        state
            .catalog
            .apply_merge_changes(&merged_away, target.clone(), drop_target);
        if drop_target {
            self.message(|| format!("commitMerge: drop 100% deleted segment {target_name}"));
            state.pool.drop(&target_name);
            state.deleter.delete_new_files(&target_files);
        }

        progress.target = Some(target);
        progress.state = MergeState::Committed;
        let forced = progress.max_num_segments.is_some();
        drop(progress);
        if forced && !drop_target {
            state.segments_to_merge.insert(target_name, false);
        }
        self.message(|| format!("commitMerge: {merge} done"));
        state.checkpoint()
    }

    /// Release the sources and forget the merge, whatever its outcome.
    fn merge_finish(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let mut engine = self.inner.engine.lock();
        let state = &mut *engine;
        let (sources, committed, target_name) = {
            let mut progress = merge.progress();
            progress.snapshots.clear();
            progress.doc_maps.clear();
            (
                std::mem::take(&mut progress.sources),
                progress.state == MergeState::Committed,
                progress.target.as_ref().map(|t| t.name().to_string()),
            )
        };

        let mut first_error = None;
        let mut written = false;
        for source in &sources {
            match state.catalog.get_mut(source.name()) {
                Some(record) => {
                    if let Some(view) = state.pool.get(source.name()) {
                        view.set_merging(false);
                    }
                    match state.pool.release(record) {
                        Ok(wrote) => written |= wrote,
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                None => state.pool.drop(source.name()),
            }
        }
        state.coordinator.finish(merge);

        if !committed
            && let Some(name) = target_name
            && let Err(err) = state.deleter.refresh(Some(&name))
        {
            first_error.get_or_insert(err);
        }
        if written && let Err(err) = state.checkpoint() {
            first_error.get_or_insert(err);
        }
        drop(engine);
        self.inner.merge_condvar.notify_all();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Merge until at most `max_num_segments` segments are left. With
    /// `do_wait`, block until the merges are done and report the first
    /// one that failed.
    pub fn force_merge(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        self.ensure_open(true)?;
        if max_num_segments < 1 {
            return Err(GalleyError::invalid_argument(format!(
                "max_num_segments must be >= 1; got {max_num_segments}"
            )));
        }
        self.message(|| format!("forceMerge: index now {:?}", self.segment_names()));
        self.flush_all(true)?;

        {
            let mut engine = self.inner.engine.lock();
            let state = &mut *engine;
            state.coordinator.clear_exceptions();
            state.segments_to_merge = state
                .catalog
                .iter()
                .map(|record| (record.name().to_string(), true))
                .collect();
            let in_flight: Vec<Arc<OneMerge>> = state
                .coordinator
                .pending()
                .chain(state.coordinator.running())
                .cloned()
                .collect();
            for merge in in_flight {
                merge.progress().max_num_segments = Some(max_num_segments);
                if let Some(target) = merge.target_name() {
                    state.segments_to_merge.insert(target, true);
                }
            }
        }

        self.maybe_merge(MergeTrigger::Explicit, Some(max_num_segments))?;
        if !do_wait {
            return Ok(());
        }

        let executes = self.inner.scheduler.executes_merges();
        let mut engine = self.inner.engine.lock();
        loop {
            self.ensure_open(false)?;
            if let Some(merge) = engine
                .coordinator
                .exceptions()
                .iter()
                .find(|merge| merge.max_num_segments().is_some())
            {
                return Err(merge.error().unwrap_or_else(|| {
                    GalleyError::merge_aborted(format!("background merge was aborted: {merge}"))
                }));
            }
            if !engine.coordinator.max_num_segments_merges_pending(executes) {
                return Ok(());
            }
            engine.wait_for(&self.inner.merge_condvar, MERGE_WAIT);
        }
    }

    /// Merge away segments with too many deleted documents.
    pub fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.ensure_open(true)?;
        self.flush_all(true)?;

        let merges = {
            let mut engine = self.inner.engine.lock();
            let state = &mut *engine;
            let ctx = EngineContext::new(self, &state.pool, &state.coordinator);
            let spec = self
                .inner
                .policy
                .find_forced_deletes_merges(&state.catalog, &ctx)?;
            let mut registered = Vec::new();
            for merge in spec.map(|spec| spec.merges).unwrap_or_default() {
                let merge = Arc::new(merge);
                if state
                    .coordinator
                    .register(Arc::clone(&merge), &state.catalog, &ctx)?
                {
                    registered.push(merge);
                }
            }
            registered
        };
        self.message(|| format!("forceMergeDeletes: registered {} merges", merges.len()));

        self.inner
            .scheduler
            .merge(self.merge_source(), MergeTrigger::Explicit, !merges.is_empty())?;
        if !do_wait {
            return Ok(());
        }

        let executes = self.inner.scheduler.executes_merges();
        let mut engine = self.inner.engine.lock();
        loop {
            self.ensure_open(false)?;
            let mut waiting = false;
            for merge in &merges {
                let running = engine.coordinator.running().any(|m| m.id() == merge.id());
                let pending = engine.coordinator.pending().any(|m| m.id() == merge.id());
                if running || (executes && pending) {
                    waiting = true;
                } else if let Some(err) = merge.error() {
                    return Err(err);
                }
            }
            if !waiting {
                return Ok(());
            }
            engine.wait_for(&self.inner.merge_condvar, MERGE_WAIT);
        }
    }

    /// Block until no merge is running. Pending merges are waited for too
    /// unless the scheduler never runs them.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.ensure_open(false)?;
        self.inner
            .scheduler
            .merge(self.merge_source(), MergeTrigger::Explicit, false)?;
        self.wait_for_running_merges();
        Ok(())
    }

    pub(super) fn wait_for_running_merges(&self) {
        let executes = self.inner.scheduler.executes_merges();
        let mut engine = self.inner.engine.lock();
        while engine.coordinator.has_running() || (executes && engine.coordinator.has_pending()) {
            self.message(|| "waitForMerges: waiting for merges to finish".to_string());
            engine.wait_for(&self.inner.merge_condvar, MERGE_WAIT);
        }
    }

    /// Stop merging: abort pending merges, ask running ones to abort and
    /// wait until they returned. Merges stay stopped until the caller
    /// clears the flag.
    pub(super) fn abort_merges(&self, engine: &mut RankedGuard<'_, EngineState>) {
        engine.coordinator.set_stop_merges(true);
        for merge in engine.coordinator.abort_pending() {
            self.message(|| format!("now abort pending merge {merge}"));
        }
        engine.coordinator.abort_running();
        while engine.coordinator.has_running() {
            self.message(|| "now wait for running merges to abort".to_string());
            engine.wait_for(&self.inner.merge_condvar, MERGE_WAIT);
        }
        self.inner.merge_condvar.notify_all();
    }
}
