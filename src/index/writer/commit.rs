//! Two-phase commit, close, rollback and `delete_all`.

use std::mem;
use std::sync::atomic::Ordering;

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::merge::MergeTrigger;

use super::IndexWriter;

impl IndexWriter {
    /// Flush everything and make it durable as a new commit. Completes a
    /// commit started by [`prepare_commit`](Self::prepare_commit).
    pub fn commit(&self) -> Result<()> {
        self.ensure_open(true)?;
        let _commit = self.inner.commit_lock.lock();
        self.commit_locked()
    }

    /// First phase of a commit: flush, sync every referenced file and write
    /// the next commit file without publishing it. Follow with
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback); until then
    /// readers keep seeing the previous commit.
    pub fn prepare_commit(&self) -> Result<()> {
        self.ensure_open(true)?;
        let _commit = self.inner.commit_lock.lock();
        self.prepare_commit_locked()
    }

    fn commit_locked(&self) -> Result<()> {
        let prepared = self.inner.engine.lock().pending_commit.is_some();
        if prepared {
            self.message(|| "commit: already prepared".to_string());
        } else {
            self.message(|| "commit: now prepare".to_string());
            self.prepare_commit_locked()?;
        }
        self.finish_commit_locked()
    }

    fn prepare_commit_locked(&self) -> Result<()> {
        if self.is_broken() {
            return Err(GalleyError::illegal_state(
                "this writer hit an unrecoverable error; cannot commit",
            ));
        }
        if self.inner.engine.lock().pending_commit.is_some() {
            return Err(GalleyError::illegal_state(
                "prepareCommit was already called with no corresponding call to commit",
            ));
        }

        self.message(|| "prepareCommit: flush".to_string());
        let flushed = self.flush_all(true)?;

        let result = (|| -> Result<()> {
            let to_commit = {
                let mut engine = self.inner.engine.lock();
                let state = &mut *engine;
                if state.pool.commit(&mut state.catalog)? {
                    state.checkpoint()?;
                }
                let to_commit = state.catalog.clone();
                state.pending_commit_change_count = state.change_count;
                state.files_to_commit = to_commit.files(false);
                state.deleter.inc_ref_files(&state.files_to_commit);
                to_commit
            };
            self.start_commit(to_commit)
        })();
        self.check_tragic(result, "prepareCommit")?;

        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }
        Ok(())
    }

    /// Sync the files of `to_commit` and write its commit file, leaving it
    /// pending.
    fn start_commit(&self, mut to_commit: SegmentCatalog) -> Result<()> {
        let files: Vec<String> = {
            let mut engine = self.inner.engine.lock();
            if engine.pending_commit_change_count == engine.last_commit_change_count {
                self.message(|| "skip startCommit(): no changes pending".to_string());
                let files = mem::take(&mut engine.files_to_commit);
                return engine.deleter.dec_ref_files(&files);
            }
            engine.files_to_commit.iter().cloned().collect()
        };
        self.message(|| {
            format!(
                "startCommit(): start; index={to_commit} files={}",
                files.len()
            )
        });

        let storage = self.inner.storage.as_ref();
        let written = storage
            .sync(&files)
            .and_then(|_| to_commit.prepare_commit(storage));

        let mut engine = self.inner.engine.lock();
        match written {
            Ok(()) => {
                self.message(|| "startCommit(): done".to_string());
                engine.pending_commit = Some(to_commit);
                Ok(())
            }
            Err(err) => {
                self.message(|| format!("hit error during prepareCommit: {err}"));
                let files = mem::take(&mut engine.files_to_commit);
                if let Err(release) = engine.deleter.dec_ref_files(&files) {
                    log::warn!("failed to release files of aborted commit: {release}");
                }
                Err(err)
            }
        }
    }

    fn finish_commit_locked(&self) -> Result<()> {
        let pending = self.inner.engine.lock().pending_commit.take();
        let Some(mut pending) = pending else {
            self.message(|| "commit: pendingCommit == null; skip".to_string());
            return Ok(());
        };

        self.message(|| "commit: pendingCommit != null".to_string());
        let finished = pending.finish_commit(self.inner.storage.as_ref());

        let mut engine = self.inner.engine.lock();
        let state = &mut *engine;
        state.catalog.update_generation(&pending);
        let result = match finished {
            Ok(file_name) => {
                self.message(|| format!("commit: wrote segments file \"{file_name}\""));
                state.last_commit_change_count = state.pending_commit_change_count;
                state.rollback_catalog = pending.clone();
                state.deleter.checkpoint(&pending, true)
            }
            Err(err) => Err(err),
        };
        let files = mem::take(&mut state.files_to_commit);
        let released = state.deleter.dec_ref_files(&files);
        drop(engine);

        self.check_tragic(result.and(released), "commit")?;
        self.message(|| "commit: done".to_string());
        Ok(())
    }

    /// Commit, wait for running merges and release the write lock. With
    /// `commit_on_close` off this is [`rollback`](Self::rollback).
    pub fn close(&self) -> Result<()> {
        self.close_with(true)
    }

    /// Like [`close`](Self::close); without `wait_for_merges`, running
    /// merges are aborted instead of waited for.
    pub fn close_with(&self, wait_for_merges: bool) -> Result<()> {
        if !self.inner.config.commit_on_close {
            return self.rollback();
        }

        let commit = self.inner.commit_lock.lock();
        if self.is_closed() {
            return Ok(());
        }
        if self.is_broken() {
            drop(commit);
            self.message(|| "close: writer is broken; rolling back".to_string());
            return self.rollback();
        }

        self.inner.closing.store(true, Ordering::Release);
        let result = self.close_internal(wait_for_merges);
        if result.is_err() {
            self.inner.closing.store(false, Ordering::Release);
        }
        result
    }

    fn close_internal(&self, wait_for_merges: bool) -> Result<()> {
        self.message(|| format!("now flush at close waitForMerges={wait_for_merges}"));
        let flushed = self.flush_all(true)?;

        if wait_for_merges {
            if flushed {
                self.maybe_merge(MergeTrigger::FullFlush, None)?;
            }
            self.inner
                .scheduler
                .merge(self.merge_source(), MergeTrigger::Closing, false)?;
            self.wait_for_running_merges();
        }
        {
            let mut engine = self.inner.engine.lock();
            self.abort_merges(&mut engine);
        }
        self.inner.scheduler.close()?;

        self.message(|| "now call final commit()".to_string());
        self.commit_locked()?;

        {
            let mut engine = self.inner.engine.lock();
            let state = &mut *engine;
            if state.pool.drop_all(&mut state.catalog, true)? {
                state.checkpoint()?;
            }
            state.deleter.close();
        }

        self.release_write_lock();
        self.inner.closed.store(true, Ordering::Release);
        self.inner.closing.store(false, Ordering::Release);
        self.inner.merge_condvar.notify_all();
        self.message(|| "at close: done".to_string());
        Ok(())
    }

    /// Discard everything since the last commit, including a prepared
    /// commit, and close the writer without committing.
    pub fn rollback(&self) -> Result<()> {
        let _commit = self.inner.commit_lock.lock();
        if self.is_closed() {
            return Ok(());
        }
        self.inner.closing.store(true, Ordering::Release);
        self.message(|| "rollback".to_string());

        match self.rollback_internal() {
            Ok(()) => {
                self.release_write_lock();
                self.inner.closed.store(true, Ordering::Release);
                self.inner.closing.store(false, Ordering::Release);
                self.inner.merge_condvar.notify_all();
                self.message(|| "rollback: done".to_string());
                Ok(())
            }
            Err(err) => {
                self.inner.closing.store(false, Ordering::Release);
                self.inner.merge_condvar.notify_all();
                Err(err)
            }
        }
    }

    fn rollback_internal(&self) -> Result<()> {
        {
            let mut engine = self.inner.engine.lock();
            self.abort_merges(&mut engine);
        }
        self.message(|| "rollback: done finish merges".to_string());
        self.inner.scheduler.close()?;

        self.inner.documents.lock().clear();

        let mut engine = self.inner.engine.lock();
        self.inner.stream.lock().clear();
        let state = &mut *engine;
        state.pool.drop_all(&mut state.catalog, false)?;

        if let Some(mut pending) = state.pending_commit.take() {
            self.message(|| "rollback: discard prepared commit".to_string());
            pending.rollback_commit(self.inner.storage.as_ref());
            state.catalog.update_generation(&pending);
            let files = mem::take(&mut state.files_to_commit);
            state.deleter.dec_ref_files(&files)?;
        }

        // Keep the generation counters: a file name once written is never
        // written again.
        state.catalog.rollback_segments(&state.rollback_catalog);
        self.message(|| format!("rollback: infos={}", state.catalog));

        state.deleter.checkpoint(&state.catalog, false)?;
        state.deleter.refresh(None)?;
        state.last_commit_change_count = state.change_count;
        state.deleter.close();
        Ok(())
    }

    /// Delete every document and segment. Nothing is removed from storage
    /// until the next commit; a rollback restores the last commit.
    pub fn delete_all(&self) -> Result<()> {
        self.ensure_open(true)?;
        let _full_flush = self.inner.full_flush_lock.lock();
        let result = (|| -> Result<()> {
            {
                let mut buffer = self.inner.documents.lock();
                buffer.clear();
                buffer.field_kinds.clear();
            }

            let mut engine = self.inner.engine.lock();
            self.abort_merges(&mut engine);
            let result = (|| -> Result<()> {
                let state = &mut *engine;
                state.catalog.clear();
                state.pool.drop_all(&mut state.catalog, false)?;
                self.inner.stream.lock().clear();
                state.checkpoint()
            })();
            engine.coordinator.set_stop_merges(false);
            self.message(|| "deleteAll: done".to_string());
            result
        })();
        self.check_tragic(result, "deleteAll")
    }
}
