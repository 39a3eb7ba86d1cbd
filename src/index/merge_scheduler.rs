//! Merge schedulers.
//!
//! The writer registers merges and then hands control to a
//! [`MergeScheduler`], which pulls them back through [`MergeSource`] and
//! runs them on whatever thread it likes. Schedulers are never called while
//! the writer's engine or full-flush locks are held.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GalleyError, Result};
use crate::index::info_stream::{InfoStream, MS};
use crate::index::merge::{MergeTrigger, OneMerge};

/// The side of the writer a scheduler talks to.
pub trait MergeSource: Send + Sync {
    /// Take the next pending merge and mark it running.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    fn has_pending_merges(&self) -> bool;

    /// Run one merge to completion on the calling thread.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;

    fn info_stream(&self) -> Arc<dyn InfoStream>;
}

pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run or schedule the pending merges of `source`.
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()>;

    /// Whether pending merges are ever run. Waiting for merges only waits
    /// on pending ones when this is true.
    fn executes_merges(&self) -> bool {
        true
    }

    /// Stop accepting work and wait for running merges to return.
    fn close(&self) -> Result<()>;
}

/// Scheduler settings as stored in a writer config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MergeSchedulerConfig {
    /// Run merges on the thread that triggered them.
    Serial,
    /// Run merges on background worker threads.
    Concurrent {
        /// Worker threads; `None` picks a default from the CPU count.
        max_thread_count: Option<usize>,
        /// Merge wake-ups that may queue up before new ones are dropped.
        max_merge_count: Option<usize>,
    },
    /// Never run merges; the caller drives them explicitly.
    NoMerge,
}

impl Default for MergeSchedulerConfig {
    fn default() -> Self {
        MergeSchedulerConfig::Concurrent {
            max_thread_count: None,
            max_merge_count: None,
        }
    }
}

impl MergeSchedulerConfig {
    pub fn build(&self) -> Arc<dyn MergeScheduler> {
        match self {
            MergeSchedulerConfig::Serial => Arc::new(SerialMergeScheduler::new()),
            MergeSchedulerConfig::Concurrent {
                max_thread_count,
                max_merge_count,
            } => {
                let threads = max_thread_count.unwrap_or_else(default_max_thread_count);
                let queued = max_merge_count.unwrap_or(threads + 5);
                Arc::new(ConcurrentMergeScheduler::new(threads, queued))
            }
            MergeSchedulerConfig::NoMerge => Arc::new(NoMergeScheduler),
        }
    }
}

/// Half the CPUs, between 1 and 4.
pub fn default_max_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, 4)
}

/// Runs every pending merge on the calling thread, one caller at a time.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    running: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        _trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        let _running = self.running.lock();
        while let Some(merge) = source.next_merge() {
            source.merge(&merge)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs merges on a fixed set of worker threads.
///
/// Each call to [`merge`](MergeScheduler::merge) queues a wake-up; an idle
/// worker takes it and drains the source's pending merges. When the queue
/// is full the wake-up is dropped, since a queued one will drain the same
/// merges.
pub struct ConcurrentMergeScheduler {
    max_thread_count: usize,
    sender: Mutex<Option<Sender<Arc<dyn MergeSource>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMergeScheduler")
            .field("max_thread_count", &self.max_thread_count)
            .field("closed", &self.sender.lock().is_none())
            .finish()
    }
}

impl ConcurrentMergeScheduler {
    pub fn new(max_thread_count: usize, max_merge_count: usize) -> Self {
        let max_thread_count = max_thread_count.max(1);
        let (sender, receiver) = bounded(max_merge_count.max(1));

        let mut workers = Vec::with_capacity(max_thread_count);
        for worker_id in 0..max_thread_count {
            let receiver: Receiver<Arc<dyn MergeSource>> = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("galley-merge-{worker_id}"))
                .spawn(move || Self::run_worker(worker_id, receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("failed to spawn merge thread {worker_id}: {e}"),
            }
        }

        ConcurrentMergeScheduler {
            max_thread_count,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    pub fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }

    fn run_worker(worker_id: usize, receiver: Receiver<Arc<dyn MergeSource>>) {
        while let Ok(source) = receiver.recv() {
            let info_stream = source.info_stream();
            while let Some(merge) = source.next_merge() {
                if info_stream.is_enabled(MS) {
                    info_stream.message(MS, &format!("merge thread {worker_id}: start {merge}"));
                }
                if let Err(e) = source.merge(&merge) {
                    log::error!("merge thread {worker_id}: merge {merge} failed: {e}");
                }
            }
        }
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(
        &self,
        source: Arc<dyn MergeSource>,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()> {
        if !source.has_pending_merges() {
            return Ok(());
        }
        let info_stream = source.info_stream();
        if info_stream.is_enabled(MS) {
            info_stream.message(
                MS,
                &format!("merge trigger={trigger:?} newMergesFound={new_merges_found}"),
            );
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Ok(());
        };
        match sender.try_send(source) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(GalleyError::illegal_state(
                "merge threads have exited",
            )),
        }
    }

    fn close(&self) -> Result<()> {
        // Dropping the sender ends every worker once the queue is drained.
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // The last writer handle may be dropped on a merge thread.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::warn!("merge thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ConcurrentMergeScheduler {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Leaves merges pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergeScheduler;

impl MergeScheduler for NoMergeScheduler {
    fn merge(
        &self,
        _source: Arc<dyn MergeSource>,
        _trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn executes_merges(&self) -> bool {
        false
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
