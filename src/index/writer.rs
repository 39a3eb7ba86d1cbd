//! The index writer.
//!
//! [`IndexWriter`] is a cheap handle around shared state; clones talk to the
//! same writer and may be used from any number of threads. Documents and
//! edits are buffered in memory, flushed into new segments, merged in the
//! background and made durable by a two-phase commit.
//!
//! The state is split over a few [`RankedMutex`]es that are always taken
//! in rank order:
//!
//! | lock | guards |
//! |------|--------|
//! | commit | prepare/commit/close/rollback sequences |
//! | full flush | flushing everything vs. snapshots and `delete_all` |
//! | documents | buffered documents and edits |
//! | engine | catalog, reader pool, file deleter, merge bookkeeping |
//! | updates stream | frozen edit packets |
//!
//! The merge scheduler is only ever called with none of the engine or full
//! flush locks held, and no lock is held across a storage sync except the
//! commit lock.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use galley::document::{Document, Term};
//! use galley::index::writer::{IndexWriter, WriterConfig};
//! use galley::storage::memory::MemoryStorage;
//!
//! let storage = Arc::new(MemoryStorage::new_default());
//! let writer = IndexWriter::open(storage, WriterConfig::default()).unwrap();
//! writer
//!     .add_document(Document::builder().add_keyword("id", "1").build())
//!     .unwrap();
//! writer.delete_terms(vec![Term::new("id", "1")]).unwrap();
//! writer.commit().unwrap();
//! assert_eq!(writer.num_docs(), 0);
//! writer.close().unwrap();
//! ```

mod commit;
mod config;
mod documents;
mod flush;
mod merging;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

pub use config::{MergePolicyConfig, OpenMode, WriterConfig, WriterOptions};

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::codec::{Codec, CodecRegistry};
use crate::index::file_deleter::FileDeleter;
use crate::index::file_names::WRITE_LOCK_NAME;
use crate::index::info_stream::{IW, InfoStream, LogInfoStream};
use crate::index::merge_coordinator::MergeCoordinator;
use crate::index::merge_policy::MergePolicy;
use crate::index::merge_scheduler::MergeScheduler;
use crate::index::reader_pool::ReaderPool;
use crate::index::updates_stream::BufferedUpdatesStream;
use crate::storage::{Storage, StorageLock};
use crate::util::lock_order::{LockRank, RankedMutex};

use self::documents::DocumentsBuffer;

/// Poll interval while waiting for the write lock.
const WRITE_LOCK_POLL: Duration = Duration::from_millis(50);

/// Everything guarded by the engine lock.
struct EngineState {
    /// The live segment list.
    catalog: SegmentCatalog,
    pool: ReaderPool,
    deleter: FileDeleter,
    /// Segment list of the last commit, restored by rollback.
    rollback_catalog: SegmentCatalog,
    /// Catalog written by `prepare_commit`, waiting for its second phase.
    pending_commit: Option<SegmentCatalog>,
    /// Files referenced on behalf of the pending commit.
    files_to_commit: BTreeSet<String>,
    change_count: u64,
    last_commit_change_count: u64,
    pending_commit_change_count: u64,
    coordinator: MergeCoordinator,
    /// Segments a running `force_merge` must reduce; true for segments that
    /// existed when it started.
    segments_to_merge: AHashMap<String, bool>,
}

impl EngineState {
    /// Record a change that the next commit must write.
    fn changed(&mut self) {
        self.change_count += 1;
        self.catalog.changed();
    }

    /// Record a change and let the deleter see the new file set.
    fn checkpoint(&mut self) -> Result<()> {
        debug_assert!(
            self.pool.check_invariants(&self.catalog),
            "pooled view without a live segment"
        );
        self.changed();
        self.deleter.checkpoint(&self.catalog, false)
    }
}

struct WriterInner {
    storage: Arc<dyn Storage>,
    /// Codec for new segments.
    codec: Arc<dyn Codec>,
    codecs: CodecRegistry,
    info_stream: Arc<dyn InfoStream>,
    policy: Arc<dyn MergePolicy>,
    scheduler: Arc<dyn MergeScheduler>,
    config: WriterConfig,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    closed: AtomicBool,
    closing: AtomicBool,
    /// Message of the fatal error that broke the writer.
    tragic: Mutex<Option<String>>,
    commit_lock: RankedMutex<()>,
    full_flush_lock: RankedMutex<()>,
    documents: RankedMutex<DocumentsBuffer>,
    engine: RankedMutex<EngineState>,
    stream: RankedMutex<BufferedUpdatesStream>,
    /// Signalled whenever a merge finishes.
    merge_condvar: Condvar,
}

/// Handle to an open index writer.
#[derive(Clone)]
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriter")
            .field("storage", &self.inner.storage)
            .field("codec", &self.inner.codec.name())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("closing", &self.inner.closing.load(Ordering::Acquire))
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer with collaborators built from `config`.
    pub fn open(storage: Arc<dyn Storage>, config: WriterConfig) -> Result<Self> {
        Self::open_with(storage, config, WriterOptions::default())
    }

    pub fn open_with(
        storage: Arc<dyn Storage>,
        config: WriterConfig,
        options: WriterOptions,
    ) -> Result<Self> {
        config.validate()?;
        let info_stream: Arc<dyn InfoStream> =
            options.info_stream.unwrap_or_else(|| Arc::new(LogInfoStream));
        let codecs = options.codecs.unwrap_or_default();
        if !codecs.contains(&config.codec) {
            return Err(GalleyError::invalid_argument(format!(
                "codec \"{}\" is not registered",
                config.codec
            )));
        }
        let codec = codecs.get(&config.codec)?;
        let policy = match options.merge_policy {
            Some(policy) => policy,
            None => config.merge_policy.build()?,
        };

        let write_lock = acquire_write_lock(storage.as_ref(), config.write_lock_timeout_ms)?;

        let existing = match SegmentCatalog::read(storage.as_ref(), &codecs, info_stream.as_ref())
        {
            Ok(catalog) => Some(catalog),
            Err(GalleyError::NotFound(_)) if config.open_mode != OpenMode::Append => None,
            Err(err) if config.open_mode == OpenMode::Create => {
                log::warn!("ignoring unreadable index while creating a new one: {err}");
                None
            }
            Err(err) => return Err(err),
        };

        let create = match config.open_mode {
            OpenMode::Create => true,
            OpenMode::Append => false,
            OpenMode::CreateOrAppend => existing.is_none(),
        };

        let (catalog, last_commit, change_count) = match existing {
            Some(committed) if create => {
                // The old commit stays referenced until the first commit of
                // this writer replaces it.
                let mut catalog = committed.clone();
                catalog.clear();
                catalog.set_user_data(BTreeMap::new());
                catalog.changed();
                (catalog, Some(committed), 1)
            }
            Some(committed) => (committed.clone(), Some(committed), 0),
            None => (SegmentCatalog::new(), None, 1),
        };

        if info_stream.is_enabled(IW) {
            info_stream.message(
                IW,
                &format!(
                    "init: create={create} segments={} codec={} config={:?}",
                    catalog.len(),
                    codec.name(),
                    config
                ),
            );
        }

        let deleter = FileDeleter::new(
            Arc::clone(&storage),
            Arc::clone(&info_stream),
            last_commit.as_ref(),
            &catalog,
        )?;

        let mut pool = ReaderPool::new(Arc::clone(&storage), codecs.clone());
        if config.reader_pooling {
            pool.enable_pooling();
        }

        let mut documents = DocumentsBuffer::new();
        for record in catalog.iter() {
            documents.field_kinds.add_all(&record.info().fields)?;
        }

        let scheduler = match options.merge_scheduler {
            Some(scheduler) => scheduler,
            None => config.merge_scheduler.build(),
        };

        let engine = EngineState {
            rollback_catalog: catalog.clone(),
            catalog,
            pool,
            deleter,
            pending_commit: None,
            files_to_commit: BTreeSet::new(),
            change_count,
            last_commit_change_count: 0,
            pending_commit_change_count: 0,
            coordinator: MergeCoordinator::new(),
            segments_to_merge: AHashMap::new(),
        };

        Ok(IndexWriter {
            inner: Arc::new(WriterInner {
                stream: RankedMutex::new(
                    LockRank::UpdatesStream,
                    BufferedUpdatesStream::new(Arc::clone(&info_stream)),
                ),
                storage,
                codec,
                codecs,
                info_stream,
                policy,
                scheduler,
                config,
                write_lock: Mutex::new(Some(write_lock)),
                closed: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                tragic: Mutex::new(None),
                commit_lock: RankedMutex::new(LockRank::Commit, ()),
                full_flush_lock: RankedMutex::new(LockRank::FullFlush, ()),
                documents: RankedMutex::new(LockRank::Documents, documents),
                engine: RankedMutex::new(LockRank::Engine, engine),
                merge_condvar: Condvar::new(),
            }),
        })
    }

    /// Whether some process holds the write lock of `storage`.
    pub fn is_locked(storage: &dyn Storage) -> bool {
        storage.lock_manager().lock_exists(WRITE_LOCK_NAME)
    }

    /// Forcibly remove the write lock of `storage`.
    ///
    /// Only safe when no writer is running against the index, for example
    /// after a crash left the lock behind.
    pub fn unlock(storage: &dyn Storage) -> Result<()> {
        storage.lock_manager().force_release(WRITE_LOCK_NAME)
    }

    pub fn config(&self) -> &WriterConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Live documents, buffered ones included.
    pub fn num_docs(&self) -> u32 {
        let buffered = self.inner.documents.lock().num_docs();
        let engine = self.inner.engine.lock();
        let flushed: u32 = engine
            .catalog
            .iter()
            .map(|record| {
                record
                    .num_docs()
                    .saturating_sub(engine.pool.pending_delete_count(record.name()))
            })
            .sum();
        buffered + flushed
    }

    /// Document slots, deleted and buffered ones included.
    pub fn max_doc(&self) -> u32 {
        let buffered = self.inner.documents.lock().num_docs();
        let engine = self.inner.engine.lock();
        buffered + engine.catalog.total_doc_count() as u32
    }

    pub fn segment_count(&self) -> usize {
        self.inner.engine.lock().catalog.len()
    }

    /// Names of the live segments, in catalog order.
    pub fn segment_names(&self) -> Vec<String> {
        self.inner
            .engine
            .lock()
            .catalog
            .iter()
            .map(|record| record.name().to_string())
            .collect()
    }

    pub fn has_pending_merges(&self) -> bool {
        self.inner.engine.lock().coordinator.has_pending()
    }

    /// Whether anything changed since the last commit, buffered edits
    /// included.
    pub fn has_uncommitted_changes(&self) -> bool {
        let buffered = self.inner.documents.lock().any_changes();
        let engine = self.inner.engine.lock();
        let streamed = self.inner.stream.lock().any();
        buffered || streamed || engine.change_count != engine.last_commit_change_count
    }

    /// User data the next commit will record.
    pub fn commit_data(&self) -> BTreeMap<String, String> {
        self.inner.engine.lock().catalog.user_data().clone()
    }

    /// Set the user data of the next commit.
    pub fn set_commit_data(&self, data: BTreeMap<String, String>) -> Result<()> {
        self.ensure_open(true)?;
        let mut engine = self.inner.engine.lock();
        engine.catalog.set_user_data(data);
        engine.changed();
        Ok(())
    }

    /// Fail if the writer is closed, or broken by a fatal error. With
    /// `fail_if_closing`, a close in progress counts as closed.
    fn ensure_open(&self, fail_if_closing: bool) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire)
            || (fail_if_closing && self.inner.closing.load(Ordering::Acquire))
        {
            return Err(GalleyError::closed("this IndexWriter is closed"));
        }
        if let Some(reason) = self.inner.tragic.lock().as_ref() {
            return Err(GalleyError::illegal_state(format!(
                "this writer hit an unrecoverable error; call rollback: {reason}"
            )));
        }
        Ok(())
    }

    /// Mark the writer broken if `result` failed with a fatal error.
    fn check_tragic<T>(&self, result: Result<T>, location: &str) -> Result<T> {
        if let Err(err) = &result
            && err.is_fatal()
        {
            let mut tragic = self.inner.tragic.lock();
            if tragic.is_none() {
                log::error!("hit unrecoverable error in {location}: {err}");
                *tragic = Some(err.to_string());
            }
        }
        result
    }

    fn is_broken(&self) -> bool {
        self.inner.tragic.lock().is_some()
    }

    fn message(&self, message: impl FnOnce() -> String) {
        if self.inner.info_stream.is_enabled(IW) {
            self.inner.info_stream.message(IW, &message());
        }
    }

    fn release_write_lock(&self) {
        if let Some(mut lock) = self.inner.write_lock.lock().take()
            && let Err(err) = lock.release()
        {
            log::warn!("failed to release {WRITE_LOCK_NAME}: {err}");
        }
    }
}

fn acquire_write_lock(storage: &dyn Storage, timeout_ms: u64) -> Result<Box<dyn StorageLock>> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match storage.lock_manager().acquire_lock(WRITE_LOCK_NAME) {
            Ok(lock) => return Ok(lock),
            Err(GalleyError::LockUnavailable(msg)) => {
                if Instant::now() >= deadline {
                    return Err(GalleyError::lock_unavailable(format!(
                        "lock obtain timed out: {msg}"
                    )));
                }
                thread::sleep(WRITE_LOCK_POLL);
            }
            Err(err) => return Err(err),
        }
    }
}

