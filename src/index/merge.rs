//! Merge descriptions shared by the policy, the scheduler and the writer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{GalleyError, Result};
use crate::index::codec::DocMap;
use crate::index::segment_reader::SegmentSnapshot;
use crate::index::segment_record::SegmentRecord;

static NEXT_MERGE_ID: AtomicU64 = AtomicU64::new(1);

/// What caused the merge policy to be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeTrigger {
    /// A segment was flushed because a RAM or document limit was hit.
    SegmentFlush,
    /// An explicit flush, commit or snapshot flushed all buffered documents.
    FullFlush,
    /// `force_merge` or `force_merge_deletes`.
    Explicit,
    /// A merge just finished.
    MergeFinished,
    /// The writer is closing.
    Closing,
}

/// Lifecycle of a [`OneMerge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Registered,
    Running,
    Committed,
    Aborted,
}

/// Mutable progress of a merge, guarded by the merge's own mutex. The lock
/// is a leaf: nothing else may be acquired while it is held.
#[derive(Debug)]
pub struct MergeProgress {
    pub state: MergeState,
    /// Source records as of `merge_init`, after buffered deletes were applied.
    pub sources: Vec<SegmentRecord>,
    /// Readers and live docs captured when the merge started reading.
    pub snapshots: Vec<SegmentSnapshot>,
    /// Source-to-merged doc id maps, one per snapshot.
    pub doc_maps: Vec<DocMap>,
    pub target: Option<SegmentRecord>,
    pub error: Option<GalleyError>,
    pub estimated_bytes: u64,
    pub max_num_segments: Option<usize>,
    /// Whether registration marked the sources as merging.
    pub register_done: bool,
}

/// One merge: a set of source segments and the segment replacing them.
#[derive(Debug)]
pub struct OneMerge {
    id: u64,
    segments: Vec<SegmentRecord>,
    total_doc_count: u32,
    aborted: AtomicBool,
    progress: Mutex<MergeProgress>,
}

impl OneMerge {
    pub fn new(segments: Vec<SegmentRecord>) -> Self {
        let total_doc_count = segments.iter().map(SegmentRecord::doc_count).sum();
        OneMerge {
            id: NEXT_MERGE_ID.fetch_add(1, Ordering::Relaxed),
            segments,
            total_doc_count,
            aborted: AtomicBool::new(false),
            progress: Mutex::new(MergeProgress {
                state: MergeState::Registered,
                sources: Vec::new(),
                snapshots: Vec::new(),
                doc_maps: Vec::new(),
                target: None,
                error: None,
                estimated_bytes: 0,
                max_num_segments: None,
                register_done: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The segments chosen by the merge policy.
    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name().to_string()).collect()
    }

    /// Document slots across the sources, deleted ones included.
    pub fn total_doc_count(&self) -> u32 {
        self.total_doc_count
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fail with `MergeAborted` once the merge was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(GalleyError::merge_aborted(format!("merge is aborted: {self}")));
        }
        Ok(())
    }

    pub fn progress(&self) -> MutexGuard<'_, MergeProgress> {
        self.progress.lock()
    }

    pub fn state(&self) -> MergeState {
        self.progress.lock().state
    }

    pub fn max_num_segments(&self) -> Option<usize> {
        self.progress.lock().max_num_segments
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.progress.lock().estimated_bytes
    }

    pub fn target_name(&self) -> Option<String> {
        self.progress
            .lock()
            .target
            .as_ref()
            .map(|t| t.name().to_string())
    }

    /// The merge's failure, if it failed.
    pub fn error(&self) -> Option<GalleyError> {
        self.progress.lock().error.as_ref().map(GalleyError::duplicate)
    }
}

impl fmt::Display for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.segments.iter().map(|s| s.name()).collect();
        write!(f, "{}", names.join(" "))?;
        // try_lock: Display may run while the progress lock is held
        if let Some(progress) = self.progress.try_lock() {
            if let Some(target) = &progress.target {
                write!(f, " into {}", target.name())?;
            }
            if let Some(max) = progress.max_num_segments {
                write!(f, " [maxNumSegments={max}]")?;
            }
        }
        if self.is_aborted() {
            write!(f, " [ABORTED]")?;
        }
        Ok(())
    }
}

/// Merges proposed by one policy call.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

impl fmt::Display for MergeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergeSpec:")?;
        for (i, merge) in self.merges.iter().enumerate() {
            write!(f, "\n  {}: {merge}", i + 1)?;
        }
        Ok(())
    }
}
