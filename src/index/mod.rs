//! Index module for Galley.
//!
//! The write engine: segments and their commits, buffered edits, pooled
//! per-segment state, merging, and the [`IndexWriter`] tying them together.

pub mod buffered_updates;
pub mod catalog;
pub mod codec;
pub mod commit_finder;
pub mod field_updates;
pub mod file_deleter;
pub mod file_names;
pub mod info_stream;
pub mod merge;
pub mod merge_coordinator;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod reader_pool;
pub mod segment_reader;
pub mod segment_record;
pub mod segment_view;
pub mod snapshot;
pub mod updates_stream;
pub mod writer;

// Re-export commonly used types
pub use catalog::SegmentCatalog;
pub use codec::{Codec, CodecRegistry, PlainCodec};
pub use info_stream::{InfoStream, LogInfoStream, NoInfoStream};
pub use merge::{MergeTrigger, OneMerge};
pub use merge_policy::{MergePolicy, NoMergePolicy, TieredMergePolicy};
pub use merge_scheduler::{
    ConcurrentMergeScheduler, MergeScheduler, MergeSchedulerConfig, NoMergeScheduler,
    SerialMergeScheduler,
};
pub use segment_record::{SegmentInfo, SegmentRecord};
pub use snapshot::IndexSnapshot;
pub use writer::{IndexWriter, MergePolicyConfig, OpenMode, WriterConfig, WriterOptions};
