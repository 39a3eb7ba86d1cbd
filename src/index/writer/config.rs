//! Writer configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GalleyError, Result};
use crate::index::codec::{CodecRegistry, PLAIN_CODEC_NAME};
use crate::index::info_stream::InfoStream;
use crate::index::merge_policy::{MergePolicy, NoMergePolicy, TieredMergePolicy};
use crate::index::merge_scheduler::{MergeScheduler, MergeSchedulerConfig};

/// What to do with an existing index when a writer opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start an empty index. Existing commits stay readable until the first
    /// commit of the new writer replaces them.
    Create,
    /// Open the latest commit; fail with `NotFound` if there is none.
    Append,
    /// Append when a commit exists, create otherwise.
    #[default]
    CreateOrAppend,
}

/// Merge policy settings as stored in a writer config.
///
/// ```
/// use galley::index::writer::MergePolicyConfig;
///
/// let config: MergePolicyConfig =
///     serde_json::from_str(r#"{"type":"Tiered","segments_per_tier":4.0}"#).unwrap();
/// assert!(matches!(config, MergePolicyConfig::Tiered(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MergePolicyConfig {
    /// Tiered merging
    Tiered(TieredMergePolicy),
    /// Never merge
    NoMerge,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig::Tiered(TieredMergePolicy::default())
    }
}

impl MergePolicyConfig {
    pub fn build(&self) -> Result<Arc<dyn MergePolicy>> {
        match self {
            MergePolicyConfig::Tiered(policy) => {
                policy.validate()?;
                Ok(Arc::new(policy.clone()))
            }
            MergePolicyConfig::NoMerge => Ok(Arc::new(NoMergePolicy)),
        }
    }
}

/// Configuration of an [`IndexWriter`](crate::index::writer::IndexWriter).
///
/// Everything here can be stored as JSON. Collaborators that cannot be
/// serialized go through [`WriterOptions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// How to treat an existing index.
    pub open_mode: OpenMode,

    /// Buffered documents and edits may use this much RAM before a flush.
    ///
    /// Zero or negative disables the RAM trigger.
    pub ram_buffer_size_mb: f64,

    /// Flush after this many buffered documents.
    pub max_buffered_docs: Option<usize>,

    /// Flush after this many distinct buffered delete terms.
    pub max_buffered_delete_terms: Option<usize>,

    /// Keep segments whose documents are all deleted instead of dropping
    /// them.
    pub keep_fully_deleted_segments: bool,

    /// Keep segment views after use instead of writing and dropping them.
    /// Opening a snapshot turns pooling on regardless.
    pub reader_pooling: bool,

    /// Commit on `close()`. When false, closing rolls back.
    pub commit_on_close: bool,

    /// Codec used for new segments.
    pub codec: String,

    pub merge_policy: MergePolicyConfig,

    pub merge_scheduler: MergeSchedulerConfig,

    /// How long to wait for the write lock. Zero fails at once.
    pub write_lock_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: 16.0,
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            keep_fully_deleted_segments: false,
            reader_pooling: false,
            commit_on_close: true,
            codec: PLAIN_CODEC_NAME.to_string(),
            merge_policy: MergePolicyConfig::default(),
            merge_scheduler: MergeSchedulerConfig::default(),
            write_lock_timeout_ms: 0,
        }
    }
}

impl WriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: WriterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ram_buffer_size_mb.is_nan() {
            return Err(GalleyError::invalid_argument(
                "ram_buffer_size_mb must be a number",
            ));
        }
        if self.max_buffered_docs == Some(0) {
            return Err(GalleyError::invalid_argument(
                "max_buffered_docs must be at least 1",
            ));
        }
        if self.max_buffered_delete_terms == Some(0) {
            return Err(GalleyError::invalid_argument(
                "max_buffered_delete_terms must be at least 1",
            ));
        }
        if self.codec.is_empty() {
            return Err(GalleyError::invalid_argument("codec must not be empty"));
        }
        if let MergePolicyConfig::Tiered(policy) = &self.merge_policy {
            policy.validate()?;
        }
        Ok(())
    }

    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: f64) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, max: usize) -> Self {
        self.max_buffered_docs = Some(max);
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, max: usize) -> Self {
        self.max_buffered_delete_terms = Some(max);
        self
    }

    pub fn with_keep_fully_deleted_segments(mut self, keep: bool) -> Self {
        self.keep_fully_deleted_segments = keep;
        self
    }

    pub fn with_reader_pooling(mut self, pooling: bool) -> Self {
        self.reader_pooling = pooling;
        self
    }

    pub fn with_commit_on_close(mut self, commit: bool) -> Self {
        self.commit_on_close = commit;
        self
    }

    pub fn with_codec<S: Into<String>>(mut self, codec: S) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicyConfig) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: MergeSchedulerConfig) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_write_lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.write_lock_timeout_ms = timeout;
        self
    }

    /// Bytes of RAM that trigger a flush, if the RAM trigger is on.
    pub(crate) fn ram_buffer_bytes(&self) -> Option<usize> {
        (self.ram_buffer_size_mb > 0.0)
            .then(|| (self.ram_buffer_size_mb * 1024.0 * 1024.0) as usize)
    }
}

/// Runtime collaborators of a writer. Anything left `None` is built from
/// the [`WriterConfig`].
#[derive(Debug, Default)]
pub struct WriterOptions {
    /// Defaults to [`LogInfoStream`](crate::index::info_stream::LogInfoStream).
    pub info_stream: Option<Arc<dyn InfoStream>>,
    pub merge_policy: Option<Arc<dyn MergePolicy>>,
    pub merge_scheduler: Option<Arc<dyn MergeScheduler>>,
    /// Codecs that may be named by `WriterConfig::codec` or found in
    /// existing commits.
    pub codecs: Option<CodecRegistry>,
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_stream(mut self, info_stream: Arc<dyn InfoStream>) -> Self {
        self.info_stream = Some(info_stream);
        self
    }

    pub fn merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    pub fn merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = Some(scheduler);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Some(codecs);
        self
    }
}
