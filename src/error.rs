//! Error types for the Galley library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`GalleyError`] enum. The variants follow the write engine's failure
//! taxonomy: corruption is surfaced and never retried, transient I/O is
//! retried only by commit discovery, aborted merges are non-fatal, and
//! resource exhaustion breaks the writer until it is rolled back.
//!
//! # Examples
//!
//! ```
//! use galley::error::{GalleyError, Result};
//!
//! fn open_commit(generation: i64) -> Result<()> {
//!     Err(GalleyError::not_found(format!("no commit at generation {generation}")))
//! }
//!
//! match open_commit(3) {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Galley operations.
#[derive(Error, Debug)]
pub enum GalleyError {
    /// I/O errors (file operations, sync, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Checksum mismatch, malformed counts or a truncated structured file.
    #[error("Corrupt index: {0}")]
    CorruptState(String),

    /// No commit exists at the index location.
    #[error("Index not found: {0}")]
    NotFound(String),

    /// A named file is absent.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The write lock is held by someone else.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// The writer is closed or closing.
    #[error("Already closed: {0}")]
    Closed(String),

    /// The call is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The reader pool has no view for the segment.
    #[error("Segment not pooled: {0}")]
    NotPooled(String),

    /// A merge observed its abort flag.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with GalleyError.
pub type Result<T> = std::result::Result<T, GalleyError>;

impl GalleyError {
    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        GalleyError::CorruptState(msg.into())
    }

    /// Create a new index-not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        GalleyError::NotFound(msg.into())
    }

    /// Create a new file-not-found error.
    pub fn file_not_found<S: Into<String>>(name: S) -> Self {
        GalleyError::FileNotFound(name.into())
    }

    /// Create a new lock error.
    pub fn lock_unavailable<S: Into<String>>(msg: S) -> Self {
        GalleyError::LockUnavailable(msg.into())
    }

    /// Create a new closed error.
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        GalleyError::Closed(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        GalleyError::IllegalState(msg.into())
    }

    /// Create a new not-pooled error.
    pub fn not_pooled<S: Into<String>>(segment: S) -> Self {
        GalleyError::NotPooled(segment.into())
    }

    /// Create a new merge aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        GalleyError::MergeAborted(msg.into())
    }

    /// Create a new resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        GalleyError::ResourceExhausted(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        GalleyError::InvalidArgument(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        GalleyError::Storage(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        GalleyError::Other(msg.into())
    }

    /// Whether commit discovery may retry after this error.
    ///
    /// Corruption is deliberately excluded: a checksum mismatch never heals
    /// by reading the same bytes again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GalleyError::Io(_) | GalleyError::FileNotFound(_) | GalleyError::Storage(_)
        )
    }

    /// Whether this error belongs to the resource-exhaustion class that
    /// permanently breaks a writer.
    pub fn is_fatal(&self) -> bool {
        match self {
            GalleyError::ResourceExhausted(_) => true,
            GalleyError::Io(e) => e.kind() == io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }

    pub fn is_merge_aborted(&self) -> bool {
        matches!(self, GalleyError::MergeAborted(_))
    }

    /// Produce an owned copy suitable for re-raising to several callers.
    ///
    /// `io::Error` and `serde_json::Error` are not `Clone`; their kind and
    /// message are preserved.
    pub fn duplicate(&self) -> Self {
        match self {
            GalleyError::Io(e) => GalleyError::Io(io::Error::new(e.kind(), e.to_string())),
            GalleyError::Json(e) => GalleyError::Other(format!("JSON error: {e}")),
            GalleyError::CorruptState(m) => GalleyError::CorruptState(m.clone()),
            GalleyError::NotFound(m) => GalleyError::NotFound(m.clone()),
            GalleyError::FileNotFound(m) => GalleyError::FileNotFound(m.clone()),
            GalleyError::LockUnavailable(m) => GalleyError::LockUnavailable(m.clone()),
            GalleyError::Closed(m) => GalleyError::Closed(m.clone()),
            GalleyError::IllegalState(m) => GalleyError::IllegalState(m.clone()),
            GalleyError::NotPooled(m) => GalleyError::NotPooled(m.clone()),
            GalleyError::MergeAborted(m) => GalleyError::MergeAborted(m.clone()),
            GalleyError::ResourceExhausted(m) => GalleyError::ResourceExhausted(m.clone()),
            GalleyError::InvalidArgument(m) => GalleyError::InvalidArgument(m.clone()),
            GalleyError::Storage(m) => GalleyError::Storage(m.clone()),
            GalleyError::Other(m) => GalleyError::Other(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = GalleyError::corrupt("checksum failed");
        assert_eq!(error.to_string(), "Corrupt index: checksum failed");

        let error = GalleyError::not_found("no segments* file");
        assert_eq!(error.to_string(), "Index not found: no segments* file");

        let error = GalleyError::merge_aborted("_3");
        assert_eq!(error.to_string(), "Merge aborted: _3");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let galley_error = GalleyError::from(io_error);

        match galley_error {
            GalleyError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_classification() {
        assert!(GalleyError::file_not_found("segments_2").is_transient());
        assert!(GalleyError::from(io::Error::other("flaky")).is_transient());
        assert!(!GalleyError::corrupt("bad footer").is_transient());
        assert!(!GalleyError::lock_unavailable("write.lock").is_transient());

        assert!(GalleyError::resource_exhausted("heap").is_fatal());
        assert!(GalleyError::from(io::Error::from(io::ErrorKind::OutOfMemory)).is_fatal());
        assert!(!GalleyError::from(io::Error::other("disk")).is_fatal());

        assert!(GalleyError::merge_aborted("_0").is_merge_aborted());
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let original = GalleyError::from(io::Error::from(io::ErrorKind::OutOfMemory));
        let copy = original.duplicate();
        assert!(copy.is_fatal());

        let copy = GalleyError::illegal_state("broken").duplicate();
        assert!(matches!(copy, GalleyError::IllegalState(m) if m == "broken"));
    }
}
