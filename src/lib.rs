//! # Galley
//!
//! The write side of a segmented inverted index, in Rust.
//!
//! ## Features
//!
//! - Buffered adds, deletes and doc-value updates, flushed into immutable segments
//! - Two-phase commits that survive a crash at any point
//! - Near-real-time snapshots of uncommitted state
//! - Tiered merging on background threads
//! - Pluggable storage backends and segment codecs

pub mod document;
pub mod error;
pub mod index;
pub mod query;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::document::{Document, FieldValue, Term};
    pub use crate::error::{GalleyError, Result};
    pub use crate::index::{IndexSnapshot, IndexWriter, OpenMode, WriterConfig, WriterOptions};
    pub use crate::query::{BooleanQuery, MatchAllDocsQuery, NumericRangeQuery, Query, TermQuery};
    pub use crate::storage::Storage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
