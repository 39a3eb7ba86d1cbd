//! Reference counting of index files.
//!
//! Every file referenced by the last commit or by the writer's current
//! catalog holds a reference; a file is deleted as soon as its count drops
//! to zero. Only the most recent commit is kept: when a new commit is
//! checkpointed, the files of the previous one are released.
//!
//! Deletes that fail are remembered and retried on the next checkpoint.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::file_names::{SEGMENTS_GEN, WRITE_LOCK_NAME, is_index_file};
use crate::index::info_stream::{IFD, InfoStream};
use crate::storage::Storage;

/// Files of one commit, released together when the commit is superseded.
#[derive(Debug, Clone)]
struct CommitPoint {
    segments_file_name: Option<String>,
    files: BTreeSet<String>,
}

#[derive(Debug)]
pub struct FileDeleter {
    storage: Arc<dyn Storage>,
    info_stream: Arc<dyn InfoStream>,
    ref_counts: AHashMap<String, u32>,
    commits: Vec<CommitPoint>,
    last_files: BTreeSet<String>,
    deletable: BTreeSet<String>,
}

impl FileDeleter {
    /// Take references for `last_commit` (if one exists) and `current`,
    /// then delete index files neither of them references.
    pub fn new(
        storage: Arc<dyn Storage>,
        info_stream: Arc<dyn InfoStream>,
        last_commit: Option<&SegmentCatalog>,
        current: &SegmentCatalog,
    ) -> Result<Self> {
        let mut deleter = FileDeleter {
            storage,
            info_stream,
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: BTreeSet::new(),
            deletable: BTreeSet::new(),
        };

        if let Some(commit) = last_commit {
            let files = commit.files(true);
            deleter.message(|| {
                format!(
                    "init: load commit \"{}\"",
                    commit.segments_file_name().unwrap_or_default()
                )
            });
            deleter.inc_ref_files(&files);
            deleter.commits.push(CommitPoint {
                segments_file_name: commit.segments_file_name(),
                files,
            });
        }
        deleter.checkpoint(current, false)?;

        for file in deleter.storage.list_files()? {
            if is_index_file(&file) && file != SEGMENTS_GEN && !deleter.is_referenced(&file) {
                deleter.message(|| format!("init: removing unreferenced file \"{file}\""));
                deleter.delete_file(&file);
            }
        }
        Ok(deleter)
    }

    fn message(&self, message: impl FnOnce() -> String) {
        if self.info_stream.is_enabled(IFD) {
            self.info_stream.message(IFD, &message());
        }
    }

    /// Record `catalog` as the writer's current state, or as a new commit.
    ///
    /// A commit reference holds the commit file too. Checkpointing a commit
    /// releases the previous one; checkpointing a non-commit releases the
    /// previous non-commit checkpoint.
    pub fn checkpoint(&mut self, catalog: &SegmentCatalog, is_commit: bool) -> Result<()> {
        self.delete_pending_files();

        let files = catalog.files(is_commit);
        self.inc_ref_files(&files);

        if is_commit {
            self.message(|| {
                format!(
                    "now checkpoint \"{}\" [{} segments; isCommit = true]",
                    catalog.segments_file_name().unwrap_or_default(),
                    catalog.len()
                )
            });
            self.commits.push(CommitPoint {
                segments_file_name: catalog.segments_file_name(),
                files,
            });
            let superseded: Vec<CommitPoint> =
                self.commits.drain(..self.commits.len() - 1).collect();
            for commit in superseded {
                self.message(|| {
                    format!(
                        "deleteCommits: now decRef commit \"{}\"",
                        commit.segments_file_name.as_deref().unwrap_or_default()
                    )
                });
                self.dec_ref_files(&commit.files)?;
            }
        } else {
            let previous = std::mem::replace(&mut self.last_files, files);
            self.dec_ref_files(&previous)?;
        }
        Ok(())
    }

    pub fn inc_ref_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            self.inc_ref(file);
        }
    }

    pub fn inc_ref(&mut self, file: &str) {
        *self.ref_counts.entry(file.to_string()).or_insert(0) += 1;
    }

    pub fn dec_ref_files(&mut self, files: &BTreeSet<String>) -> Result<()> {
        for file in files {
            self.dec_ref(file)?;
        }
        Ok(())
    }

    /// Release one reference, deleting the file when none is left.
    pub fn dec_ref(&mut self, file: &str) -> Result<()> {
        let Some(count) = self.ref_counts.get_mut(file) else {
            return Err(GalleyError::illegal_state(format!(
                "file \"{file}\" has no references"
            )));
        };
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(file);
            self.delete_file(file);
        }
        Ok(())
    }

    pub fn ref_count(&self, file: &str) -> u32 {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    pub fn is_referenced(&self, file: &str) -> bool {
        self.ref_count(file) > 0
    }

    /// Delete unreferenced files among `files`, typically written by a
    /// flush or merge that did not make it into the catalog.
    pub fn delete_new_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            if !self.is_referenced(file) && self.storage.file_exists(file) {
                self.message(|| format!("delete new file \"{file}\""));
                self.delete_file(file);
            }
        }
    }

    /// Delete every unreferenced index file, or with `segment` only those
    /// belonging to that segment.
    pub fn refresh(&mut self, segment: Option<&str>) -> Result<()> {
        self.delete_pending_files();

        let prefixes = segment.map(|name| (format!("{name}."), format!("{name}_")));
        for file in self.storage.list_files()? {
            let matches = match &prefixes {
                Some((dot, underscore)) => file.starts_with(dot) || file.starts_with(underscore),
                None => true,
            };
            if matches
                && is_index_file(&file)
                && file != SEGMENTS_GEN
                && file != WRITE_LOCK_NAME
                && !self.is_referenced(&file)
            {
                self.message(|| format!("refresh: removing newly created unreferenced file \"{file}\""));
                self.delete_file(&file);
            }
        }
        Ok(())
    }

    fn delete_file(&mut self, file: &str) {
        self.message(|| format!("delete \"{file}\""));
        match self.storage.delete_file(file) {
            Ok(()) => {
                self.deletable.remove(file);
            }
            Err(GalleyError::FileNotFound(_)) => {
                self.deletable.remove(file);
            }
            Err(err) => {
                // Retried on the next checkpoint.
                self.message(|| format!("unable to remove file \"{file}\": {err}; will re-try later"));
                self.deletable.insert(file.to_string());
            }
        }
    }

    fn delete_pending_files(&mut self) {
        let pending: Vec<String> = self.deletable.iter().cloned().collect();
        for file in pending {
            if !self.is_referenced(&file) {
                self.delete_file(&file);
            } else {
                self.deletable.remove(&file);
            }
        }
    }

    /// Files that could not be deleted yet.
    pub fn pending_deletes(&self) -> &BTreeSet<String> {
        &self.deletable
    }

    /// Retry pending deletes one last time.
    pub fn close(&mut self) {
        self.delete_pending_files();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::document::Document;
    use crate::index::codec::{Codec, PlainCodec};
    use crate::index::info_stream::NoInfoStream;
    use crate::index::segment_reader::SegmentReader;
    use crate::index::segment_record::SegmentRecord;
    use crate::storage::memory::MemoryStorage;

    fn add_segment(storage: &MemoryStorage, catalog: &mut SegmentCatalog) -> String {
        let codec = PlainCodec::new();
        let name = catalog.new_segment_name();
        let docs = vec![Document::builder().add_keyword("id", "1").build()];
        let reader = SegmentReader::from_documents(&name, &docs).unwrap();
        let mut info = codec.write_segment(storage, &reader).unwrap();
        codec.write_segment_info(storage, &mut info).unwrap();
        catalog.add(SegmentRecord::new(info));
        name
    }

    fn deleter(storage: &Arc<MemoryStorage>, current: &SegmentCatalog) -> FileDeleter {
        FileDeleter::new(storage.clone(), Arc::new(NoInfoStream), None, current).unwrap()
    }

    #[test]
    fn test_init_removes_unreferenced_files() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = SegmentCatalog::new();
        add_segment(&storage, &mut catalog);
        for name in ["_9.dat", "segments.gen", "write.lock", "notes.txt"] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(b"x").unwrap();
            output.close().unwrap();
        }

        let deleter = deleter(&storage, &catalog);
        assert!(!storage.file_exists("_9.dat"));
        assert!(storage.file_exists("_0.dat"));
        assert!(storage.file_exists("segments.gen"));
        assert!(storage.file_exists("write.lock"));
        assert!(storage.file_exists("notes.txt"));
        assert_eq!(deleter.ref_count("_0.si"), 1);
    }

    #[test]
    fn test_commit_keeps_only_last() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut catalog = SegmentCatalog::new();
        let first = add_segment(&storage, &mut catalog);
        let mut deleter = deleter(&storage, &catalog);

        catalog.commit(&*storage).unwrap();
        deleter.checkpoint(&catalog, true).unwrap();
        assert_eq!(deleter.ref_count("_0.dat"), 2);
        assert!(deleter.is_referenced("segments_1"));

        // replace the segment and commit again
        catalog.remove(&first);
        add_segment(&storage, &mut catalog);
        deleter.checkpoint(&catalog, false).unwrap();
        assert!(storage.file_exists("_0.dat"), "still held by segments_1");

        catalog.commit(&*storage).unwrap();
        deleter.checkpoint(&catalog, true).unwrap();
        assert!(!storage.file_exists("_0.dat"));
        assert!(!storage.file_exists("segments_1"));
        assert!(storage.file_exists("segments_2"));
        assert!(storage.file_exists("_1.dat"));
    }

    #[test]
    fn test_refresh_scoped_to_segment() {
        let storage = Arc::new(MemoryStorage::new_default());
        let catalog = SegmentCatalog::new();
        let mut deleter = deleter(&storage, &catalog);
        for name in ["_3.dat", "_3_1.liv", "_31.dat"] {
            storage.create_output(name).unwrap().close().unwrap();
        }

        deleter.refresh(Some("_3")).unwrap();
        assert!(!storage.file_exists("_3.dat"));
        assert!(!storage.file_exists("_3_1.liv"));
        assert!(storage.file_exists("_31.dat"));

        deleter.refresh(None).unwrap();
        assert!(!storage.file_exists("_31.dat"));
    }

    #[test]
    fn test_dec_ref_unknown_file_is_illegal() {
        let storage = Arc::new(MemoryStorage::new_default());
        let mut deleter = deleter(&storage, &SegmentCatalog::new());
        assert!(matches!(
            deleter.dec_ref("_0.dat"),
            Err(GalleyError::IllegalState(_))
        ));

        deleter.inc_ref("_0.dat");
        let mut files = BTreeSet::new();
        files.insert("_0.dat".to_string());
        deleter.delete_new_files(&files);
        assert_eq!(deleter.ref_count("_0.dat"), 1);
    }
}
