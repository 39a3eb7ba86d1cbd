#[cfg(test)]
mod tests {
    use galley::document::{Document, Term};
    use galley::error::GalleyError;
    use galley::index::file_names::WRITE_LOCK_NAME;
    use galley::index::merge_scheduler::MergeSchedulerConfig;
    use galley::index::{IndexSnapshot, IndexWriter, MergePolicyConfig, OpenMode, WriterConfig};
    use galley::storage::file::FileStorage;
    use galley::storage::memory::{MemoryStorage, MemoryStorageConfig};
    use galley::storage::{Storage, StorageConfig, StorageFactory};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config() -> WriterConfig {
        WriterConfig::new()
            .with_merge_policy(MergePolicyConfig::NoMerge)
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
    }

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("title", format!("title of {id}"))
            .build()
    }

    #[test]
    fn test_file_storage_reopen() {
        let temp_dir = TempDir::new().unwrap();

        // 1. Build and commit an index on disk
        {
            let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(temp_dir.path()).unwrap());
            let writer = IndexWriter::open(storage.clone(), config()).unwrap();
            for i in 0..5 {
                writer.add_document(doc(&format!("doc{i}"))).unwrap();
            }
            writer.commit().unwrap();
            writer.delete_terms([Term::new("id", "doc2")]).unwrap();
            writer.close().unwrap();
            assert!(!IndexWriter::is_locked(storage.as_ref()));
        }

        // 2. A fresh storage handle sees the closing commit
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(temp_dir.path()).unwrap());
        let snapshot = IndexSnapshot::open(storage.as_ref()).unwrap();
        assert_eq!(snapshot.num_docs(), 4);
        assert_eq!(snapshot.max_doc(), 5);

        // 3. Append more and reopen once more
        let writer =
            IndexWriter::open(storage.clone(), config().with_open_mode(OpenMode::Append)).unwrap();
        assert_eq!(writer.num_docs(), 4);
        writer.add_document(doc("doc5")).unwrap();
        writer.close().unwrap();

        let snapshot = IndexSnapshot::open(storage.as_ref()).unwrap();
        assert_eq!(snapshot.num_docs(), 5);
        assert_eq!(snapshot.doc_freq(&Term::new("title", "doc5")), 1);
    }

    #[test]
    fn test_append_on_empty_location_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(temp_dir.path()).unwrap());
        let result = IndexWriter::open(storage.clone(), config().with_open_mode(OpenMode::Append));
        assert!(matches!(result, Err(GalleyError::NotFound(_))));
        assert!(!IndexWriter::is_locked(storage.as_ref()));
    }

    #[test]
    fn test_write_lock_is_exclusive() {
        let storage =
            StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default())).unwrap();

        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        assert!(IndexWriter::is_locked(storage.as_ref()));
        assert!(matches!(
            IndexWriter::open(storage.clone(), config()),
            Err(GalleyError::LockUnavailable(_))
        ));

        writer.close().unwrap();
        assert!(!IndexWriter::is_locked(storage.as_ref()));
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_unlock_clears_stale_lock() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(temp_dir.path()).unwrap());

        // 1. A lock file left behind by a dead process
        std::fs::write(temp_dir.path().join(WRITE_LOCK_NAME), b"").unwrap();
        assert!(IndexWriter::is_locked(storage.as_ref()));
        assert!(matches!(
            IndexWriter::open(storage.clone(), config()),
            Err(GalleyError::LockUnavailable(_))
        ));

        // 2. Recovery tooling removes it
        IndexWriter::unlock(storage.as_ref()).unwrap();
        assert!(!IndexWriter::is_locked(storage.as_ref()));
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.close().unwrap();
        assert_eq!(IndexSnapshot::open(storage.as_ref()).unwrap().num_docs(), 1);
    }

    #[test]
    fn test_fatal_error_requires_rollback() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();

        // 1. Storage runs out of space while flushing
        writer.add_document(doc("b")).unwrap();
        storage.fail_writes_after(0);
        let err = writer.flush().unwrap_err();
        assert!(err.is_fatal());

        // 2. Every further mutation is refused
        assert!(matches!(
            writer.add_document(doc("c")),
            Err(GalleyError::IllegalState(_))
        ));
        assert!(matches!(writer.commit(), Err(GalleyError::IllegalState(_))));

        // 3. Rollback releases the writer and the last commit is intact
        storage.clear_write_quota();
        writer.rollback().unwrap();
        assert!(writer.is_closed());
        assert!(!IndexWriter::is_locked(&*storage));

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(snapshot.num_docs(), 1);
        let writer =
            IndexWriter::open(storage.clone(), config().with_open_mode(OpenMode::Append)).unwrap();
        writer.add_document(doc("d")).unwrap();
        writer.close().unwrap();
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().num_docs(), 2);
    }

    #[test]
    fn test_closed_writer_rejects_calls() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.close().unwrap();

        assert!(matches!(
            writer.add_document(doc("a")),
            Err(GalleyError::Closed(_))
        ));
        assert!(matches!(writer.commit(), Err(GalleyError::Closed(_))));
        assert!(writer.close().is_ok());
        assert!(writer.rollback().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config = WriterConfig::from_json(
            r#"{
                "max_buffered_docs": 2,
                "reader_pooling": true,
                "merge_policy": {"type": "NoMerge"},
                "merge_scheduler": {"type": "Serial"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_buffered_docs, Some(2));
        assert!(config.reader_pooling);
        assert_eq!(config.merge_policy, MergePolicyConfig::NoMerge);
        assert_eq!(config.ram_buffer_size_mb, 16.0);
        assert_eq!(
            WriterConfig::from_json(&config.to_json().unwrap()).unwrap(),
            config
        );

        // 1. The buffer limit drives automatic flushes
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config).unwrap();
        for i in 0..5 {
            writer.add_document(doc(&i.to_string())).unwrap();
        }
        assert_eq!(writer.segment_count(), 2);
        assert_eq!(writer.max_doc(), 5);
        writer.close().unwrap();
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().segment_count(), 3);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            WriterConfig::from_json(r#"{"max_buffered_docs": 0}"#),
            Err(GalleyError::InvalidArgument(_))
        ));
        assert!(matches!(
            WriterConfig::from_json(r#"{"merge_policy": {"type": "Tiered", "segments_per_tier": 1.0}}"#),
            Err(GalleyError::InvalidArgument(_))
        ));
        assert!(WriterConfig::from_json("not json").is_err());

        let storage = Arc::new(MemoryStorage::new_default());
        assert!(matches!(
            IndexWriter::open(storage, config().with_codec("Missing")),
            Err(GalleyError::InvalidArgument(_))
        ));
    }
}
