#[cfg(test)]
mod tests {
    use galley::document::{Document, Term};
    use galley::error::GalleyError;
    use galley::index::file_names::{SEGMENTS_GEN, max_segments_generation, segments_file_name};
    use galley::index::merge_scheduler::MergeSchedulerConfig;
    use galley::index::{IndexSnapshot, IndexWriter, MergePolicyConfig, OpenMode, WriterConfig};
    use galley::query::TermQuery;
    use galley::storage::Storage;
    use galley::storage::memory::MemoryStorage;
    use std::sync::Arc;

    fn config() -> WriterConfig {
        WriterConfig::new()
            .with_merge_policy(MergePolicyConfig::NoMerge)
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
    }

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("body", format!("document {id}"))
            .build()
    }

    fn latest_generation(storage: &MemoryStorage) -> i64 {
        max_segments_generation(&storage.list_files().unwrap())
    }

    #[test]
    fn test_crash_after_prepare_commit_recovers_previous_commit() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();

        // 1. First commit with three documents
        for id in ["a", "b", "c"] {
            writer.add_document(doc(id)).unwrap();
        }
        writer.commit().unwrap();

        // 2. Prepare a second commit and crash before finishing it
        writer.add_document(doc("d")).unwrap();
        writer.delete_terms([Term::new("id", "a")]).unwrap();
        writer.prepare_commit().unwrap();
        let image = storage.crash_image();

        let recovered = IndexSnapshot::open(&image).unwrap();
        assert_eq!(recovered.num_docs(), 3);
        assert_eq!(recovered.doc_freq(&Term::new("id", "a")), 1);
        assert_eq!(recovered.doc_freq(&Term::new("id", "d")), 0);

        // 3. A writer on the crashed image continues from the first commit
        let survivor = IndexWriter::open(
            Arc::new(image.clone()),
            config().with_open_mode(OpenMode::Append),
        )
        .unwrap();
        assert_eq!(survivor.num_docs(), 3);
        survivor.add_document(doc("e")).unwrap();
        survivor.commit().unwrap();
        survivor.close().unwrap();
        assert_eq!(IndexSnapshot::open(&image).unwrap().num_docs(), 4);

        // 4. Finishing the original commit makes it durable
        writer.commit().unwrap();
        let image = storage.crash_image();
        let recovered = IndexSnapshot::open(&image).unwrap();
        assert_eq!(recovered.num_docs(), 3);
        assert_eq!(recovered.doc_freq(&Term::new("id", "a")), 0);
        assert_eq!(recovered.doc_freq(&Term::new("id", "d")), 1);

        writer.close().unwrap();
    }

    #[test]
    fn test_crash_before_any_commit_leaves_no_index() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.flush().unwrap();

        let image = storage.crash_image();
        assert!(matches!(
            IndexSnapshot::open(&image),
            Err(GalleyError::NotFound(_))
        ));
        writer.rollback().unwrap();
    }

    #[test]
    fn test_failed_sync_keeps_previous_commit() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        let generation = latest_generation(&storage);

        // 1. The sync of the new segment files fails
        writer.add_document(doc("b")).unwrap();
        storage.fail_next_sync(1);
        assert!(writer.commit().is_err());
        assert_eq!(latest_generation(&storage), generation);
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().num_docs(), 1);

        // 2. The writer is still usable and the next commit carries the change
        assert!(writer.has_uncommitted_changes());
        writer.commit().unwrap();
        assert!(latest_generation(&storage) > generation);
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().num_docs(), 2);

        writer.close().unwrap();
    }

    #[test]
    fn test_crash_after_failed_commit_skips_generation_gap() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        let first = latest_generation(&storage);

        // 1. The final sync of the second commit fails and its file is removed
        writer.add_document(doc("b")).unwrap();
        writer.prepare_commit().unwrap();
        storage.fail_next_sync(1);
        assert!(writer.commit().is_err());
        assert_eq!(latest_generation(&storage), first);

        // 2. A third commit is prepared with the next generation, then the crash
        writer.add_document(doc("c")).unwrap();
        writer.prepare_commit().unwrap();
        let image = storage.crash_image();
        let torn = latest_generation(&image);
        assert!(torn > first + 1);
        assert!(!image.file_exists(&segments_file_name(first + 1).unwrap()));

        let recovered = IndexSnapshot::open(&image).unwrap();
        assert_eq!(recovered.num_docs(), 1);
        assert_eq!(recovered.doc_freq(&Term::new("id", "a")), 1);
        assert_eq!(recovered.doc_freq(&Term::new("id", "c")), 0);
        writer.rollback().unwrap();
    }

    #[test]
    fn test_commit_replaces_previous_commit_file() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();

        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        let first = latest_generation(&storage);
        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();
        let second = latest_generation(&storage);

        assert!(second > first);
        let first_name = segments_file_name(first).unwrap();
        let second_name = segments_file_name(second).unwrap();
        assert!(!storage.file_exists(&first_name));
        assert!(storage.is_synced(&second_name));
        writer.close().unwrap();
    }

    #[test]
    fn test_discovery_uses_generation_hint_when_listing_lags() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        // 1. The newest commit file is missing from listings
        let latest = segments_file_name(latest_generation(&storage)).unwrap();
        storage.hide_from_listing(&latest);
        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(snapshot.num_docs(), 2);
        assert_eq!(
            snapshot
                .search(&TermQuery::new(Term::new("id", "b")))
                .unwrap()
                .len(),
            1
        );

        // 2. Without a readable hint the commit cannot be found
        storage.corrupt_file(SEGMENTS_GEN, 0).unwrap();
        assert!(matches!(
            IndexSnapshot::open(&*storage),
            Err(GalleyError::NotFound(_))
        ));

        // 3. Once the listing catches up the corrupt hint is ignored
        storage.unhide(&latest);
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().num_docs(), 2);
    }

    #[test]
    fn test_transient_open_failure_is_retried() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        let latest = segments_file_name(latest_generation(&storage)).unwrap();
        storage.fail_open(&latest, 1);
        assert_eq!(IndexSnapshot::open(&*storage).unwrap().num_docs(), 1);
    }
}
