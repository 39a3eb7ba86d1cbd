#[cfg(test)]
mod tests {
    use galley::document::{Document, Term};
    use galley::error::GalleyError;
    use galley::index::merge_scheduler::MergeSchedulerConfig;
    use galley::index::{IndexSnapshot, IndexWriter, MergePolicyConfig, OpenMode, WriterConfig};
    use galley::query::{NumericRangeQuery, Query, TermQuery};
    use galley::storage::memory::MemoryStorage;
    use std::sync::Arc;

    fn config() -> WriterConfig {
        WriterConfig::new()
            .with_merge_policy(MergePolicyConfig::NoMerge)
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
    }

    fn doc(id: &str, price: i64) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_numeric("price", price)
            .build()
    }

    fn id(value: &str) -> Term {
        Term::new("id", value)
    }

    /// Prices of the live documents with `id`, in doc id order.
    fn prices(snapshot: &IndexSnapshot, value: &str) -> Vec<Option<i64>> {
        snapshot
            .search(&TermQuery::new(id(value)))
            .unwrap()
            .into_iter()
            .map(|doc| snapshot.numeric_value("price", doc))
            .collect()
    }

    #[test]
    fn test_delete_then_add_keeps_later_document() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();

        // 1. All three events land in the same buffer
        writer.add_document(doc("1", 1)).unwrap();
        writer.delete_terms([id("1")]).unwrap();
        writer.add_document(doc("1", 2)).unwrap();
        writer.commit().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(snapshot.num_docs(), 1);
        assert_eq!(prices(&snapshot, "1"), vec![Some(2)]);
        writer.close().unwrap();
    }

    #[test]
    fn test_delete_then_add_across_flush() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();

        // 1. The first document is already flushed when the delete arrives
        writer.add_document(doc("0", 0)).unwrap();
        writer.add_document(doc("1", 1)).unwrap();
        writer.flush().unwrap();
        writer.delete_terms([id("1")]).unwrap();
        writer.add_document(doc("1", 2)).unwrap();
        writer.commit().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(snapshot.num_docs(), 2);
        assert_eq!(snapshot.max_doc(), 3);
        assert_eq!(prices(&snapshot, "1"), vec![Some(2)]);
        writer.close().unwrap();
    }

    #[test]
    fn test_update_document_replaces_all_matches() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("1", 1)).unwrap();
        writer.flush().unwrap();
        writer.add_document(doc("1", 2)).unwrap();
        writer.update_document(id("1"), doc("1", 3)).unwrap();

        let snapshot = writer.open_snapshot(true).unwrap();
        assert_eq!(prices(&snapshot, "1"), vec![Some(3)]);
        writer.close().unwrap();
    }

    #[test]
    fn test_delete_query_only_affects_earlier_documents() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        for (i, price) in [10, 20, 30].into_iter().enumerate() {
            writer.add_document(doc(&i.to_string(), price)).unwrap();
        }
        writer
            .delete_queries(vec![
                Box::new(NumericRangeQuery::new("price", Some(15), None)) as Box<dyn Query>,
            ])
            .unwrap();
        writer.add_document(doc("3", 40)).unwrap();
        writer.commit().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(snapshot.num_docs(), 2);
        assert_eq!(prices(&snapshot, "0"), vec![Some(10)]);
        assert!(prices(&snapshot, "1").is_empty());
        assert!(prices(&snapshot, "2").is_empty());
        assert_eq!(prices(&snapshot, "3"), vec![Some(40)]);
        writer.close().unwrap();
    }

    #[test]
    fn test_numeric_update_applies_to_earlier_documents_only() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();

        writer.add_document(doc("1", 1)).unwrap();
        writer.update_numeric_value(id("1"), "price", Some(10)).unwrap();
        writer.add_document(doc("1", 2)).unwrap();

        let snapshot = writer.open_snapshot(true).unwrap();
        assert_eq!(prices(&snapshot, "1"), vec![Some(10), Some(2)]);
        writer.close().unwrap();
    }

    #[test]
    fn test_numeric_updates_survive_commit_and_reopen() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("1", 1)).unwrap();
        writer.add_document(doc("2", 1)).unwrap();
        writer.flush().unwrap();

        // 1. Two updates against the flushed segment, the last one wins
        writer.update_numeric_value(id("1"), "price", Some(5)).unwrap();
        writer.update_numeric_value(id("1"), "price", Some(6)).unwrap();
        writer.update_numeric_value(id("2"), "price", None).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(prices(&snapshot, "1"), vec![Some(6)]);
        assert_eq!(prices(&snapshot, "2"), vec![None]);

        // 2. A second writer stacks another update generation on top
        let writer =
            IndexWriter::open(storage.clone(), config().with_open_mode(OpenMode::Append)).unwrap();
        writer.update_numeric_value(id("1"), "price", Some(7)).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        assert_eq!(prices(&snapshot, "1"), vec![Some(7)]);
        assert_eq!(prices(&snapshot, "2"), vec![None]);
    }

    #[test]
    fn test_binary_update_round_trip() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer
            .add_document(
                Document::builder()
                    .add_keyword("id", "1")
                    .add_binary("payload", b"old".to_vec())
                    .build(),
            )
            .unwrap();
        writer.commit().unwrap();

        writer
            .update_binary_value(id("1"), "payload", Some(b"new".to_vec()))
            .unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();

        let snapshot = IndexSnapshot::open(&*storage).unwrap();
        let doc = snapshot.search(&TermQuery::new(id("1"))).unwrap()[0];
        assert_eq!(snapshot.binary_value("payload", doc), Some(&b"new"[..]));
    }

    #[test]
    fn test_update_of_unknown_field_is_rejected() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::open(storage.clone(), config()).unwrap();
        writer.add_document(doc("1", 1)).unwrap();

        assert!(matches!(
            writer.update_numeric_value(id("1"), "missing", Some(1)),
            Err(GalleyError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.update_binary_value(id("1"), "price", Some(vec![1])),
            Err(GalleyError::InvalidArgument(_))
        ));
        writer.rollback().unwrap();
    }

    #[test]
    fn test_max_buffered_delete_terms_triggers_flush() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer =
            IndexWriter::open(storage.clone(), config().with_max_buffered_delete_terms(2)).unwrap();
        for i in 0..4 {
            writer.add_document(doc(&i.to_string(), i)).unwrap();
        }
        assert_eq!(writer.segment_count(), 0);

        writer.delete_terms([id("0")]).unwrap();
        writer.delete_terms([id("1")]).unwrap();
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.num_docs(), 2);
        writer.close().unwrap();
    }
}
