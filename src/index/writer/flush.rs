//! Turning buffered documents into segments, and applying buffered edits.

use std::collections::BTreeMap;
use std::mem;

use bit_vec::BitVec;

use crate::error::Result;
use crate::index::buffered_updates::{BufferedUpdates, FrozenUpdates};
use crate::index::merge::MergeTrigger;
use crate::index::segment_reader::SegmentReader;
use crate::index::segment_record::SegmentRecord;
use crate::index::snapshot::IndexSnapshot;
use crate::util::lock_order::{LockRank, holds};

use super::documents::DocumentsBuffer;
use super::merging::EngineContext;
use super::{EngineState, IndexWriter};

/// Provenance recorded in every new segment.
pub(super) fn diagnostics(source: &str) -> BTreeMap<String, String> {
    let mut diagnostics = BTreeMap::new();
    diagnostics.insert("source".to_string(), source.to_string());
    diagnostics.insert(
        "timestamp".to_string(),
        chrono::Utc::now().timestamp_millis().to_string(),
    );
    diagnostics.insert(
        "galley.version".to_string(),
        crate::VERSION.to_string(),
    );
    diagnostics.insert("os".to_string(), std::env::consts::OS.to_string());
    diagnostics
}

impl IndexWriter {
    /// Flush buffered documents and apply every buffered edit, without
    /// committing.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open(false)?;
        if self.flush_all(true)? {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }
        Ok(())
    }

    /// Open a near-real-time snapshot of everything added so far.
    ///
    /// Pooling stays on for the rest of the writer's life, so snapshots and
    /// the writer share live docs instead of reloading them.
    pub fn open_snapshot(&self, apply_all_deletes: bool) -> Result<IndexSnapshot> {
        self.ensure_open(true)?;
        self.inner.engine.lock().pool.enable_pooling();

        let (snapshot, flushed) = {
            let _full_flush = self.inner.full_flush_lock.lock();
            let result = (|| -> Result<(IndexSnapshot, bool)> {
                let flushed = {
                    let mut buffer = self.inner.documents.lock();
                    self.flush_documents(&mut buffer)?
                };
                if apply_all_deletes {
                    self.apply_all_deletes()?;
                }

                let mut engine = self.inner.engine.lock();
                let EngineState { catalog, pool, .. } = &mut *engine;
                let names: Vec<String> =
                    catalog.iter().map(|r| r.name().to_string()).collect();
                let mut segments = Vec::with_capacity(names.len());
                for name in names {
                    let Some(record) = catalog.get_mut(&name) else {
                        continue;
                    };
                    let view = pool.acquire(record, true)?;
                    let snapshot = view.snapshot(record);
                    pool.release(record)?;
                    segments.push((name, snapshot?));
                }
                let version = catalog.version();
                drop(engine);

                self.message(|| format!("return snapshot version={version} segments={}", segments.len()));
                Ok((IndexSnapshot::new(segments, version), flushed))
            })();
            self.check_tragic(result, "open_snapshot")?
        };

        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush, None)?;
        }
        Ok(snapshot)
    }

    /// Flush everything buffered. Returns whether a segment was written.
    pub(super) fn flush_all(&self, apply_all_deletes: bool) -> Result<bool> {
        debug_assert!(!holds(LockRank::Engine), "flush_all under the engine lock");
        let _full_flush = self.inner.full_flush_lock.lock();
        let result = (|| -> Result<bool> {
            let flushed = {
                let mut buffer = self.inner.documents.lock();
                self.flush_documents(&mut buffer)?
            };
            if apply_all_deletes || self.updates_ram_exceeded() {
                self.apply_all_deletes()?;
            }
            Ok(flushed)
        })();
        self.check_tragic(result, "flush")
    }

    /// Whether frozen edits use more than half the RAM buffer.
    fn updates_ram_exceeded(&self) -> bool {
        let Some(max) = self.inner.config.ram_buffer_bytes() else {
            return false;
        };
        let used = self.inner.stream.lock().ram_bytes_used();
        if used > max / 2 {
            self.message(|| format!("apply deletes: bytesUsed={used} vs ramBuffer={max}"));
            return true;
        }
        false
    }

    /// Write the buffered documents as a new segment and publish the
    /// buffered edits. Returns whether a segment was written.
    pub(super) fn flush_documents(&self, buffer: &mut DocumentsBuffer) -> Result<bool> {
        let docs = mem::take(&mut buffer.docs);
        let private = mem::take(&mut buffer.private);
        let global = mem::take(&mut buffer.global);
        buffer.docs_ram = 0;

        // Global edits go first: they must not touch the segment flushed
        // below, whose generation will be newer.
        let global = FrozenUpdates::freeze(&global, false);
        if global.any() {
            self.inner.stream.lock().push(global);
        }
        if docs.is_empty() {
            return Ok(false);
        }

        let name = self.inner.engine.lock().catalog.new_segment_name();
        self.message(|| format!("flush postings as segment {name} numDocs={}", docs.len()));

        let record = match self.write_flushed_segment(&name, &docs, &private) {
            Ok(record) => record,
            Err(err) => {
                let mut engine = self.inner.engine.lock();
                if let Err(refresh) = engine.deleter.refresh(Some(&name)) {
                    log::warn!("failed to remove files of unflushed segment {name}: {refresh}");
                }
                return Err(err);
            }
        };
        self.publish_flushed_segment(record, &private)?;
        Ok(true)
    }

    fn write_flushed_segment(
        &self,
        name: &str,
        docs: &[crate::document::Document],
        private: &BufferedUpdates,
    ) -> Result<SegmentRecord> {
        let storage = self.inner.storage.as_ref();
        let codec = &self.inner.codec;
        let reader = SegmentReader::from_documents(name, docs)?;
        let max_doc = reader.max_doc();

        // Term and doc-id deletes buffered with these documents apply now,
        // each only to the documents buffered before it.
        let mut live = BitVec::from_elem(max_doc as usize, true);
        let mut del_count = 0u32;
        for (term, upto) in private.sorted_terms() {
            for &doc in reader.postings(&term) {
                if doc < upto && live.get(doc as usize).unwrap_or(false) {
                    live.set(doc as usize, false);
                    del_count += 1;
                }
            }
        }
        for &doc in private.doc_ids() {
            if doc < max_doc && live.get(doc as usize).unwrap_or(false) {
                live.set(doc as usize, false);
                del_count += 1;
            }
        }

        let mut info = codec.write_segment(storage, &reader)?;
        info.diagnostics = diagnostics("flush");
        let bytes: u64 = info
            .files
            .iter()
            .map(|file| storage.file_size(file).unwrap_or(0))
            .sum();
        info.use_compound_file = {
            let engine = self.inner.engine.lock();
            let ctx = EngineContext::new(self, &engine.pool, &engine.coordinator);
            self.inner
                .policy
                .use_compound_file(&engine.catalog, bytes, &ctx)
        };
        codec.write_segment_info(storage, &mut info)?;

        let mut record = SegmentRecord::new(info);
        if del_count > 0 {
            let generation = record.next_write_del_gen();
            codec.write_live_docs(storage, &record, &live, generation)?;
            record.advance_del_gen();
            record.set_del_count(del_count)?;
        }
        self.message(|| {
            format!(
                "flushed segment {name}: docCount={max_doc} delCount={del_count} files={:?}",
                record.files()
            )
        });
        Ok(record)
    }

    fn publish_flushed_segment(
        &self,
        mut record: SegmentRecord,
        private: &BufferedUpdates,
    ) -> Result<()> {
        let mut engine = self.inner.engine.lock();
        let segment_gen = {
            let mut stream = self.inner.stream.lock();
            let packet = FrozenUpdates::freeze(private, true);
            if packet.any() {
                stream.push(packet)
            } else {
                stream.next_gen()
            }
        };
        record.set_buffered_deletes_gen(segment_gen);

        if record.num_docs() == 0 && !self.inner.config.keep_fully_deleted_segments {
            self.message(|| format!("dropping fully deleted flushed segment {}", record.name()));
            engine.deleter.delete_new_files(&record.files());
        } else {
            engine.catalog.add(record);
        }
        engine.checkpoint()
    }

    /// Apply every frozen packet to every segment, then drop segments
    /// left without live documents.
    pub(super) fn apply_all_deletes(&self) -> Result<()> {
        let mut engine = self.inner.engine.lock();
        let mut stream = self.inner.stream.lock();
        if stream.packet_count() == 0 {
            return Ok(());
        }
        self.message(|| "apply all deletes during flush".to_string());

        let result = {
            let EngineState { catalog, pool, .. } = &mut *engine;
            let names: Vec<String> = catalog.iter().map(|r| r.name().to_string()).collect();
            stream.apply_deletes_and_updates(pool, catalog, &names)?
        };
        engine.checkpoint()?;

        if !self.inner.config.keep_fully_deleted_segments && !result.all_deleted.is_empty() {
            let mut dropped = false;
            for name in &result.all_deleted {
                if engine.coordinator.is_merging(name) {
                    continue;
                }
                self.message(|| format!("drop 100% deleted segment {name}"));
                engine.catalog.remove(name);
                engine.pool.drop(name);
                dropped = true;
            }
            if dropped {
                engine.checkpoint()?;
            }
        }
        stream.prune(&engine.catalog);
        Ok(())
    }
}
