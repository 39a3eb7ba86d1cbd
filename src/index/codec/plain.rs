//! The default codec.
//!
//! `Plain48` keeps every segment in two files: `<seg>.si` with the segment
//! descriptor and `<seg>.dat` with postings (delta-compressed doc ids per
//! term, terms in sorted order) and both kinds of doc values. Live docs and
//! field updates are separate generation-stamped files. Every file carries a
//! codec header and a checksum footer.

use std::collections::BTreeMap;

use ahash::AHashMap;
use bit_vec::BitVec;

use crate::document::{FieldInfos, FieldKind, Term};
use crate::error::{GalleyError, Result};
use crate::index::codec::{Codec, DocMap, MergedSegment};
use crate::index::field_updates::FieldUpdates;
use crate::index::file_names::{
    DATA_EXTENSION, FIELD_UPDATES_EXTENSION, LIVE_DOCS_EXTENSION, SEGMENT_INFO_EXTENSION,
    file_name_from_generation, segment_file_name,
};
use crate::index::segment_reader::{SegmentReader, SegmentSnapshot};
use crate::index::segment_record::{SegmentInfo, SegmentRecord};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub const PLAIN_CODEC_NAME: &str = "Plain48";

const SEGMENT_INFO_CODEC: &str = "Plain48SegmentInfo";
const DATA_CODEC: &str = "Plain48Data";
const LIVE_DOCS_CODEC: &str = "Plain48LiveDocs";
const FIELD_UPDATES_CODEC: &str = "Plain48FieldUpdates";

const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = VERSION_START;

#[derive(Debug, Clone, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub fn new() -> Self {
        PlainCodec
    }

    fn write_field_infos(writer: &mut StructWriter, fields: &FieldInfos) -> Result<()> {
        writer.write_u32(fields.len() as u32)?;
        for (name, kind) in fields.iter() {
            writer.write_string(name)?;
            writer.write_u8(kind.code())?;
        }
        Ok(())
    }

    fn read_field_infos(reader: &mut StructReader) -> Result<FieldInfos> {
        let count = reader.read_u32()?;
        let mut fields = FieldInfos::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let kind = FieldKind::from_code(reader.read_u8()?)?;
            fields
                .add(&name, kind)
                .map_err(|e| GalleyError::corrupt(format!("{e} (resource: {})", reader.name())))?;
        }
        Ok(fields)
    }

    fn read_data(&self, storage: &dyn Storage, name: &str) -> Result<SegmentReader> {
        let file = segment_file_name(name, "", DATA_EXTENSION);
        let mut input = StructReader::open(storage, &file)?;
        input.check_header(DATA_CODEC, VERSION_START, VERSION_CURRENT)?;

        let max_doc = input.read_u32()?;
        let fields = Self::read_field_infos(&mut input)?;

        let term_count = input.read_u32()?;
        let mut postings = AHashMap::with_capacity(term_count as usize);
        for _ in 0..term_count {
            let field = input.read_string()?;
            let text = input.read_string()?;
            let docs = input.read_delta_compressed_u32s()?;
            postings.insert(Term::new(field, text), docs);
        }

        let mut numeric = BTreeMap::new();
        for _ in 0..input.read_u32()? {
            let field = input.read_string()?;
            let mut values = Vec::with_capacity(max_doc as usize);
            for _ in 0..max_doc {
                values.push(match input.read_u8()? {
                    0 => None,
                    _ => Some(input.read_i64()?),
                });
            }
            numeric.insert(field, values);
        }

        let mut binary = BTreeMap::new();
        for _ in 0..input.read_u32()? {
            let field = input.read_string()?;
            let mut values = Vec::with_capacity(max_doc as usize);
            for _ in 0..max_doc {
                values.push(match input.read_u8()? {
                    0 => None,
                    _ => Some(input.read_bytes()?),
                });
            }
            binary.insert(field, values);
        }

        input.check_footer()?;
        SegmentReader::from_parts(name, max_doc, fields, postings, numeric, binary)
    }

    fn read_field_updates(&self, storage: &dyn Storage, file: &str) -> Result<FieldUpdates> {
        let mut input = StructReader::open(storage, file)?;
        input.check_header(FIELD_UPDATES_CODEC, VERSION_START, VERSION_CURRENT)?;

        let mut updates = FieldUpdates::new();
        for _ in 0..input.read_u32()? {
            let field = input.read_string()?;
            for _ in 0..input.read_u32()? {
                let doc = input.read_u32()?;
                let value = match input.read_u8()? {
                    0 => None,
                    _ => Some(input.read_i64()?),
                };
                updates.set_numeric(&field, doc, value);
            }
        }
        for _ in 0..input.read_u32()? {
            let field = input.read_string()?;
            for _ in 0..input.read_u32()? {
                let doc = input.read_u32()?;
                let value = match input.read_u8()? {
                    0 => None,
                    _ => Some(input.read_bytes()?),
                };
                updates.set_binary(&field, doc, value);
            }
        }
        input.check_footer()?;
        Ok(updates)
    }
}

impl Codec for PlainCodec {
    fn name(&self) -> &str {
        PLAIN_CODEC_NAME
    }

    fn write_segment(&self, storage: &dyn Storage, reader: &SegmentReader) -> Result<SegmentInfo> {
        let file = segment_file_name(reader.name(), "", DATA_EXTENSION);
        let mut output = StructWriter::create(storage, &file)?;
        output.write_header(DATA_CODEC, VERSION_CURRENT)?;
        output.write_u32(reader.max_doc())?;
        Self::write_field_infos(&mut output, reader.fields())?;

        let mut terms: Vec<_> = reader.terms().collect();
        terms.sort_unstable_by(|a, b| a.0.cmp(b.0));
        output.write_u32(terms.len() as u32)?;
        for (term, docs) in terms {
            output.write_string(term.field())?;
            output.write_string(term.text())?;
            output.write_delta_compressed_u32s(docs)?;
        }

        output.write_u32(reader.numeric_columns().len() as u32)?;
        for (field, values) in reader.numeric_columns() {
            output.write_string(field)?;
            for value in values {
                match value {
                    Some(v) => {
                        output.write_u8(1)?;
                        output.write_i64(*v)?;
                    }
                    None => output.write_u8(0)?,
                }
            }
        }

        output.write_u32(reader.binary_columns().len() as u32)?;
        for (field, values) in reader.binary_columns() {
            output.write_string(field)?;
            for value in values {
                match value {
                    Some(v) => {
                        output.write_u8(1)?;
                        output.write_bytes(v)?;
                    }
                    None => output.write_u8(0)?,
                }
            }
        }

        output.write_footer()?;
        output.close()?;

        let mut info = SegmentInfo::new(reader.name(), reader.max_doc(), PLAIN_CODEC_NAME);
        info.fields = reader.fields().clone();
        info.files.insert(file);
        Ok(info)
    }

    fn write_segment_info(&self, storage: &dyn Storage, info: &mut SegmentInfo) -> Result<()> {
        let file = segment_file_name(&info.name, "", SEGMENT_INFO_EXTENSION);
        info.files.insert(file.clone());

        let mut output = StructWriter::create(storage, &file)?;
        output.write_header(SEGMENT_INFO_CODEC, VERSION_CURRENT)?;
        output.write_string(&info.name)?;
        output.write_u32(info.doc_count)?;
        output.write_u8(u8::from(info.use_compound_file))?;
        output.write_string_map(&info.diagnostics)?;
        output.write_string_set(&info.files)?;
        Self::write_field_infos(&mut output, &info.fields)?;
        output.write_footer()?;
        output.close()
    }

    fn read_segment_info(&self, storage: &dyn Storage, name: &str) -> Result<SegmentInfo> {
        let file = segment_file_name(name, "", SEGMENT_INFO_EXTENSION);
        let mut input = StructReader::open(storage, &file)?;
        input.check_header(SEGMENT_INFO_CODEC, VERSION_START, VERSION_CURRENT)?;

        let stored_name = input.read_string()?;
        if stored_name != name {
            return Err(GalleyError::corrupt(format!(
                "segment name mismatch: {stored_name} vs {name} (resource: {file})"
            )));
        }
        let doc_count = input.read_u32()?;
        let use_compound_file = input.read_u8()? != 0;
        let diagnostics = input.read_string_map()?;
        let files = input.read_string_set()?;
        let fields = Self::read_field_infos(&mut input)?;
        input.check_footer()?;

        Ok(SegmentInfo {
            name: stored_name,
            doc_count,
            codec: PLAIN_CODEC_NAME.to_string(),
            use_compound_file,
            diagnostics,
            files,
            fields,
        })
    }

    fn open_reader(&self, storage: &dyn Storage, record: &SegmentRecord) -> Result<SegmentReader> {
        let mut reader = self.read_data(storage, record.name())?;
        if reader.max_doc() != record.doc_count() {
            return Err(GalleyError::corrupt(format!(
                "segment {} has maxDoc={} but docCount={}",
                record.name(),
                reader.max_doc(),
                record.doc_count()
            )));
        }
        for generation in record.updated_fields().keys() {
            let Some(file) =
                file_name_from_generation(record.name(), FIELD_UPDATES_EXTENSION, *generation)
            else {
                continue;
            };
            let updates = self.read_field_updates(storage, &file)?;
            reader = reader.with_field_updates(&updates)?;
        }
        Ok(reader)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        record: &SegmentRecord,
        live_docs: &BitVec,
        generation: i64,
    ) -> Result<String> {
        let file = file_name_from_generation(record.name(), LIVE_DOCS_EXTENSION, generation)
            .ok_or_else(|| {
                GalleyError::invalid_argument(format!("invalid live docs generation {generation}"))
            })?;

        let mut output = StructWriter::create(storage, &file)?;
        output.write_header(LIVE_DOCS_CODEC, VERSION_CURRENT)?;
        output.write_u32(live_docs.len() as u32)?;
        output.write_bytes(&live_docs.to_bytes())?;
        output.write_footer()?;
        output.close()?;
        Ok(file)
    }

    fn read_live_docs(&self, storage: &dyn Storage, record: &SegmentRecord) -> Result<BitVec> {
        let file = record.live_docs_file_name().ok_or_else(|| {
            GalleyError::illegal_state(format!("segment {} has no deletions", record.name()))
        })?;

        let mut input = StructReader::open(storage, &file)?;
        input.check_header(LIVE_DOCS_CODEC, VERSION_START, VERSION_CURRENT)?;
        let length = input.read_u32()?;
        let bytes = input.read_bytes()?;
        input.check_footer()?;

        if length != record.doc_count() || bytes.len() * 8 < length as usize {
            return Err(GalleyError::corrupt(format!(
                "live docs length {length} does not match docCount {} (resource: {file})",
                record.doc_count()
            )));
        }
        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(length as usize);

        let deleted = bits.iter().filter(|live| !live).count() as u32;
        if deleted != record.del_count() {
            return Err(GalleyError::corrupt(format!(
                "live docs count mismatch: info={} vs bits={deleted} (resource: {file})",
                record.del_count()
            )));
        }
        Ok(bits)
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        record: &SegmentRecord,
        updates: &FieldUpdates,
        generation: i64,
    ) -> Result<String> {
        let file = file_name_from_generation(record.name(), FIELD_UPDATES_EXTENSION, generation)
            .ok_or_else(|| {
                GalleyError::invalid_argument(format!("invalid field updates generation {generation}"))
            })?;

        let mut output = StructWriter::create(storage, &file)?;
        output.write_header(FIELD_UPDATES_CODEC, VERSION_CURRENT)?;
        output.write_u32(updates.numeric().len() as u32)?;
        for (field, docs) in updates.numeric() {
            output.write_string(field)?;
            output.write_u32(docs.len() as u32)?;
            for (doc, value) in docs {
                output.write_u32(*doc)?;
                match value {
                    Some(v) => {
                        output.write_u8(1)?;
                        output.write_i64(*v)?;
                    }
                    None => output.write_u8(0)?,
                }
            }
        }
        output.write_u32(updates.binary().len() as u32)?;
        for (field, docs) in updates.binary() {
            output.write_string(field)?;
            output.write_u32(docs.len() as u32)?;
            for (doc, value) in docs {
                output.write_u32(*doc)?;
                match value {
                    Some(v) => {
                        output.write_u8(1)?;
                        output.write_bytes(v)?;
                    }
                    None => output.write_u8(0)?,
                }
            }
        }
        output.write_footer()?;
        output.close()?;
        Ok(file)
    }

    fn merge(
        &self,
        storage: &dyn Storage,
        target: &str,
        sources: &[SegmentSnapshot],
        check_abort: &dyn Fn() -> Result<()>,
    ) -> Result<MergedSegment> {
        let mut doc_maps = Vec::with_capacity(sources.len());
        let mut base = 0u32;
        let mut fields = FieldInfos::new();
        for source in sources {
            let map =
                DocMap::from_live_docs(source.max_doc(), source.live_docs().map(|b| b.as_ref()), base);
            base += map.num_mapped();
            doc_maps.push(map);
            fields.add_all(source.reader().fields())?;
        }
        let max_doc = base;

        let mut postings: AHashMap<Term, Vec<u32>> = AHashMap::new();
        let mut numeric: BTreeMap<String, Vec<Option<i64>>> = BTreeMap::new();
        let mut binary: BTreeMap<String, Vec<Option<Vec<u8>>>> = BTreeMap::new();

        for (source, map) in sources.iter().zip(&doc_maps) {
            check_abort()?;
            let reader = source.reader();

            for (term, docs) in reader.terms() {
                let mapped: Vec<u32> = docs.iter().filter_map(|doc| map.get(*doc)).collect();
                if !mapped.is_empty() {
                    postings.entry(term.clone()).or_default().extend(mapped);
                }
            }

            for (field, values) in reader.numeric_columns() {
                let column = numeric
                    .entry(field.clone())
                    .or_insert_with(|| vec![None; max_doc as usize]);
                for (doc, value) in values.iter().enumerate() {
                    if let Some(new_doc) = map.get(doc as u32) {
                        column[new_doc as usize] = *value;
                    }
                }
            }

            for (field, values) in reader.binary_columns() {
                let column = binary
                    .entry(field.clone())
                    .or_insert_with(|| vec![None; max_doc as usize]);
                for (doc, value) in values.iter().enumerate() {
                    if let Some(new_doc) = map.get(doc as u32) {
                        column[new_doc as usize] = value.clone();
                    }
                }
            }
        }

        let merged = SegmentReader::from_parts(target, max_doc, fields, postings, numeric, binary)?;
        check_abort()?;
        let info = self.write_segment(storage, &merged)?;

        Ok(MergedSegment { info, doc_maps })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::document::Document;
    use crate::storage::memory::MemoryStorage;

    fn docs(offset: i64) -> Vec<Document> {
        (0..3)
            .map(|i| {
                Document::builder()
                    .add_keyword("id", format!("{}", offset + i))
                    .add_text("body", if i % 2 == 0 { "even" } else { "odd" })
                    .add_numeric("num", offset + i)
                    .build()
            })
            .collect()
    }

    fn flush(storage: &MemoryStorage, name: &str, offset: i64) -> SegmentRecord {
        let codec = PlainCodec::new();
        let reader = SegmentReader::from_documents(name, &docs(offset)).unwrap();
        let mut info = codec.write_segment(storage, &reader).unwrap();
        codec.write_segment_info(storage, &mut info).unwrap();
        SegmentRecord::new(info)
    }

    #[test]
    fn test_segment_info_round_trip() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let reader = SegmentReader::from_documents("_0", &docs(0)).unwrap();
        let mut info = codec.write_segment(&storage, &reader).unwrap();
        info.diagnostics
            .insert("source".to_string(), "flush".to_string());
        codec.write_segment_info(&storage, &mut info).unwrap();

        assert!(info.files.contains("_0.si"));
        assert!(info.files.contains("_0.dat"));
        let read = codec.read_segment_info(&storage, "_0").unwrap();
        assert_eq!(read, info);
    }

    #[test]
    fn test_data_round_trip_with_updates() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let mut record = flush(&storage, "_1", 10);

        let mut updates = FieldUpdates::new();
        updates.set_numeric("num", 2, Some(99));
        updates.set_binary("blob", 0, Some(vec![1, 2, 3]));
        let generation = record.next_write_field_infos_gen();
        let file = codec
            .write_field_updates(&storage, &record, &updates, generation)
            .unwrap();
        assert_eq!(file, "_1_1.upd");
        record.advance_field_infos_gen(updates.fields());

        let reader = codec.open_reader(&storage, &record).unwrap();
        assert_eq!(reader.max_doc(), 3);
        assert_eq!(reader.postings(&Term::new("body", "even")), &[0, 2]);
        assert_eq!(reader.numeric_value("num", 0), Some(10));
        assert_eq!(reader.numeric_value("num", 2), Some(99));
        assert_eq!(reader.binary_value("blob", 0), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_live_docs_round_trip() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let mut record = flush(&storage, "_2", 0);

        let mut live = BitVec::from_elem(3, true);
        live.set(1, false);
        record.set_del_count(1).unwrap();
        let generation = record.next_write_del_gen();
        codec
            .write_live_docs(&storage, &record, &live, generation)
            .unwrap();
        record.advance_del_gen();

        assert_eq!(codec.read_live_docs(&storage, &record).unwrap(), live);

        // a commit that claims a different delete count is corrupt
        record.set_del_count(2).unwrap();
        assert!(matches!(
            codec.read_live_docs(&storage, &record),
            Err(GalleyError::CorruptState(_))
        ));
    }

    #[test]
    fn test_truncated_data_is_corrupt() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let record = flush(&storage, "_3", 0);
        storage.corrupt_file("_3.dat", 20).unwrap();
        assert!(matches!(
            codec.open_reader(&storage, &record),
            Err(GalleyError::CorruptState(_))
        ));
    }

    #[test]
    fn test_merge_drops_deleted_documents() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let first = flush(&storage, "_4", 0);
        let second = flush(&storage, "_5", 3);

        let first_reader = Arc::new(codec.open_reader(&storage, &first).unwrap());
        let second_reader = Arc::new(codec.open_reader(&storage, &second).unwrap());
        let mut live = BitVec::from_elem(3, true);
        live.set(0, false);
        let sources = vec![
            SegmentSnapshot::new(first_reader, Some(Arc::new(live)), 2),
            SegmentSnapshot::new(second_reader, None, 3),
        ];

        let merged = codec
            .merge(&storage, "_6", &sources, &|| Ok(()))
            .unwrap();
        assert_eq!(merged.info.doc_count, 5);
        assert_eq!(merged.doc_maps[0].get(0), None);
        assert_eq!(merged.doc_maps[0].get(1), Some(0));
        assert_eq!(merged.doc_maps[1].get(0), Some(2));

        let mut info = merged.info;
        codec.write_segment_info(&storage, &mut info).unwrap();
        let reader = codec
            .open_reader(&storage, &SegmentRecord::new(info))
            .unwrap();
        assert_eq!(reader.postings(&Term::new("id", "0")), &[] as &[u32]);
        assert_eq!(reader.postings(&Term::new("id", "3")), &[2]);
        assert_eq!(reader.numeric_value("num", 0), Some(1));
    }

    #[test]
    fn test_merge_observes_abort() {
        let storage = MemoryStorage::new_default();
        let codec = PlainCodec::new();
        let record = flush(&storage, "_7", 0);
        let reader = Arc::new(codec.open_reader(&storage, &record).unwrap());
        let sources = vec![SegmentSnapshot::new(reader, None, 3)];

        let result = codec.merge(&storage, "_8", &sources, &|| {
            Err(GalleyError::merge_aborted("merge is aborted"))
        });
        assert!(matches!(result, Err(GalleyError::MergeAborted(_))));
        assert!(!storage.file_exists("_8.dat"));
    }
}
