//! Structured file I/O for index metadata and segment data.
//!
//! [`StructWriter`] and [`StructReader`] encode little-endian primitives,
//! varints, strings and string collections while feeding every byte into a
//! running CRC-32. Files open with a header naming their codec and format
//! version and close with a footer carrying the checksum, so a reader can
//! tell a complete file from one whose write was interrupted.

use std::collections::{BTreeMap, BTreeSet};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{GalleyError, Result};
use crate::storage::{Storage, StorageOutput, read_all};
use crate::util::varint::{decode_u64, encoded_u64};

/// Leading magic of every codec header.
pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;

/// Leading magic of every footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Footer length: magic, algorithm id, checksum.
pub const FOOTER_LENGTH: usize = 16;

/// A structured file writer for binary data.
#[derive(Debug)]
pub struct StructWriter {
    name: String,
    output: Box<dyn StorageOutput>,
    hasher: Hasher,
    position: u64,
}

impl StructWriter {
    /// Create a new structured file writer over an open output.
    pub fn new(name: &str, output: Box<dyn StorageOutput>) -> Self {
        StructWriter {
            name: name.to_string(),
            output,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Create `name` in `storage` and wrap it.
    pub fn create(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(Self::new(name, storage.create_output(name)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.output.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encoded_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    pub fn write_string_set(&mut self, set: &BTreeSet<String>) -> Result<()> {
        self.write_u32(set.len() as u32)?;
        for value in set {
            self.write_string(value)?;
        }
        Ok(())
    }

    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_u32(map.len() as u32)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Write a sorted integer array using delta encoding.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            let delta = value.wrapping_sub(previous);
            self.write_varint(delta as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Write the codec header: magic, codec name, format version.
    pub fn write_header(&mut self, codec: &str, version: u32) -> Result<()> {
        self.write_u32(CODEC_MAGIC)?;
        self.write_string(codec)?;
        self.write_u32(version)
    }

    /// Write the footer. The checksum covers every byte before it.
    pub fn write_footer(&mut self) -> Result<()> {
        self.write_u32(FOOTER_MAGIC)?;
        self.write_u32(0)?;
        let checksum = self.checksum();
        self.output.write_u64::<LittleEndian>(checksum)?;
        self.position += 8;
        Ok(())
    }

    /// Write the bare trailing checksum used by pre-footer formats.
    pub fn write_legacy_checksum(&mut self) -> Result<()> {
        let checksum = self.checksum();
        self.output.write_u64::<LittleEndian>(checksum)?;
        self.position += 8;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Checksum of everything written so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }

    /// Flush and close the underlying output.
    pub fn close(mut self) -> Result<()> {
        self.output.close()
    }
}

/// A structured file reader for binary data.
///
/// The whole file is loaded up front. Running off the end of the data is
/// reported as corruption rather than as an I/O error: a well-formed file
/// always ends with its footer.
#[derive(Debug)]
pub struct StructReader {
    name: String,
    data: Vec<u8>,
    position: usize,
    hasher: Hasher,
}

impl StructReader {
    /// Create a reader over in-memory bytes.
    pub fn from_bytes(name: &str, data: Vec<u8>) -> Self {
        StructReader {
            name: name.to_string(),
            data,
            position: 0,
            hasher: Hasher::new(),
        }
    }

    /// Open `name` in `storage`.
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(Self::from_bytes(name, read_all(storage, name)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn take(&mut self, length: usize) -> Result<&[u8]> {
        if self.remaining() < length {
            return Err(GalleyError::corrupt(format!(
                "read past EOF: {} (wanted {length} bytes at {}, length {})",
                self.name,
                self.position,
                self.data.len()
            )));
        }
        let start = self.position;
        self.position += length;
        let slice = &self.data[start..self.position];
        self.hasher.update(slice);
        Ok(slice)
    }

    /// Read raw bytes without length prefix.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        Ok(self.take(length)?.to_vec())
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, length) = decode_u64(&self.data[self.position..])
            .map_err(|e| GalleyError::corrupt(format!("{e} in {}", self.name)))?;
        self.take(length)?;
        Ok(value)
    }

    /// Read raw bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        self.read_raw(length)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| GalleyError::corrupt(format!("invalid UTF-8 in {}: {e}", self.name)))
    }

    pub fn read_string_set(&mut self) -> Result<BTreeSet<String>> {
        let count = self.read_u32()?;
        let mut set = BTreeSet::new();
        for _ in 0..count {
            set.insert(self.read_string()?);
        }
        Ok(set)
    }

    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.read_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Read a delta-encoded integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        let count = self.read_varint()? as usize;
        if count > self.remaining() {
            return Err(GalleyError::corrupt(format!(
                "invalid array length {count} in {}",
                self.name
            )));
        }

        let mut values = Vec::with_capacity(count);
        let mut previous = 0u32;
        for _ in 0..count {
            let delta = self.read_varint()? as u32;
            previous = previous.wrapping_add(delta);
            values.push(previous);
        }

        Ok(values)
    }

    /// Validate the codec header and return the format version.
    pub fn check_header(&mut self, codec: &str, min_version: u32, max_version: u32) -> Result<u32> {
        let magic = self.read_u32()?;
        if magic != CODEC_MAGIC {
            return Err(GalleyError::corrupt(format!(
                "codec header mismatch: actual header={magic:#x} vs expected header={CODEC_MAGIC:#x} (resource: {})",
                self.name
            )));
        }
        self.check_header_no_magic(codec, min_version, max_version)
    }

    /// Validate the rest of a header whose magic was already consumed.
    pub fn check_header_no_magic(
        &mut self,
        codec: &str,
        min_version: u32,
        max_version: u32,
    ) -> Result<u32> {
        let actual = self.read_string()?;
        if actual != codec {
            return Err(GalleyError::corrupt(format!(
                "codec mismatch: actual codec={actual} vs expected codec={codec} (resource: {})",
                self.name
            )));
        }

        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(GalleyError::corrupt(format!(
                "unsupported format version {version} (needs to be between {min_version} and {max_version}) (resource: {})",
                self.name
            )));
        }
        Ok(version)
    }

    /// Validate the footer: it must be the last [`FOOTER_LENGTH`] bytes and
    /// its checksum must match everything before it.
    pub fn check_footer(&mut self) -> Result<()> {
        if self.remaining() != FOOTER_LENGTH {
            return Err(GalleyError::corrupt(format!(
                "misplaced codec footer (file truncated or extended?): {} bytes remain (resource: {})",
                self.remaining(),
                self.name
            )));
        }

        let magic = self.read_u32()?;
        if magic != FOOTER_MAGIC {
            return Err(GalleyError::corrupt(format!(
                "codec footer mismatch: actual footer={magic:#x} vs expected footer={FOOTER_MAGIC:#x} (resource: {})",
                self.name
            )));
        }

        let algorithm = self.read_u32()?;
        if algorithm != 0 {
            return Err(GalleyError::corrupt(format!(
                "codec footer mismatch: unknown algorithm id {algorithm} (resource: {})",
                self.name
            )));
        }

        self.verify_trailing_checksum()
    }

    /// Validate the bare trailing checksum of pre-footer formats.
    pub fn check_legacy_checksum(&mut self) -> Result<()> {
        if self.remaining() != 8 {
            return Err(GalleyError::corrupt(format!(
                "legacy checksum expected at end of file: {} bytes remain (resource: {})",
                self.remaining(),
                self.name
            )));
        }
        self.verify_trailing_checksum()
    }

    fn verify_trailing_checksum(&mut self) -> Result<()> {
        let expected = self.checksum();
        let actual = self.read_u64()?;
        if actual != expected {
            return Err(GalleyError::corrupt(format!(
                "checksum failed (hardware problem?): expected={expected:#x} actual={actual:#x} (resource: {})",
                self.name
            )));
        }
        Ok(())
    }

    /// Checksum of everything read so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.clone().finalize() as u64
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn written(build: impl FnOnce(&mut StructWriter)) -> (MemoryStorage, StructReader) {
        let storage = MemoryStorage::new_default();
        let mut writer = StructWriter::create(&storage, "test.bin").unwrap();
        build(&mut writer);
        writer.close().unwrap();
        let reader = StructReader::open(&storage, "test.bin").unwrap();
        (storage, reader)
    }

    #[test]
    fn test_struct_writer_reader() {
        let mut map = BTreeMap::new();
        map.insert("source".to_string(), "flush".to_string());
        let set: BTreeSet<String> = ["body".to_string(), "price".to_string()].into();

        let (_storage, mut reader) = written(|w| {
            w.write_header("segments", 2).unwrap();
            w.write_u8(7).unwrap();
            w.write_i64(-1).unwrap();
            w.write_varint(300).unwrap();
            w.write_string("_a").unwrap();
            w.write_string_set(&set).unwrap();
            w.write_string_map(&map).unwrap();
            w.write_footer().unwrap();
        });

        assert_eq!(reader.check_header("segments", 0, 2).unwrap(), 2);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_i64().unwrap(), -1);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_string().unwrap(), "_a");
        assert_eq!(reader.read_string_set().unwrap(), set);
        assert_eq!(reader.read_string_map().unwrap(), map);
        reader.check_footer().unwrap();
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_delta_compression() {
        let values = vec![1, 5, 10, 15, 100, 1000];
        let (_storage, mut reader) = written(|w| {
            w.write_delta_compressed_u32s(&values).unwrap();
            w.write_delta_compressed_u32s(&[]).unwrap();
        });

        assert_eq!(reader.read_delta_compressed_u32s().unwrap(), values);
        assert!(reader.read_delta_compressed_u32s().unwrap().is_empty());
    }

    #[test]
    fn test_missing_footer_is_corrupt() {
        let (_storage, mut reader) = written(|w| {
            w.write_header("segments", 2).unwrap();
            w.write_u32(42).unwrap();
        });

        reader.check_header("segments", 0, 2).unwrap();
        reader.read_u32().unwrap();
        assert!(matches!(
            reader.check_footer(),
            Err(GalleyError::CorruptState(_))
        ));
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let storage = MemoryStorage::new_default();
        let mut writer = StructWriter::create(&storage, "x.bin").unwrap();
        writer.write_header("segments", 2).unwrap();
        writer.write_u64(99).unwrap();
        writer.write_footer().unwrap();
        writer.close().unwrap();

        let header_len = 4 + 1 + "segments".len() + 4;
        storage.corrupt_file("x.bin", header_len).unwrap();

        let mut reader = StructReader::open(&storage, "x.bin").unwrap();
        reader.check_header("segments", 0, 2).unwrap();
        reader.read_u64().unwrap();
        let err = reader.check_footer().unwrap_err();
        assert!(err.to_string().contains("checksum failed"));
    }

    #[test]
    fn test_truncated_read_is_corrupt() {
        let mut reader = StructReader::from_bytes("short.bin", vec![1, 2]);
        assert!(matches!(reader.read_u32(), Err(GalleyError::CorruptState(_))));
    }

    #[test]
    fn test_header_mismatches() {
        let (_storage, mut reader) = written(|w| w.write_header("segments", 5).unwrap());
        let err = reader.check_header("segments", 0, 2).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 5"));

        let (_storage, mut reader) = written(|w| w.write_header("other", 1).unwrap());
        let err = reader.check_header("segments", 0, 2).unwrap_err();
        assert!(err.to_string().contains("codec mismatch"));
    }

    #[test]
    fn test_legacy_checksum() {
        let (_storage, mut reader) = written(|w| {
            w.write_u32(11).unwrap();
            w.write_legacy_checksum().unwrap();
        });

        assert_eq!(reader.read_u32().unwrap(), 11);
        reader.check_legacy_checksum().unwrap();
    }
}
