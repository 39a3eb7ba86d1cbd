//! Storage abstraction layer for Galley.
//!
//! The write engine never touches the file system directly. Everything goes
//! through the [`Storage`] trait: a flat namespace of write-once files plus
//! advisory locks and an explicit durability barrier ([`Storage::sync`]).
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - `sync` fsyncs each named file and then the directory
//! - Lock files created with `create_new`
//!
//! ## MemoryStorage
//! - In-memory storage for tests and temporary indexes
//! - Fault injection for sync, open and write failures
//! - Crash images that keep only what was synced
//!
//! # Example
//!
//! ```
//! use galley::storage::{StorageConfig, StorageFactory};
//! use galley::storage::memory::MemoryStorageConfig;
//! use std::io::Write;
//!
//! # fn main() -> galley::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! let mut output = storage.create_output("_0.dat")?;
//! output.write_all(b"postings")?;
//! output.close()?;
//! storage.sync(&["_0.dat".to_string()])?;
//! assert_eq!(storage.file_size("_0.dat")?, 8);
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::Result;

pub mod file;
pub mod memory;
pub mod structured;

/// A flat namespace of files with explicit durability.
///
/// Files are written once through [`StorageOutput`] and never modified in
/// place afterwards; there is no rename.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    ///
    /// Fails with [`GalleyError::FileNotFound`](crate::error::GalleyError::FileNotFound)
    /// when the file does not exist.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check whether a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is a `FileNotFound` error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    ///
    /// The listing may lag behind the actual state of the namespace on
    /// eventually consistent backends.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Make the named files durable. Returns only once the data survives a
    /// crash of the process or the machine.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// The advisory lock manager for this location.
    fn lock_manager(&self) -> Arc<dyn LockManager>;
}

/// A trait for storage input streams.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> u64;
}

/// A trait for storage output streams.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush buffered bytes and close the output. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// A lock manager for coordinating access to storage.
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Acquire a lock with the given name, failing with
    /// [`GalleyError::LockUnavailable`](crate::error::GalleyError::LockUnavailable)
    /// when it is already held.
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Check if a lock with the given name is held.
    fn lock_exists(&self, name: &str) -> bool;

    /// Forcibly release a lock held by someone else. Recovery tooling only.
    fn force_release(&self, name: &str) -> Result<()>;
}

/// A lock on a resource in storage. Dropping the lock releases it.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still valid.
    fn is_valid(&self) -> bool;
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut data = Vec::with_capacity(input.size() as usize);
    input.read_to_end(&mut data)?;
    Ok(data)
}

/// Configuration for storage backends.
///
/// # Example
///
/// ```
/// use galley::storage::StorageConfig;
/// use galley::storage::file::FileStorageConfig;
/// use galley::storage::memory::MemoryStorageConfig;
///
/// let config = StorageConfig::File(FileStorageConfig::new("/data/index"));
/// let config = StorageConfig::Memory(MemoryStorageConfig::default());
/// ```
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let storage = file::FileStorage::new(file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}
