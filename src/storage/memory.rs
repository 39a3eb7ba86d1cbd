//! In-memory storage implementation for testing and caching.
//!
//! Besides being a fast scratch backend, `MemoryStorage` is the harness the
//! commit protocol is tested against. It tracks which files have been
//! synced, so [`MemoryStorage::crash_image`] can model what survives a
//! process kill, and it can inject sync, open and write failures and hide
//! files from listings the way an eventually consistent store would.

use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{GalleyError, Result};
use crate::storage::{LockManager, Storage, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    synced: bool,
}

#[derive(Debug)]
struct MemoryState {
    files: HashMap<String, MemoryFile>,
    hidden: HashSet<String>,
    failing_opens: HashMap<String, usize>,
    failing_syncs: usize,
    write_quota: Option<u64>,
    bytes_written: u64,
    random_failures: Option<(f64, StdRng)>,
    sync_count: usize,
}

impl MemoryState {
    fn new(capacity: usize) -> Self {
        MemoryState {
            files: HashMap::with_capacity(capacity),
            hidden: HashSet::new(),
            failing_opens: HashMap::new(),
            failing_syncs: 0,
            write_quota: None,
            bytes_written: 0,
            random_failures: None,
            sync_count: 0,
        }
    }
}

/// An in-memory storage implementation.
///
/// Writes go straight into the shared file table, so a partially written
/// file is visible to readers exactly as it would be on a real file system.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    lock_manager: Arc<MemoryLockManager>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            state: Arc::new(Mutex::new(MemoryState::new(config.initial_capacity))),
            lock_manager: Arc::new(MemoryLockManager::new()),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        let state = self.state.lock();
        state.files.values().map(|f| f.data.len() as u64).sum()
    }

    /// Whether the file has been synced since it was last written.
    pub fn is_synced(&self, name: &str) -> bool {
        self.state
            .lock()
            .files
            .get(name)
            .map(|f| f.synced)
            .unwrap_or(false)
    }

    /// Number of successful `sync` calls.
    pub fn sync_count(&self) -> usize {
        self.state.lock().sync_count
    }

    /// Make the next `count` calls to `sync` fail.
    pub fn fail_next_sync(&self, count: usize) {
        self.state.lock().failing_syncs = count;
    }

    /// Make the next `times` attempts to open `name` fail with a transient
    /// I/O error.
    pub fn fail_open(&self, name: &str, times: usize) {
        self.state
            .lock()
            .failing_opens
            .insert(name.to_string(), times);
    }

    /// Fail writes with an `OutOfMemory` error once `bytes` more bytes have
    /// been written across all outputs.
    pub fn fail_writes_after(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.write_quota = Some(state.bytes_written + bytes);
    }

    /// Remove the write quota installed by [`fail_writes_after`](Self::fail_writes_after).
    pub fn clear_write_quota(&self) {
        self.state.lock().write_quota = None;
    }

    /// Fail each output write with probability `rate`.
    pub fn random_io_failure_rate(&self, rate: f64, seed: u64) {
        let mut state = self.state.lock();
        state.random_failures = if rate > 0.0 {
            Some((rate, StdRng::seed_from_u64(seed)))
        } else {
            None
        };
    }

    /// Omit `name` from listings while leaving it readable.
    pub fn hide_from_listing(&self, name: &str) {
        self.state.lock().hidden.insert(name.to_string());
    }

    pub fn unhide(&self, name: &str) {
        self.state.lock().hidden.remove(name);
    }

    /// Overwrite a file's bytes in place, bypassing the write-once rule.
    pub fn corrupt_file(&self, name: &str, offset: usize) -> Result<()> {
        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(name)
            .ok_or_else(|| GalleyError::file_not_found(name))?;
        if offset >= file.data.len() {
            return Err(GalleyError::invalid_argument(format!(
                "offset {offset} beyond end of {name}"
            )));
        }
        file.data[offset] ^= 0xFF;
        Ok(())
    }

    /// The storage as it would look after the process was killed now.
    ///
    /// Synced files survive intact. Files written since their last sync are
    /// torn: only the first half of their bytes survives. Locks and fault
    /// injection settings are not carried over.
    pub fn crash_image(&self) -> MemoryStorage {
        let state = self.state.lock();
        let mut image = MemoryState::new(state.files.len());
        for (name, file) in &state.files {
            let data = if file.synced {
                file.data.clone()
            } else {
                file.data[..file.data.len() / 2].to_vec()
            };
            image.files.insert(name.clone(), MemoryFile { data, synced: true });
        }
        MemoryStorage {
            state: Arc::new(Mutex::new(image)),
            lock_manager: Arc::new(MemoryLockManager::new()),
        }
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let mut state = self.state.lock();

        if let Some(remaining) = state.failing_opens.get_mut(name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(io::Error::other(format!("simulated open failure: {name}")).into());
        }

        let file = state
            .files
            .get(name)
            .ok_or_else(|| GalleyError::file_not_found(name))?;

        Ok(Box::new(MemoryInput::new(file.data.clone())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let mut state = self.state.lock();
        state.files.insert(
            name.to_string(),
            MemoryFile {
                data: Vec::new(),
                synced: false,
            },
        );

        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            position: 0,
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.state.lock().files.contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| GalleyError::file_not_found(name))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .files
            .keys()
            .filter(|name| !state.hidden.contains(*name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let state = self.state.lock();
        state
            .files
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| GalleyError::file_not_found(name))
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        let mut state = self.state.lock();

        if state.failing_syncs > 0 {
            state.failing_syncs -= 1;
            return Err(io::Error::other("simulated sync failure").into());
        }

        for name in names {
            if !state.files.contains_key(name) {
                return Err(GalleyError::file_not_found(name.clone()));
            }
        }
        for name in names {
            if let Some(file) = state.files.get_mut(name) {
                file.synced = true;
            }
        }
        state.sync_count += 1;
        Ok(())
    }

    fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.lock_manager.clone()
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> u64 {
        self.size
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    position: u64,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("Output is closed"));
        }

        let mut state = self.state.lock();

        if let Some(quota) = state.write_quota
            && state.bytes_written + buf.len() as u64 > quota
        {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("simulated resource exhaustion writing {}", self.name),
            ));
        }
        if let Some((rate, rng)) = state.random_failures.as_mut()
            && rng.random::<f64>() < *rate
        {
            return Err(io::Error::other(format!(
                "simulated random failure writing {}",
                self.name
            )));
        }

        state.bytes_written += buf.len() as u64;
        match state.files.get_mut(&self.name) {
            Some(file) => {
                file.data.extend_from_slice(buf);
                file.synced = false;
            }
            // Deleted while open; keep accepting bytes like an unlinked file.
            None => {}
        }
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A memory-based lock manager.
#[derive(Debug)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockManager {
    fn new() -> Self {
        MemoryLockManager {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl LockManager for MemoryLockManager {
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut held = self.held.lock();

        if !held.insert(name.to_string()) {
            return Err(GalleyError::lock_unavailable(format!(
                "lock obtain failed: {name}"
            )));
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            held: Arc::clone(&self.held),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.held.lock().contains(name)
    }

    fn force_release(&self, name: &str) -> Result<()> {
        self.held.lock().remove(name);
        Ok(())
    }
}

/// A memory-based lock implementation.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.held.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.held.lock().contains(&self.name)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
