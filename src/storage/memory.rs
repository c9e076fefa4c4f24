//! In-memory storage implementation for testing.
//!
//! Besides holding files in memory, [`MemoryStorage`] models durability: a
//! file is only durable once it has been passed to [`Storage::sync`].
//! [`MemoryStorage::crash`] throws away everything that is not durable, which
//! is how the crash-safety tests simulate a power loss. Failures can be
//! injected per operation with [`FailPoint`], at random with
//! [`MemoryStorage::set_random_failure_rate`], or by capping the total size
//! with [`MemoryStorage::set_max_size`].

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Result, SegdexError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageConfig {
    /// Refuse to delete files that have open inputs, like Windows does.
    pub prevent_delete_open_files: bool,

    /// Total size cap in bytes. Writes beyond it fail as "disk full".
    pub max_size_bytes: Option<u64>,
}

/// Storage operations that can be targeted by a [`FailPoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    CreateOutput,
    Write,
    Sync,
    Rename,
    Delete,
    OpenInput,
}

/// An injected failure.
///
/// The fail point matches operations of kind `op` on files whose name starts
/// with `name_prefix` (every file when `None`). The first `skip` matching
/// calls go through; the next one fails. A sticky fail point keeps failing
/// until cleared, a one-shot point is removed after it fires.
#[derive(Debug, Clone)]
pub struct FailPoint {
    pub op: StorageOp,
    pub name_prefix: Option<String>,
    pub skip: usize,
    pub sticky: bool,
}

impl FailPoint {
    /// A one-shot failure on the next matching operation.
    pub fn once(op: StorageOp, name_prefix: impl Into<String>) -> Self {
        FailPoint {
            op,
            name_prefix: Some(name_prefix.into()),
            skip: 0,
            sticky: false,
        }
    }

    /// A failure on every matching operation until cleared.
    pub fn always(op: StorageOp, name_prefix: impl Into<String>) -> Self {
        FailPoint {
            op,
            name_prefix: Some(name_prefix.into()),
            skip: 0,
            sticky: true,
        }
    }

    /// Let `skip` matching operations through before failing.
    pub fn after(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    fn matches(&self, op: StorageOp, name: &str) -> bool {
        self.op == op
            && self
                .name_prefix
                .as_deref()
                .is_none_or(|prefix| name.starts_with(prefix))
    }
}

#[derive(Debug)]
struct MemoryFile {
    data: Arc<Vec<u8>>,
    synced: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, MemoryFile>,
    open_inputs: HashMap<String, usize>,
    fail_points: Vec<FailPoint>,
    random_failure_rate: f64,
    max_size_bytes: Option<u64>,
    prevent_delete_open_files: bool,
    /// Lock name -> token of the current holder.
    locks: HashMap<String, u64>,
    next_lock_token: u64,
    injected_failures: u64,
}

impl MemoryState {
    fn check_failure(&mut self, op: StorageOp, name: &str) -> std::io::Result<()> {
        let mut fire = None;
        for (i, point) in self.fail_points.iter_mut().enumerate() {
            if point.matches(op, name) {
                if point.skip > 0 {
                    point.skip -= 1;
                } else {
                    fire = Some(i);
                    break;
                }
            }
        }

        if let Some(i) = fire {
            if !self.fail_points[i].sticky {
                self.fail_points.remove(i);
            }
            self.injected_failures += 1;
            return Err(std::io::Error::other(format!(
                "injected failure: {op:?} {name}"
            )));
        }

        if self.random_failure_rate > 0.0
            && matches!(
                op,
                StorageOp::CreateOutput | StorageOp::Write | StorageOp::Sync | StorageOp::Rename
            )
            && rand::rng().random_bool(self.random_failure_rate.clamp(0.0, 1.0))
        {
            self.injected_failures += 1;
            return Err(std::io::Error::other(format!(
                "random injected failure: {op:?} {name}"
            )));
        }

        Ok(())
    }

    fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.data.len() as u64).sum()
    }
}

/// An in-memory storage implementation.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        let state = MemoryState {
            prevent_delete_open_files: config.prevent_delete_open_files,
            max_size_bytes: config.max_size_bytes,
            ..Default::default()
        };
        MemoryStorage {
            state: Arc::new(Mutex::new(state)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed.into())
        } else {
            Ok(())
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size()
    }

    /// Names of files that would be lost by a crash right now.
    pub fn unsynced_files(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .files
            .iter()
            .filter(|(_, f)| !f.synced)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Simulate a power loss: every file that was never synced disappears and
    /// every lock is dropped. The storage is reopened afterwards.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        state.files.retain(|_, f| f.synced);
        state.open_inputs.clear();
        state.locks.clear();
        self.closed.store(false, Ordering::Release);
    }

    /// Install a fail point.
    pub fn fail_on(&self, point: FailPoint) {
        self.state.lock().fail_points.push(point);
    }

    /// Remove every fail point and disable random failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_points.clear();
        state.random_failure_rate = 0.0;
    }

    /// Fail write-side operations with the given probability.
    pub fn set_random_failure_rate(&self, rate: f64) {
        self.state.lock().random_failure_rate = rate;
    }

    /// Cap the total size of all files. `None` removes the cap.
    pub fn set_max_size(&self, max_size_bytes: Option<u64>) {
        self.state.lock().max_size_bytes = max_size_bytes;
    }

    /// Toggle Windows-like refusal to delete files with open inputs.
    pub fn set_prevent_delete_open_files(&self, prevent: bool) {
        self.state.lock().prevent_delete_open_files = prevent;
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u64 {
        self.state.lock().injected_failures
    }

    /// Overwrite one byte of a file, keeping its synced state.
    pub fn corrupt_file(&self, name: &str, offset: usize) -> Result<()> {
        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let mut data = file.data.as_ref().clone();
        if offset >= data.len() {
            return Err(SegdexError::invalid_argument(format!(
                "offset {offset} beyond end of {name}"
            )));
        }
        data[offset] ^= 0xFF;
        file.data = Arc::new(data);
        Ok(())
    }

    /// Truncate a file to `len` bytes, keeping its synced state.
    pub fn truncate_file(&self, name: &str, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        let mut data = file.data.as_ref().clone();
        data.truncate(len);
        file.data = Arc::new(data);
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new_default()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let mut state = self.state.lock();
        state.check_failure(StorageOp::OpenInput, name)?;
        let data = state
            .files
            .get(name)
            .map(|f| Arc::clone(&f.data))
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        *state.open_inputs.entry(name.to_string()).or_insert(0) += 1;

        Ok(Box::new(MemoryInput {
            name: name.to_string(),
            size: data.len() as u64,
            cursor: Cursor::new(data),
            state: Arc::clone(&self.state),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;
        self.state.lock().check_failure(StorageOp::CreateOutput, name)?;

        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.state.lock().files.contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        state.check_failure(StorageOp::Delete, name)?;
        if state.prevent_delete_open_files
            && state.open_inputs.get(name).copied().unwrap_or(0) > 0
        {
            return Err(SegdexError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot delete open file: {name}"),
            )));
        }
        state.files.remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let state = self.state.lock();
        let mut names: Vec<String> = state.files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let state = self.state.lock();
        state
            .files
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        state.check_failure(StorageOp::Rename, old_name)?;
        let file = state
            .files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        state.files.insert(new_name.to_string(), file);
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.check_closed()?;

        let mut state = self.state.lock();
        for name in names {
            state.check_failure(StorageOp::Sync, name)?;
            match state.files.get_mut(name) {
                Some(file) => file.synced = true,
                None => return Err(StorageError::FileNotFound(name.clone()).into()),
            }
        }
        Ok(())
    }

    fn sync_metadata(&self) -> Result<()> {
        self.check_closed()
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.check_closed()?;

        let mut state = self.state.lock();
        if state.locks.contains_key(name) {
            return Err(StorageError::LockHeld(name.to_string()).into());
        }
        state.next_lock_token += 1;
        let token = state.next_lock_token;
        state.locks.insert(name.to_string(), token);

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            token,
            released: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    name: String,
    cursor: Cursor<Arc<Vec<u8>>>,
    size: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.cursor.get_ref().as_slice();
        let pos = (self.cursor.position() as usize).min(data.len());
        let n = (data.len() - pos).min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.cursor.set_position((pos + n) as u64);
        Ok(n)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.size.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.cursor.position().checked_add_signed(offset),
        };
        match new_pos {
            Some(p) => {
                self.cursor.set_position(p);
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            )),
        }
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

impl Drop for MemoryInput {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(count) = state.open_inputs.get_mut(&self.name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.open_inputs.remove(&self.name);
            }
        }
    }
}

/// A memory-based output implementation. Content is published on close.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let mut state = self.state.lock();
        state.check_failure(StorageOp::Write, &self.name)?;
        if let Some(max) = state.max_size_bytes {
            let existing = state.files.get(&self.name).map_or(0, |f| f.data.len() as u64);
            let after = state.total_size() - existing + (self.buffer.len() + buf.len()) as u64;
            if after > max {
                state.injected_failures += 1;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    format!("disk full writing {}", self.name),
                ));
            }
        }
        drop(state);

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.close()?;
        let mut state = self.state.lock();
        state.check_failure(StorageOp::Sync, &self.name)?;
        if let Some(file) = state.files.get_mut(&self.name) {
            file.synced = true;
        }
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let mut state = self.state.lock();
            state.files.insert(
                self.name.clone(),
                MemoryFile {
                    data: Arc::new(std::mem::take(&mut self.buffer)),
                    synced: false,
                },
            );
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // An abandoned output still leaves its partial content behind.
        let _ = self.close();
    }
}

/// A lock held on a [`MemoryStorage`].
#[derive(Debug)]
struct MemoryLock {
    name: String,
    token: u64,
    released: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            let mut state = self.state.lock();
            // A crash may have cleared the lock and someone else may hold it now.
            if state.locks.get(&self.name) == Some(&self.token) {
                state.locks.remove(&self.name);
            }
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.state.lock().locks.get(&self.name) == Some(&self.token)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
