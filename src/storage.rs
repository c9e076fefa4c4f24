//! Storage abstraction layer for segdex.
//!
//! Every index file goes through the [`Storage`] trait, so the commit, merge
//! and deletion machinery never touches the filesystem directly. Two backends
//! ship with the crate:
//!
//! - [`file::FileStorage`]: one directory on disk, fsync of files and of the
//!   directory entry, OS advisory lock on `write.lock`.
//! - [`memory::MemoryStorage`]: in-memory files with unsynced-data tracking
//!   and fault injection (crash, disk full, per-operation failures) for tests.
//!
//! # Example
//!
//! ```
//! use segdex::storage::{StorageConfig, StorageFactory};
//!
//! # fn main() -> segdex::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::default())?;
//! assert!(storage.list_files()?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::sync::Arc;

use crate::error::{Result, SegdexError};

pub mod file;
pub mod memory;
pub mod structured;

/// A trait for storage backends that hold the files of one index.
///
/// Names are flat (no sub-directories). Implementations must be usable from
/// several threads at once: merges write their outputs while the writer
/// flushes and readers open segment files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    ///
    /// # Example
    ///
    /// ```
    /// use segdex::storage::memory::{MemoryStorage, MemoryStorageConfig};
    /// use segdex::storage::Storage;
    /// use std::io::{Read, Write};
    ///
    /// # fn main() -> segdex::error::Result<()> {
    /// let storage = MemoryStorage::new(MemoryStorageConfig::default());
    ///
    /// let mut output = storage.create_output("_0.fdt")?;
    /// output.write_all(b"test data")?;
    /// output.close()?;
    ///
    /// let mut input = storage.open_input("_0.fdt")?;
    /// let mut buffer = Vec::new();
    /// input.read_to_end(&mut buffer)?;
    /// assert_eq!(buffer, b"test data");
    /// # Ok(())
    /// # }
    /// ```
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file of that name.
    ///
    /// The file becomes visible to [`Storage::open_input`] once the output is
    /// closed. It is not durable until [`Storage::sync`] has been called.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file succeeds.
    ///
    /// Backends that emulate platforms which refuse to delete open files
    /// return an error here; callers are expected to retry later.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the content of the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Make directory metadata (creations, renames, deletions) durable.
    fn sync_metadata(&self) -> Result<()>;

    /// Obtain an exclusive lock. Fails immediately with
    /// [`SegdexError::LockObtainFailed`] if the lock is already held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Close the storage. Further operations fail.
    fn close(&self) -> Result<()>;

    /// Read a whole file into memory.
    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut buffer = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream, publishing its content.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }
}

/// An exclusive lock on a resource in storage. Dropping the lock releases it.
pub trait StorageLock: Send + Sync + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock. Releasing twice is a no-op.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Where an index lives.
///
/// ```
/// use segdex::storage::StorageConfig;
/// use segdex::storage::file::FileStorageConfig;
/// use segdex::storage::memory::MemoryStorageConfig;
///
/// let on_disk = StorageConfig::File(FileStorageConfig::new("/data/index"));
/// let in_memory = StorageConfig::Memory(MemoryStorageConfig::default());
/// ```
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// A directory on disk.
    File(file::FileStorageConfig),

    /// Process memory; lost on drop.
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// Builds a backend from a [`StorageConfig`].
pub struct StorageFactory;

impl StorageFactory {
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match config {
            StorageConfig::Memory(config) => Arc::new(memory::MemoryStorage::new(config)),
            StorageConfig::File(config) => {
                let directory = config.path.clone();
                Arc::new(file::FileStorage::new(directory, config)?)
            }
        };
        Ok(storage)
    }
}

/// Failures raised by the backends themselves, before any index logic.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("no such file: {0}")]
    FileNotFound(String),

    #[error("lock {0} is held by another writer")]
    LockHeld(String),

    #[error("storage is closed")]
    Closed,
}

impl From<StorageError> for SegdexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockHeld(_) => SegdexError::lock_obtain_failed(err.to_string()),
            StorageError::Closed => SegdexError::already_closed(err.to_string()),
            StorageError::FileNotFound(_) => SegdexError::storage(err.to_string()),
        }
    }
}
