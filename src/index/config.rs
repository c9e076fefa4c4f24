//! Writer configuration.

use std::sync::Arc;

use crate::error::{Result, SegdexError};
use crate::index::codec::{Codec, StoredFieldsCodec};
use crate::index::deletion_policy::{IndexCommit, IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy};
use crate::index::merge_policy::{MergePolicy, TieredMergePolicy};
use crate::index::merge_scheduler::MergeSchedulerConfig;

/// How a writer treats an existing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Start a new, empty index, superseding whatever is there.
    Create,
    /// Open an existing index; fail if there is none.
    Append,
    /// Open an existing index or create one.
    #[default]
    CreateOrAppend,
}

/// What happens to a background merge failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeExceptionMode {
    /// Log it and drop it.
    Suppress,
    /// Return it from the next writer operation.
    #[default]
    Propagate,
}

/// Configuration for [`IndexWriter`](crate::index::writer::IndexWriter).
#[derive(Debug, Clone)]
pub struct IndexWriterConfig {
    /// How an existing index is treated.
    pub open_mode: OpenMode,

    /// Flush after this many buffered documents. `None` disables the trigger.
    pub max_buffered_docs: Option<usize>,

    /// Flush when buffered documents use this much memory (in MB). `None`
    /// disables the trigger.
    pub ram_buffer_size_mb: Option<f64>,

    /// Apply buffered deletes after this many delete terms. `None` disables
    /// the trigger.
    pub max_buffered_delete_terms: Option<usize>,

    /// Selects merges.
    pub merge_policy: Arc<dyn MergePolicy>,

    /// Runs merges.
    pub merge_scheduler: MergeSchedulerConfig,

    /// What happens to background merge failures.
    pub merge_exception_mode: MergeExceptionMode,

    /// Decides which commits to keep.
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,

    /// Writes and reads segment files.
    pub codec: Arc<dyn Codec>,

    /// Commit pending changes when the writer is closed.
    pub commit_on_close: bool,

    /// Open the writer on this commit instead of the latest one.
    pub index_commit: Option<IndexCommit>,

    /// Keep segment cores loaded between operations.
    pub reader_pooling: bool,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            open_mode: OpenMode::CreateOrAppend,
            max_buffered_docs: None,
            ram_buffer_size_mb: Some(16.0),
            max_buffered_delete_terms: None,
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: MergeSchedulerConfig::default(),
            merge_exception_mode: MergeExceptionMode::Propagate,
            deletion_policy: Arc::new(KeepOnlyLastCommitDeletionPolicy),
            codec: Arc::new(StoredFieldsCodec::new()),
            commit_on_close: true,
            index_commit: None,
            reader_pooling: true,
        }
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn with_max_buffered_docs(mut self, max: Option<usize>) -> Self {
        self.max_buffered_docs = max;
        self
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, max: Option<usize>) -> Self {
        self.max_buffered_delete_terms = max;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: MergeSchedulerConfig) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_merge_exception_mode(mut self, mode: MergeExceptionMode) -> Self {
        self.merge_exception_mode = mode;
        self
    }

    pub fn with_deletion_policy(mut self, policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.commit_on_close = commit_on_close;
        self
    }

    pub fn with_index_commit(mut self, commit: Option<IndexCommit>) -> Self {
        self.index_commit = commit;
        self
    }

    pub fn with_reader_pooling(mut self, pooling: bool) -> Self {
        self.reader_pooling = pooling;
        self
    }

    /// RAM trigger in bytes.
    pub fn ram_buffer_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }

    /// Check the configuration for values the writer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_docs.is_none() && self.ram_buffer_size_mb.is_none() {
            return Err(SegdexError::invalid_argument(
                "at least one of max_buffered_docs and ram_buffer_size_mb must be enabled",
            ));
        }
        if let Some(max) = self.max_buffered_docs {
            if max < 2 {
                return Err(SegdexError::invalid_argument(format!(
                    "max_buffered_docs must be at least 2, got {max}"
                )));
            }
        }
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0 && mb.is_finite()) {
                return Err(SegdexError::invalid_argument(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        }
        if let Some(max) = self.max_buffered_delete_terms {
            if max < 1 {
                return Err(SegdexError::invalid_argument(
                    "max_buffered_delete_terms must be at least 1",
                ));
            }
        }
        if self.index_commit.is_some() && self.open_mode == OpenMode::Create {
            return Err(SegdexError::invalid_argument(
                "index_commit cannot be combined with OpenMode::Create",
            ));
        }
        Ok(())
    }
}
