//! Index module for segdex.
//!
//! This module holds the segment commit, merge and deletion engine: segment
//! records and commit manifests, the reference-counting file deleter, deletion
//! policies and snapshots, the two-phase commit path, merge selection and
//! scheduling, and the writer and readers built on top of them.

pub mod buffer;
pub mod check;
pub mod codec;
pub mod config;
pub mod deleter;
pub mod deletion_policy;
pub mod doc_values;
pub mod file_names;
pub mod live_docs;
pub mod manifest;
pub mod merge;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod reader;
pub mod reader_pool;
pub mod segment;
pub mod snapshot;
pub mod two_phase;
pub mod writer;

// Re-export commonly used types
pub use check::{CheckIndex, CheckIndexStatus};
pub use codec::{Codec, StoredFieldsCodec};
pub use config::{IndexWriterConfig, MergeExceptionMode, OpenMode};
pub use deleter::IndexFileDeleter;
pub use deletion_policy::{
    IndexCommit, IndexDeletionPolicy, KeepAllDeletionPolicy, KeepOnlyLastCommitDeletionPolicy,
};
pub use manifest::SegmentInfos;
pub use merge::{DocMap, MergeSpecification, MergeTrigger, OneMerge};
pub use merge_policy::{LogDocMergePolicy, MergePolicy, NoMergePolicy, TieredMergePolicy};
pub use merge_scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeScheduler,
    MergeSchedulerConfig, SerialMergeScheduler,
};
pub use reader::{DirectoryReader, SegmentReader};
pub use segment::{SegmentCommitInfo, SegmentInfo};
pub use snapshot::{PersistentSnapshotDeletionPolicy, Snapshot, SnapshotDeletionPolicy, SnapshotRegistry};
pub use two_phase::{TwoPhaseCommit, TwoPhaseCommitCoordinator, TwoPhaseCommitError};
pub use writer::IndexWriter;
