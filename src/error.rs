//! Error types for the segdex library.
//!
//! Every fallible operation in segdex returns [`Result`], whose error type is
//! the closed [`SegdexError`] enum. Variants map onto the failure classes the
//! engine distinguishes: transient I/O, corruption, merge failures, lock
//! contention and contract violations.
//!
//! # Examples
//!
//! ```
//! use segdex::error::{SegdexError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(SegdexError::invalid_argument("max_buffered_docs must be >= 2"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for segdex operations.
#[derive(Error, Debug)]
pub enum SegdexError {
    /// I/O errors (file operations, disk full, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic index errors
    #[error("Index error: {0}")]
    Index(String),

    /// Checksum or format failure while reading an index file
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// No valid commit could be found in the directory
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Another writer holds the write lock
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The writer or reader was already closed
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// A merge was aborted before it could be installed
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// A merge failed; the source holds the underlying cause
    #[error("Merge {merge} failed: {source}")]
    MergeFailed {
        merge: String,
        #[source]
        source: Box<SegdexError>,
    },

    /// Errors reported by the codec layer itself
    #[error("Codec error: {0}")]
    Codec(String),

    /// API misuse (double release, prepare twice, ...)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Thread join errors
    #[error("Thread join error: {0}")]
    ThreadJoinError(String),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with SegdexError.
pub type Result<T> = std::result::Result<T, SegdexError>;

impl SegdexError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        SegdexError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SegdexError::Storage(msg.into())
    }

    /// Create a new corruption error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        SegdexError::CorruptIndex(msg.into())
    }

    /// Create a new index-not-found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        SegdexError::IndexNotFound(msg.into())
    }

    /// Create a new lock error.
    pub fn lock_obtain_failed<S: Into<String>>(msg: S) -> Self {
        SegdexError::LockObtainFailed(msg.into())
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        SegdexError::AlreadyClosed(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        SegdexError::MergeAborted(msg.into())
    }

    /// Wrap an error raised while executing the named merge.
    pub fn merge_failed<S: Into<String>>(merge: S, source: SegdexError) -> Self {
        SegdexError::MergeFailed {
            merge: merge.into(),
            source: Box::new(source),
        }
    }

    /// Create a new codec error.
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        SegdexError::Codec(msg.into())
    }

    /// Create a new illegal-state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        SegdexError::IllegalState(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SegdexError::InvalidArgument(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        SegdexError::Serialization(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        SegdexError::Other(msg.into())
    }

    /// Whether this error means a file failed its checksum or format checks.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SegdexError::CorruptIndex(_))
    }

    /// Whether this error is (or wraps) a cooperative merge abort.
    pub fn is_merge_aborted(&self) -> bool {
        match self {
            SegdexError::MergeAborted(_) => true,
            SegdexError::MergeFailed { source, .. } => source.is_merge_aborted(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for SegdexError {
    fn from(err: bincode::Error) -> Self {
        SegdexError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = SegdexError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = SegdexError::corrupt("checksum mismatch");
        assert_eq!(error.to_string(), "Corrupt index: checksum mismatch");
        assert!(error.is_corruption());

        let error = SegdexError::lock_obtain_failed("write.lock");
        assert_eq!(error.to_string(), "Lock obtain failed: write.lock");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = SegdexError::from(io_error);

        match error {
            SegdexError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_merge_failed_wraps_abort() {
        let error = SegdexError::merge_failed("_3", SegdexError::merge_aborted("rollback"));
        assert!(error.is_merge_aborted());
        assert_eq!(error.to_string(), "Merge _3 failed: Merge aborted: rollback");

        let error = SegdexError::merge_failed("_3", SegdexError::codec("bad postings"));
        assert!(!error.is_merge_aborted());
    }
}
