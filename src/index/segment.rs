//! Segment records.
//!
//! [`SegmentInfo`] describes what a flush or merge wrote and never changes
//! afterwards. [`SegmentCommitInfo`] pairs it with the mutable overlay that
//! tracks deletions and doc-values updates, each stored in its own
//! generation-numbered file so that an older commit keeps pointing at the
//! files it was written with.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::index::file_names::{self, DOC_VALUES_EXTENSION, LIVE_DOCS_EXTENSION};

/// Diagnostics key recording whether a segment came from a flush or a merge.
pub const SOURCE_KEY: &str = "source";

/// Diagnostics key recording when a segment was written.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Immutable description of a written segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Unique name, `_<radix36 counter>`.
    pub name: String,
    /// Random identity, distinguishes segments across indexes.
    pub id: Uuid,
    /// Number of documents including deleted ones.
    pub doc_count: u32,
    /// Name of the codec that wrote the segment.
    pub codec: String,
    /// Codec files of the segment.
    pub files: BTreeSet<String>,
    /// Total size of `files` in bytes.
    pub size_bytes: u64,
    /// Free-form diagnostics (source, timestamp, merge inputs, ...).
    pub diagnostics: BTreeMap<String, String>,
    /// Commit generation the writer was at when the segment was created.
    pub created_generation: u64,
}

impl SegmentInfo {
    /// Create a segment record with fresh identity and diagnostics.
    pub fn new(
        name: impl Into<String>,
        doc_count: u32,
        codec: impl Into<String>,
        files: BTreeSet<String>,
        size_bytes: u64,
        source: &str,
        created_generation: u64,
    ) -> Self {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert(SOURCE_KEY.to_string(), source.to_string());
        diagnostics.insert(TIMESTAMP_KEY.to_string(), Utc::now().to_rfc3339());

        SegmentInfo {
            name: name.into(),
            id: Uuid::new_v4(),
            doc_count,
            codec: codec.into(),
            files,
            size_bytes,
            diagnostics,
            created_generation,
        }
    }

    /// The `source` diagnostic (`flush` or `merge`).
    pub fn source(&self) -> Option<&str> {
        self.diagnostics.get(SOURCE_KEY).map(String::as_str)
    }
}

/// A segment as referenced by one manifest: the immutable record plus the
/// deletion and doc-values overlay at that point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommitInfo {
    pub info: Arc<SegmentInfo>,
    /// Number of deleted documents.
    pub del_count: u32,
    /// Generation of the live-docs file, 0 when nothing is deleted.
    pub del_gen: u64,
    /// Generation of the doc-values update file, 0 when there are none.
    pub dv_gen: u64,
    /// Generation the next live-docs write will use.
    pub next_write_del_gen: u64,
    /// Generation the next doc-values write will use.
    pub next_write_dv_gen: u64,
}

impl SegmentCommitInfo {
    /// Wrap a freshly written segment with an empty overlay.
    pub fn new(info: SegmentInfo) -> Self {
        Self::with_overlay(Arc::new(info), 0, 0, 0)
    }

    /// Rebuild a commit info from persisted overlay state.
    pub fn with_overlay(info: Arc<SegmentInfo>, del_count: u32, del_gen: u64, dv_gen: u64) -> Self {
        SegmentCommitInfo {
            info,
            del_count,
            del_gen,
            dv_gen,
            next_write_del_gen: del_gen + 1,
            next_write_dv_gen: dv_gen + 1,
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Number of documents that are not deleted.
    pub fn num_live_docs(&self) -> u32 {
        self.info.doc_count.saturating_sub(self.del_count)
    }

    /// Whether any document is deleted.
    pub fn has_deletions(&self) -> bool {
        self.del_gen > 0
    }

    /// Whether doc-values updates exist.
    pub fn has_doc_values_updates(&self) -> bool {
        self.dv_gen > 0
    }

    /// Live-docs file at the current generation.
    pub fn live_docs_file_name(&self) -> Option<String> {
        (self.del_gen > 0).then(|| {
            file_names::file_name_from_generation(&self.info.name, LIVE_DOCS_EXTENSION, self.del_gen)
        })
    }

    /// Doc-values update file at the current generation.
    pub fn doc_values_file_name(&self) -> Option<String> {
        (self.dv_gen > 0).then(|| {
            file_names::file_name_from_generation(&self.info.name, DOC_VALUES_EXTENSION, self.dv_gen)
        })
    }

    /// Live-docs file name the next write will produce.
    pub fn next_live_docs_file_name(&self) -> String {
        file_names::file_name_from_generation(
            &self.info.name,
            LIVE_DOCS_EXTENSION,
            self.next_write_del_gen,
        )
    }

    /// Doc-values file name the next write will produce.
    pub fn next_doc_values_file_name(&self) -> String {
        file_names::file_name_from_generation(
            &self.info.name,
            DOC_VALUES_EXTENSION,
            self.next_write_dv_gen,
        )
    }

    /// Make the pending live-docs generation current.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen += 1;
    }

    /// Make the pending doc-values generation current.
    pub fn advance_dv_gen(&mut self) {
        self.dv_gen = self.next_write_dv_gen;
        self.next_write_dv_gen += 1;
    }

    /// Skip a live-docs generation whose write failed or whose file exists.
    pub fn advance_next_write_del_gen(&mut self) {
        self.next_write_del_gen += 1;
    }

    /// Skip a doc-values generation whose write failed or whose file exists.
    pub fn advance_next_write_dv_gen(&mut self) {
        self.next_write_dv_gen += 1;
    }

    /// Every file needed to open this segment at this overlay.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file_name());
        files.extend(self.doc_values_file_name());
        files
    }

    /// Fraction of documents that are deleted.
    pub fn deletion_ratio(&self) -> f64 {
        if self.info.doc_count == 0 {
            0.0
        } else {
            self.del_count as f64 / self.info.doc_count as f64
        }
    }
}
