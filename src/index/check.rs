//! Consistency checker.
//!
//! [`CheckIndex`] opens the latest commit and verifies every segment: files
//! present, core decodable, live docs consistent with the recorded delete
//! count, postings in range. Segments are checked in parallel. A broken
//! index can be repaired with [`CheckIndex::fix_index`], which commits a new
//! generation without the broken segments (their documents are lost).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegdexError};
use crate::index::codec::{Codec, StoredFieldsCodec};
use crate::index::file_names::{self, WRITE_LOCK_NAME};
use crate::index::manifest::SegmentInfos;
use crate::index::reader::{IndexReader, SegmentReader};
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Storage;

/// Outcome of checking one segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStatus {
    pub name: String,
    pub codec: String,
    pub doc_count: u32,
    pub del_count: u32,
    pub size_bytes: u64,
    pub files: Vec<String>,
    pub diagnostics: BTreeMap<String, String>,
    /// Distinct terms with at least one live document.
    pub term_count: u64,
    /// Live documents whose stored fields could be read.
    pub stored_doc_count: u64,
    pub doc_values_updates: usize,
    /// First problem found, `None` if the segment is sound.
    pub error: Option<String>,
}

impl SegmentStatus {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`CheckIndex::check_index`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckIndexStatus {
    /// No problem was found.
    pub clean: bool,
    /// No readable commit exists.
    pub missing_segments: bool,
    pub segments_file_name: Option<String>,
    pub generation: u64,
    pub user_data: BTreeMap<String, String>,
    pub num_segments: usize,
    /// Live documents over every checked segment.
    pub total_docs: u64,
    pub term_count: u64,
    pub stored_doc_count: u64,
    pub segments: Vec<SegmentStatus>,
    /// Segments with an error; [`CheckIndex::fix_index`] drops these.
    pub broken_segments: Vec<String>,
    /// Documents lost if the broken segments are dropped.
    pub lost_docs: u64,
    /// Whether only part of the index was checked.
    pub partial: bool,
}

/// Checks, and optionally repairs, an index.
#[derive(Debug)]
pub struct CheckIndex {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    only_segments: Option<BTreeSet<String>>,
}

impl CheckIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        CheckIndex {
            storage,
            codec: Arc::new(StoredFieldsCodec::new()),
            only_segments: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Restrict the check to the named segments.
    pub fn with_segments<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_segments = Some(segments.into_iter().map(Into::into).collect());
        self
    }

    /// Check the latest commit.
    ///
    /// Problems are reported in the status, not as errors. An error is only
    /// returned when storage itself cannot be listed.
    pub fn check_index(&self) -> Result<CheckIndexStatus> {
        let infos = match SegmentInfos::read_latest(self.storage.as_ref()) {
            Ok(infos) => infos,
            Err(e) if matches!(e, SegdexError::IndexNotFound(_)) || e.is_corruption() => {
                warn!("no readable commit: {e}");
                return Ok(CheckIndexStatus {
                    missing_segments: true,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let selected: Vec<&SegmentCommitInfo> = infos
            .segments()
            .iter()
            .filter(|s| {
                self.only_segments
                    .as_ref()
                    .is_none_or(|only| only.contains(s.name()))
            })
            .collect();

        let segments: Vec<SegmentStatus> = selected
            .par_iter()
            .map(|info| self.check_segment(info))
            .collect();

        let broken_segments: Vec<String> = segments
            .iter()
            .filter(|s| !s.is_ok())
            .map(|s| s.name.clone())
            .collect();
        let lost_docs = segments
            .iter()
            .filter(|s| !s.is_ok())
            .map(|s| (s.doc_count - s.del_count) as u64)
            .sum();
        let healthy = || segments.iter().filter(|s| s.is_ok());

        let status = CheckIndexStatus {
            clean: broken_segments.is_empty(),
            missing_segments: false,
            segments_file_name: infos.segments_file_name(),
            generation: infos.generation,
            user_data: infos.user_data.clone(),
            num_segments: infos.len(),
            total_docs: healthy().map(|s| (s.doc_count - s.del_count) as u64).sum(),
            term_count: healthy().map(|s| s.term_count).sum(),
            stored_doc_count: healthy().map(|s| s.stored_doc_count).sum(),
            broken_segments,
            lost_docs,
            partial: self.only_segments.is_some(),
            segments,
        };
        if status.clean {
            info!(
                "index at generation {} is clean: {} segments, {} docs",
                status.generation, status.num_segments, status.total_docs
            );
        } else {
            warn!(
                "index at generation {} has {} broken segments ({} docs)",
                status.generation,
                status.broken_segments.len(),
                status.lost_docs
            );
        }
        Ok(status)
    }

    /// Check one segment of the latest commit.
    pub fn check_segment(&self, info: &SegmentCommitInfo) -> SegmentStatus {
        let mut status = SegmentStatus {
            name: info.name().to_string(),
            codec: info.info.codec.clone(),
            doc_count: info.info.doc_count,
            del_count: info.del_count,
            size_bytes: info.info.size_bytes,
            files: info.files().into_iter().collect(),
            diagnostics: info.info.diagnostics.clone(),
            ..Default::default()
        };
        if let Err(e) = self.verify_segment(info, &mut status) {
            warn!("segment {} is broken: {e}", info.name());
            status.error = Some(e.to_string());
        }
        status
    }

    fn verify_segment(&self, info: &SegmentCommitInfo, status: &mut SegmentStatus) -> Result<()> {
        for file in &status.files {
            if !self.storage.file_exists(file) {
                return Err(SegdexError::corrupt(format!("file {file} is missing")));
            }
        }

        let reader = SegmentReader::open(self.storage.as_ref(), self.codec.as_ref(), info)?;
        let max_doc = reader.core().max_doc();
        if max_doc != info.info.doc_count {
            return Err(SegdexError::corrupt(format!(
                "segment holds {max_doc} docs, manifest says {}",
                info.info.doc_count
            )));
        }
        let deleted = reader.live_docs().num_deleted();
        if deleted != info.del_count {
            return Err(SegdexError::corrupt(format!(
                "live docs mark {deleted} deleted, manifest says {}",
                info.del_count
            )));
        }

        for (term, docs) in &reader.core().postings {
            if docs.windows(2).any(|w| w[0] >= w[1]) {
                return Err(SegdexError::corrupt(format!("postings of {term} are not ascending")));
            }
            if docs.last().is_some_and(|d| *d >= max_doc) {
                return Err(SegdexError::corrupt(format!("postings of {term} exceed max doc")));
            }
        }
        status.term_count = reader.live_terms().count() as u64;

        for doc in reader.live_docs().live_iter() {
            if reader.document(doc as u64)?.is_none() {
                return Err(SegdexError::corrupt(format!("stored fields of doc {doc} are missing")));
            }
            status.stored_doc_count += 1;
        }
        status.doc_values_updates = reader.doc_values().len();
        if status.stored_doc_count != reader.num_docs() {
            return Err(SegdexError::corrupt(format!(
                "read {} stored docs, expected {}",
                status.stored_doc_count,
                reader.num_docs()
            )));
        }
        Ok(())
    }

    /// Commit a new generation without the segments `status` found broken.
    ///
    /// Takes the write lock, so no writer may be open. Refuses partial
    /// checks. Returns the new generation, or the current one if there was
    /// nothing to fix.
    pub fn fix_index(&self, status: &CheckIndexStatus) -> Result<u64> {
        if status.partial {
            return Err(SegdexError::illegal_state("cannot fix an index from a partial check"));
        }
        if status.missing_segments {
            return Err(SegdexError::index_not_found("no readable commit to fix"));
        }
        let mut lock = self.storage.obtain_lock(WRITE_LOCK_NAME)?;
        let result = self.write_fixed_commit(status);
        let released = lock.release();
        let generation = result?;
        released?;
        Ok(generation)
    }

    fn write_fixed_commit(&self, status: &CheckIndexStatus) -> Result<u64> {
        let mut infos = SegmentInfos::read_latest(self.storage.as_ref())?;
        if infos.generation != status.generation {
            return Err(SegdexError::illegal_state(format!(
                "index moved from generation {} to {} since it was checked",
                status.generation, infos.generation
            )));
        }
        if status.broken_segments.is_empty() {
            return Ok(infos.generation);
        }
        for name in &status.broken_segments {
            infos.remove(name);
        }
        infos.changed();

        let generation = infos.prepare_commit(self.storage.as_ref())?;
        if let Err(e) = infos.finish_commit(self.storage.as_ref(), generation) {
            if !self
                .storage
                .file_exists(&file_names::segments_file_name(generation))
            {
                SegmentInfos::rollback_commit(self.storage.as_ref(), generation);
                return Err(e);
            }
        }
        if let Err(e) = SegmentInfos::write_segments_gen(self.storage.as_ref(), generation) {
            warn!("could not update segments.gen: {e}");
        }
        warn!(
            "wrote generation {generation} without {} broken segments; {} docs lost",
            status.broken_segments.len(),
            status.lost_docs
        );
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Term};
    use crate::index::config::IndexWriterConfig;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::MergeSchedulerConfig;
    use crate::index::writer::IndexWriter;
    use crate::storage::memory::MemoryStorage;

    fn build_index(storage: Arc<MemoryStorage>) {
        let config = IndexWriterConfig::new()
            .with_max_buffered_docs(Some(2))
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial);
        let writer = IndexWriter::new(storage, config).unwrap();
        for i in 0..19 {
            let doc = Document::builder().add_keyword("field", format!("aaa{i}")).build();
            writer.add_document(doc).unwrap();
        }
        writer.delete_documents(Term::new("field", "aaa5")).unwrap();
        writer.commit().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_clean_index() {
        let storage = Arc::new(MemoryStorage::new_default());
        build_index(storage.clone());

        let status = CheckIndex::new(storage).check_index().unwrap();
        assert!(status.clean);
        assert_eq!(status.num_segments, 10);
        assert_eq!(status.term_count, 18);
        assert_eq!(status.stored_doc_count, 18);
        assert_eq!(status.total_docs, 18);
    }

    #[test]
    fn test_missing_index() {
        let storage = Arc::new(MemoryStorage::new_default());
        let status = CheckIndex::new(storage).check_index().unwrap();
        assert!(status.missing_segments);
        assert!(!status.clean);
    }

    #[test]
    fn test_fix_drops_broken_segment() {
        let storage = Arc::new(MemoryStorage::new_default());
        build_index(storage.clone());
        let victim = SegmentInfos::read_latest(storage.as_ref()).unwrap().segments()[0]
            .info
            .files
            .iter()
            .next()
            .cloned()
            .unwrap();
        storage.corrupt_file(&victim, 10).unwrap();

        let checker = CheckIndex::new(storage.clone());
        let status = checker.check_index().unwrap();
        assert!(!status.clean);
        assert_eq!(status.broken_segments, vec!["_0".to_string()]);
        assert_eq!(status.lost_docs, 2);

        let generation = checker.fix_index(&status).unwrap();
        assert!(generation > status.generation);
        let status = checker.check_index().unwrap();
        assert!(status.clean);
        assert_eq!(status.num_segments, 9);
        assert_eq!(status.stored_doc_count, 16);
    }
}
