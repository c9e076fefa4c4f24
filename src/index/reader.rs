//! Point-in-time readers.
//!
//! A [`DirectoryReader`] sees one state of the index: either a commit read
//! from storage, or the writer's current in-memory state (a near-real-time
//! reader from [`IndexWriter::get_reader`](crate::index::writer::IndexWriter::get_reader)).
//! It never changes; [`DirectoryReader::open_if_changed`] returns a new
//! reader when the index has moved on.
//!
//! Readers are reference counted explicitly. A near-real-time reader holds
//! the files of its segments in the writer's file deleter until its count
//! drops to zero.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::document::{Document, Term};
use crate::error::{Result, SegdexError};
use crate::index::codec::{Codec, SegmentCore, StoredFieldsCodec};
use crate::index::deleter::IndexFileDeleter;
use crate::index::deletion_policy::IndexCommit;
use crate::index::doc_values::DocValuesUpdates;
use crate::index::live_docs::LiveDocs;
use crate::index::manifest::SegmentInfos;
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Storage;

/// Attempts to open the latest commit while a writer deletes old ones.
const MAX_OPEN_RETRIES: usize = 5;

/// Read access to documents and postings.
pub trait IndexReader: Send + Sync + std::fmt::Debug {
    /// Number of live documents.
    fn num_docs(&self) -> u64;

    /// Number of documents, deleted ones included.
    fn max_doc(&self) -> u64;

    /// Check if a document is deleted. Out-of-range ids count as deleted.
    fn is_deleted(&self, doc: u64) -> bool;

    /// A live document with its numeric updates applied.
    fn document(&self, doc: u64) -> Result<Option<Document>>;

    /// Live documents containing `term`, ascending.
    fn postings(&self, term: &Term) -> Result<Vec<u64>>;

    /// Current value of a numeric field of a live document.
    fn numeric_doc_value(&self, doc: u64, field: &str) -> Result<Option<i64>>;

    /// Number of live documents containing `term`.
    fn doc_freq(&self, term: &Term) -> Result<u64> {
        Ok(self.postings(term)?.len() as u64)
    }

    fn has_deletions(&self) -> bool {
        self.num_docs() < self.max_doc()
    }
}

/// Reader over one segment at one overlay.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    info: SegmentCommitInfo,
    core: Arc<SegmentCore>,
    live_docs: Arc<LiveDocs>,
    doc_values: Arc<DocValuesUpdates>,
}

impl SegmentReader {
    pub fn new(
        info: SegmentCommitInfo,
        core: Arc<SegmentCore>,
        live_docs: Arc<LiveDocs>,
        doc_values: Arc<DocValuesUpdates>,
    ) -> Self {
        SegmentReader {
            info,
            core,
            live_docs,
            doc_values,
        }
    }

    /// Load a segment and its overlay files from storage.
    pub fn open(storage: &dyn Storage, codec: &dyn Codec, info: &SegmentCommitInfo) -> Result<Self> {
        if info.info.codec != codec.name() {
            return Err(SegdexError::codec(format!(
                "segment {} was written by codec {}, reader uses {}",
                info.name(),
                info.info.codec,
                codec.name()
            )));
        }
        let core = codec.open_segment(storage, &info.info)?;
        let max_doc = core.max_doc();
        let live_docs = match info.live_docs_file_name() {
            Some(name) => LiveDocs::read(storage, &name, info.name(), max_doc, info.del_count)?,
            None => LiveDocs::all_live(max_doc),
        };
        let doc_values = match info.doc_values_file_name() {
            Some(name) => DocValuesUpdates::read(storage, &name)?,
            None => DocValuesUpdates::new(),
        };
        Ok(Self::new(
            info.clone(),
            Arc::new(core),
            Arc::new(live_docs),
            Arc::new(doc_values),
        ))
    }

    pub fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn core(&self) -> &Arc<SegmentCore> {
        &self.core
    }

    pub fn live_docs(&self) -> &Arc<LiveDocs> {
        &self.live_docs
    }

    pub fn doc_values(&self) -> &Arc<DocValuesUpdates> {
        &self.doc_values
    }

    /// Every distinct term of the segment with its live document count.
    /// Terms whose documents are all deleted are skipped.
    pub fn live_terms(&self) -> impl Iterator<Item = (&Term, u32)> + '_ {
        self.core.postings.iter().filter_map(|(term, docs)| {
            let live = docs.iter().filter(|d| self.live_docs.is_live(**d)).count() as u32;
            (live > 0).then_some((term, live))
        })
    }
}

impl IndexReader for SegmentReader {
    fn num_docs(&self) -> u64 {
        self.live_docs.num_live() as u64
    }

    fn max_doc(&self) -> u64 {
        self.core.max_doc() as u64
    }

    fn is_deleted(&self, doc: u64) -> bool {
        u32::try_from(doc).map_or(true, |doc| !self.live_docs.is_live(doc))
    }

    fn document(&self, doc: u64) -> Result<Option<Document>> {
        if self.is_deleted(doc) {
            return Ok(None);
        }
        let doc = doc as u32;
        Ok(self.core.document(doc).map(|stored| {
            let mut stored = stored.clone();
            for (field, value) in self.doc_values.for_doc(doc) {
                stored.set_numeric(field, value);
            }
            stored
        }))
    }

    fn postings(&self, term: &Term) -> Result<Vec<u64>> {
        Ok(self
            .core
            .postings(term)
            .iter()
            .filter(|d| self.live_docs.is_live(**d))
            .map(|d| *d as u64)
            .collect())
    }

    fn numeric_doc_value(&self, doc: u64, field: &str) -> Result<Option<i64>> {
        if self.is_deleted(doc) {
            return Ok(None);
        }
        let doc = doc as u32;
        Ok(self
            .doc_values
            .get(doc, field)
            .or_else(|| self.core.document(doc).and_then(|d| d.numeric(field))))
    }
}

/// Source of near-real-time reopens.
pub(crate) trait ReaderSource: Send + Sync {
    /// A new reader if the writer changed since `version`.
    fn reopen_if_changed(&self, version: u64) -> Result<Option<DirectoryReader>>;
}

/// Files a near-real-time reader holds in the writer's deleter.
#[derive(Debug)]
struct HeldFiles {
    deleter: Weak<Mutex<IndexFileDeleter>>,
    files: BTreeSet<String>,
}

/// Reader over every segment of one index state.
pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    infos: SegmentInfos,
    segments: Vec<SegmentReader>,
    starts: Vec<u64>,
    max_doc: u64,
    num_docs: u64,
    ref_count: AtomicU32,
    held: Mutex<Option<HeldFiles>>,
    source: Option<Weak<dyn ReaderSource>>,
}

impl std::fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("generation", &self.infos.generation)
            .field("version", &self.infos.version)
            .field("segments", &self.segments.len())
            .field("num_docs", &self.num_docs)
            .field("ref_count", &self.ref_count.load(Ordering::Acquire))
            .field("nrt", &self.source.is_some())
            .finish()
    }
}

impl DirectoryReader {
    fn from_segments(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        segments: Vec<SegmentReader>,
    ) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut max_doc = 0u64;
        let mut num_docs = 0u64;
        for segment in &segments {
            starts.push(max_doc);
            max_doc += segment.max_doc();
            num_docs += segment.num_docs();
        }
        DirectoryReader {
            storage,
            codec,
            infos,
            segments,
            starts,
            max_doc,
            num_docs,
            ref_count: AtomicU32::new(1),
            held: Mutex::new(None),
            source: None,
        }
    }

    /// Near-real-time reader built by the writer. `files` are already
    /// referenced in `deleter` on behalf of the reader.
    pub(crate) fn new_nrt(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        infos: SegmentInfos,
        segments: Vec<SegmentReader>,
        deleter: Weak<Mutex<IndexFileDeleter>>,
        files: BTreeSet<String>,
        source: Weak<dyn ReaderSource>,
    ) -> Self {
        let mut reader = Self::from_segments(storage, codec, infos, segments);
        *reader.held.get_mut() = Some(HeldFiles { deleter, files });
        reader.source = Some(source);
        reader
    }

    /// Open the latest commit with the default codec.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        Self::open_with_codec(storage, Arc::new(StoredFieldsCodec::new()))
    }

    /// Open the latest commit.
    ///
    /// If a writer deletes the commit while it is being loaded, the newer
    /// commit is tried instead.
    pub fn open_with_codec(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>) -> Result<Self> {
        let mut attempt = 0;
        loop {
            let infos = SegmentInfos::read_latest(storage.as_ref())?;
            let generation = infos.generation;
            match Self::load(Arc::clone(&storage), Arc::clone(&codec), infos) {
                Ok(reader) => return Ok(reader),
                Err(e) => {
                    attempt += 1;
                    let latest = SegmentInfos::read_latest(storage.as_ref())
                        .map(|i| i.generation)
                        .unwrap_or(generation);
                    if latest == generation || attempt >= MAX_OPEN_RETRIES {
                        return Err(e);
                    }
                    debug!("commit {generation} changed while opening ({e}); retrying with {latest}");
                }
            }
        }
    }

    /// Open a specific commit.
    pub fn open_commit(storage: Arc<dyn Storage>, commit: &IndexCommit) -> Result<Self> {
        Self::open_commit_with_codec(storage, Arc::new(StoredFieldsCodec::new()), commit)
    }

    pub fn open_commit_with_codec(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        commit: &IndexCommit,
    ) -> Result<Self> {
        let infos = SegmentInfos::read(storage.as_ref(), commit.generation())?;
        Self::load(storage, codec, infos)
    }

    fn load(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>, infos: SegmentInfos) -> Result<Self> {
        let segments = infos
            .segments()
            .iter()
            .map(|info| SegmentReader::open(storage.as_ref(), codec.as_ref(), info))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_segments(storage, codec, infos, segments))
    }

    /// Every valid commit in `storage`, oldest first.
    pub fn list_commits(storage: &dyn Storage) -> Result<Vec<IndexCommit>> {
        let commits = SegmentInfos::read_all_commits(storage)?;
        if commits.is_empty() {
            return Err(SegdexError::index_not_found("no valid commit in storage"));
        }
        Ok(commits.iter().map(IndexCommit::from_infos).collect())
    }

    /// A reader over the newer state of the index, or `None` if nothing
    /// changed. A near-real-time reader whose writer is gone falls back to
    /// the latest commit.
    pub fn open_if_changed(&self) -> Result<Option<DirectoryReader>> {
        self.ensure_open()?;
        if let Some(source) = self.source.as_ref().and_then(Weak::upgrade) {
            return source.reopen_if_changed(self.infos.version);
        }
        let latest = SegmentInfos::read_latest(self.storage.as_ref())?;
        if self.source.is_none()
            && latest.generation == self.infos.generation
            && latest.version == self.infos.version
        {
            return Ok(None);
        }
        Self::load(Arc::clone(&self.storage), Arc::clone(&self.codec), latest).map(Some)
    }

    /// The commit this reader was opened on, if it was opened from storage.
    pub fn index_commit(&self) -> Option<IndexCommit> {
        (self.source.is_none() && self.infos.generation > 0)
            .then(|| IndexCommit::from_infos(&self.infos))
    }

    /// Generation of the commit the reader's state descends from.
    pub fn generation(&self) -> u64 {
        self.infos.generation
    }

    /// Change counter of the state the reader sees.
    pub fn version(&self) -> u64 {
        self.infos.version
    }

    pub fn user_data(&self) -> &std::collections::BTreeMap<String, String> {
        &self.infos.user_data
    }

    pub fn is_near_real_time(&self) -> bool {
        self.source.is_some()
    }

    pub fn segments(&self) -> &[SegmentReader] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Live documents matching `term`, as reader-wide ids.
    pub fn search(&self, term: &Term) -> Result<Vec<u64>> {
        self.postings(term)
    }

    fn locate(&self, doc: u64) -> Option<(usize, u64)> {
        if doc >= self.max_doc {
            return None;
        }
        let idx = self.starts.partition_point(|start| *start <= doc) - 1;
        Some((idx, doc - self.starts[idx]))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count.load(Ordering::Acquire) == 0 {
            return Err(SegdexError::already_closed("reader is closed"));
        }
        Ok(())
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add a reference. Fails if the reader is already closed.
    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(SegdexError::already_closed("reader is closed"))
        }
    }

    /// Add a reference unless the reader is already closed.
    pub fn try_inc_ref(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Acquire);
        while count > 0 {
            match self.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
        false
    }

    /// Drop a reference. At zero the reader releases its files.
    pub fn dec_ref(&self) -> Result<()> {
        let mut count = self.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return Err(SegdexError::illegal_state("reader ref count is already zero"));
            }
            match self.ref_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        if count == 1 {
            self.release_files()?;
        }
        Ok(())
    }

    /// Same as [`DirectoryReader::dec_ref`].
    pub fn close(&self) -> Result<()> {
        self.dec_ref()
    }

    fn release_files(&self) -> Result<()> {
        let Some(held) = self.held.lock().take() else {
            return Ok(());
        };
        match held.deleter.upgrade() {
            Some(deleter) => deleter.lock().dec_ref(&held.files),
            None => {
                warn!("writer closed before reader; {} files left for the next writer", held.files.len());
                Ok(())
            }
        }
    }
}

impl IndexReader for DirectoryReader {
    fn num_docs(&self) -> u64 {
        self.num_docs
    }

    fn max_doc(&self) -> u64 {
        self.max_doc
    }

    fn is_deleted(&self, doc: u64) -> bool {
        match self.locate(doc) {
            Some((idx, local)) => self.segments[idx].is_deleted(local),
            None => true,
        }
    }

    fn document(&self, doc: u64) -> Result<Option<Document>> {
        self.ensure_open()?;
        match self.locate(doc) {
            Some((idx, local)) => self.segments[idx].document(local),
            None => Ok(None),
        }
    }

    fn postings(&self, term: &Term) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let mut docs = Vec::new();
        for (segment, start) in self.segments.iter().zip(&self.starts) {
            docs.extend(segment.postings(term)?.into_iter().map(|d| d + start));
        }
        Ok(docs)
    }

    fn numeric_doc_value(&self, doc: u64, field: &str) -> Result<Option<i64>> {
        self.ensure_open()?;
        match self.locate(doc) {
            Some((idx, local)) => self.segments[idx].numeric_doc_value(local, field),
            None => Ok(None),
        }
    }
}
