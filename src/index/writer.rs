//! The index writer.
//!
//! One [`IndexWriter`] owns an index at a time (it holds `write.lock` for its
//! whole life). It buffers added documents, deletes and doc-values updates,
//! flushes them into new segments, merges segments in the background, and
//! publishes its state through two-phase commits.
//!
//! ```
//! use std::sync::Arc;
//!
//! use segdex::document::{Document, Term};
//! use segdex::index::{IndexWriter, IndexWriterConfig};
//! use segdex::index::reader::IndexReader;
//! use segdex::storage::memory::MemoryStorage;
//!
//! # fn main() -> segdex::error::Result<()> {
//! let storage = Arc::new(MemoryStorage::new_default());
//! let writer = IndexWriter::new(storage, IndexWriterConfig::default())?;
//!
//! writer.add_document(Document::builder().add_keyword("id", "1").build())?;
//! writer.add_document(Document::builder().add_keyword("id", "2").build())?;
//! writer.delete_documents(Term::new("id", "1"))?;
//! writer.commit()?;
//!
//! let reader = writer.get_reader(true)?;
//! assert_eq!(reader.num_docs(), 1);
//! reader.close()?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! All public methods take `&self`; the writer can be shared between threads
//! behind an `Arc`. The in-memory state is guarded by one mutex, commits are
//! serialized by a second one, and merges read and write segment data
//! without holding either.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::document::{Document, Term};
use crate::error::{Result, SegdexError};
use crate::index::buffer::{DocumentsBuffer, FlushBatch};
use crate::index::codec::{MergeInput, MergedSegment, SegmentCore};
use crate::index::config::{IndexWriterConfig, MergeExceptionMode, OpenMode};
use crate::index::deleter::IndexFileDeleter;
use crate::index::file_names::{self, WRITE_LOCK_NAME};
use crate::index::manifest::SegmentInfos;
use crate::index::merge::{MergeState, MergeTrigger, OneMerge};
use crate::index::merge_policy::MergeContext;
use crate::index::merge_scheduler::{MergeScheduler, MergeSource};
use crate::index::reader::{DirectoryReader, ReaderSource};
use crate::index::reader_pool::ReaderPool;
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::index::snapshot::{Snapshot, SnapshotRegistry};
use crate::index::two_phase::TwoPhaseCommit;
use crate::storage::{Storage, StorageLock};

/// A prepared commit waiting for [`IndexWriter::commit`].
#[derive(Debug)]
struct PendingCommit {
    infos: SegmentInfos,
    /// `None` when there was nothing to commit.
    generation: Option<u64>,
    /// Files held in the deleter until the commit is finished or dropped.
    held: BTreeSet<String>,
}

#[derive(Debug)]
struct WriterState {
    infos: SegmentInfos,
    buffer: DocumentsBuffer,
    pool: ReaderPool,
    /// Rollback target.
    last_commit: SegmentInfos,
    /// `infos.version` at the last commit.
    committed_version: u64,
    pending_commit: Option<PendingCommit>,
    synced: HashSet<String>,

    merging: BTreeSet<String>,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    stop_merges: bool,
    merge_error: Option<SegdexError>,

    /// Target of the force merge in progress.
    force_merge_max: Option<usize>,
    /// Segments a force merge must rewrite, mapped to whether they existed
    /// when it started.
    segments_to_merge: BTreeMap<String, bool>,
    force_merge_error: Option<String>,

    post_commit_warning: Option<SegdexError>,
}

impl WriterState {
    fn has_uncommitted_changes(&self) -> bool {
        self.infos.version != self.committed_version
    }

    fn forced_merges_outstanding(&self) -> bool {
        self.pending_merges
            .iter()
            .chain(self.running_merges.iter())
            .any(|m| m.max_num_segments.is_some())
    }
}

struct WriterInner {
    storage: Arc<dyn Storage>,
    config: IndexWriterConfig,
    state: Mutex<WriterState>,
    merge_done: Condvar,
    commit_lock: Mutex<()>,
    deleter: Arc<Mutex<IndexFileDeleter>>,
    scheduler: Arc<dyn MergeScheduler>,
    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
    closing: AtomicBool,
    closed: AtomicBool,
    self_ref: Weak<WriterInner>,
}

/// Writes an index. See the [module documentation](self).
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IndexWriter")
            .field("storage", &self.inner.storage)
            .field("generation", &state.infos.generation)
            .field("segments", &state.infos.len())
            .field("buffered_docs", &state.buffer.num_docs())
            .field("running_merges", &state.running_merges.len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer on `storage`.
    ///
    /// Fails with [`SegdexError::LockObtainFailed`] if another writer holds
    /// the index, and with [`SegdexError::IndexNotFound`] in
    /// [`OpenMode::Append`] when there is no index.
    pub fn new(storage: Arc<dyn Storage>, config: IndexWriterConfig) -> Result<Self> {
        config.validate()?;
        let lock = storage.obtain_lock(WRITE_LOCK_NAME)?;

        let (mut infos, is_create) = Self::initial_infos(storage.as_ref(), &config)?;
        let deleter = IndexFileDeleter::new(
            Arc::clone(&storage),
            Arc::clone(&config.deletion_policy),
            &mut infos,
            is_create,
        )?;
        let scheduler = config.merge_scheduler.build()?;
        let pool = ReaderPool::new(
            Arc::clone(&storage),
            Arc::clone(&config.codec),
            config.reader_pooling,
        );

        let last_commit = infos.clone();
        let committed_version = infos.version;
        if is_create || config.index_commit.is_some() {
            infos.changed();
        }
        info!(
            "opened writer ({:?}) at generation {} with {} segments",
            config.open_mode,
            infos.generation,
            infos.len()
        );

        let state = WriterState {
            infos,
            buffer: DocumentsBuffer::new(),
            pool,
            last_commit,
            committed_version,
            pending_commit: None,
            synced: HashSet::new(),
            merging: BTreeSet::new(),
            pending_merges: VecDeque::new(),
            running_merges: Vec::new(),
            stop_merges: false,
            merge_error: None,
            force_merge_max: None,
            segments_to_merge: BTreeMap::new(),
            force_merge_error: None,
            post_commit_warning: None,
        };

        let inner = Arc::new_cyclic(|self_ref| WriterInner {
            storage,
            config,
            state: Mutex::new(state),
            merge_done: Condvar::new(),
            commit_lock: Mutex::new(()),
            deleter: Arc::new(Mutex::new(deleter)),
            scheduler,
            write_lock: Mutex::new(Some(lock)),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Ok(IndexWriter { inner })
    }

    fn initial_infos(storage: &dyn Storage, config: &IndexWriterConfig) -> Result<(SegmentInfos, bool)> {
        if let Some(commit) = &config.index_commit {
            let infos = SegmentInfos::read(storage, commit.generation())?;
            debug!("opening writer on commit {}", commit.segments_file_name());
            return Ok((infos, false));
        }
        match config.open_mode {
            OpenMode::Append => Ok((SegmentInfos::read_latest(storage)?, false)),
            OpenMode::CreateOrAppend => match SegmentInfos::read_latest(storage) {
                Ok(infos) => Ok((infos, false)),
                Err(SegdexError::IndexNotFound(_)) => Ok((SegmentInfos::new(), true)),
                Err(e) => Err(e),
            },
            OpenMode::Create => {
                // Keep generations and names moving forward over the old index.
                let mut infos = SegmentInfos::new();
                if let Ok(old) = SegmentInfos::read_latest(storage) {
                    infos.generation = old.generation;
                    infos.last_generation = old.last_generation;
                    infos.counter = old.counter;
                    infos.version = old.version;
                }
                Ok((infos, true))
            }
        }
    }

    /// Buffer a document.
    ///
    /// Fails with [`SegdexError::InvalidArgument`] if a term is too long; the
    /// writer stays usable.
    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.inner.add_document(None, doc)
    }

    /// Atomically delete every document matching `term` and add `doc`.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<()> {
        self.inner.add_document(Some(term), doc)
    }

    /// Delete every document matching `term`, including buffered ones.
    pub fn delete_documents(&self, term: Term) -> Result<()> {
        self.inner.delete_documents(term)
    }

    /// Drop every document of the index. Takes effect on commit.
    pub fn delete_all(&self) -> Result<()> {
        self.inner.delete_all()
    }

    /// Set numeric field `field` to `value` on every document matching
    /// `term`.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<()> {
        self.inner.update_numeric_doc_value(term, field, value)
    }

    /// First phase of a commit: make every pending change durable without
    /// publishing it.
    pub fn prepare_commit(&self) -> Result<()> {
        self.inner.prepare_commit()
    }

    /// Publish every change, preparing first if needed.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit(true)
    }

    /// Discard every uncommitted change and any prepared commit. Running
    /// merges are aborted. The writer stays open.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    /// Close the writer, committing first if `commit_on_close` is set. The
    /// write lock is released even if the final commit fails.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Replace the user data stored with the next commit.
    pub fn set_commit_data(&self, data: BTreeMap<String, String>) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        state.infos.user_data = data;
        state.infos.changed();
        Ok(())
    }

    /// User data of the writer's current state.
    pub fn commit_data(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().infos.user_data.clone()
    }

    /// Merge until at most `max_num_segments` segments remain.
    ///
    /// With `do_wait` the call blocks until the merges are done and reports
    /// their failures.
    pub fn force_merge(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        self.inner.force_merge(max_num_segments, do_wait)
    }

    /// Merge away segments with too many deleted documents.
    pub fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.inner.force_merge_deletes(do_wait)
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.take_merge_error()?;
        self.inner.maybe_merge(MergeTrigger::Explicit)
    }

    /// Block until no merge is pending or running.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.wait_for_merges();
        Ok(())
    }

    /// Pin the last commit. Requires a snapshotting deletion policy.
    ///
    /// Pins only change between commits: the state lock is held so a commit
    /// cannot checkpoint while the registry is updated.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.ensure_open()?;
        let registry = self.inner.snapshots()?;
        let _state = self.inner.state.lock();
        registry.snapshot()
    }

    /// Release a pin and delete whatever it alone kept.
    pub fn release_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner.ensure_open()?;
        let registry = self.inner.snapshots()?;
        let _state = self.inner.state.lock();
        registry.release(snapshot)?;
        self.inner.deleter.lock().revisit_policy()
    }

    /// Current pins, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.inner.snapshots()?.list_snapshots())
    }

    /// A near-real-time reader over everything added so far, committed or
    /// not.
    ///
    /// With `apply_all_deletes` false, buffered deletes are only applied if
    /// documents have to be flushed anyway.
    pub fn get_reader(&self, apply_all_deletes: bool) -> Result<DirectoryReader> {
        self.inner.get_reader(apply_all_deletes)
    }

    /// Retry pending deletes and remove files no one references.
    pub fn delete_unused_files(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let _state = self.inner.state.lock();
        let mut deleter = self.inner.deleter.lock();
        deleter.revisit_policy()?;
        Ok(deleter.delete_unreferenced())
    }

    /// Live documents, buffered ones included. Buffered deletes of existing
    /// segments count once they are applied.
    pub fn num_docs(&self) -> u64 {
        let state = self.inner.state.lock();
        let segments: u64 = state
            .infos
            .segments()
            .iter()
            .map(|info| (info.info.doc_count - state.pool.num_deleted(info)) as u64)
            .sum();
        segments + state.buffer.num_live_docs() as u64
    }

    /// Documents, deleted and buffered ones included.
    pub fn max_doc(&self) -> u64 {
        let state = self.inner.state.lock();
        state.infos.total_max_doc() + state.buffer.num_docs() as u64
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().infos.len()
    }

    /// Copy of the writer's current segment list.
    pub fn segment_infos(&self) -> SegmentInfos {
        self.inner.state.lock().infos.clone()
    }

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.inner.state.lock();
        state.has_uncommitted_changes() || state.buffer.has_changes() || state.pool.any_dirty()
    }

    /// Merges registered or running.
    pub fn merge_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.pending_merges.len() + state.running_merges.len()
    }

    /// The failure of a step after the last commit point (writing
    /// `segments.gen`, deleting old commits), if any.
    pub fn take_post_commit_warning(&self) -> Option<SegdexError> {
        self.inner.state.lock().post_commit_warning.take()
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            warn!("writer dropped without close; uncommitted changes are discarded");
            if let Err(e) = self.inner.shutdown() {
                warn!("shutdown of dropped writer failed: {e}");
            }
        }
    }
}

impl TwoPhaseCommit for IndexWriter {
    fn prepare_commit(&self) -> Result<()> {
        IndexWriter::prepare_commit(self)
    }

    fn commit(&self) -> Result<()> {
        IndexWriter::commit(self)
    }

    fn rollback(&self) -> Result<()> {
        IndexWriter::rollback(self)
    }
}

impl WriterInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SegdexError::already_closed("index writer is closed"));
        }
        Ok(())
    }

    fn take_merge_error(&self) -> Result<()> {
        match self.state.lock().merge_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn merge_source(&self) -> Result<Arc<dyn MergeSource>> {
        let inner = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SegdexError::already_closed("index writer is gone"))?;
        Ok(inner)
    }

    fn snapshots(&self) -> Result<&dyn SnapshotRegistry> {
        self.config
            .deletion_policy
            .snapshot_registry()
            .ok_or_else(|| SegdexError::illegal_state("deletion policy does not support snapshots"))
    }

    // ---- buffering and flushing ----

    fn add_document(&self, replace: Option<Term>, doc: Document) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let flushed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(term) = replace {
                // Reject the document before its delete is recorded.
                doc.terms()?;
                state.buffer.delete_term(term);
            }
            state.buffer.add_document(doc)?;
            self.maybe_flush(state)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::SegmentFlush)?;
        }
        Ok(())
    }

    fn delete_documents(&self, term: Term) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let flushed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.buffer.delete_term(term);
            self.maybe_flush(state)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::SegmentFlush)?;
        }
        Ok(())
    }

    fn update_numeric_doc_value(&self, term: Term, field: &str, value: i64) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.buffer.update_numeric(term, field, value);
        self.maybe_flush(state)?;
        Ok(())
    }

    /// Apply whichever flush trigger fired. Returns whether a segment was
    /// written.
    fn maybe_flush(&self, state: &mut WriterState) -> Result<bool> {
        let config = &self.config;
        let docs_full = config
            .max_buffered_docs
            .is_some_and(|max| state.buffer.num_docs() >= max);
        let ram_full = config
            .ram_buffer_bytes()
            .is_some_and(|max| state.buffer.bytes_used() >= max);
        if docs_full || ram_full {
            debug!(
                "flushing {} buffered docs ({} bytes)",
                state.buffer.num_docs(),
                state.buffer.bytes_used()
            );
            return self.flush(state);
        }
        let deletes_full = config
            .max_buffered_delete_terms
            .is_some_and(|max| state.buffer.num_delete_terms() >= max);
        if deletes_full {
            self.apply_segment_edits(state)?;
        }
        Ok(false)
    }

    /// Apply buffered edits to existing segments, then write buffered
    /// documents as a new segment. Returns whether a segment was written.
    fn flush(&self, state: &mut WriterState) -> Result<bool> {
        self.apply_segment_edits(state)?;
        match state.buffer.take_flush_batch() {
            Some(batch) => self.write_flushed_segment(state, batch),
            None => Ok(false),
        }
    }

    fn apply_segment_edits(&self, state: &mut WriterState) -> Result<()> {
        if !state.buffer.has_segment_edits() {
            return Ok(());
        }
        let edits = state.buffer.take_segment_edits();
        let mut deleter = self.deleter.lock();
        let applied = state
            .pool
            .apply_deletes(&state.infos, &edits.delete_terms, &mut deleter)
            .and_then(|deleted| {
                state
                    .pool
                    .apply_numeric_updates(&state.infos, &edits.numeric_updates, &mut deleter)
                    .map(|updated| (deleted, updated))
            });
        match applied {
            Ok((deleted, updated)) => {
                debug!(
                    "applied {} delete terms and {} numeric updates: {deleted} docs deleted, {updated} updated",
                    edits.delete_terms.len(),
                    edits.numeric_updates.len()
                );
                if deleted > 0 || updated > 0 {
                    state.infos.changed();
                }
                Ok(())
            }
            Err(e) => {
                // Edits are idempotent; keep them for the next attempt.
                state.buffer.restore_segment_edits(edits);
                Err(e)
            }
        }
    }

    fn write_flushed_segment(&self, state: &mut WriterState, batch: FlushBatch) -> Result<bool> {
        let name = state.infos.new_segment_name();
        self.deleter.lock().protect(&name);

        let written = self
            .config
            .codec
            .write_segment(self.storage.as_ref(), &name, &batch.docs)
            .and_then(|files| {
                let size = files
                    .iter()
                    .map(|f| self.storage.file_size(f))
                    .sum::<Result<u64>>()?;
                Ok((files, size))
            });
        let (files, size) = match written {
            Ok(written) => written,
            Err(e) => {
                let mut deleter = self.deleter.lock();
                deleter.unprotect(&name);
                deleter.refresh_segment(&name);
                warn!("flush of {name} failed: {e}");
                state.buffer.restore(batch);
                return Err(e);
            }
        };

        let doc_count = batch.docs.len() as u32;
        let mut deleter = self.deleter.lock();
        if batch.live_docs.as_ref().is_some_and(|live| live.num_live() == 0) {
            debug!("dropping flushed segment {name}: every document was deleted");
            deleter.unprotect(&name);
            deleter.delete_new_files(&files);
            return Ok(false);
        }

        let core = match SegmentCore::from_documents(batch.docs) {
            Ok(core) => core,
            Err(e) => {
                deleter.unprotect(&name);
                deleter.delete_new_files(&files);
                return Err(e);
            }
        };
        let info = SegmentCommitInfo::new(SegmentInfo::new(
            name.clone(),
            doc_count,
            self.config.codec.name(),
            files,
            size,
            "flush",
            state.infos.generation,
        ));
        state
            .pool
            .insert_flushed(&info, core, batch.live_docs, &mut deleter);
        state.infos.add(info);
        state.infos.changed();
        let checkpointed = deleter.checkpoint(&state.infos, false);
        deleter.unprotect(&name);
        checkpointed?;
        debug!("flushed {name} with {doc_count} docs ({size} bytes)");
        Ok(true)
    }

    fn delete_all(&self) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.state.lock();
        self.abort_merges(&mut guard);
        let state = &mut *guard;
        let mut deleter = self.deleter.lock();
        state.buffer.clear();
        state.pool.drop_all(&mut deleter)?;
        state.infos.clear();
        state.infos.changed();
        deleter.checkpoint(&state.infos, false)?;
        info!("deleted all documents");
        Ok(())
    }

    // ---- commit ----

    fn prepare_commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let _commit = self.commit_lock.lock();
        let flushed = {
            let mut guard = self.state.lock();
            self.prepare_locked(&mut guard)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(())
    }

    fn commit(&self, trigger_merges: bool) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let _commit = self.commit_lock.lock();
        let flushed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let flushed = if state.pending_commit.is_none() {
                self.prepare_locked(state)?
            } else {
                false
            };
            self.finish_locked(state)?;
            flushed
        };
        if flushed && trigger_merges {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(())
    }

    fn prepare_locked(&self, state: &mut WriterState) -> Result<bool> {
        if state.pending_commit.is_some() {
            return Err(SegdexError::illegal_state(
                "prepare_commit was already called; commit or rollback first",
            ));
        }
        let flushed = self.flush(state)?;

        let mut deleter = self.deleter.lock();
        let written = state.pool.write_all_pending(&mut state.infos);
        // Hold whatever was written, even if a later write failed.
        deleter.checkpoint(&state.infos, false)?;
        written?;
        if !self.config.reader_pooling {
            state.pool.prune(&state.infos, &mut deleter)?;
        }

        if !state.has_uncommitted_changes() {
            debug!("nothing to commit");
            state.pending_commit = Some(PendingCommit {
                infos: state.infos.clone(),
                generation: None,
                held: BTreeSet::new(),
            });
            return Ok(flushed);
        }

        let mut candidate = state.infos.clone();
        let to_sync: Vec<String> = candidate
            .files(false)
            .into_iter()
            .filter(|f| !state.synced.contains(f))
            .collect();
        self.storage.sync(&to_sync)?;
        state.synced.extend(to_sync);

        let prepared = candidate.prepare_commit(self.storage.as_ref());
        // An attempted generation is never reused.
        state.infos.last_generation = state.infos.last_generation.max(candidate.last_generation);
        let generation = prepared?;

        let mut held = candidate.files(false);
        held.insert(file_names::pending_segments_file_name(generation));
        deleter.inc_ref(&held);
        info!(
            "prepared commit {generation}: {} segments, {} docs",
            candidate.len(),
            candidate.total_num_docs()
        );
        state.pending_commit = Some(PendingCommit {
            infos: candidate,
            generation: Some(generation),
            held,
        });
        Ok(flushed)
    }

    fn finish_locked(&self, state: &mut WriterState) -> Result<()> {
        let Some(pending) = state.pending_commit.take() else {
            return Err(SegdexError::illegal_state("no prepared commit"));
        };
        let Some(generation) = pending.generation else {
            return Ok(());
        };
        let mut candidate = pending.infos;
        let mut deleter = self.deleter.lock();

        if let Err(e) = candidate.finish_commit(self.storage.as_ref(), generation) {
            let committed = file_names::segments_file_name(generation);
            if !self.storage.file_exists(&committed) {
                warn!("commit {generation} failed before it became visible: {e}");
                SegmentInfos::rollback_commit(self.storage.as_ref(), generation);
                if let Err(release) = deleter.dec_ref(&pending.held) {
                    warn!("could not release files of failed commit: {release}");
                }
                return Err(e);
            }
            candidate.generation = generation;
            Self::record_post_commit_warning(state, e);
        }

        state.committed_version = candidate.version;
        state.infos.generation = generation;
        state.last_commit = candidate.clone();

        if let Err(e) = SegmentInfos::write_segments_gen(self.storage.as_ref(), generation) {
            Self::record_post_commit_warning(state, e);
        }
        if let Err(e) = deleter.checkpoint(&candidate, true) {
            Self::record_post_commit_warning(state, e);
        }
        if let Err(e) = deleter.dec_ref(&pending.held) {
            Self::record_post_commit_warning(state, e);
        }
        info!(
            "committed generation {generation}: {} segments, {} docs",
            candidate.len(),
            candidate.total_num_docs()
        );
        Ok(())
    }

    fn record_post_commit_warning(state: &mut WriterState, e: SegdexError) {
        warn!("commit is visible but a follow-up step failed: {e}");
        state.post_commit_warning = Some(e);
    }

    fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();
        let mut guard = self.state.lock();
        self.abort_merges(&mut guard);
        let state = &mut *guard;
        let mut deleter = self.deleter.lock();

        if let Some(pending) = state.pending_commit.take() {
            if let Some(generation) = pending.generation {
                SegmentInfos::rollback_commit(self.storage.as_ref(), generation);
            }
            deleter.dec_ref(&pending.held)?;
        }
        state.buffer.clear();
        state.pool.drop_all(&mut deleter)?;

        let mut restored = state.last_commit.clone();
        restored.counter = restored.counter.max(state.infos.counter);
        restored.last_generation = restored.last_generation.max(state.infos.last_generation);
        for info in restored.segments_mut().iter_mut() {
            if let Some(current) = state.infos.get(info.name()) {
                info.next_write_del_gen = info.next_write_del_gen.max(current.next_write_del_gen);
                info.next_write_dv_gen = info.next_write_dv_gen.max(current.next_write_dv_gen);
            }
        }
        state.infos = restored;
        state.committed_version = state.infos.version;
        state.merge_error = None;
        state.force_merge_max = None;
        state.force_merge_error = None;
        state.segments_to_merge.clear();
        state.stop_merges = false;

        deleter.checkpoint(&state.infos, false)?;
        deleter.delete_unreferenced();
        info!("rolled back to generation {}", state.infos.generation);
        Ok(())
    }

    // ---- close ----

    fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = if self.config.commit_on_close {
            self.wait_for_merges();
            self.commit(false)
        } else {
            Ok(())
        };
        let shutdown = self.shutdown();
        result.and(shutdown)
    }

    /// Stop merges, drop unwritten state and release the write lock.
    fn shutdown(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        {
            let mut guard = self.state.lock();
            guard.stop_merges = true;
            self.abort_merges(&mut guard);
        }
        let scheduled = self.scheduler.close();

        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut deleter = self.deleter.lock();
            if let Some(pending) = state.pending_commit.take() {
                if let Some(generation) = pending.generation {
                    SegmentInfos::rollback_commit(self.storage.as_ref(), generation);
                }
                if let Err(e) = deleter.dec_ref(&pending.held) {
                    warn!("could not release files of pending commit: {e}");
                }
            }
            state.buffer.clear();
            let dropped = state.pool.drop_all(&mut deleter);
            deleter.close();
            dropped
        };

        self.closed.store(true, Ordering::Release);
        let unlocked = match self.write_lock.lock().take() {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        };
        info!("writer closed");
        scheduled.and(released).and(unlocked)
    }

    // ---- readers ----

    fn get_reader(&self, apply_all_deletes: bool) -> Result<DirectoryReader> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let (reader, flushed) = {
            let mut guard = self.state.lock();
            self.open_nrt_reader(&mut guard, apply_all_deletes)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(reader)
    }

    fn open_nrt_reader(
        &self,
        state: &mut WriterState,
        apply_all_deletes: bool,
    ) -> Result<(DirectoryReader, bool)> {
        let flushed = if apply_all_deletes || state.buffer.num_docs() > 0 {
            self.flush(state)?
        } else {
            false
        };

        let mut deleter = self.deleter.lock();
        let segments = state
            .infos
            .segments()
            .iter()
            .map(|info| Ok(state.pool.get(info, &mut deleter)?.reader(info)))
            .collect::<Result<Vec<_>>>()?;
        let files = state.infos.files(false);
        deleter.inc_ref(&files);
        if !self.config.reader_pooling {
            state.pool.prune(&state.infos, &mut deleter)?;
        }

        let source: Weak<dyn ReaderSource> = self.self_ref.clone();
        let reader = DirectoryReader::new_nrt(
            Arc::clone(&self.storage),
            Arc::clone(&self.config.codec),
            state.infos.clone(),
            segments,
            Arc::downgrade(&self.deleter),
            files,
            source,
        );
        debug!("opened near-real-time reader at version {}", state.infos.version);
        Ok((reader, flushed))
    }

    // ---- merges ----

    fn maybe_merge(&self, trigger: MergeTrigger) -> Result<()> {
        {
            let mut guard = self.state.lock();
            self.update_pending_merges(&mut guard, trigger, None);
        }
        self.scheduler.merge(self.merge_source()?, trigger)
    }

    /// Ask the policy for merges and register them. Returns the merges
    /// registered.
    fn update_pending_merges(
        &self,
        state: &mut WriterState,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Vec<Arc<OneMerge>> {
        if state.stop_merges {
            return Vec::new();
        }
        let ctx = MergeContext::new(state.merging.clone(), state.pool.del_counts(&state.infos));
        let policy = &self.config.merge_policy;
        let spec = match max_num_segments {
            Some(max) => policy.find_forced_merges(&state.infos, max, &state.segments_to_merge, &ctx),
            None => policy.find_merges(trigger, &state.infos, &ctx),
        };
        let Some(spec) = spec else {
            return Vec::new();
        };
        spec.into_iter()
            .filter_map(|mut merge| {
                merge.max_num_segments = max_num_segments;
                self.register_merge(state, merge)
            })
            .collect()
    }

    fn register_merge(&self, state: &mut WriterState, merge: OneMerge) -> Option<Arc<OneMerge>> {
        for info in merge.segments() {
            if state.merging.contains(info.name()) {
                debug!("not registering {}: {} is already merging", merge.seg_string(), info.name());
                return None;
            }
            if !state.infos.contains(info.name()) {
                debug!("not registering {}: {} is gone", merge.seg_string(), info.name());
                return None;
            }
        }
        state.merging.extend(merge.segment_names());
        merge.set_state(MergeState::Registered);
        debug!("registered merge {}: {}", merge.id(), merge.seg_string());
        let merge = Arc::new(merge);
        state.pending_merges.push_back(Arc::clone(&merge));
        Some(merge)
    }

    /// Abort every pending and running merge and wait for the running ones
    /// to stop.
    fn abort_merges(&self, guard: &mut MutexGuard<'_, WriterState>) {
        let stop = guard.stop_merges;
        guard.stop_merges = true;
        let pending: Vec<_> = guard.pending_merges.drain(..).collect();
        for merge in pending {
            merge.abort();
            merge.set_state(MergeState::Aborted);
            for name in merge.segment_names() {
                guard.merging.remove(&name);
            }
        }
        for merge in &guard.running_merges {
            merge.abort();
        }
        while !guard.running_merges.is_empty() {
            debug!("waiting for {} aborted merges", guard.running_merges.len());
            self.merge_done.wait(guard);
        }
        guard.stop_merges = stop;
        self.merge_done.notify_all();
    }

    fn wait_for_merges(&self) {
        let mut guard = self.state.lock();
        while !guard.pending_merges.is_empty() || !guard.running_merges.is_empty() {
            self.merge_done.wait(&mut guard);
        }
    }

    fn force_merge(&self, max_num_segments: usize, do_wait: bool) -> Result<()> {
        if max_num_segments < 1 {
            return Err(SegdexError::invalid_argument("max_num_segments must be at least 1"));
        }
        self.ensure_open()?;
        self.take_merge_error()?;
        info!("force merge to {max_num_segments} segments");
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.flush(state)?;
            state.segments_to_merge = state
                .infos
                .segments()
                .iter()
                .map(|info| (info.name().to_string(), true))
                .collect();
            state.force_merge_max = Some(max_num_segments);
            state.force_merge_error = None;
            self.update_pending_merges(state, MergeTrigger::Explicit, Some(max_num_segments));
        }
        self.scheduler.merge(self.merge_source()?, MergeTrigger::Explicit)?;
        if !do_wait {
            return Ok(());
        }

        let mut guard = self.state.lock();
        loop {
            if let Some(message) = guard.force_merge_error.take() {
                // Reported here; not again by the next operation.
                guard.merge_error = None;
                guard.force_merge_max = None;
                guard.segments_to_merge.clear();
                return Err(SegdexError::merge_failed(
                    "force merge",
                    SegdexError::other(message),
                ));
            }
            if !guard.forced_merges_outstanding() {
                break;
            }
            self.merge_done.wait(&mut guard);
        }
        guard.force_merge_max = None;
        guard.segments_to_merge.clear();
        drop(guard);
        self.ensure_open()
    }

    fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.ensure_open()?;
        self.take_merge_error()?;
        let registered = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.flush(state)?;
            if state.stop_merges {
                Vec::new()
            } else {
                let ctx = MergeContext::new(state.merging.clone(), state.pool.del_counts(&state.infos));
                match self.config.merge_policy.find_forced_deletes_merges(&state.infos, &ctx) {
                    Some(spec) => spec
                        .into_iter()
                        .filter_map(|merge| self.register_merge(state, merge))
                        .collect(),
                    None => Vec::new(),
                }
            }
        };
        info!("force merge deletes: {} merges", registered.len());
        self.scheduler.merge(self.merge_source()?, MergeTrigger::Explicit)?;
        if !do_wait {
            return Ok(());
        }

        let mut guard = self.state.lock();
        while registered.iter().any(|m| {
            !matches!(
                m.state(),
                MergeState::Completed | MergeState::Aborted | MergeState::Failed
            )
        }) {
            self.merge_done.wait(&mut guard);
        }
        drop(guard);
        match registered.iter().find_map(|m| m.error()) {
            Some(message) => Err(SegdexError::merge_failed(
                "force merge deletes",
                SegdexError::other(message),
            )),
            None => Ok(()),
        }
    }

    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let result = self.merge_init(merge).and_then(|inputs| {
            let merged = self.merge_middle(merge, &inputs)?;
            self.merge_commit(merge, &inputs, merged)
        });
        let outcome = match result {
            Ok(()) => {
                merge.set_state(MergeState::Completed);
                Ok(())
            }
            Err(e) => Err(self.handle_merge_error(merge, e)),
        };
        self.merge_finish(merge, outcome.is_ok());
        outcome
    }

    /// Snapshot the inputs' live docs and overlays and name the output.
    fn merge_init(&self, merge: &Arc<OneMerge>) -> Result<Vec<MergeInput>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        merge.check_abort(0)?;
        for info in merge.segments() {
            if !state.infos.contains(info.name()) {
                return Err(SegdexError::illegal_state(format!(
                    "merge {} references {} which is not in the index",
                    merge.id(),
                    info.name()
                )));
            }
        }

        let name = state.infos.new_segment_name();
        merge.set_output_name(name.clone());
        let mut deleter = self.deleter.lock();
        deleter.protect(&name);

        let mut inputs = Vec::with_capacity(merge.segments().len());
        for segment in merge.segments() {
            let current = state
                .infos
                .get(segment.name())
                .cloned()
                .ok_or_else(|| SegdexError::illegal_state(format!("{} vanished", segment.name())))?;
            inputs.push(state.pool.get(&current, &mut deleter)?.merge_input());
        }
        info!("merging {} into {name}", merge.seg_string());
        Ok(inputs)
    }

    fn merge_middle(&self, merge: &Arc<OneMerge>, inputs: &[MergeInput]) -> Result<MergedSegment> {
        let name = merge
            .output_name()
            .ok_or_else(|| SegdexError::illegal_state("merge was not initialized"))?;
        self.config.codec.merge(
            self.storage.as_ref(),
            &name,
            inputs,
            &|processed| merge.check_abort(processed),
        )
    }

    /// Splice the output into the segment list in place of the inputs.
    fn merge_commit(
        &self,
        merge: &Arc<OneMerge>,
        inputs: &[MergeInput],
        merged: MergedSegment,
    ) -> Result<()> {
        let name = merge
            .output_name()
            .ok_or_else(|| SegdexError::illegal_state("merge was not initialized"))?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        merge.check_abort(merged.doc_count)?;
        let mut deleter = self.deleter.lock();

        // Deletes and updates that landed while the merge ran.
        let mut carried_deletes = Vec::new();
        let mut carried_updates = Vec::new();
        for (idx, input) in inputs.iter().enumerate() {
            let current = state
                .infos
                .get(&input.segment)
                .cloned()
                .ok_or_else(|| SegdexError::illegal_state(format!("{} vanished", input.segment)))?;
            let entry = state.pool.get(&current, &mut deleter)?;
            let live_now = entry.live_docs();
            let changed = match &input.live_docs {
                Some(before) => !Arc::ptr_eq(before, live_now),
                None => live_now.num_deleted() > 0,
            };
            if changed {
                for doc in 0..input.core.max_doc() {
                    let was_live = input.live_docs.as_ref().is_none_or(|l| l.is_live(doc));
                    if was_live && !live_now.is_live(doc) {
                        carried_deletes.extend(merged.doc_map.get(idx, doc));
                    }
                }
            }
            if !Arc::ptr_eq(&input.doc_values, entry.doc_values()) {
                for (field, doc, value) in entry.doc_values().iter() {
                    if input.doc_values.get(doc, field) != Some(value) {
                        if let Some(new_doc) = merged.doc_map.get(idx, doc) {
                            carried_updates.push((new_doc, field.to_string(), value));
                        }
                    }
                }
            }
        }

        let input_names = merge.segment_names();
        let size = merged
            .files
            .iter()
            .map(|f| self.storage.file_size(f))
            .sum::<Result<u64>>()?;
        let live = merged.doc_count as usize - carried_deletes.len();
        let output = if live == 0 {
            None
        } else {
            let mut info = SegmentInfo::new(
                name.clone(),
                merged.doc_count,
                self.config.codec.name(),
                merged.files.clone(),
                size,
                "merge",
                state.infos.generation,
            );
            info.diagnostics.insert(
                "merge_inputs".to_string(),
                input_names.iter().cloned().collect::<Vec<_>>().join(","),
            );
            let output = SegmentCommitInfo::new(info);
            if !carried_deletes.is_empty() || !carried_updates.is_empty() {
                let entry = state.pool.get(&output, &mut deleter)?;
                for doc in &carried_deletes {
                    entry.delete(*doc);
                }
                for (doc, field, value) in &carried_updates {
                    entry.set_numeric(*doc, field, *value);
                }
                debug!(
                    "carried {} deletes and {} updates into {name}",
                    carried_deletes.len(),
                    carried_updates.len()
                );
            }
            Some(output)
        };

        let dropped = output.is_none();
        state.infos.apply_merge_changes(&input_names, output);
        for input in &input_names {
            state.pool.release(input, &mut deleter)?;
        }
        if merge.max_num_segments.is_some() && state.force_merge_max.is_some() {
            for input in &input_names {
                state.segments_to_merge.remove(input);
            }
            if !dropped {
                state.segments_to_merge.insert(name.clone(), false);
            }
        }
        let checkpointed = deleter.checkpoint(&state.infos, false);
        deleter.unprotect(&name);
        if dropped {
            info!("merge {} produced no live documents; dropped {name}", merge.seg_string());
            deleter.delete_new_files(&merged.files);
        } else {
            info!(
                "merged {} into {name}: {live} live of {} docs",
                merge.seg_string(),
                merged.doc_count
            );
        }
        checkpointed
    }

    /// Clean up after a failed or aborted merge and record the failure.
    fn handle_merge_error(&self, merge: &Arc<OneMerge>, e: SegdexError) -> SegdexError {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(name) = merge.output_name() {
            let mut deleter = self.deleter.lock();
            if let Err(release) = state.pool.release(&name, &mut deleter) {
                warn!("could not release failed merge output {name}: {release}");
            }
            deleter.unprotect(&name);
            deleter.refresh_segment(&name);
        }

        if merge.is_aborted() || e.is_merge_aborted() {
            merge.set_state(MergeState::Aborted);
            info!("merge {} aborted", merge.seg_string());
            return SegdexError::merge_aborted(merge.seg_string());
        }

        let failed = SegdexError::merge_failed(merge.seg_string(), e);
        merge.set_error(&failed);
        merge.set_state(MergeState::Failed);
        if merge.max_num_segments.is_some() {
            state.force_merge_error = Some(failed.to_string());
        }
        let reported = SegdexError::merge_failed(merge.seg_string(), SegdexError::other(failed.to_string()));
        match self.config.merge_exception_mode {
            MergeExceptionMode::Suppress => warn!("merge failed (suppressed): {failed}"),
            MergeExceptionMode::Propagate => {
                warn!("merge failed: {failed}");
                if state.merge_error.is_none() {
                    state.merge_error = Some(failed);
                }
            }
        }
        reported
    }

    fn merge_finish(&self, merge: &Arc<OneMerge>, succeeded: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for name in merge.segment_names() {
            state.merging.remove(&name);
        }
        state.running_merges.retain(|m| m.id() != merge.id());

        if succeeded && !state.stop_merges {
            match state.force_merge_max {
                Some(max) => {
                    self.update_pending_merges(state, MergeTrigger::MergeFinished, Some(max));
                    if !state.forced_merges_outstanding() {
                        state.force_merge_max = None;
                    }
                }
                None => {
                    self.update_pending_merges(state, MergeTrigger::MergeFinished, None);
                }
            }
        }
        self.merge_done.notify_all();
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        if state.stop_merges {
            return None;
        }
        let merge = state.pending_merges.pop_front()?;
        merge.set_state(MergeState::Running);
        state.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn pending_merge_count(&self) -> usize {
        let state = self.state.lock();
        if state.stop_merges {
            0
        } else {
            state.pending_merges.len()
        }
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.run_merge(merge)
    }
}

impl ReaderSource for WriterInner {
    fn reopen_if_changed(&self, version: u64) -> Result<Option<DirectoryReader>> {
        self.ensure_open()?;
        let (reader, flushed) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.infos.version == version && !state.buffer.has_changes() {
                return Ok(None);
            }
            self.open_nrt_reader(state, true)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(Some(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::reader::IndexReader;
    use crate::index::merge_policy::NoMergePolicy;
    use crate::index::merge_scheduler::MergeSchedulerConfig;
    use crate::storage::memory::MemoryStorage;

    fn doc(id: &str) -> Document {
        Document::builder()
            .add_keyword("id", id)
            .add_text("body", format!("text of {id}"))
            .build()
    }

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::new()
            .with_max_buffered_docs(Some(2))
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_merge_scheduler(MergeSchedulerConfig::Serial)
    }

    #[test]
    fn test_flush_on_max_buffered_docs() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage, config()).unwrap();
        for i in 0..5 {
            writer.add_document(doc(&i.to_string())).unwrap();
        }
        assert_eq!(writer.segment_count(), 2);
        assert_eq!(writer.max_doc(), 5);
        assert_eq!(writer.num_docs(), 5);
        writer.close().unwrap();
    }

    #[test]
    fn test_update_document_replaces() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage, config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.add_document(doc("b")).unwrap();
        writer.update_document(Term::new("id", "a"), doc("a")).unwrap();

        let reader = writer.get_reader(true).unwrap();
        assert_eq!(reader.num_docs(), 2);
        assert_eq!(reader.doc_freq(&Term::new("id", "a")).unwrap(), 1);
        reader.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_nothing_to_commit_writes_nothing() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage.clone(), config()).unwrap();
        writer.commit().unwrap();
        assert!(storage.file_exists("segments_1"));
        writer.commit().unwrap();
        assert!(!storage.file_exists("segments_2"));
        writer.close().unwrap();
    }

    #[test]
    fn test_prepare_twice_is_illegal() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage, config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        writer.prepare_commit().unwrap();
        assert!(matches!(writer.prepare_commit(), Err(SegdexError::IllegalState(_))));
        writer.commit().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_closed_writer_rejects_operations() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage, config()).unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(matches!(writer.add_document(doc("a")), Err(SegdexError::AlreadyClosed(_))));
        writer.close().unwrap();
    }

    #[test]
    fn test_immense_term_keeps_writer_usable() {
        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage, config()).unwrap();
        let big = "x".repeat(crate::document::MAX_TERM_LENGTH + 1);
        let bad = Document::builder().add_keyword("id", big).build();
        assert!(matches!(writer.add_document(bad.clone()), Err(SegdexError::InvalidArgument(_))));
        assert!(writer.update_document(Term::new("id", "a"), bad).is_err());
        writer.add_document(doc("a")).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.num_docs(), 1);
        writer.close().unwrap();
    }

    #[test]
    fn test_flush_on_ram_buffer() {
        let storage = Arc::new(MemoryStorage::new_default());
        let config = config()
            .with_max_buffered_docs(None)
            .with_ram_buffer_size_mb(Some(0.0001));
        let writer = IndexWriter::new(storage, config).unwrap();
        let body = "word ".repeat(40);
        for i in 0..3 {
            let doc = Document::builder()
                .add_keyword("id", i.to_string())
                .add_text("body", body.clone())
                .build();
            writer.add_document(doc).unwrap();
        }
        assert_eq!(writer.segment_count(), 3);
        writer.close().unwrap();
    }

    #[test]
    fn test_apply_on_max_buffered_delete_terms() {
        let storage = Arc::new(MemoryStorage::new_default());
        let config = config().with_max_buffered_delete_terms(Some(2));
        let writer = IndexWriter::new(storage, config).unwrap();
        for i in 0..4 {
            writer.add_document(doc(&i.to_string())).unwrap();
        }
        writer.delete_documents(Term::new("id", "0")).unwrap();
        assert_eq!(writer.inner.state.lock().buffer.num_delete_terms(), 1);
        writer.delete_documents(Term::new("id", "3")).unwrap();
        assert_eq!(writer.inner.state.lock().buffer.num_delete_terms(), 0);
        assert_eq!(writer.num_docs(), 2);
        assert_eq!(writer.segment_count(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_post_commit_failure_is_a_warning() {
        use crate::storage::memory::{FailPoint, StorageOp};

        let storage = Arc::new(MemoryStorage::new_default());
        let writer = IndexWriter::new(storage.clone(), config()).unwrap();
        writer.add_document(doc("a")).unwrap();
        storage.fail_on(FailPoint::once(StorageOp::CreateOutput, file_names::SEGMENTS_GEN));
        writer.commit().unwrap();

        assert!(storage.file_exists("segments_1"));
        assert!(writer.take_post_commit_warning().is_some());
        assert!(writer.take_post_commit_warning().is_none());
        assert_eq!(SegmentInfos::read_latest(storage.as_ref()).unwrap().generation, 1);
        writer.close().unwrap();
    }
}
