//! Writer-side per-segment state.
//!
//! The pool keeps each segment's decoded core together with its current live
//! docs and doc-values overlay, including edits that have not been written
//! yet. Live docs and overlays are copy-on-write `Arc`s: a reader handed out
//! earlier keeps seeing the bitmap it was given while the writer deletes more
//! documents.
//!
//! A pooled core holds a reference on its segment's files until it is
//! released.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::debug;

use crate::document::Term;
use crate::error::Result;
use crate::index::buffer::NumericUpdate;
use crate::index::codec::{Codec, MergeInput, SegmentCore};
use crate::index::deleter::IndexFileDeleter;
use crate::index::doc_values::DocValuesUpdates;
use crate::index::live_docs::LiveDocs;
use crate::index::manifest::SegmentInfos;
use crate::index::reader::SegmentReader;
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Storage;

/// State of one segment inside the writer.
#[derive(Debug)]
pub struct ReadersAndUpdates {
    segment: String,
    core: Arc<SegmentCore>,
    core_files: BTreeSet<String>,
    live_docs: Arc<LiveDocs>,
    pending_delete_count: u32,
    doc_values: Arc<DocValuesUpdates>,
    doc_values_dirty: bool,
}

impl ReadersAndUpdates {
    fn load(storage: &dyn Storage, codec: &dyn Codec, info: &SegmentCommitInfo) -> Result<Self> {
        let reader = SegmentReader::open(storage, codec, info)?;
        Ok(ReadersAndUpdates {
            segment: info.name().to_string(),
            core: Arc::clone(reader.core()),
            core_files: info.info.files.clone(),
            live_docs: Arc::clone(reader.live_docs()),
            pending_delete_count: 0,
            doc_values: Arc::clone(reader.doc_values()),
            doc_values_dirty: false,
        })
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

    /// Deleted documents, written or not.
    pub fn num_deleted(&self) -> u32 {
        self.live_docs.num_deleted()
    }

    /// Whether there are edits not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.pending_delete_count > 0 || self.doc_values_dirty
    }

    /// Delete one document. Returns whether it was live.
    pub fn delete(&mut self, doc: u32) -> bool {
        if !self.live_docs.is_live(doc) {
            return false;
        }
        Arc::make_mut(&mut self.live_docs).delete(doc);
        self.pending_delete_count += 1;
        true
    }

    /// Delete every document containing `term`. Returns how many were live.
    pub fn delete_term(&mut self, term: &Term) -> u32 {
        let docs: Vec<u32> = self.core.postings(term).to_vec();
        docs.into_iter().filter(|doc| self.delete(*doc)).count() as u32
    }

    /// Set one numeric value.
    pub fn set_numeric(&mut self, doc: u32, field: &str, value: i64) {
        Arc::make_mut(&mut self.doc_values).set(doc, field, value);
        self.doc_values_dirty = true;
    }

    /// Apply a term-based numeric update to live documents. Returns how many
    /// documents were updated.
    pub fn apply_numeric(&mut self, update: &NumericUpdate) -> u32 {
        let docs: Vec<u32> = self
            .core
            .postings(&update.term)
            .iter()
            .copied()
            .filter(|doc| self.live_docs.is_live(*doc))
            .collect();
        for doc in &docs {
            self.set_numeric(*doc, &update.field, update.value);
        }
        docs.len() as u32
    }

    /// Write pending edits as new generations of the segment's overlay
    /// files and advance `info` to them. Returns the files written.
    ///
    /// A generation whose file already exists is skipped; a generation whose
    /// write fails is never reused.
    pub fn write_pending(
        &mut self,
        storage: &dyn Storage,
        info: &mut SegmentCommitInfo,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        if self.pending_delete_count > 0 {
            let name = loop {
                let name = info.next_live_docs_file_name();
                if !storage.file_exists(&name) {
                    break name;
                }
                info.advance_next_write_del_gen();
            };
            if let Err(e) = self.live_docs.write(storage, &name, &self.segment) {
                info.advance_next_write_del_gen();
                let _ = storage.delete_file(&name);
                return Err(e);
            }
            info.advance_del_gen();
            info.del_count = self.live_docs.num_deleted();
            self.pending_delete_count = 0;
            debug!("wrote {name}: {} deleted docs", info.del_count);
            written.push(name);
        }
        if self.doc_values_dirty {
            let name = loop {
                let name = info.next_doc_values_file_name();
                if !storage.file_exists(&name) {
                    break name;
                }
                info.advance_next_write_dv_gen();
            };
            if let Err(e) = self.doc_values.write(storage, &name) {
                info.advance_next_write_dv_gen();
                let _ = storage.delete_file(&name);
                return Err(e);
            }
            info.advance_dv_gen();
            self.doc_values_dirty = false;
            debug!("wrote {name}: {} doc-values updates", self.doc_values.len());
            written.push(name);
        }
        Ok(written)
    }

    /// Snapshot taken when a merge starts.
    pub fn merge_input(&self) -> MergeInput {
        MergeInput {
            segment: self.segment.clone(),
            core: Arc::clone(&self.core),
            live_docs: (self.live_docs.num_deleted() > 0).then(|| Arc::clone(&self.live_docs)),
            doc_values: Arc::clone(&self.doc_values),
        }
    }

    /// Point-in-time reader over the current state.
    pub fn reader(&self, info: &SegmentCommitInfo) -> SegmentReader {
        SegmentReader::new(
            info.clone(),
            Arc::clone(&self.core),
            Arc::clone(&self.live_docs),
            Arc::clone(&self.doc_values),
        )
    }
}

/// Per-segment writer state, keyed by segment name.
#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    pooling: bool,
    entries: HashMap<String, ReadersAndUpdates>,
}

impl ReaderPool {
    pub fn new(storage: Arc<dyn Storage>, codec: Arc<dyn Codec>, pooling: bool) -> Self {
        ReaderPool {
            storage,
            codec,
            pooling,
            entries: HashMap::new(),
        }
    }

    /// The state of `info`'s segment, loading it if needed.
    pub fn get(
        &mut self,
        info: &SegmentCommitInfo,
        deleter: &mut IndexFileDeleter,
    ) -> Result<&mut ReadersAndUpdates> {
        match self.entries.entry(info.name().to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let entry =
                    ReadersAndUpdates::load(self.storage.as_ref(), self.codec.as_ref(), info)?;
                deleter.inc_ref(&entry.core_files);
                Ok(slot.insert(entry))
            }
        }
    }

    /// The state of a segment if it is loaded.
    pub fn get_if_loaded(&self, segment: &str) -> Option<&ReadersAndUpdates> {
        self.entries.get(segment)
    }

    /// Register a segment just written by a flush.
    pub fn insert_flushed(
        &mut self,
        info: &SegmentCommitInfo,
        core: SegmentCore,
        live_docs: Option<LiveDocs>,
        deleter: &mut IndexFileDeleter,
    ) {
        let max_doc = core.max_doc();
        let (live_docs, pending) = match live_docs {
            Some(live) => {
                let deleted = live.num_deleted();
                (live, deleted)
            }
            None => (LiveDocs::all_live(max_doc), 0),
        };
        let entry = ReadersAndUpdates {
            segment: info.name().to_string(),
            core: Arc::new(core),
            core_files: info.info.files.clone(),
            live_docs: Arc::new(live_docs),
            pending_delete_count: pending,
            doc_values: Arc::new(DocValuesUpdates::new()),
            doc_values_dirty: false,
        };
        deleter.inc_ref(&entry.core_files);
        if let Some(old) = self.entries.insert(info.name().to_string(), entry) {
            let _ = deleter.dec_ref(&old.core_files);
        }
    }

    /// Deleted documents of `info`, counting edits not yet written.
    pub fn num_deleted(&self, info: &SegmentCommitInfo) -> u32 {
        self.entries
            .get(info.name())
            .map_or(info.del_count, ReadersAndUpdates::num_deleted)
    }

    /// Delete counts of every segment in `infos`.
    pub fn del_counts(&self, infos: &SegmentInfos) -> HashMap<String, u32> {
        infos
            .segments()
            .iter()
            .map(|info| (info.name().to_string(), self.num_deleted(info)))
            .collect()
    }

    /// Apply term deletes to every segment of `infos`. Returns the number of
    /// documents newly deleted.
    pub fn apply_deletes(
        &mut self,
        infos: &SegmentInfos,
        terms: &[Term],
        deleter: &mut IndexFileDeleter,
    ) -> Result<u64> {
        let mut deleted = 0u64;
        for info in infos.segments() {
            let entry = self.get(info, deleter)?;
            for term in terms {
                deleted += entry.delete_term(term) as u64;
            }
        }
        Ok(deleted)
    }

    /// Apply numeric updates to every segment of `infos`.
    pub fn apply_numeric_updates(
        &mut self,
        infos: &SegmentInfos,
        updates: &[NumericUpdate],
        deleter: &mut IndexFileDeleter,
    ) -> Result<u64> {
        let mut updated = 0u64;
        for info in infos.segments() {
            let entry = self.get(info, deleter)?;
            for update in updates {
                updated += entry.apply_numeric(update) as u64;
            }
        }
        Ok(updated)
    }

    /// Whether any segment has edits not yet written.
    pub fn any_dirty(&self) -> bool {
        self.entries.values().any(ReadersAndUpdates::is_dirty)
    }

    /// Write the pending edits of every segment in `infos`. Returns the files
    /// written.
    pub fn write_all_pending(&mut self, infos: &mut SegmentInfos) -> Result<Vec<String>> {
        let mut written = Vec::new();
        for info in infos.segments_mut().iter_mut() {
            if let Some(entry) = self.entries.get_mut(info.name()) {
                written.extend(entry.write_pending(self.storage.as_ref(), info)?);
            }
        }
        if !written.is_empty() {
            infos.changed();
        }
        Ok(written)
    }

    /// Drop the state of one segment.
    pub fn release(&mut self, segment: &str, deleter: &mut IndexFileDeleter) -> Result<()> {
        if let Some(entry) = self.entries.remove(segment) {
            deleter.dec_ref(&entry.core_files)?;
        }
        Ok(())
    }

    /// Drop entries for segments no longer in `infos`, and with pooling off
    /// every entry without pending edits.
    pub fn prune(&mut self, infos: &SegmentInfos, deleter: &mut IndexFileDeleter) -> Result<()> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(name, entry)| {
                !infos.contains(name) || (!self.pooling && !entry.is_dirty())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.release(&name, deleter)?;
        }
        Ok(())
    }

    /// Drop every entry, discarding unwritten edits.
    pub fn drop_all(&mut self, deleter: &mut IndexFileDeleter) -> Result<()> {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            self.release(&name, deleter)?;
        }
        Ok(())
    }

    /// Number of loaded segments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::codec::StoredFieldsCodec;
    use crate::index::deletion_policy::KeepOnlyLastCommitDeletionPolicy;
    use crate::index::reader::IndexReader;
    use crate::index::segment::SegmentInfo;
    use crate::storage::memory::MemoryStorage;

    fn setup(n: usize) -> (MemoryStorage, ReaderPool, IndexFileDeleter, SegmentInfos) {
        let storage = MemoryStorage::new_default();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let codec = StoredFieldsCodec::new();
        let mut infos = SegmentInfos::new();
        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&shared),
            Arc::new(KeepOnlyLastCommitDeletionPolicy),
            &mut infos,
            true,
        )
        .unwrap();

        let docs: Vec<Document> = (0..n)
            .map(|i| Document::builder().add_keyword("id", format!("{}", i % 2)).build())
            .collect();
        let name = infos.new_segment_name();
        let files = codec.write_segment(&storage, &name, &docs).unwrap();
        infos.add(SegmentCommitInfo::new(SegmentInfo::new(name, n as u32, "Segdex10", files, 0, "flush", 0)));
        deleter.checkpoint(&infos, false).unwrap();

        let pool = ReaderPool::new(shared, Arc::new(codec), true);
        (storage, pool, deleter, infos)
    }

    #[test]
    fn test_deletes_are_copy_on_write() {
        let (_storage, mut pool, mut deleter, infos) = setup(4);
        let info = infos.segments()[0].clone();
        let before = pool.get(&info, &mut deleter).unwrap().reader(&info);

        let deleted = pool
            .apply_deletes(&infos, &[Term::new("id", "0")], &mut deleter)
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(before.num_docs(), 4);
        assert_eq!(pool.num_deleted(&info), 2);
        assert!(pool.any_dirty());
        assert_eq!(deleter.ref_count("_0.fdt"), 2);
    }

    #[test]
    fn test_write_pending_skips_existing_generation() {
        let (storage, mut pool, mut deleter, mut infos) = setup(4);
        pool.apply_deletes(&infos, &[Term::new("id", "1")], &mut deleter)
            .unwrap();
        let update = NumericUpdate {
            term: Term::new("id", "0"),
            field: "price".to_string(),
            value: 9,
        };
        pool.apply_numeric_updates(&infos, &[update], &mut deleter).unwrap();

        // Leftover of a crashed session.
        let mut out = storage.create_output("_0_1.del").unwrap();
        out.close().unwrap();

        let written = pool.write_all_pending(&mut infos).unwrap();
        assert_eq!(written, vec!["_0_2.del".to_string(), "_0_1.dvu".to_string()]);
        let info = &infos.segments()[0];
        assert_eq!(info.del_gen, 2);
        assert_eq!(info.del_count, 2);
        assert_eq!(info.dv_gen, 1);
        assert!(!pool.any_dirty());

        // A fresh load sees the written state.
        pool.drop_all(&mut deleter).unwrap();
        let entry = pool.get(info, &mut deleter).unwrap();
        assert_eq!(entry.num_deleted(), 2);
        assert_eq!(entry.doc_values().get(0, "price"), Some(9));
        assert_eq!(entry.doc_values().get(1, "price"), None);
    }

    #[test]
    fn test_prune_releases_core_refs() {
        let (_storage, mut pool, mut deleter, mut infos) = setup(2);
        let info = infos.segments()[0].clone();
        pool.get(&info, &mut deleter).unwrap();
        assert_eq!(pool.len(), 1);

        infos.clear();
        deleter.checkpoint(&infos, false).unwrap();
        assert_eq!(deleter.ref_count("_0.fdt"), 1);
        pool.prune(&infos, &mut deleter).unwrap();
        assert!(pool.is_empty());
        assert_eq!(deleter.ref_count("_0.fdt"), 0);
    }
}
