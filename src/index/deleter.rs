//! Reference counting of index files.
//!
//! Every file is held by whoever needs it: each kept commit, the writer's
//! current in-memory state, open NRT readers and pooled segment cores. When a
//! count drops to zero the file is deleted. Only names the engine recognizes
//! are ever touched, and files belonging to a flush or merge still in flight
//! are left alone.
//!
//! Deletes that fail (e.g. a file still open on a platform that refuses to
//! delete open files) are queued and retried on later checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};

use crate::error::{Result, SegdexError};
use crate::index::deletion_policy::{IndexCommit, IndexDeletionPolicy};
use crate::index::file_names::{self, DOC_VALUES_EXTENSION, LIVE_DOCS_EXTENSION};
use crate::index::manifest::SegmentInfos;
use crate::storage::Storage;

/// Tracks which files are in use and deletes the rest.
#[derive(Debug)]
pub struct IndexFileDeleter {
    storage: Arc<dyn Storage>,
    policy: Arc<dyn IndexDeletionPolicy>,
    ref_counts: AHashMap<String, u32>,
    /// Kept commits, oldest first.
    commits: Vec<IndexCommit>,
    /// Files held on behalf of the writer's in-memory state.
    last_files: BTreeSet<String>,
    /// Deletes that failed and will be retried.
    deletable: BTreeSet<String>,
    /// Segments being written by a flush or merge.
    in_flight: BTreeSet<String>,
}

impl IndexFileDeleter {
    /// Load every commit in the directory, apply the deletion policy, and
    /// delete leftovers of earlier sessions.
    ///
    /// `infos` is the state the writer starts from. Its name counter, commit
    /// generation and per-segment generations are raised past every file on
    /// disk so that no leftover file is ever overwritten.
    pub fn new(
        storage: Arc<dyn Storage>,
        policy: Arc<dyn IndexDeletionPolicy>,
        infos: &mut SegmentInfos,
        is_create: bool,
    ) -> Result<Self> {
        let mut deleter = IndexFileDeleter {
            storage,
            policy,
            ref_counts: AHashMap::new(),
            commits: Vec::new(),
            last_files: BTreeSet::new(),
            deletable: BTreeSet::new(),
            in_flight: BTreeSet::new(),
        };

        let files = deleter.storage.list_files()?;
        Self::inflate_generations(infos, &files);

        let mut commits = Vec::new();
        for name in files.iter().filter(|n| file_names::is_index_file(n)) {
            deleter.ref_counts.entry(name.clone()).or_insert(0);
            if !file_names::is_segments_file(name) {
                continue;
            }
            let Some(generation) = file_names::parse_generation(name) else {
                continue;
            };
            match SegmentInfos::read_generation(deleter.storage.as_ref(), generation) {
                Some(commit_infos) => {
                    let commit = IndexCommit::from_infos(&commit_infos);
                    // A commit whose files are gone cannot be opened; treat it
                    // like a corrupt manifest.
                    if let Some(missing) = commit
                        .file_names()
                        .iter()
                        .find(|f| !deleter.storage.file_exists(f))
                    {
                        warn!("{name} references missing file {missing}; ignoring it");
                        continue;
                    }
                    commits.push(commit);
                }
                None => debug!("{name} does not validate; it will be removed"),
            }
        }
        commits.sort_by_key(IndexCommit::generation);
        for commit in &commits {
            deleter.inc_ref_all(commit.file_names().iter());
        }
        deleter.commits = commits;

        if is_create {
            // A new index supersedes every commit in the directory but keeps
            // them until the first commit of the new index.
            debug!("create mode: {} earlier commits kept until first commit", deleter.commits.len());
        }

        // The writer's starting state holds its files from the start.
        deleter.checkpoint(infos, false)?;

        let mut newest_first: Vec<IndexCommit> = deleter.commits.iter().rev().cloned().collect();
        if !newest_first.is_empty() {
            deleter.policy.on_init(&mut newest_first)?;
        }
        deleter.apply_policy_decisions(newest_first)?;
        deleter.delete_unreferenced();

        info!(
            "file deleter ready: {} commits kept, {} files tracked",
            deleter.commits.len(),
            deleter.ref_counts.len()
        );
        Ok(deleter)
    }

    /// Raise counters of `infos` past what `files` already use.
    fn inflate_generations(infos: &mut SegmentInfos, files: &[String]) {
        let mut max_counter = None;
        for name in files {
            if file_names::is_segments_file(name) || file_names::is_pending_segments_file(name) {
                if let Some(generation) = file_names::parse_generation(name) {
                    infos.last_generation = infos.last_generation.max(generation);
                }
                continue;
            }
            if !file_names::is_segment_file(name) {
                continue;
            }
            let Some(segment) = file_names::parse_segment_name(name) else {
                continue;
            };
            if let Some(counter) = file_names::from_radix36(&segment[1..]) {
                max_counter = max_counter.max(Some(counter));
            }
            let Some(generation) = file_names::parse_file_generation(name) else {
                continue;
            };
            let ext = file_names::file_extension(name);
            if let Some(seg) = infos.get_mut(segment) {
                if ext == Some(LIVE_DOCS_EXTENSION) && seg.next_write_del_gen <= generation {
                    seg.next_write_del_gen = generation + 1;
                } else if ext == Some(DOC_VALUES_EXTENSION) && seg.next_write_dv_gen <= generation {
                    seg.next_write_dv_gen = generation + 1;
                }
            }
        }
        if let Some(counter) = max_counter {
            if infos.counter <= counter {
                debug!("raising segment counter from {} past {counter}", infos.counter);
                infos.counter = counter + 1;
            }
        }
    }

    fn inc_ref_all<'a>(&mut self, files: impl Iterator<Item = &'a String>) {
        for file in files {
            *self.ref_counts.entry(file.clone()).or_insert(0) += 1;
        }
    }

    /// Add a reference to each of `files`.
    pub fn inc_ref(&mut self, files: &BTreeSet<String>) {
        self.inc_ref_all(files.iter());
    }

    /// Drop a reference to each of `files`, deleting those no longer held.
    pub fn dec_ref(&mut self, files: &BTreeSet<String>) -> Result<()> {
        for file in files {
            self.dec_ref_file(file)?;
        }
        self.delete_pending_files();
        Ok(())
    }

    fn dec_ref_file(&mut self, file: &str) -> Result<()> {
        let count = self.ref_counts.get_mut(file).ok_or_else(|| {
            SegdexError::illegal_state(format!("dec_ref of untracked file {file}"))
        })?;
        if *count == 0 {
            return Err(SegdexError::illegal_state(format!(
                "ref count of {file} is already zero"
            )));
        }
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(file);
            self.delete_file(file);
        }
        Ok(())
    }

    /// Number of holders of `file`.
    pub fn ref_count(&self, file: &str) -> u32 {
        self.ref_counts.get(file).copied().unwrap_or(0)
    }

    /// Whether `file` is held by anyone.
    pub fn exists(&self, file: &str) -> bool {
        self.ref_count(file) > 0
    }

    /// Mark a segment as being written so its files are never swept.
    pub fn protect(&mut self, segment: &str) {
        self.in_flight.insert(segment.to_string());
    }

    /// The flush or merge writing `segment` finished or failed.
    pub fn unprotect(&mut self, segment: &str) {
        self.in_flight.remove(segment);
    }

    fn is_protected(&self, file: &str) -> bool {
        file_names::parse_segment_name(file).is_some_and(|segment| self.in_flight.contains(segment))
    }

    /// Record a new state of the writer.
    ///
    /// With `is_commit` the state was just committed: it becomes a commit
    /// point holding all its files, the policy is consulted and commits it
    /// drops are removed. Otherwise the in-memory state's files replace the
    /// previous in-memory state's.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        self.delete_pending_files();

        if is_commit {
            let commit = IndexCommit::from_infos(infos);
            self.inc_ref(commit.file_names());
            self.commits.push(commit);
            self.revisit_policy()?;
        } else {
            let files = infos.files(false);
            self.inc_ref(&files);
            let previous = std::mem::replace(&mut self.last_files, files);
            self.dec_ref(&previous)?;
        }
        Ok(())
    }

    /// Consult the policy again, e.g. after a snapshot was released.
    pub fn revisit_policy(&mut self) -> Result<()> {
        if self.commits.is_empty() {
            return Ok(());
        }
        let mut newest_first: Vec<IndexCommit> = self.commits.iter().rev().cloned().collect();
        self.policy.on_commit(&mut newest_first)?;
        self.apply_policy_decisions(newest_first)
    }

    fn apply_policy_decisions(&mut self, newest_first: Vec<IndexCommit>) -> Result<()> {
        let mut kept = Vec::with_capacity(newest_first.len());
        let mut dropped = Vec::new();
        for commit in newest_first.into_iter().rev() {
            if commit.is_deleted() {
                dropped.push(commit);
            } else {
                kept.push(commit);
            }
        }
        self.commits = kept;
        for commit in dropped {
            debug!("deleting commit {}", commit.segments_file_name());
            self.dec_ref(commit.file_names())?;
        }
        Ok(())
    }

    /// Kept commits, oldest first.
    pub fn commits(&self) -> &[IndexCommit] {
        &self.commits
    }

    fn delete_file(&mut self, file: &str) {
        if !file_names::is_index_file(file) {
            return;
        }
        match self.storage.delete_file(file) {
            Ok(()) => {
                self.deletable.remove(file);
                debug!("deleted {file}");
            }
            Err(e) => {
                if self.storage.file_exists(file) {
                    warn!("could not delete {file}, will retry: {e}");
                    self.deletable.insert(file.to_string());
                } else {
                    self.deletable.remove(file);
                }
            }
        }
    }

    /// Retry deletes that failed earlier.
    pub fn delete_pending_files(&mut self) {
        if self.deletable.is_empty() {
            return;
        }
        let pending: Vec<String> = self.deletable.iter().cloned().collect();
        for file in pending {
            if self.ref_counts.contains_key(&file) {
                // Referenced again since; keep it.
                self.deletable.remove(&file);
                continue;
            }
            self.delete_file(&file);
        }
    }

    /// Names queued for a retried delete.
    pub fn pending_deletes(&self) -> &BTreeSet<String> {
        &self.deletable
    }

    /// Delete every recognized file no one holds, except in-flight outputs.
    pub fn delete_unreferenced(&mut self) -> usize {
        self.sweep(None)
    }

    /// Like [`IndexFileDeleter::delete_unreferenced`], limited to the files of
    /// one segment, e.g. after a failed flush or merge.
    pub fn refresh_segment(&mut self, segment: &str) -> usize {
        self.sweep(Some(segment))
    }

    fn sweep(&mut self, segment: Option<&str>) -> usize {
        self.delete_pending_files();
        let files = match self.storage.list_files() {
            Ok(files) => files,
            Err(e) => {
                warn!("could not list files for cleanup: {e}");
                return 0;
            }
        };
        let mut deleted = 0;
        for file in files {
            if !file_names::is_index_file(&file) || self.exists(&file) || self.is_protected(&file) {
                continue;
            }
            if let Some(segment) = segment {
                if file_names::parse_segment_name(&file) != Some(segment) {
                    continue;
                }
            }
            self.ref_counts.remove(&file);
            self.delete_file(&file);
            if !self.deletable.contains(&file) {
                deleted += 1;
            }
        }
        deleted
    }

    /// Delete files written for a state that never became visible, unless
    /// something references them.
    pub fn delete_new_files(&mut self, files: &BTreeSet<String>) {
        for file in files {
            if !self.exists(file) {
                self.ref_counts.remove(file);
                self.delete_file(file);
            }
        }
    }

    /// Reference counts of every tracked file.
    pub fn ref_counts(&self) -> BTreeMap<String, u32> {
        self.ref_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Retry pending deletes before the writer goes away.
    pub fn close(&mut self) {
        self.delete_pending_files();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::deletion_policy::{KeepAllDeletionPolicy, KeepOnlyLastCommitDeletionPolicy};
    use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn touch(storage: &MemoryStorage, name: &str) {
        let mut out = storage.create_output(name).unwrap();
        std::io::Write::write_all(&mut out, b"x").unwrap();
        out.close().unwrap();
    }

    fn add_segment(storage: &MemoryStorage, infos: &mut SegmentInfos) -> String {
        let name = infos.new_segment_name();
        let fdt = format!("{name}.fdt");
        touch(storage, &fdt);
        let files = [fdt].into_iter().collect();
        infos.add(SegmentCommitInfo::new(SegmentInfo::new(name.clone(), 1, "Segdex10", files, 1, "flush", 0)));
        name
    }

    fn commit(storage: &MemoryStorage, infos: &mut SegmentInfos, deleter: &mut IndexFileDeleter) {
        let generation = infos.prepare_commit(storage).unwrap();
        infos.finish_commit(storage, generation).unwrap();
        deleter.checkpoint(infos, true).unwrap();
    }

    fn open(storage: &MemoryStorage, policy: Arc<dyn IndexDeletionPolicy>, infos: &mut SegmentInfos) -> IndexFileDeleter {
        IndexFileDeleter::new(Arc::new(storage.clone()), policy, infos, false).unwrap()
    }

    #[test]
    fn test_keep_only_last_deletes_superseded_files() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let mut deleter = open(&storage, Arc::new(KeepOnlyLastCommitDeletionPolicy), &mut infos);

        add_segment(&storage, &mut infos);
        deleter.checkpoint(&infos, false).unwrap();
        commit(&storage, &mut infos, &mut deleter);
        assert!(storage.file_exists("segments_1"));
        assert_eq!(deleter.ref_count("_0.fdt"), 2);

        // Replace _0 by _1 and commit again.
        infos.clear();
        add_segment(&storage, &mut infos);
        deleter.checkpoint(&infos, false).unwrap();
        assert!(storage.file_exists("_0.fdt"));
        commit(&storage, &mut infos, &mut deleter);

        assert!(!storage.file_exists("segments_1"));
        assert!(!storage.file_exists("_0.fdt"));
        assert!(storage.file_exists("_1.fdt"));
        assert_eq!(deleter.commits().len(), 1);
    }

    #[test]
    fn test_startup_removes_leftovers_and_inflates() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        {
            let mut deleter = open(&storage, Arc::new(KeepAllDeletionPolicy), &mut infos);
            add_segment(&storage, &mut infos);
            deleter.checkpoint(&infos, false).unwrap();
            commit(&storage, &mut infos, &mut deleter);
        }
        // Crash leftovers: an unreferenced flush, a stray live-docs file, a
        // pending manifest and files the deleter must never touch.
        touch(&storage, "_5.fdt");
        touch(&storage, "_0_3.del");
        touch(&storage, "pending_segments_7");
        touch(&storage, "segments.gen");
        touch(&storage, "write.lock");
        touch(&storage, "notes.txt");
        touch(&storage, "snapshots_0");

        let mut infos = SegmentInfos::read_latest(&storage).unwrap();
        let _deleter = open(&storage, Arc::new(KeepAllDeletionPolicy), &mut infos);

        assert!(!storage.file_exists("_5.fdt"));
        assert!(!storage.file_exists("_0_3.del"));
        assert!(!storage.file_exists("pending_segments_7"));
        for kept in ["segments.gen", "write.lock", "notes.txt", "snapshots_0", "segments_1", "_0.fdt"] {
            assert!(storage.file_exists(kept), "{kept} was deleted");
        }
        assert_eq!(infos.counter, 6);
        assert_eq!(infos.next_generation(), 8);
        assert_eq!(infos.segments()[0].next_write_del_gen, 4);
    }

    #[test]
    fn test_in_flight_outputs_are_protected() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let mut deleter = open(&storage, Arc::new(KeepOnlyLastCommitDeletionPolicy), &mut infos);

        deleter.protect("_9");
        touch(&storage, "_9.fdt");
        assert_eq!(deleter.delete_unreferenced(), 0);
        assert!(storage.file_exists("_9.fdt"));

        deleter.unprotect("_9");
        assert_eq!(deleter.refresh_segment("_9"), 1);
        assert!(!storage.file_exists("_9.fdt"));
    }

    #[test]
    fn test_failed_deletes_are_retried() {
        let storage = MemoryStorage::new(MemoryStorageConfig {
            prevent_delete_open_files: true,
            ..Default::default()
        });
        let mut infos = SegmentInfos::new();
        let mut deleter = open(&storage, Arc::new(KeepOnlyLastCommitDeletionPolicy), &mut infos);
        add_segment(&storage, &mut infos);
        deleter.checkpoint(&infos, false).unwrap();

        let input = storage.open_input("_0.fdt").unwrap();
        infos.clear();
        deleter.checkpoint(&infos, false).unwrap();
        assert!(storage.file_exists("_0.fdt"));
        assert!(deleter.pending_deletes().contains("_0.fdt"));

        drop(input);
        deleter.checkpoint(&infos, false).unwrap();
        assert!(!storage.file_exists("_0.fdt"));
        assert!(deleter.pending_deletes().is_empty());
    }

    #[test]
    fn test_external_holders() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let mut deleter = open(&storage, Arc::new(KeepOnlyLastCommitDeletionPolicy), &mut infos);
        add_segment(&storage, &mut infos);
        deleter.checkpoint(&infos, false).unwrap();

        // A reader holds the segment.
        let held = infos.files(false);
        deleter.inc_ref(&held);
        infos.clear();
        deleter.checkpoint(&infos, false).unwrap();
        assert!(storage.file_exists("_0.fdt"));

        deleter.dec_ref(&held).unwrap();
        assert!(!storage.file_exists("_0.fdt"));
        assert!(deleter.dec_ref(&held).is_err());
    }
}
