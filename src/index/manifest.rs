//! Commit manifests.
//!
//! A [`SegmentInfos`] is the ordered list of segments that make up one
//! version of the index, plus the user commit data and the counters that
//! keep names unique. Each commit writes it to a new `segments_<gen>` file in
//! two steps: [`SegmentInfos::prepare_commit`] writes and syncs
//! `pending_segments_<gen>`, [`SegmentInfos::finish_commit`] renames it into
//! place. A manifest is therefore either complete with a valid checksum or
//! absent.
//!
//! `segments.gen` records the latest generation as a hint. Readers take the
//! maximum of the hint and the directory listing and fall back to older
//! generations when the newest one does not validate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SegdexError};
use crate::index::file_names::{self, SEGMENTS_GEN};
use crate::index::segment::{SegmentCommitInfo, SegmentInfo};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const MANIFEST_MAGIC: u32 = 0x3FD7_6C17;
const MANIFEST_VERSION: u32 = 1;

const SEGMENTS_GEN_MAGIC: u32 = 0x5347_454E; // "SGEN"
const SEGMENTS_GEN_VERSION: u32 = 1;

/// The ordered list of segments of one index version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentInfos {
    segments: Vec<SegmentCommitInfo>,
    /// Generation this manifest was read from or last committed as, 0 if none.
    pub generation: u64,
    /// Last generation a commit was attempted with.
    pub last_generation: u64,
    /// Incremented on every change.
    pub version: u64,
    /// Source of segment names.
    pub counter: u64,
    /// Opaque user commit data.
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    /// An empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments in index order.
    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    /// Mutable access to the segments.
    pub fn segments_mut(&mut self) -> &mut Vec<SegmentCommitInfo> {
        &mut self.segments
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the manifest holds no segment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Look up a segment by name.
    pub fn get(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|s| s.name() == name)
    }

    /// Position of a segment.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    /// Whether a segment with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Append a segment.
    pub fn add(&mut self, segment: SegmentCommitInfo) {
        self.segments.push(segment);
    }

    /// Remove a segment by name.
    pub fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let idx = self.index_of(name)?;
        Some(self.segments.remove(idx))
    }

    /// Drop every segment.
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Replace the segment list, keeping counters and user data.
    pub fn replace_segments(&mut self, segments: Vec<SegmentCommitInfo>) {
        self.segments = segments;
    }

    /// Record a change.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    /// Allocate a new, never used segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = file_names::segment_name(self.counter);
        self.counter += 1;
        self.changed();
        name
    }

    /// Documents including deleted ones.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.info.doc_count as u64).sum()
    }

    /// Live documents.
    pub fn total_num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_live_docs() as u64).sum()
    }

    /// `segments_<gen>` of the committed generation.
    pub fn segments_file_name(&self) -> Option<String> {
        (self.generation > 0).then(|| file_names::segments_file_name(self.generation))
    }

    /// Generation the next commit attempt will use. Attempted generations are
    /// never reused, even when the attempt failed.
    pub fn next_generation(&self) -> u64 {
        self.generation.max(self.last_generation) + 1
    }

    /// Every file referenced by this manifest.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files
    }

    /// Replace the inputs of a merge by its output.
    ///
    /// The output takes the position of the first input still present. When
    /// `merged` is `None` (every document was deleted) the inputs are simply
    /// dropped.
    pub fn apply_merge_changes(&mut self, inputs: &BTreeSet<String>, merged: Option<SegmentCommitInfo>) {
        let mut merged = merged;
        let mut result = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if inputs.contains(segment.name()) {
                if let Some(output) = merged.take() {
                    result.push(output);
                }
            } else {
                result.push(segment);
            }
        }
        // None of the inputs were found; keep the output anyway.
        result.extend(merged);
        self.segments = result;
        self.changed();
    }

    /// Write and sync `pending_segments_<gen>`, returning its generation.
    ///
    /// On failure the partial file is removed and the generation is burnt.
    pub fn prepare_commit(&mut self, storage: &dyn Storage) -> Result<u64> {
        let generation = self.next_generation();
        self.last_generation = generation;
        let pending = file_names::pending_segments_file_name(generation);

        let result = self
            .write_to(storage, &pending, generation)
            .and_then(|_| storage.sync(std::slice::from_ref(&pending)));
        if let Err(e) = result {
            if let Err(del) = storage.delete_file(&pending) {
                debug!("could not remove partial {pending}: {del}");
            }
            return Err(e);
        }
        Ok(generation)
    }

    /// Publish a prepared manifest by renaming it to `segments_<gen>`.
    ///
    /// This is the commit point: once it returns the new generation is what
    /// readers open. `segments.gen` is written separately by the caller.
    pub fn finish_commit(&mut self, storage: &dyn Storage, generation: u64) -> Result<String> {
        let pending = file_names::pending_segments_file_name(generation);
        let committed = file_names::segments_file_name(generation);
        storage.rename_file(&pending, &committed)?;
        self.generation = generation;
        storage.sync_metadata()?;
        Ok(committed)
    }

    /// Discard a prepared manifest.
    pub fn rollback_commit(storage: &dyn Storage, generation: u64) {
        let pending = file_names::pending_segments_file_name(generation);
        if storage.file_exists(&pending) {
            if let Err(e) = storage.delete_file(&pending) {
                warn!("could not remove {pending} during rollback: {e}");
            }
        }
    }

    fn write_to(&self, storage: &dyn Storage, name: &str, generation: u64) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(MANIFEST_MAGIC, MANIFEST_VERSION)?;
        writer.write_u64(generation)?;
        writer.write_u64(self.version)?;
        writer.write_u64(self.counter)?;
        writer.write_varint(self.segments.len() as u64)?;
        for segment in &self.segments {
            let info = &segment.info;
            writer.write_string(&info.name)?;
            writer.write_raw(info.id.as_bytes())?;
            writer.write_string(&info.codec)?;
            writer.write_u32(info.doc_count)?;
            writer.write_strings(info.files.iter())?;
            writer.write_u64(info.size_bytes)?;
            writer.write_string_map(&info.diagnostics)?;
            writer.write_u64(info.created_generation)?;
            writer.write_u64(segment.del_gen)?;
            writer.write_u32(segment.del_count)?;
            writer.write_u64(segment.dv_gen)?;
        }
        writer.write_string_map(&self.user_data)?;
        writer.close()
    }

    /// Read the manifest of one generation.
    pub fn read(storage: &dyn Storage, generation: u64) -> Result<Self> {
        let name = file_names::segments_file_name(generation);
        let mut reader = StructReader::open(storage, &name)?;
        reader.read_header(MANIFEST_MAGIC, MANIFEST_VERSION, MANIFEST_VERSION)?;

        let stored_generation = reader.read_u64()?;
        if stored_generation != generation {
            return Err(SegdexError::corrupt(format!(
                "{name}: records generation {stored_generation}"
            )));
        }
        let version = reader.read_u64()?;
        let counter = reader.read_u64()?;

        let count = reader.read_varint()?;
        let mut segments = Vec::new();
        let mut names = BTreeSet::new();
        for _ in 0..count {
            let seg_name = reader.read_string()?;
            let mut id = [0u8; 16];
            for b in id.iter_mut() {
                *b = reader.read_u8()?;
            }
            let codec = reader.read_string()?;
            let doc_count = reader.read_u32()?;
            let files: BTreeSet<String> = reader.read_strings()?.into_iter().collect();
            let size_bytes = reader.read_u64()?;
            let diagnostics = reader.read_string_map()?;
            let created_generation = reader.read_u64()?;
            let del_gen = reader.read_u64()?;
            let del_count = reader.read_u32()?;
            let dv_gen = reader.read_u64()?;

            if del_count > doc_count || (del_count > 0 && del_gen == 0) {
                return Err(SegdexError::corrupt(format!(
                    "{name}: segment {seg_name} has del_count {del_count} for {doc_count} docs at del_gen {del_gen}"
                )));
            }
            if !names.insert(seg_name.clone()) {
                return Err(SegdexError::corrupt(format!(
                    "{name}: duplicate segment {seg_name}"
                )));
            }

            let info = SegmentInfo {
                name: seg_name,
                id: Uuid::from_bytes(id),
                doc_count,
                codec,
                files,
                size_bytes,
                diagnostics,
                created_generation,
            };
            segments.push(SegmentCommitInfo::with_overlay(
                Arc::new(info),
                del_count,
                del_gen,
                dv_gen,
            ));
        }
        let user_data = reader.read_string_map()?;
        reader.expect_eof()?;

        Ok(SegmentInfos {
            segments,
            generation,
            last_generation: generation,
            version,
            counter,
            user_data,
        })
    }

    /// Read one generation, treating a missing or corrupt manifest as absent.
    pub fn read_generation(storage: &dyn Storage, generation: u64) -> Option<Self> {
        match Self::read(storage, generation) {
            Ok(infos) => Some(infos),
            Err(e) => {
                debug!("segments_{} unusable: {e}", file_names::to_radix36(generation));
                None
            }
        }
    }

    /// Generations of every `segments_N` file present.
    pub fn list_generations(storage: &dyn Storage) -> Result<BTreeSet<u64>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter(|name| file_names::is_segments_file(name))
            .filter_map(|name| file_names::parse_generation(name))
            .collect())
    }

    /// Read the `segments.gen` hint, if present and valid.
    pub fn read_segments_gen(storage: &dyn Storage) -> Option<u64> {
        if !storage.file_exists(SEGMENTS_GEN) {
            return None;
        }
        let read = || -> Result<u64> {
            let mut reader = StructReader::open(storage, SEGMENTS_GEN)?;
            reader.read_header(SEGMENTS_GEN_MAGIC, SEGMENTS_GEN_VERSION, SEGMENTS_GEN_VERSION)?;
            let gen0 = reader.read_u64()?;
            let gen1 = reader.read_u64()?;
            reader.expect_eof()?;
            if gen0 != gen1 {
                return Err(SegdexError::corrupt(format!(
                    "{SEGMENTS_GEN}: generations {gen0} and {gen1} disagree"
                )));
            }
            Ok(gen0)
        };
        match read() {
            Ok(generation) => Some(generation),
            Err(e) => {
                debug!("ignoring {SEGMENTS_GEN}: {e}");
                None
            }
        }
    }

    /// Write the `segments.gen` hint.
    pub fn write_segments_gen(storage: &dyn Storage, generation: u64) -> Result<()> {
        let output = storage.create_output(SEGMENTS_GEN)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(SEGMENTS_GEN_MAGIC, SEGMENTS_GEN_VERSION)?;
        writer.write_u64(generation)?;
        writer.write_u64(generation)?;
        writer.close()?;
        storage.sync(&[SEGMENTS_GEN.to_string()])
    }

    /// Read the newest valid commit.
    ///
    /// Fails with [`SegdexError::IndexNotFound`] when there is no manifest at
    /// all and with [`SegdexError::CorruptIndex`] when manifests exist but
    /// none of them validates.
    pub fn read_latest(storage: &dyn Storage) -> Result<Self> {
        let mut candidates = Self::list_generations(storage)?;
        if let Some(hint) = Self::read_segments_gen(storage) {
            if storage.file_exists(&file_names::segments_file_name(hint)) {
                candidates.insert(hint);
            }
        }
        if candidates.is_empty() {
            return Err(SegdexError::index_not_found(
                "no segments_N file found in directory",
            ));
        }

        let mut last_error = None;
        for &generation in candidates.iter().rev() {
            match Self::read(storage, generation) {
                Ok(infos) => {
                    if last_error.is_some() {
                        warn!(
                            "fell back to segments_{} after newer manifests failed to validate",
                            file_names::to_radix36(generation)
                        );
                    }
                    return Ok(infos);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(SegdexError::corrupt(format!(
            "none of {} manifests validates; last error: {}",
            candidates.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Every valid commit in the directory, oldest first.
    pub fn read_all_commits(storage: &dyn Storage) -> Result<Vec<Self>> {
        Ok(Self::list_generations(storage)?
            .into_iter()
            .filter_map(|generation| Self::read_generation(storage, generation))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FailPoint, MemoryStorage, StorageOp};

    fn segment(infos: &mut SegmentInfos, docs: u32) -> SegmentCommitInfo {
        let name = infos.new_segment_name();
        let files = [format!("{name}.fdt")].into_iter().collect();
        SegmentCommitInfo::new(SegmentInfo::new(name, docs, "Segdex10", files, 10, "flush", 0))
    }

    fn commit(infos: &mut SegmentInfos, storage: &MemoryStorage) -> u64 {
        let generation = infos.prepare_commit(storage).unwrap();
        infos.finish_commit(storage, generation).unwrap();
        SegmentInfos::write_segments_gen(storage, generation).unwrap();
        generation
    }

    #[test]
    fn test_commit_and_read_back() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let mut seg = segment(&mut infos, 5);
        seg.del_count = 2;
        seg.advance_del_gen();
        infos.add(seg);
        let seg = segment(&mut infos, 3);
        infos.add(seg);
        infos.user_data.insert("label".into(), "first".into());

        assert_eq!(commit(&mut infos, &storage), 1);
        assert!(storage.file_exists("segments_1"));
        assert!(!storage.file_exists("pending_segments_1"));

        let read = SegmentInfos::read_latest(&storage).unwrap();
        assert_eq!(read, infos);
        assert_eq!(read.total_max_doc(), 8);
        assert_eq!(read.total_num_docs(), 6);
        assert_eq!(read.segments()[0].next_live_docs_file_name(), "_0_2.del");
        assert!(read.files(true).contains("_0_1.del"));
        assert!(read.files(true).contains("segments_1"));
    }

    #[test]
    fn test_generations_strictly_increase() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        assert_eq!(commit(&mut infos, &storage), 1);
        assert_eq!(commit(&mut infos, &storage), 2);

        // A failed attempt burns its generation.
        storage.fail_on(FailPoint::once(StorageOp::Sync, "pending_segments_3"));
        assert!(infos.prepare_commit(&storage).is_err());
        assert!(!storage.file_exists("pending_segments_3"));
        assert_eq!(commit(&mut infos, &storage), 4);

        let gens: Vec<u64> = SegmentInfos::list_generations(&storage).unwrap().into_iter().collect();
        assert_eq!(gens, vec![1, 2, 4]);
    }

    #[test]
    fn test_fallback_to_prior_generation() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        let seg = segment(&mut infos, 1);
        infos.add(seg);
        commit(&mut infos, &storage);
        let seg = segment(&mut infos, 1);
        infos.add(seg);
        commit(&mut infos, &storage);

        storage.corrupt_file("segments_2", 12).unwrap();
        let read = SegmentInfos::read_latest(&storage).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.len(), 1);
        assert!(SegmentInfos::read_generation(&storage, 2).is_none());
    }

    #[test]
    fn test_no_manifest_vs_all_corrupt() {
        let storage = MemoryStorage::new_default();
        assert!(matches!(
            SegmentInfos::read_latest(&storage),
            Err(SegdexError::IndexNotFound(_))
        ));

        let mut infos = SegmentInfos::new();
        commit(&mut infos, &storage);
        storage.truncate_file("segments_1", 10).unwrap();
        assert!(SegmentInfos::read_latest(&storage).unwrap_err().is_corruption());
    }

    #[test]
    fn test_segments_gen_hint() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        commit(&mut infos, &storage);
        commit(&mut infos, &storage);
        assert_eq!(SegmentInfos::read_segments_gen(&storage), Some(2));

        storage.corrupt_file(SEGMENTS_GEN, 9).unwrap();
        assert_eq!(SegmentInfos::read_segments_gen(&storage), None);
        // The listing alone still finds the newest commit.
        assert_eq!(SegmentInfos::read_latest(&storage).unwrap().generation, 2);
    }

    #[test]
    fn test_apply_merge_changes_keeps_position() {
        let mut infos = SegmentInfos::new();
        let segs: Vec<_> = (0..4).map(|_| segment(&mut infos, 2)).collect();
        for s in &segs {
            infos.add(s.clone());
        }
        let merged = segment(&mut infos, 4);

        let inputs: BTreeSet<String> = ["_1".to_string(), "_3".to_string()].into_iter().collect();
        infos.apply_merge_changes(&inputs, Some(merged));
        let names: Vec<&str> = infos.segments().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["_0", "_4", "_2"]);

        let inputs: BTreeSet<String> = ["_0".to_string()].into_iter().collect();
        infos.apply_merge_changes(&inputs, None);
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn test_read_all_commits_skips_invalid() {
        let storage = MemoryStorage::new_default();
        let mut infos = SegmentInfos::new();
        commit(&mut infos, &storage);
        infos.user_data.insert("k".into(), "v".into());
        commit(&mut infos, &storage);
        commit(&mut infos, &storage);
        storage.corrupt_file("segments_2", 30).unwrap();

        let commits = SegmentInfos::read_all_commits(&storage).unwrap();
        let gens: Vec<u64> = commits.iter().map(|c| c.generation).collect();
        assert_eq!(gens, vec![1, 3]);
        assert_eq!(commits[1].user_data["k"], "v");
    }
}
