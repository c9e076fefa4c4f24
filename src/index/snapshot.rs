//! Snapshots.
//!
//! A snapshot pins one commit so that neither its manifest nor its files are
//! deleted, whatever the wrapped deletion policy decides, until the snapshot
//! is released. [`SnapshotDeletionPolicy`] keeps pins in memory;
//! [`PersistentSnapshotDeletionPolicy`] also writes them to a
//! `snapshots_<gen>` file so they survive a restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, SegdexError};
use crate::index::config::OpenMode;
use crate::index::deletion_policy::{IndexCommit, IndexDeletionPolicy};
use crate::index::file_names;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const SNAPSHOTS_MAGIC: u32 = 0x534E_4150; // "SNAP"
const SNAPSHOTS_VERSION: u32 = 1;

/// A handle on a pinned commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// Creating and releasing snapshots.
pub trait SnapshotRegistry: Send + Sync {
    /// Pin the most recent commit.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Release a snapshot by handle.
    fn release(&self, snapshot: &Snapshot) -> Result<()> {
        self.release_by_id(&snapshot.id)
    }

    /// Release a snapshot by id.
    fn release_by_id(&self, id: &str) -> Result<()>;

    /// Release one pin of `generation`.
    fn release_generation(&self, generation: u64) -> Result<()>;

    /// Every live snapshot, oldest first.
    fn list_snapshots(&self) -> Vec<Snapshot>;

    /// The commit a snapshot pins, if the policy has seen it.
    fn index_commit(&self, generation: u64) -> Option<IndexCommit>;

    /// Whether any snapshot pins `generation`.
    fn is_pinned(&self, generation: u64) -> bool {
        self.list_snapshots().iter().any(|s| s.generation == generation)
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    /// Live snapshots by id.
    snapshots: BTreeMap<String, Snapshot>,
    /// Commits seen by the policy by generation.
    commits: BTreeMap<u64, IndexCommit>,
    /// Newest commit.
    last_commit: Option<u64>,
    next_id: u64,
}

impl SnapshotState {
    fn pins(&self, generation: u64) -> usize {
        self.snapshots
            .values()
            .filter(|s| s.generation == generation)
            .count()
    }

    fn remember(&mut self, commits: &[IndexCommit]) {
        self.commits = commits
            .iter()
            .filter(|c| !c.is_deleted())
            .map(|c| (c.generation(), c.clone()))
            .collect();
        self.last_commit = commits.first().map(IndexCommit::generation);
    }

    fn remove_one_pin(&mut self, generation: u64) -> Option<Snapshot> {
        let id = self
            .snapshots
            .values()
            .filter(|s| s.generation == generation)
            .max_by_key(|s| s.created_at)
            .map(|s| s.id.clone())?;
        self.snapshots.remove(&id)
    }
}

/// Wraps another policy and keeps snapshotted commits alive.
#[derive(Debug)]
pub struct SnapshotDeletionPolicy {
    primary: Arc<dyn IndexDeletionPolicy>,
    state: Mutex<SnapshotState>,
}

impl SnapshotDeletionPolicy {
    pub fn new(primary: Arc<dyn IndexDeletionPolicy>) -> Self {
        SnapshotDeletionPolicy {
            primary,
            state: Mutex::new(SnapshotState::default()),
        }
    }

    fn keep_pinned(&self, commits: &mut [IndexCommit]) {
        let mut state = self.state.lock();
        for commit in commits.iter_mut() {
            if commit.is_deleted() && state.pins(commit.generation()) > 0 {
                commit.undelete();
            }
        }
        state.remember(commits);
    }

    /// Number of live snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Restore pins loaded from a snapshot store.
    fn restore(&self, snapshots: Vec<Snapshot>, next_id: u64) {
        let mut state = self.state.lock();
        state.snapshots = snapshots.into_iter().map(|s| (s.id.clone(), s)).collect();
        state.next_id = next_id;
    }

    fn export(&self) -> (Vec<Snapshot>, u64) {
        let state = self.state.lock();
        (state.snapshots.values().cloned().collect(), state.next_id)
    }
}

impl IndexDeletionPolicy for SnapshotDeletionPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.primary.on_init(commits)?;
        self.keep_pinned(commits);
        Ok(())
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.primary.on_commit(commits)?;
        self.keep_pinned(commits);
        Ok(())
    }

    fn snapshot_registry(&self) -> Option<&dyn SnapshotRegistry> {
        Some(self)
    }
}

impl SnapshotRegistry for SnapshotDeletionPolicy {
    fn snapshot(&self) -> Result<Snapshot> {
        let mut state = self.state.lock();
        let Some(generation) = state.last_commit else {
            return Err(SegdexError::illegal_state(
                "no commit to snapshot; commit the index first",
            ));
        };
        let snapshot = Snapshot {
            id: format!("snapshot_{}", state.next_id),
            generation,
            created_at: Utc::now(),
        };
        state.next_id += 1;
        state.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        debug!("snapshot {} pins generation {generation}", snapshot.id);
        Ok(snapshot)
    }

    fn release_by_id(&self, id: &str) -> Result<()> {
        match self.state.lock().snapshots.remove(id) {
            Some(_) => Ok(()),
            None => Err(SegdexError::illegal_state(format!(
                "snapshot {id} is not held"
            ))),
        }
    }

    fn release_generation(&self, generation: u64) -> Result<()> {
        match self.state.lock().remove_one_pin(generation) {
            Some(_) => Ok(()),
            None => Err(SegdexError::illegal_state(format!(
                "generation {generation} is not snapshotted"
            ))),
        }
    }

    fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.state.lock().snapshots.values().cloned().collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    fn index_commit(&self, generation: u64) -> Option<IndexCommit> {
        self.state.lock().commits.get(&generation).cloned()
    }
}

/// A [`SnapshotDeletionPolicy`] whose pins are persisted.
///
/// Every change writes the full set of pins to a new `snapshots_<gen>` file,
/// then removes older store files.
#[derive(Debug)]
pub struct PersistentSnapshotDeletionPolicy {
    inner: SnapshotDeletionPolicy,
    storage: Arc<dyn Storage>,
    /// Generation of the newest store file, `None` before the first write.
    generation: Mutex<Option<u64>>,
}

impl PersistentSnapshotDeletionPolicy {
    /// Wrap `primary`, keeping pins in `storage`.
    ///
    /// `Create` discards earlier pins and writes an empty store right away.
    /// `Append` loads the newest valid store and fails if there is none.
    /// `CreateOrAppend` loads a store when present and otherwise creates one.
    pub fn new(
        primary: Arc<dyn IndexDeletionPolicy>,
        storage: Arc<dyn Storage>,
        mode: OpenMode,
    ) -> Result<Self> {
        let policy = PersistentSnapshotDeletionPolicy {
            inner: SnapshotDeletionPolicy::new(primary),
            storage,
            generation: Mutex::new(None),
        };

        let existing = policy.store_generations()?;
        *policy.generation.lock() = existing.last().copied();

        match (mode, existing.is_empty()) {
            (OpenMode::Create, _) | (OpenMode::CreateOrAppend, true) => {
                policy.persist()?;
            }
            (OpenMode::Append, true) => {
                return Err(SegdexError::index_not_found(
                    "no snapshots_N file found; the snapshot store was never created in this directory",
                ));
            }
            (OpenMode::Append, false) | (OpenMode::CreateOrAppend, false) => {
                policy.load(&existing)?;
            }
        }
        Ok(policy)
    }

    /// Generation of the newest store file.
    pub fn last_generation(&self) -> Option<u64> {
        *self.generation.lock()
    }

    fn store_generations(&self) -> Result<Vec<u64>> {
        let mut gens: Vec<u64> = self
            .storage
            .list_files()?
            .iter()
            .filter(|name| file_names::is_snapshots_file(name))
            .filter_map(|name| file_names::parse_generation(name))
            .collect();
        gens.sort_unstable();
        Ok(gens)
    }

    fn load(&self, generations: &[u64]) -> Result<()> {
        let mut last_error = None;
        for &generation in generations.iter().rev() {
            match Self::read_store(self.storage.as_ref(), generation) {
                Ok((snapshots, next_id)) => {
                    info!(
                        "loaded {} snapshots from {}",
                        snapshots.len(),
                        file_names::snapshots_file_name(generation)
                    );
                    self.inner.restore(snapshots, next_id);
                    return Ok(());
                }
                Err(e) => {
                    warn!("{} unusable: {e}", file_names::snapshots_file_name(generation));
                    last_error = Some(e);
                }
            }
        }
        Err(SegdexError::corrupt(format!(
            "no valid snapshot store among {} files; last error: {}",
            generations.len(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn read_store(storage: &dyn Storage, generation: u64) -> Result<(Vec<Snapshot>, u64)> {
        let name = file_names::snapshots_file_name(generation);
        let mut reader = StructReader::open(storage, &name)?;
        reader.read_header(SNAPSHOTS_MAGIC, SNAPSHOTS_VERSION, SNAPSHOTS_VERSION)?;
        let next_id = reader.read_u64()?;
        let count = reader.read_varint()?;
        let mut snapshots = Vec::new();
        for _ in 0..count {
            let id = reader.read_string()?;
            let generation = reader.read_u64()?;
            let millis = reader.read_i64()?;
            let created_at = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| SegdexError::corrupt(format!("{name}: bad timestamp {millis}")))?;
            snapshots.push(Snapshot {
                id,
                generation,
                created_at,
            });
        }
        reader.expect_eof()?;
        Ok((snapshots, next_id))
    }

    /// Write the current pins to a new store file and drop older ones.
    fn persist(&self) -> Result<()> {
        let (snapshots, next_id) = self.inner.export();
        self.write_store(&snapshots, next_id)
    }

    fn write_store(&self, snapshots: &[Snapshot], next_id: u64) -> Result<()> {
        let mut current = self.generation.lock();
        let next = current.map_or(0, |g| g + 1);
        let name = file_names::snapshots_file_name(next);

        let write = || -> Result<()> {
            let mut writer = StructWriter::new(self.storage.create_output(&name)?);
            writer.write_header(SNAPSHOTS_MAGIC, SNAPSHOTS_VERSION)?;
            writer.write_u64(next_id)?;
            writer.write_varint(snapshots.len() as u64)?;
            for snapshot in snapshots {
                writer.write_string(&snapshot.id)?;
                writer.write_u64(snapshot.generation)?;
                writer.write_i64(snapshot.created_at.timestamp_millis())?;
            }
            writer.close()?;
            self.storage.sync(std::slice::from_ref(&name))?;
            self.storage.sync_metadata()
        };
        if let Err(e) = write() {
            if let Err(del) = self.storage.delete_file(&name) {
                debug!("could not remove partial {name}: {del}");
            }
            return Err(e);
        }
        *current = Some(next);
        drop(current);

        for generation in self.store_generations()? {
            if generation < next {
                let old = file_names::snapshots_file_name(generation);
                if let Err(e) = self.storage.delete_file(&old) {
                    warn!("could not remove old snapshot store {old}: {e}");
                }
            }
        }
        Ok(())
    }
}

impl IndexDeletionPolicy for PersistentSnapshotDeletionPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.inner.on_init(commits)?;
        for snapshot in self.inner.list_snapshots() {
            if !commits.iter().any(|c| c.generation() == snapshot.generation) {
                warn!(
                    "snapshot {} pins generation {} which no longer exists",
                    snapshot.id, snapshot.generation
                );
            }
        }
        Ok(())
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.inner.on_commit(commits)
    }

    fn snapshot_registry(&self) -> Option<&dyn SnapshotRegistry> {
        Some(self)
    }
}

impl SnapshotRegistry for PersistentSnapshotDeletionPolicy {
    fn snapshot(&self) -> Result<Snapshot> {
        let snapshot = self.inner.snapshot()?;
        if let Err(e) = self.persist() {
            let _ = self.inner.release_by_id(&snapshot.id);
            return Err(e);
        }
        Ok(snapshot)
    }

    /// The store is rewritten before the pin goes, so a failed write leaves
    /// the snapshot held and its commit protected.
    fn release_by_id(&self, id: &str) -> Result<()> {
        let (mut snapshots, next_id) = self.inner.export();
        let held = snapshots.len();
        snapshots.retain(|s| s.id != id);
        if snapshots.len() == held {
            return Err(SegdexError::illegal_state(format!(
                "snapshot {id} is not held"
            )));
        }
        self.write_store(&snapshots, next_id)?;
        self.inner.release_by_id(id)
    }

    fn release_generation(&self, generation: u64) -> Result<()> {
        let newest = self
            .inner
            .list_snapshots()
            .into_iter()
            .filter(|s| s.generation == generation)
            .max_by_key(|s| s.created_at)
            .ok_or_else(|| {
                SegdexError::illegal_state(format!("generation {generation} is not snapshotted"))
            })?;
        self.release_by_id(&newest.id)
    }

    fn list_snapshots(&self) -> Vec<Snapshot> {
        self.inner.list_snapshots()
    }

    fn index_commit(&self, generation: u64) -> Option<IndexCommit> {
        self.inner.index_commit(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::deletion_policy::KeepOnlyLastCommitDeletionPolicy;
    use crate::index::manifest::SegmentInfos;
    use crate::storage::memory::{FailPoint, MemoryStorage, StorageOp};

    fn commits(gens: &[u64]) -> Vec<IndexCommit> {
        gens.iter()
            .rev()
            .map(|&generation| {
                let mut infos = SegmentInfos::new();
                infos.generation = generation;
                IndexCommit::from_infos(&infos)
            })
            .collect()
    }

    fn kept(commits: &[IndexCommit]) -> Vec<u64> {
        commits.iter().filter(|c| !c.is_deleted()).map(|c| c.generation()).collect()
    }

    #[test]
    fn test_snapshot_before_commit_fails() {
        let policy = SnapshotDeletionPolicy::new(Arc::new(KeepOnlyLastCommitDeletionPolicy));
        assert!(matches!(policy.snapshot(), Err(SegdexError::IllegalState(_))));
    }

    #[test]
    fn test_pinned_commit_survives() {
        let policy = SnapshotDeletionPolicy::new(Arc::new(KeepOnlyLastCommitDeletionPolicy));
        policy.on_init(&mut commits(&[1])).unwrap();
        let snap = policy.snapshot().unwrap();
        assert_eq!(snap.generation, 1);
        assert!(policy.index_commit(1).is_some());

        let mut next = commits(&[1, 2]);
        policy.on_commit(&mut next).unwrap();
        assert_eq!(kept(&next), vec![2, 1]);

        policy.release(&snap).unwrap();
        let mut next = commits(&[1, 2]);
        policy.on_commit(&mut next).unwrap();
        assert_eq!(kept(&next), vec![2]);

        assert!(matches!(policy.release(&snap), Err(SegdexError::IllegalState(_))));
    }

    #[test]
    fn test_same_generation_independent_handles() {
        let policy = SnapshotDeletionPolicy::new(Arc::new(KeepOnlyLastCommitDeletionPolicy));
        policy.on_init(&mut commits(&[3])).unwrap();
        let a = policy.snapshot().unwrap();
        let b = policy.snapshot().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(policy.snapshot_count(), 2);

        policy.release_generation(3).unwrap();
        assert!(policy.is_pinned(3));
        policy.release_generation(3).unwrap();
        assert!(!policy.is_pinned(3));
        assert!(policy.release_generation(3).is_err());
    }

    #[test]
    fn test_persistent_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let primary: Arc<dyn IndexDeletionPolicy> = Arc::new(KeepOnlyLastCommitDeletionPolicy);

        let policy = PersistentSnapshotDeletionPolicy::new(primary.clone(), storage.clone(), OpenMode::Create).unwrap();
        assert!(storage.file_exists("snapshots_0"));
        policy.on_init(&mut commits(&[1, 2])).unwrap();
        let snap = policy.snapshot().unwrap();
        assert!(storage.file_exists("snapshots_1"));
        assert!(!storage.file_exists("snapshots_0"));

        let reopened = PersistentSnapshotDeletionPolicy::new(primary.clone(), storage.clone(), OpenMode::Append).unwrap();
        assert_eq!(reopened.list_snapshots(), vec![snap.clone()]);
        let mut all = commits(&[1, 2, 3]);
        reopened.on_init(&mut all).unwrap();
        assert_eq!(kept(&all), vec![3, 2]);

        reopened.release(&snap).unwrap();
        let again = PersistentSnapshotDeletionPolicy::new(primary, storage, OpenMode::CreateOrAppend).unwrap();
        assert!(again.list_snapshots().is_empty());
        // Ids are never reused across restarts.
        again.on_init(&mut commits(&[3])).unwrap();
        assert_ne!(again.snapshot().unwrap().id, snap.id);
    }

    #[test]
    fn test_persistent_append_requires_store() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let primary: Arc<dyn IndexDeletionPolicy> = Arc::new(KeepOnlyLastCommitDeletionPolicy);
        let err = PersistentSnapshotDeletionPolicy::new(primary.clone(), storage.clone(), OpenMode::Append).unwrap_err();
        assert!(matches!(err, SegdexError::IndexNotFound(_)));

        PersistentSnapshotDeletionPolicy::new(primary.clone(), storage.clone(), OpenMode::Create).unwrap();
        assert!(PersistentSnapshotDeletionPolicy::new(primary, storage, OpenMode::Append).is_ok());
    }

    #[test]
    fn test_persistent_corrupt_store() {
        let memory = MemoryStorage::new_default();
        let storage: Arc<dyn Storage> = Arc::new(memory.clone());
        let primary: Arc<dyn IndexDeletionPolicy> = Arc::new(KeepOnlyLastCommitDeletionPolicy);
        PersistentSnapshotDeletionPolicy::new(primary.clone(), storage.clone(), OpenMode::Create).unwrap();
        memory.corrupt_file("snapshots_0", 4).unwrap();

        let err = PersistentSnapshotDeletionPolicy::new(primary, storage, OpenMode::Append).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_failed_persist_undoes_snapshot() {
        let memory = MemoryStorage::new_default();
        let storage: Arc<dyn Storage> = Arc::new(memory.clone());
        let primary: Arc<dyn IndexDeletionPolicy> = Arc::new(KeepOnlyLastCommitDeletionPolicy);
        let policy = PersistentSnapshotDeletionPolicy::new(primary, storage, OpenMode::Create).unwrap();
        policy.on_init(&mut commits(&[1])).unwrap();

        memory.fail_on(FailPoint::once(StorageOp::Sync, "snapshots_"));
        assert!(policy.snapshot().is_err());
        assert!(policy.list_snapshots().is_empty());
        assert!(!memory.file_exists("snapshots_1"));
        assert_eq!(policy.last_generation(), Some(0));
    }

    #[test]
    fn test_failed_persist_keeps_release_pinned() {
        let memory = MemoryStorage::new_default();
        let storage: Arc<dyn Storage> = Arc::new(memory.clone());
        let primary: Arc<dyn IndexDeletionPolicy> = Arc::new(KeepOnlyLastCommitDeletionPolicy);
        let policy = PersistentSnapshotDeletionPolicy::new(primary, storage, OpenMode::Create).unwrap();
        policy.on_init(&mut commits(&[1])).unwrap();
        let snap = policy.snapshot().unwrap();

        memory.fail_on(FailPoint::once(StorageOp::CreateOutput, "snapshots_"));
        assert!(policy.release(&snap).is_err());
        assert!(policy.is_pinned(1));
        // A commit arriving after the failed release still sees the pin.
        let mut next = commits(&[1, 2]);
        policy.on_commit(&mut next).unwrap();
        assert_eq!(kept(&next), vec![2, 1]);

        memory.fail_on(FailPoint::once(StorageOp::Sync, "snapshots_"));
        assert!(policy.release_generation(1).is_err());
        assert_eq!(policy.list_snapshots(), vec![snap.clone()]);

        policy.release(&snap).unwrap();
        assert!(!policy.is_pinned(1));
    }
}
