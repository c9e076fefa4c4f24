//! Deletion policies.
//!
//! The file deleter asks the policy which commits to keep every time the
//! writer opens ([`IndexDeletionPolicy::on_init`]) and after every commit
//! ([`IndexDeletionPolicy::on_commit`]). Commits are passed newest first; the
//! policy marks the ones it no longer needs with [`IndexCommit::delete`].

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::Result;
use crate::index::manifest::SegmentInfos;
use crate::index::snapshot::SnapshotRegistry;

/// A commit point as seen by deletion policies and readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexCommit {
    generation: u64,
    segments_file_name: String,
    files: BTreeSet<String>,
    user_data: BTreeMap<String, String>,
    segment_count: usize,
    num_docs: u64,
    #[serde(skip)]
    deleted: bool,
}

impl IndexCommit {
    /// Describe the committed state of `infos`.
    pub fn from_infos(infos: &SegmentInfos) -> Self {
        IndexCommit {
            generation: infos.generation,
            segments_file_name: infos.segments_file_name().unwrap_or_default(),
            files: infos.files(true),
            user_data: infos.user_data.clone(),
            segment_count: infos.len(),
            num_docs: infos.total_num_docs(),
            deleted: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn segments_file_name(&self) -> &str {
        &self.segments_file_name
    }

    /// Every file of the commit, its manifest included.
    pub fn file_names(&self) -> &BTreeSet<String> {
        &self.files
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Live documents at commit time.
    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// Ask for this commit to be removed.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    /// Keep a commit a wrapped policy asked to remove.
    pub fn undelete(&mut self) {
        self.deleted = false;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Decides which commits are kept.
pub trait IndexDeletionPolicy: Send + Sync + std::fmt::Debug {
    /// Called once when a writer opens, with every valid commit, newest first.
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()>;

    /// Called after every commit, with every kept commit, newest first.
    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()>;

    /// Snapshot support, if the policy offers it.
    fn snapshot_registry(&self) -> Option<&dyn SnapshotRegistry> {
        None
    }
}

/// Keeps only the newest commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOnlyLastCommitDeletionPolicy;

impl IndexDeletionPolicy for KeepOnlyLastCommitDeletionPolicy {
    fn on_init(&self, commits: &mut [IndexCommit]) -> Result<()> {
        self.on_commit(commits)
    }

    fn on_commit(&self, commits: &mut [IndexCommit]) -> Result<()> {
        for commit in commits.iter_mut().skip(1) {
            commit.delete();
        }
        Ok(())
    }
}

/// Keeps every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllDeletionPolicy;

impl IndexDeletionPolicy for KeepAllDeletionPolicy {
    fn on_init(&self, _commits: &mut [IndexCommit]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &mut [IndexCommit]) -> Result<()> {
        Ok(())
    }
}
