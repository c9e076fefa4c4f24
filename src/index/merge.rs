//! Merge descriptors.
//!
//! A [`MergePolicy`](crate::index::merge_policy::MergePolicy) proposes merges
//! as a [`MergeSpecification`] of [`OneMerge`]s. The writer registers each
//! merge, a [`MergeScheduler`](crate::index::merge_scheduler::MergeScheduler)
//! runs it, and the [`DocMap`] built at merge start translates document ids
//! of the inputs into ids of the merged segment.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SegdexError};
use crate::index::live_docs::LiveDocs;
use crate::index::segment::SegmentCommitInfo;

/// What caused a merge policy to be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTrigger {
    /// A segment was flushed.
    SegmentFlush,
    /// A full flush ran as part of a commit or reader open.
    FullFlush,
    /// `maybe_merge` was called.
    Explicit,
    /// A merge finished and freed capacity.
    MergeFinished,
    /// The writer is closing.
    Closing,
}

/// Lifecycle of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Proposed by a policy, not yet registered.
    Pending,
    /// Registered with the writer, waiting for a scheduler thread.
    Registered,
    /// Inputs snapshotted and combining.
    Running,
    /// Output installed.
    Completed,
    /// Aborted before install.
    Aborted,
    /// Failed with an error.
    Failed,
}

static NEXT_MERGE_ID: AtomicU64 = AtomicU64::new(1);

/// One merge of several segments into one.
#[derive(Debug)]
pub struct OneMerge {
    id: u64,
    segments: Vec<SegmentCommitInfo>,
    /// Set when the merge runs on behalf of `force_merge`.
    pub max_num_segments: Option<usize>,
    aborted: AtomicBool,
    progress: AtomicU32,
    state: Mutex<MergeState>,
    output: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
}

impl OneMerge {
    /// A merge of `segments`, in index order.
    pub fn new(segments: Vec<SegmentCommitInfo>) -> Self {
        OneMerge {
            id: NEXT_MERGE_ID.fetch_add(1, Ordering::Relaxed),
            segments,
            max_num_segments: None,
            aborted: AtomicBool::new(false),
            progress: AtomicU32::new(0),
            state: Mutex::new(MergeState::Pending),
            output: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inputs as selected by the policy.
    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    /// Names of the inputs.
    pub fn segment_names(&self) -> BTreeSet<String> {
        self.segments.iter().map(|s| s.name().to_string()).collect()
    }

    /// Documents in the inputs, deleted ones included.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.info.doc_count as u64).sum()
    }

    /// Size of the inputs in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.info.size_bytes).sum()
    }

    /// Ask the merge to stop at its next abort check.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Record progress and fail with [`SegdexError::MergeAborted`] if the
    /// merge was aborted.
    pub fn check_abort(&self, processed: u32) -> Result<()> {
        self.progress.store(processed, Ordering::Relaxed);
        if self.is_aborted() {
            return Err(SegdexError::merge_aborted(format!(
                "merge {} aborted after {processed} docs",
                self.seg_string()
            )));
        }
        Ok(())
    }

    /// Documents processed so far.
    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> MergeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: MergeState) {
        *self.state.lock() = state;
    }

    /// Name of the output segment once the merge started.
    pub fn output_name(&self) -> Option<String> {
        self.output.lock().clone()
    }

    pub fn set_output_name(&self, name: impl Into<String>) {
        *self.output.lock() = Some(name.into());
    }

    /// Error message once the merge failed.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, error: &SegdexError) {
        *self.error.lock() = Some(error.to_string());
    }

    /// Short description for logging, e.g. `_0(5) _1(3)`.
    pub fn seg_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| format!("{}({})", s.name(), s.info.doc_count))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Merges proposed by one policy call.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    /// `Some(self)` unless empty.
    pub fn non_empty(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }
}

impl IntoIterator for MergeSpecification {
    type Item = OneMerge;
    type IntoIter = std::vec::IntoIter<OneMerge>;

    fn into_iter(self) -> Self::IntoIter {
        self.merges.into_iter()
    }
}

/// Marker for a document that did not survive the merge.
const DELETED: u32 = u32::MAX;

/// Old-to-new document id mapping of a merge.
///
/// Built once from the live docs snapshotted at merge start. New ids follow
/// the concatenation order of the inputs with deleted documents squeezed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocMap {
    maps: Vec<Vec<u32>>,
    new_doc_count: u32,
}

impl DocMap {
    /// Build from `(max_doc, live_docs)` of each input in merge order.
    pub fn build<'a>(inputs: impl IntoIterator<Item = (u32, Option<&'a LiveDocs>)>) -> Self {
        let mut maps = Vec::new();
        let mut next = 0u32;
        for (max_doc, live_docs) in inputs {
            let map = (0..max_doc)
                .map(|doc| {
                    if live_docs.is_none_or(|live| live.is_live(doc)) {
                        next += 1;
                        next - 1
                    } else {
                        DELETED
                    }
                })
                .collect();
            maps.push(map);
        }
        DocMap {
            maps,
            new_doc_count: next,
        }
    }

    /// New id of `doc` of input `input`, `None` if it was deleted.
    pub fn get(&self, input: usize, doc: u32) -> Option<u32> {
        match self.maps.get(input)?.get(doc as usize) {
            Some(&DELETED) | None => None,
            Some(&new) => Some(new),
        }
    }

    /// Number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.maps.len()
    }

    /// Documents in the merged segment.
    pub fn new_doc_count(&self) -> u32 {
        self.new_doc_count
    }
}
