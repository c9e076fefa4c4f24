//! Merge policies.
//!
//! A policy looks at the current segments and proposes merges; it never runs
//! them. Segments already taking part in a running merge are never proposed
//! again, and the writer re-checks this when it registers a merge.
//!
//! Candidates of equal merit are ordered by size descending, then by segment
//! name ascending, so the same index state always yields the same proposals.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::index::manifest::SegmentInfos;
use crate::index::merge::{MergeSpecification, MergeTrigger, OneMerge};
use crate::index::segment::SegmentCommitInfo;

/// What a policy may know about the writer beyond the manifest.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    merging: BTreeSet<String>,
    del_counts: HashMap<String, u32>,
}

impl MergeContext {
    /// `merging` are segments in running merges; `del_counts` override the
    /// manifest delete counts with deletes not yet written.
    pub fn new(merging: BTreeSet<String>, del_counts: HashMap<String, u32>) -> Self {
        MergeContext {
            merging,
            del_counts,
        }
    }

    pub fn is_merging(&self, segment: &str) -> bool {
        self.merging.contains(segment)
    }

    pub fn merging_segments(&self) -> &BTreeSet<String> {
        &self.merging
    }

    /// Deleted documents of a segment including pending deletes.
    pub fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> u32 {
        self.del_counts
            .get(info.name())
            .copied()
            .unwrap_or(info.del_count)
            .min(info.info.doc_count)
    }

    /// Size in bytes pro-rated by the fraction of live documents.
    pub fn segment_size(&self, info: &SegmentCommitInfo) -> u64 {
        let doc_count = info.info.doc_count;
        if doc_count == 0 {
            return info.info.size_bytes;
        }
        let live_ratio = 1.0 - self.num_deleted_docs(info) as f64 / doc_count as f64;
        (info.info.size_bytes as f64 * live_ratio) as u64
    }

    /// Live documents of a segment including pending deletes.
    pub fn num_live_docs(&self, info: &SegmentCommitInfo) -> u32 {
        info.info.doc_count - self.num_deleted_docs(info)
    }
}

/// Selects merges.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Natural merges, consulted after flushes and merges.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges needed to get down to `max_segment_count` segments.
    ///
    /// `segments_to_merge` maps the segments eligible for the forced merge to
    /// whether they were present when it was requested (as opposed to being
    /// outputs of an earlier round).
    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges that expunge deleted documents.
    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification>;

    /// Get policy configuration as key-value pairs for debugging.
    fn get_config(&self) -> HashMap<String, String>;
}

/// Sort by size descending, then name ascending.
fn size_desc_then_name(a: &(u64, &SegmentCommitInfo), b: &(u64, &SegmentCommitInfo)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.name().cmp(b.1.name()))
}

/// Merges segments of roughly equal size, limiting the number allowed per
/// tier. Selection scores candidate merges by skew, size and reclaimed
/// deletes and picks the cheapest.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    /// Segments merged at once during natural merging.
    pub max_merge_at_once: usize,
    /// Segments merged at once during forced merges.
    pub max_merge_at_once_explicit: usize,
    /// Natural merges never produce a segment larger than this.
    pub max_merged_segment_bytes: u64,
    /// Smaller segments are rounded up to this size.
    pub floor_segment_bytes: u64,
    /// Segments allowed per tier.
    pub segs_per_tier: f64,
    /// How strongly reclaiming deletes is favored.
    pub reclaim_deletes_weight: f64,
    /// Segments with a larger percentage of deletes are forced-delete merged.
    pub force_merge_deletes_pct_allowed: f64,
    /// Ceiling for forced merges; `None` lets forced merges grow unbounded.
    pub max_forced_merged_segment_bytes: Option<u64>,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            floor_segment_bytes: 2 * 1024 * 1024,
            segs_per_tier: 10.0,
            reclaim_deletes_weight: 2.0,
            force_merge_deletes_pct_allowed: 10.0,
            max_forced_merged_segment_bytes: None,
        }
    }
}

impl TieredMergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_merge_at_once(mut self, value: usize) -> Self {
        self.max_merge_at_once = value.max(2);
        self
    }

    pub fn with_max_merge_at_once_explicit(mut self, value: usize) -> Self {
        self.max_merge_at_once_explicit = value.max(2);
        self
    }

    pub fn with_segs_per_tier(mut self, value: f64) -> Self {
        self.segs_per_tier = value.max(2.0);
        self
    }

    pub fn with_floor_segment_bytes(mut self, value: u64) -> Self {
        self.floor_segment_bytes = value.max(1);
        self
    }

    pub fn with_max_merged_segment_bytes(mut self, value: u64) -> Self {
        self.max_merged_segment_bytes = value;
        self
    }

    pub fn with_max_forced_merged_segment_bytes(mut self, value: Option<u64>) -> Self {
        self.max_forced_merged_segment_bytes = value;
        self
    }

    pub fn with_force_merge_deletes_pct_allowed(mut self, value: f64) -> Self {
        self.force_merge_deletes_pct_allowed = value.clamp(0.0, 100.0);
        self
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.floor_segment_bytes)
    }

    /// Lower is better.
    fn score(&self, candidate: &[(u64, &SegmentCommitInfo)], hit_too_large: bool) -> f64 {
        let mut before = 0u64;
        let mut after = 0u64;
        let mut after_floored = 0u64;
        for (size, info) in candidate {
            before += info.info.size_bytes;
            after += size;
            after_floored += self.floor_size(*size);
        }

        let skew = if hit_too_large {
            1.0 / self.max_merge_at_once as f64
        } else {
            self.floor_size(candidate[0].0) as f64 / after_floored.max(1) as f64
        };
        let mut score = skew * (after.max(1) as f64).powf(0.05);
        let non_del_ratio = after as f64 / before.max(1) as f64;
        score *= non_del_ratio.powf(self.reclaim_deletes_weight);
        score
    }

    /// Segments eligible for natural merging with their sizes, sorted.
    fn sorted_sizes<'a>(
        &self,
        infos: &'a SegmentInfos,
        ctx: &MergeContext,
    ) -> Vec<(u64, &'a SegmentCommitInfo)> {
        let mut sorted: Vec<_> = infos
            .segments()
            .iter()
            .map(|info| (ctx.segment_size(info), info))
            .collect();
        sorted.sort_by(size_desc_then_name);
        sorted
    }

    fn new_merge(segments: &[(u64, &SegmentCommitInfo)]) -> OneMerge {
        OneMerge::new(segments.iter().map(|(_, info)| (*info).clone()).collect())
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        if infos.is_empty() {
            return None;
        }
        let sorted = self.sorted_sizes(infos, ctx);

        let mut total_bytes = 0u64;
        let mut min_segment_bytes = u64::MAX;
        let mut too_big_count = 0usize;
        let mut merging_bytes = 0u64;
        for (size, info) in &sorted {
            if ctx.is_merging(info.name()) {
                merging_bytes += size;
                continue;
            }
            if *size as f64 >= self.max_merged_segment_bytes as f64 / 2.0 {
                too_big_count += 1;
            } else {
                total_bytes += size;
            }
            min_segment_bytes = min_segment_bytes.min(*size);
        }
        if min_segment_bytes == u64::MAX {
            return None;
        }

        // Budget of segments the index may hold at its current size.
        let mut level_size = self.floor_size(min_segment_bytes) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let seg_count_level = bytes_left / level_size;
            if seg_count_level < self.segs_per_tier {
                allowed += seg_count_level.ceil();
                break;
            }
            allowed += self.segs_per_tier;
            bytes_left -= self.segs_per_tier * level_size;
            level_size *= self.max_merge_at_once as f64;
        }
        let allowed = allowed.max(self.segs_per_tier) as usize + too_big_count;

        let mut to_be_merged: BTreeSet<&str> = BTreeSet::new();
        let mut spec = MergeSpecification::new();
        loop {
            let eligible: Vec<(u64, &SegmentCommitInfo)> = sorted
                .iter()
                .filter(|(size, info)| {
                    !ctx.is_merging(info.name())
                        && !to_be_merged.contains(info.name())
                        && (*size as f64) < self.max_merged_segment_bytes as f64 / 2.0
                })
                .copied()
                .collect();

            let max_merge_running = merging_bytes >= self.max_merged_segment_bytes;
            if eligible.len() + too_big_count <= allowed || eligible.len() < 2 {
                break;
            }

            let mut best: Option<(f64, Vec<(u64, &SegmentCommitInfo)>)> = None;
            let last_start = eligible.len().saturating_sub(self.max_merge_at_once);
            for start in 0..=last_start {
                let mut candidate = Vec::new();
                let mut after = 0u64;
                let mut hit_too_large = false;
                for entry in &eligible[start..] {
                    if candidate.len() >= self.max_merge_at_once {
                        break;
                    }
                    if after + entry.0 > self.max_merged_segment_bytes {
                        hit_too_large = true;
                        continue;
                    }
                    candidate.push(*entry);
                    after += entry.0;
                }
                if candidate.len() < 2 {
                    continue;
                }
                let score = self.score(&candidate, hit_too_large);
                if best.as_ref().is_none_or(|(best_score, _)| score < *best_score) {
                    best = Some((score, candidate));
                }
            }

            match best {
                Some((_, candidate)) if !max_merge_running => {
                    to_be_merged.extend(candidate.iter().map(|(_, info)| info.name()));
                    spec.add(Self::new_merge(&candidate));
                }
                _ => break,
            }
        }
        spec.non_empty()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        let mut eligible = Vec::new();
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        for info in infos.segments() {
            let Some(&original) = segments_to_merge.get(info.name()) else {
                continue;
            };
            if ctx.is_merging(info.name()) {
                force_merge_running = true;
                continue;
            }
            let size = ctx.segment_size(info);
            if self
                .max_forced_merged_segment_bytes
                .is_some_and(|ceiling| size > ceiling)
            {
                continue;
            }
            segment_is_original |= original;
            eligible.push((size, info));
        }

        if eligible.is_empty() {
            return None;
        }
        if max_segment_count > 1 && eligible.len() <= max_segment_count {
            return None;
        }
        if max_segment_count == 1 && eligible.len() == 1 {
            let only = eligible[0].1;
            if !segment_is_original || ctx.num_deleted_docs(only) == 0 {
                return None;
            }
        }

        eligible.sort_by(size_desc_then_name);
        let mut spec = MergeSpecification::new();
        let mut end = eligible.len();
        let explicit = self.max_merge_at_once_explicit;

        while end >= explicit + max_segment_count - 1 {
            let mut merge = Self::new_merge(&eligible[end - explicit..end]);
            merge.max_num_segments = Some(max_segment_count);
            spec.add(merge);
            end -= explicit;
        }

        if spec.is_empty() && !force_merge_running {
            let num_to_merge = end + 1 - max_segment_count.min(end);
            let mut merge = Self::new_merge(&eligible[end - num_to_merge..end]);
            merge.max_num_segments = Some(max_segment_count);
            spec.add(merge);
        }
        spec.non_empty()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let mut eligible: Vec<(u64, &SegmentCommitInfo)> = infos
            .segments()
            .iter()
            .filter(|info| !ctx.is_merging(info.name()) && info.info.doc_count > 0)
            .filter(|info| {
                let pct = 100.0 * ctx.num_deleted_docs(info) as f64 / info.info.doc_count as f64;
                pct > self.force_merge_deletes_pct_allowed
            })
            .map(|info| (ctx.segment_size(info), info))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by(size_desc_then_name);

        let mut spec = MergeSpecification::new();
        for chunk in eligible.chunks(self.max_merge_at_once_explicit) {
            spec.add(Self::new_merge(chunk));
        }
        spec.non_empty()
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("type".to_string(), "tiered".to_string());
        config.insert("max_merge_at_once".to_string(), self.max_merge_at_once.to_string());
        config.insert(
            "max_merge_at_once_explicit".to_string(),
            self.max_merge_at_once_explicit.to_string(),
        );
        config.insert(
            "max_merged_segment_bytes".to_string(),
            self.max_merged_segment_bytes.to_string(),
        );
        config.insert("floor_segment_bytes".to_string(), self.floor_segment_bytes.to_string());
        config.insert("segs_per_tier".to_string(), self.segs_per_tier.to_string());
        config.insert(
            "reclaim_deletes_weight".to_string(),
            self.reclaim_deletes_weight.to_string(),
        );
        config.insert(
            "force_merge_deletes_pct_allowed".to_string(),
            self.force_merge_deletes_pct_allowed.to_string(),
        );
        config
    }
}

/// Level span of one merge level in log space.
const LEVEL_LOG_SPAN: f64 = 0.75;

/// Merges adjacent segments whose document counts fall into the same
/// logarithmic level.
#[derive(Debug, Clone)]
pub struct LogDocMergePolicy {
    /// Segments per level, and segments merged at once.
    pub merge_factor: usize,
    /// Segments smaller than this are all on the lowest level.
    pub min_merge_docs: u32,
    /// Segments with more docs are never merged naturally.
    pub max_merge_docs: u32,
    /// Discount deleted documents when measuring segments.
    pub calibrate_size_by_deletes: bool,
}

impl Default for LogDocMergePolicy {
    fn default() -> Self {
        LogDocMergePolicy {
            merge_factor: 10,
            min_merge_docs: 1000,
            max_merge_docs: u32::MAX,
            calibrate_size_by_deletes: true,
        }
    }
}

impl LogDocMergePolicy {
    pub fn new(merge_factor: usize) -> Self {
        LogDocMergePolicy {
            merge_factor: merge_factor.max(2),
            ..Default::default()
        }
    }

    pub fn with_min_merge_docs(mut self, value: u32) -> Self {
        self.min_merge_docs = value;
        self
    }

    pub fn with_max_merge_docs(mut self, value: u32) -> Self {
        self.max_merge_docs = value;
        self
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &MergeContext) -> u32 {
        if self.calibrate_size_by_deletes {
            ctx.num_live_docs(info)
        } else {
            info.info.doc_count
        }
    }

    fn merge_of(segments: &[SegmentCommitInfo], max_num_segments: Option<usize>) -> OneMerge {
        let mut merge = OneMerge::new(segments.to_vec());
        merge.max_num_segments = max_num_segments;
        merge
    }
}

impl MergePolicy for LogDocMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let segments = infos.segments();
        if segments.is_empty() {
            return None;
        }
        let norm = (self.merge_factor as f64).ln();
        let levels: Vec<f64> = segments
            .iter()
            .map(|info| (self.size(info, ctx).max(1) as f64).ln() / norm)
            .collect();
        let level_floor = if self.min_merge_docs <= 1 {
            0.0
        } else {
            (self.min_merge_docs as f64).ln() / norm
        };

        let mut spec = MergeSpecification::new();
        let num_segments = segments.len();
        let mut start = 0;
        while start < num_segments {
            let max_level = levels[start..]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);

            let level_bottom = if max_level <= level_floor {
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor && max_level >= level_floor {
                    level_floor
                } else {
                    bottom
                }
            };

            // Rightmost segment that falls into this level.
            let mut upto = num_segments - 1;
            while upto > start && levels[upto] < level_bottom {
                upto -= 1;
            }

            let mut end = start + self.merge_factor;
            while end <= upto + 1 {
                let window = &segments[start..end];
                let any_merging = window.iter().any(|s| ctx.is_merging(s.name()));
                let any_too_large = window
                    .iter()
                    .any(|s| self.size(s, ctx) >= self.max_merge_docs);
                if !any_merging && !any_too_large {
                    spec.add(Self::merge_of(window, None));
                }
                start = end;
                end = start + self.merge_factor;
            }
            start = upto + 1;
        }
        spec.non_empty()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let max_segment_count = max_segment_count.max(1);
        let eligible: Vec<SegmentCommitInfo> = infos
            .segments()
            .iter()
            .filter(|s| segments_to_merge.contains_key(s.name()))
            .cloned()
            .collect();
        if eligible.iter().any(|s| ctx.is_merging(s.name())) {
            return None;
        }
        if eligible.len() <= max_segment_count {
            let already_merged = eligible.len() != 1
                || max_segment_count > 1
                || ctx.num_deleted_docs(&eligible[0]) == 0
                || !segments_to_merge.get(eligible[0].name()).copied().unwrap_or(false);
            if already_merged {
                return None;
            }
        }

        let mut spec = MergeSpecification::new();
        let mut last = eligible.len();
        while last + 1 >= self.merge_factor + max_segment_count {
            spec.add(Self::merge_of(
                &eligible[last - self.merge_factor..last],
                Some(max_segment_count),
            ));
            last -= self.merge_factor;
        }
        if spec.is_empty() {
            let num_to_merge = last + 1 - max_segment_count.min(last);
            spec.add(Self::merge_of(
                &eligible[last - num_to_merge..last],
                Some(max_segment_count),
            ));
        }
        spec.non_empty()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &MergeContext,
    ) -> Option<MergeSpecification> {
        let segments = infos.segments();
        let mut spec = MergeSpecification::new();
        let mut run: Vec<SegmentCommitInfo> = Vec::new();
        for info in segments {
            let has_deletes = ctx.num_deleted_docs(info) > 0 && !ctx.is_merging(info.name());
            if has_deletes {
                run.push(info.clone());
                if run.len() == self.merge_factor {
                    spec.add(Self::merge_of(&run, None));
                    run.clear();
                }
            } else if !run.is_empty() {
                spec.add(Self::merge_of(&run, None));
                run.clear();
            }
        }
        if !run.is_empty() {
            spec.add(Self::merge_of(&run, None));
        }
        spec.non_empty()
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("type".to_string(), "log_doc".to_string());
        config.insert("merge_factor".to_string(), self.merge_factor.to_string());
        config.insert("min_merge_docs".to_string(), self.min_merge_docs.to_string());
        config.insert("max_merge_docs".to_string(), self.max_merge_docs.to_string());
        config
    }
}

/// Never merges.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _: MergeTrigger, _: &SegmentInfos, _: &MergeContext) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(
        &self,
        _: &SegmentInfos,
        _: usize,
        _: &BTreeMap<String, bool>,
        _: &MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(&self, _: &SegmentInfos, _: &MergeContext) -> Option<MergeSpecification> {
        None
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("type".to_string(), "none".to_string());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::SegmentInfo;

    fn infos(sizes: &[(u32, u64)]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for &(docs, bytes) in sizes {
            let name = infos.new_segment_name();
            infos.add(SegmentCommitInfo::new(SegmentInfo::new(
                name,
                docs,
                "Segdex10",
                BTreeSet::new(),
                bytes,
                "flush",
                0,
            )));
        }
        infos
    }

    fn all_original(infos: &SegmentInfos) -> BTreeMap<String, bool> {
        infos.segments().iter().map(|s| (s.name().to_string(), true)).collect()
    }

    fn names(spec: &MergeSpecification) -> Vec<Vec<String>> {
        spec.merges
            .iter()
            .map(|m| m.segments().iter().map(|s| s.name().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_tiered_no_merge_under_budget() {
        let infos = infos(&[(10, 1000); 9]);
        let policy = TieredMergePolicy::default();
        assert!(policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &MergeContext::default())
            .is_none());
    }

    #[test]
    fn test_tiered_merges_over_budget_and_skips_merging() {
        let infos = infos(&[(10, 1000); 25]);
        let policy = TieredMergePolicy::default();
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &MergeContext::default())
            .unwrap();
        assert!(!spec.is_empty());
        for merge in &spec.merges {
            assert!(merge.segments().len() <= policy.max_merge_at_once);
        }

        let merging: BTreeSet<String> = infos.segments()[..20].iter().map(|s| s.name().to_string()).collect();
        let ctx = MergeContext::new(merging.clone(), HashMap::new());
        if let Some(spec) = policy.find_merges(MergeTrigger::SegmentFlush, &infos, &ctx) {
            for merge in &spec.merges {
                assert!(merge.segment_names().is_disjoint(&merging));
            }
        }
    }

    #[test]
    fn test_tiered_tie_break_is_deterministic() {
        let infos = infos(&[(10, 1000); 30]);
        let policy = TieredMergePolicy::default();
        let ctx = MergeContext::default();
        let a = policy.find_merges(MergeTrigger::Explicit, &infos, &ctx).unwrap();
        let b = policy.find_merges(MergeTrigger::Explicit, &infos, &ctx).unwrap();
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_tiered_forced_merge_to_one() {
        let infos = infos(&[(10, 1000), (5, 500), (7, 700)]);
        let policy = TieredMergePolicy::default();
        let ctx = MergeContext::default();
        let spec = policy
            .find_forced_merges(&infos, 1, &all_original(&infos), &ctx)
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 3);
        assert_eq!(spec.merges[0].max_num_segments, Some(1));

        // Already at or below the target: nothing to do.
        assert!(policy.find_forced_merges(&infos, 3, &all_original(&infos), &ctx).is_none());
        assert!(policy.find_forced_merges(&infos, 5, &all_original(&infos), &ctx).is_none());
    }

    #[test]
    fn test_tiered_forced_merge_single_segment_with_deletes() {
        let mut infos = infos(&[(10, 1000)]);
        infos.segments_mut()[0].del_count = 3;
        infos.segments_mut()[0].advance_del_gen();
        let policy = TieredMergePolicy::default();
        let ctx = MergeContext::default();
        assert!(policy.find_forced_merges(&infos, 1, &all_original(&infos), &ctx).is_some());

        let not_original: BTreeMap<String, bool> = [("_0".to_string(), false)].into_iter().collect();
        assert!(policy.find_forced_merges(&infos, 1, &not_original, &ctx).is_none());
    }

    #[test]
    fn test_tiered_forced_merge_respects_optional_ceiling() {
        let infos = infos(&[(10, 10_000), (5, 500), (7, 700)]);
        let ctx = MergeContext::default();
        let policy = TieredMergePolicy::default().with_max_forced_merged_segment_bytes(Some(1000));
        let spec = policy
            .find_forced_merges(&infos, 1, &all_original(&infos), &ctx)
            .unwrap();
        assert_eq!(names(&spec), vec![vec!["_2".to_string(), "_1".to_string()]]);
    }

    #[test]
    fn test_tiered_forced_deletes() {
        let infos = infos(&[(10, 1000), (10, 1000), (10, 1000)]);
        let mut del_counts = HashMap::new();
        del_counts.insert("_1".to_string(), 5);
        del_counts.insert("_2".to_string(), 1);
        let ctx = MergeContext::new(BTreeSet::new(), del_counts);
        let policy = TieredMergePolicy::default();
        let spec = policy.find_forced_deletes_merges(&infos, &ctx).unwrap();
        assert_eq!(names(&spec), vec![vec!["_1".to_string()]]);
    }

    #[test]
    fn test_log_doc_merges_full_levels() {
        let infos = infos(&[(5, 100); 7]);
        let policy = LogDocMergePolicy::new(3).with_min_merge_docs(10);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &MergeContext::default())
            .unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec.merges[0].segments().len(), 3);
        assert_eq!(spec.merges[0].segments()[0].name(), "_0");
        assert_eq!(spec.merges[1].segments()[0].name(), "_3");
    }

    #[test]
    fn test_log_doc_forced_merge_converges() {
        let mut infos = infos(&[(5, 100); 7]);
        let policy = LogDocMergePolicy::new(3);
        let ctx = MergeContext::default();
        let mut rounds = 0;
        while let Some(spec) = policy.find_forced_merges(&infos, 2, &all_original(&infos), &ctx) {
            rounds += 1;
            assert!(rounds < 10);
            for merge in spec {
                assert!(merge.segments().len() >= 2);
                let output = SegmentCommitInfo::new(SegmentInfo::new(
                    infos.new_segment_name(),
                    merge.total_max_doc() as u32,
                    "Segdex10",
                    BTreeSet::new(),
                    merge.total_bytes(),
                    "merge",
                    0,
                ));
                infos.apply_merge_changes(&merge.segment_names(), Some(output));
            }
        }
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn test_no_merge_policy() {
        let infos = infos(&[(1, 1); 50]);
        let ctx = MergeContext::default();
        assert!(NoMergePolicy.find_merges(MergeTrigger::Explicit, &infos, &ctx).is_none());
        assert!(NoMergePolicy.find_forced_merges(&infos, 1, &all_original(&infos), &ctx).is_none());
    }
}
