//! Merge policies for segment management.
//!
//! A policy looks at the catalog and proposes merges; the writer registers
//! them and hands them to the scheduler. Policies never mutate anything and
//! may be called concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GalleyError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::info_stream::{InfoStream, TMP};
use crate::index::merge::{MergeSpecification, MergeTrigger, OneMerge};
use crate::index::segment_record::SegmentRecord;

const MB: f64 = 1024.0 * 1024.0;

/// What a policy can ask the writer about segments.
pub trait MergeContext {
    /// Deleted documents including deletes not yet written.
    fn num_deleted_docs(&self, record: &SegmentRecord) -> u32;

    /// Whether the segment is already part of a registered merge.
    fn is_merging(&self, name: &str) -> bool;

    /// Bytes of all files the segment references.
    fn size_in_bytes(&self, record: &SegmentRecord) -> u64;

    fn info_stream(&self) -> &dyn InfoStream;
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + Debug {
    /// Merges to run after a flush or a finished merge.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges bringing the segments in `segments_to_merge` down to at most
    /// `max_segment_count`. The map value is true for segments that existed
    /// when the force merge started, false for segments it produced.
    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &AHashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges reclaiming deleted documents.
    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Whether a new segment of `segment_bytes` should use a compound layout.
    fn use_compound_file(
        &self,
        catalog: &SegmentCatalog,
        segment_bytes: u64,
        ctx: &dyn MergeContext,
    ) -> bool;

    /// Get policy configuration as key-value pairs for debugging.
    fn get_config(&self) -> HashMap<String, String>;
}

/// Merges segments of roughly equal size, a tier at a time.
///
/// The index is allowed `segments_per_tier` segments per size tier, tiers
/// growing by `max_merge_at_once`. When there are more segments than that
/// budget, the cheapest merge of up to `max_merge_at_once` similarly sized
/// segments is picked. Cheapness favours merges with low skew, small total
/// size and many deletes to reclaim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicy {
    /// Maximum number of segments merged at once during normal merging.
    pub max_merge_at_once: usize,

    /// Maximum number of segments merged at once by forced merges.
    pub max_merge_at_once_explicit: usize,

    /// Upper bound on the size of a merged segment, in MB.
    pub max_merged_segment_mb: f64,

    /// Segments smaller than this are treated as this size, in MB.
    pub floor_segment_mb: f64,

    /// Allowed number of segments per tier.
    pub segments_per_tier: f64,

    /// Segments with a higher deleted percentage are merged by
    /// `force_merge_deletes`.
    pub force_merge_deletes_pct_allowed: f64,

    /// How strongly reclaiming deletes is favoured.
    pub reclaim_deletes_weight: f64,

    /// A new segment uses the compound layout when it is at most this
    /// fraction of the index.
    pub no_cfs_ratio: f64,

    /// Segments larger than this never use the compound layout, in MB.
    pub max_cfs_segment_size_mb: f64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_mb: 5.0 * 1024.0,
            floor_segment_mb: 2.0,
            segments_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            reclaim_deletes_weight: 2.0,
            no_cfs_ratio: 0.1,
            max_cfs_segment_size_mb: f64::MAX,
        }
    }
}

impl TieredMergePolicy {
    /// Create a new tiered merge policy with custom configuration.
    pub fn new(max_merge_at_once: usize, segments_per_tier: f64, max_merged_segment_mb: f64) -> Self {
        TieredMergePolicy {
            max_merge_at_once,
            segments_per_tier,
            max_merged_segment_mb,
            ..Default::default()
        }
    }

    /// Reject settings the selection loops cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_merge_at_once < 2 {
            return Err(GalleyError::invalid_argument(format!(
                "max_merge_at_once must be > 1 (got {})",
                self.max_merge_at_once
            )));
        }
        if self.max_merge_at_once_explicit < 2 {
            return Err(GalleyError::invalid_argument(format!(
                "max_merge_at_once_explicit must be > 1 (got {})",
                self.max_merge_at_once_explicit
            )));
        }
        if self.segments_per_tier < 2.0 {
            return Err(GalleyError::invalid_argument(format!(
                "segments_per_tier must be >= 2.0 (got {})",
                self.segments_per_tier
            )));
        }
        if self.max_merged_segment_mb < 0.0 || self.floor_segment_mb <= 0.0 {
            return Err(GalleyError::invalid_argument(format!(
                "segment sizes must be positive (max_merged_segment_mb={}, floor_segment_mb={})",
                self.max_merged_segment_mb, self.floor_segment_mb
            )));
        }
        if !(0.0..=100.0).contains(&self.force_merge_deletes_pct_allowed) {
            return Err(GalleyError::invalid_argument(format!(
                "force_merge_deletes_pct_allowed must be between 0.0 and 100.0 (got {})",
                self.force_merge_deletes_pct_allowed
            )));
        }
        if self.reclaim_deletes_weight < 0.0 {
            return Err(GalleyError::invalid_argument(format!(
                "reclaim_deletes_weight must be >= 0.0 (got {})",
                self.reclaim_deletes_weight
            )));
        }
        if !(0.0..=1.0).contains(&self.no_cfs_ratio) {
            return Err(GalleyError::invalid_argument(format!(
                "no_cfs_ratio must be 0.0 to 1.0 inclusive (got {})",
                self.no_cfs_ratio
            )));
        }
        Ok(())
    }

    fn max_merged_segment_bytes(&self) -> u64 {
        (self.max_merged_segment_mb * MB) as u64
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max((self.floor_segment_mb * MB) as u64)
    }

    /// Size with the deleted fraction taken out.
    fn size(&self, record: &SegmentRecord, ctx: &dyn MergeContext) -> u64 {
        let bytes = ctx.size_in_bytes(record);
        if record.doc_count() == 0 {
            return bytes;
        }
        let del_ratio = ctx.num_deleted_docs(record) as f64 / record.doc_count() as f64;
        (bytes as f64 * (1.0 - del_ratio)) as u64
    }

    fn is_merged(&self, record: &SegmentRecord, ctx: &dyn MergeContext) -> bool {
        ctx.num_deleted_docs(record) == 0
    }

    fn message(&self, ctx: &dyn MergeContext, message: impl FnOnce() -> String) {
        let info_stream = ctx.info_stream();
        if info_stream.is_enabled(TMP) {
            info_stream.message(TMP, &message());
        }
    }

    /// Records sorted by size, largest first. Ties keep catalog order.
    fn sorted_by_size<'a>(
        &self,
        records: impl Iterator<Item = &'a SegmentRecord>,
        ctx: &dyn MergeContext,
    ) -> Vec<(&'a SegmentRecord, u64)> {
        let mut sorted: Vec<(&SegmentRecord, u64)> =
            records.map(|r| (r, self.size(r, ctx))).collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted
    }

    /// Lower is better.
    fn score(&self, candidate: &[(&SegmentRecord, u64)], hit_too_large: bool, ctx: &dyn MergeContext) -> f64 {
        let mut before_bytes = 0u64;
        let mut after_bytes = 0u64;
        let mut after_bytes_floored = 0u64;
        for (record, size) in candidate {
            after_bytes += size;
            after_bytes_floored += self.floor_size(*size);
            before_bytes += ctx.size_in_bytes(record);
        }

        let skew = if hit_too_large {
            // A merge capped by the size limit is as good as a perfectly
            // balanced one.
            1.0 / self.max_merge_at_once as f64
        } else {
            let largest = candidate.first().map_or(0, |(_, size)| *size);
            self.floor_size(largest) as f64 / after_bytes_floored.max(1) as f64
        };

        let non_del_ratio = if before_bytes == 0 {
            1.0
        } else {
            after_bytes as f64 / before_bytes as f64
        };
        skew * (after_bytes as f64).powf(0.05) * non_del_ratio.powf(self.reclaim_deletes_weight)
    }

    /// Number of segments the index may have before merging is needed.
    fn allowed_segment_count(&self, total_bytes: u64, min_segment_bytes: u64) -> usize {
        let mut level_size = self.floor_size(min_segment_bytes).max(1) as f64;
        let mut bytes_left = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let seg_count_level = bytes_left / level_size;
            if seg_count_level < self.segments_per_tier {
                allowed += seg_count_level.ceil();
                break;
            }
            allowed += self.segments_per_tier;
            bytes_left -= self.segments_per_tier * level_size;
            level_size *= self.max_merge_at_once as f64;
        }
        allowed as usize
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        if catalog.is_empty() {
            return Ok(None);
        }
        self.message(ctx, || {
            format!("findMerges: {} segments, trigger={trigger:?}", catalog.len())
        });

        let sorted = self.sorted_by_size(catalog.iter(), ctx);
        let max_merged_bytes = self.max_merged_segment_bytes();

        let mut total_bytes: u64 = sorted.iter().map(|(_, size)| size).sum();
        let min_segment_bytes = sorted.iter().map(|(_, size)| *size).min().unwrap_or(0);

        // Segments already close to the size limit don't count against the
        // budget.
        let too_big_count = sorted
            .iter()
            .take_while(|(_, size)| *size as f64 >= max_merged_bytes as f64 / 2.0)
            .count();
        for (_, size) in &sorted[..too_big_count] {
            total_bytes -= size;
        }

        let allowed = self.allowed_segment_count(total_bytes, min_segment_bytes);

        let mut spec: Option<MergeSpecification> = None;
        let mut to_be_merged: HashSet<&str> = HashSet::new();

        loop {
            let mut merging_bytes = 0u64;
            let mut eligible: Vec<(&SegmentRecord, u64)> = Vec::new();
            for (record, size) in &sorted[too_big_count..] {
                if ctx.is_merging(record.name()) {
                    merging_bytes += ctx.size_in_bytes(record);
                } else if !to_be_merged.contains(record.name()) {
                    eligible.push((record, *size));
                }
            }
            let max_merge_is_running = merging_bytes >= max_merged_bytes;

            if eligible.is_empty() || eligible.len() <= allowed {
                return Ok(spec);
            }
            self.message(ctx, || {
                format!(
                    "  allowedSegmentCount={allowed} vs count={} (eligible count={}) tooBigCount={too_big_count}",
                    catalog.len(),
                    eligible.len()
                )
            });

            let mut best: Option<(Vec<(&SegmentRecord, u64)>, f64)> = None;
            if eligible.len() >= self.max_merge_at_once {
                for start in 0..=eligible.len() - self.max_merge_at_once {
                    let mut after_bytes = 0u64;
                    let mut candidate = Vec::new();
                    let mut hit_too_large = false;
                    for (record, size) in &eligible[start..] {
                        if candidate.len() >= self.max_merge_at_once {
                            break;
                        }
                        if after_bytes + size > max_merged_bytes {
                            hit_too_large = true;
                            continue;
                        }
                        candidate.push((*record, *size));
                        after_bytes += size;
                    }
                    if candidate.len() < 2 {
                        continue;
                    }

                    let score = self.score(&candidate, hit_too_large, ctx);
                    let better = best.as_ref().is_none_or(|(_, best_score)| score < *best_score);
                    if better && (!hit_too_large || !max_merge_is_running) {
                        best = Some((candidate, score));
                    }
                }
            }

            let Some((best, score)) = best else {
                return Ok(spec);
            };
            self.message(ctx, || {
                let names: Vec<&str> = best.iter().map(|(r, _)| r.name()).collect();
                format!("  add merge={names:?} score={score:.3}")
            });
            for (record, _) in &best {
                to_be_merged.insert(record.name());
            }
            spec.get_or_insert_with(MergeSpecification::new)
                .add(OneMerge::new(best.into_iter().map(|(r, _)| r.clone()).collect()));
        }
    }

    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &AHashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        if max_segment_count < 1 {
            return Err(GalleyError::invalid_argument(format!(
                "max_segment_count must be >= 1 (got {max_segment_count})"
            )));
        }
        self.message(ctx, || {
            format!(
                "findForcedMerges maxSegmentCount={max_segment_count} segmentsToMerge={}",
                segments_to_merge.len()
            )
        });

        let mut eligible = Vec::new();
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        for record in catalog.iter() {
            if let Some(is_original) = segments_to_merge.get(record.name()) {
                segment_is_original = *is_original;
                if ctx.is_merging(record.name()) {
                    force_merge_running = true;
                } else {
                    eligible.push(record);
                }
            }
        }

        if eligible.is_empty() {
            return Ok(None);
        }
        if (max_segment_count > 1 && eligible.len() <= max_segment_count)
            || (max_segment_count == 1
                && eligible.len() == 1
                && (!segment_is_original || self.is_merged(eligible[0], ctx)))
        {
            self.message(ctx, || "already merged".to_string());
            return Ok(None);
        }

        let eligible: Vec<&SegmentRecord> = self
            .sorted_by_size(eligible.into_iter(), ctx)
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        let mut end = eligible.len();
        let mut spec: Option<MergeSpecification> = None;

        // Full-width merges first, from the small end.
        while end >= self.max_merge_at_once_explicit + max_segment_count - 1 {
            let merge = OneMerge::new(
                eligible[end - self.max_merge_at_once_explicit..end]
                    .iter()
                    .map(|r| (*r).clone())
                    .collect(),
            );
            spec.get_or_insert_with(MergeSpecification::new).add(merge);
            end -= self.max_merge_at_once_explicit;
        }

        if spec.is_none() && !force_merge_running {
            let num_to_merge = end + 1 - max_segment_count;
            let merge = OneMerge::new(
                eligible[end - num_to_merge..end]
                    .iter()
                    .map(|r| (*r).clone())
                    .collect(),
            );
            spec.get_or_insert_with(MergeSpecification::new).add(merge);
        }
        Ok(spec)
    }

    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        let eligible: Vec<&SegmentRecord> = catalog
            .iter()
            .filter(|record| {
                let pct_deletes = if record.doc_count() == 0 {
                    0.0
                } else {
                    100.0 * ctx.num_deleted_docs(record) as f64 / record.doc_count() as f64
                };
                pct_deletes > self.force_merge_deletes_pct_allowed && !ctx.is_merging(record.name())
            })
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let eligible = self.sorted_by_size(eligible.into_iter(), ctx);
        let mut spec = MergeSpecification::new();
        // The caller asked for it explicitly, so the size limit is not
        // enforced.
        for chunk in eligible.chunks(self.max_merge_at_once_explicit) {
            spec.add(OneMerge::new(chunk.iter().map(|(r, _)| (*r).clone()).collect()));
        }
        Ok(Some(spec))
    }

    fn use_compound_file(
        &self,
        catalog: &SegmentCatalog,
        segment_bytes: u64,
        ctx: &dyn MergeContext,
    ) -> bool {
        if self.no_cfs_ratio == 0.0 {
            return false;
        }
        if segment_bytes as f64 > self.max_cfs_segment_size_mb * MB {
            return false;
        }
        if self.no_cfs_ratio >= 1.0 {
            return true;
        }
        let total_bytes: u64 = catalog.iter().map(|r| self.size(r, ctx)).sum();
        segment_bytes as f64 <= self.no_cfs_ratio * total_bytes as f64
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("policy_type".to_string(), "tiered".to_string());
        config.insert(
            "max_merge_at_once".to_string(),
            self.max_merge_at_once.to_string(),
        );
        config.insert(
            "max_merge_at_once_explicit".to_string(),
            self.max_merge_at_once_explicit.to_string(),
        );
        config.insert(
            "max_merged_segment_mb".to_string(),
            self.max_merged_segment_mb.to_string(),
        );
        config.insert(
            "floor_segment_mb".to_string(),
            self.floor_segment_mb.to_string(),
        );
        config.insert(
            "segments_per_tier".to_string(),
            self.segments_per_tier.to_string(),
        );
        config.insert(
            "force_merge_deletes_pct_allowed".to_string(),
            self.force_merge_deletes_pct_allowed.to_string(),
        );
        config.insert(
            "reclaim_deletes_weight".to_string(),
            self.reclaim_deletes_weight.to_string(),
        );
        config.insert("no_cfs_ratio".to_string(), self.no_cfs_ratio.to_string());
        config
    }
}

/// No-merge policy for testing or read-only scenarios.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _catalog: &SegmentCatalog,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_merges(
        &self,
        _catalog: &SegmentCatalog,
        _max_segment_count: usize,
        _segments_to_merge: &AHashMap<String, bool>,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_deletes_merges(
        &self,
        _catalog: &SegmentCatalog,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn use_compound_file(
        &self,
        _catalog: &SegmentCatalog,
        _segment_bytes: u64,
        _ctx: &dyn MergeContext,
    ) -> bool {
        false
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("policy_type".to_string(), "no_merge".to_string());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::info_stream::NoInfoStream;
    use crate::index::segment_record::SegmentInfo;

    #[derive(Default)]
    struct TestContext {
        sizes: AHashMap<String, u64>,
        deletes: AHashMap<String, u32>,
        merging: HashSet<String>,
    }

    impl MergeContext for TestContext {
        fn num_deleted_docs(&self, record: &SegmentRecord) -> u32 {
            self.deletes.get(record.name()).copied().unwrap_or(0)
        }

        fn is_merging(&self, name: &str) -> bool {
            self.merging.contains(name)
        }

        fn size_in_bytes(&self, record: &SegmentRecord) -> u64 {
            self.sizes.get(record.name()).copied().unwrap_or(0)
        }

        fn info_stream(&self) -> &dyn InfoStream {
            &NoInfoStream
        }
    }

    fn create_test_catalog(sizes: &[u64], ctx: &mut TestContext) -> SegmentCatalog {
        let mut catalog = SegmentCatalog::new();
        for size in sizes {
            let name = catalog.new_segment_name();
            ctx.sizes.insert(name.clone(), *size);
            catalog.add(SegmentRecord::new(SegmentInfo::new(&name, 100, "Plain48")));
        }
        catalog
    }

    fn policy() -> TieredMergePolicy {
        TieredMergePolicy {
            max_merge_at_once: 2,
            segments_per_tier: 2.0,
            floor_segment_mb: 0.001,
            ..Default::default()
        }
    }

    #[test]
    fn test_tiered_merge_policy_too_many_segments() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000, 1000, 1000, 1000, 1000], &mut ctx);

        let spec = policy()
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
            .unwrap()
            .expect("over budget");
        assert!(!spec.is_empty());
        assert!(spec.merges.iter().all(|m| m.segments().len() == 2));
    }

    #[test]
    fn test_tiered_merge_policy_within_budget() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000, 1000], &mut ctx);
        let spec = policy()
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
            .unwrap();
        assert!(spec.is_none());
    }

    #[test]
    fn test_tiered_merge_policy_skips_merging_segments() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000, 1000, 1000, 1000, 1000], &mut ctx);
        for name in ["_0", "_1", "_2", "_3"] {
            ctx.merging.insert(name.to_string());
        }

        let spec = policy()
            .find_merges(MergeTrigger::MergeFinished, &catalog, &ctx)
            .unwrap();
        assert!(spec.is_none());
    }

    #[test]
    fn test_forced_merge_to_one_segment() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[4000, 3000, 2000, 1000], &mut ctx);
        let to_merge: AHashMap<String, bool> = catalog
            .iter()
            .map(|r| (r.name().to_string(), true))
            .collect();

        let spec = policy()
            .find_forced_merges(&catalog, 1, &to_merge, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 4);

        // a single segment produced by the forced merge is done
        let mut merged = AHashMap::new();
        merged.insert("_0".to_string(), false);
        let single = create_test_catalog(&[1000], &mut TestContext::default());
        assert!(
            policy()
                .find_forced_merges(&single, 1, &merged, &ctx)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_forced_merge_expunges_deletes_of_single_original() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000], &mut ctx);
        let to_merge: AHashMap<String, bool> = [("_0".to_string(), true)].into_iter().collect();

        assert!(
            policy()
                .find_forced_merges(&catalog, 1, &to_merge, &ctx)
                .unwrap()
                .is_none()
        );

        ctx.deletes.insert("_0".to_string(), 10);
        let spec = policy()
            .find_forced_merges(&catalog, 1, &to_merge, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.merges[0].segment_names(), vec!["_0"]);
    }

    #[test]
    fn test_forced_deletes_merges() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000, 1000, 1000], &mut ctx);
        ctx.deletes.insert("_1".to_string(), 50);
        ctx.deletes.insert("_2".to_string(), 5);

        let spec = policy()
            .find_forced_deletes_merges(&catalog, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segment_names(), vec!["_1"]);
    }

    #[test]
    fn test_use_compound_file() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1000, 1000], &mut ctx);
        let policy = TieredMergePolicy::default();
        assert!(policy.use_compound_file(&catalog, 100, &ctx));
        assert!(!policy.use_compound_file(&catalog, 1000, &ctx));

        let never = TieredMergePolicy {
            no_cfs_ratio: 0.0,
            ..Default::default()
        };
        assert!(!never.use_compound_file(&catalog, 1, &ctx));
    }

    #[test]
    fn test_validate_and_config() {
        assert!(TieredMergePolicy::default().validate().is_ok());
        let bad = TieredMergePolicy {
            segments_per_tier: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let config = TieredMergePolicy::new(5, 4.0, 100.0).get_config();
        assert_eq!(config.get("policy_type").unwrap(), "tiered");
        assert_eq!(config.get("max_merge_at_once").unwrap(), "5");
    }

    #[test]
    fn test_no_merge_policy() {
        let mut ctx = TestContext::default();
        let catalog = create_test_catalog(&[1, 1, 1, 1], &mut ctx);
        let policy = NoMergePolicy;
        assert!(
            policy
                .find_merges(MergeTrigger::FullFlush, &catalog, &ctx)
                .unwrap()
                .is_none()
        );
        assert!(!policy.use_compound_file(&catalog, 1, &ctx));
        assert_eq!(policy.get_config().get("policy_type").unwrap(), "no_merge");
    }
}
