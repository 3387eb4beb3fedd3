//! C4: Category / Resource Engine.
//!
//! Per-category resource histograms, allocation policies, and the
//! two-step (first/max) retry contract (spec.md §4.4). Grounded in
//! `original_source/dttools/src/category.h`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;
use crate::task::AllocationLabel;

/// `category.h`'s `steady_state` thresholds (spec.md §4.4: "e.g., 25").
pub const STEADY_STATE_MIN_COMPLETIONS: u64 = 25;
pub const STEADY_STATE_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryMode {
    Fixed,
    Max,
    MinWaste,
    MaxThroughput,
    GreedyBucketing,
    ExhaustiveBucketing,
}

/// A fixed-bucket histogram over observed peak resource usage
/// (spec.md §4.4: "Samples are stored in fixed-bucket histograms").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    bucket_width: u64,
    buckets: Vec<u64>,
    samples: Vec<u64>,
    sum: u64,
    max_seen: u64,
}

impl Histogram {
    pub fn new(bucket_width: u64) -> Self {
        Histogram { bucket_width: bucket_width.max(1), buckets: Vec::new(), samples: Vec::new(), sum: 0, max_seen: 0 }
    }

    pub fn observe(&mut self, value: u64) {
        let bucket = (value / self.bucket_width) as usize;
        if bucket >= self.buckets.len() {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] += 1;
        self.samples.push(value);
        self.sum += value;
        self.max_seen = self.max_seen.max(value);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.samples.len() as f64
        }
    }

    pub fn max_seen(&self) -> u64 {
        self.max_seen
    }

    /// `P(x <= a)`.
    pub fn fraction_at_most(&self, a: u64) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let at_most = self.samples.iter().filter(|&&x| x <= a).count();
        at_most as f64 / self.samples.len() as f64
    }

    /// Sum of wall times for samples strictly exceeding `a` — used as the
    /// retry-time penalty term in `MinWaste`/`MaxThroughput`
    /// (spec.md §4.4). `wall_times` gives the paired wall-clock sample for
    /// each observed value, in insertion order.
    pub fn tail_wall_time_sum(&self, a: u64, wall_times: &[u64]) -> u64 {
        self.samples
            .iter()
            .zip(wall_times.iter())
            .filter(|(x, _)| **x > a)
            .map(|(_, w)| *w)
            .sum()
    }
}

/// Bookkeeping for one resource dimension: the observed-usage histogram
/// paired with the wall-clock time of each sample, needed by the
/// waste/throughput formulas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStats {
    pub histogram: Histogram,
    pub paired_wall_times: Vec<u64>,
}

impl ResourceStats {
    pub fn new(bucket_width: u64) -> Self {
        ResourceStats { histogram: Histogram::new(bucket_width), paired_wall_times: Vec::new() }
    }

    pub fn observe(&mut self, value: u64, wall_time_s: u64) {
        self.histogram.observe(value);
        self.paired_wall_times.push(wall_time_s);
    }
}

/// One category's resource-allocation state (spec.md §3 "Category").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub mode: CategoryMode,
    pub max_allocation: ResourceVector,
    pub min_allocation: ResourceVector,
    pub first_allocation: ResourceVector,
    pub cores: ResourceStats,
    pub memory: ResourceStats,
    pub disk: ResourceStats,
    pub gpus: ResourceStats,
    pub wall_time: ResourceStats,
    pub total_tasks: u64,
    pub completions_since_last_reset: u64,
    pub steady_state: bool,
    /// `category.h`'s `fast_abort`: multiplier on mean task time past
    /// which a running task is a fast-abort candidate.
    pub fast_abort: f64,
    /// Ladder of ascending bucket sizes for bucketing modes
    /// (simplified relative to the original `bucketing_manager`; see
    /// DESIGN.md).
    bucket_ladder: Vec<u64>,
    #[serde(skip, default = "Instant::now")]
    max_last_updated: Instant,
}

impl Category {
    pub fn new(name: impl Into<String>, mode: CategoryMode) -> Self {
        Category {
            name: name.into(),
            mode,
            max_allocation: ResourceVector::new(),
            min_allocation: ResourceVector::new(),
            first_allocation: ResourceVector::new(),
            cores: ResourceStats::new(1),
            memory: ResourceStats::new(64),
            disk: ResourceStats::new(256),
            gpus: ResourceStats::new(1),
            wall_time: ResourceStats::new(5),
            total_tasks: 0,
            completions_since_last_reset: 0,
            steady_state: false,
            fast_abort: 10.0,
            bucket_ladder: Vec::new(),
            max_last_updated: Instant::now(),
        }
    }

    /// Record a completed task's peak memory usage and wall time, and
    /// recompute derived state (spec.md §4.4).
    pub fn record_completion(&mut self, peak_memory_mb: u64, wall_time_s: u64) {
        self.total_tasks += 1;
        self.completions_since_last_reset += 1;
        let prior_max = self.memory.histogram.max_seen();
        self.memory.observe(peak_memory_mb, wall_time_s);
        self.wall_time.observe(wall_time_s, wall_time_s);
        if self.memory.histogram.max_seen() > prior_max {
            self.max_last_updated = Instant::now();
        }
        self.insert_bucket(peak_memory_mb);
        self.recompute_steady_state();
    }

    fn insert_bucket(&mut self, value: u64) {
        if let Err(pos) = self.bucket_ladder.binary_search(&value) {
            self.bucket_ladder.insert(pos, value);
        }
    }

    fn recompute_steady_state(&mut self) {
        self.steady_state = self.completions_since_last_reset >= STEADY_STATE_MIN_COMPLETIONS
            && self.max_last_updated.elapsed() >= STEADY_STATE_MAX_AGE;
    }

    /// `first_allocation` per spec.md §4.4's mode table, for the memory
    /// dimension (the dimension most commonly auto-labeled in practice;
    /// other dimensions follow the same formulas and are omitted here for
    /// brevity, matching the original's practice of using monitored
    /// `rmsummary` peaks mainly for memory/disk).
    pub fn compute_first_allocation_memory(&self) -> Option<u64> {
        match self.mode {
            CategoryMode::Fixed => self.first_allocation.memory_mb,
            CategoryMode::Max => {
                if self.memory.histogram.count() == 0 {
                    self.first_allocation.memory_mb
                } else {
                    Some(self.memory.histogram.max_seen())
                }
            }
            CategoryMode::MinWaste => self.min_waste_allocation(),
            CategoryMode::MaxThroughput => self.max_throughput_allocation(),
            CategoryMode::GreedyBucketing | CategoryMode::ExhaustiveBucketing => self.bucket_ladder.first().copied(),
        }
    }

    /// `E_waste(a) = a * mean(wall_time) + a_max * sum(wall_time over x>a)`
    /// (spec.md §4.4 "MinWaste"), minimized over observed candidate
    /// allocations.
    fn min_waste_allocation(&self) -> Option<u64> {
        if self.memory.histogram.count() == 0 {
            return self.first_allocation.memory_mb;
        }
        let a_max = self.memory.histogram.max_seen();
        let mean_wall = self.wall_time.histogram.mean();
        let mut best: Option<(u64, f64)> = None;
        for &candidate in self.candidate_allocations() {
            let tail = self.memory.histogram.tail_wall_time_sum(candidate, &self.memory.paired_wall_times);
            let waste = candidate as f64 * mean_wall + a_max as f64 * tail as f64;
            if best.map(|(_, w)| waste < w).unwrap_or(true) {
                best = Some((candidate, waste));
            }
        }
        best.map(|(a, _)| a)
    }

    /// `T(a) = (P(x>a) * a_max/a + P(x<=a)) / (mean(wall_time) + wall_tail(a))`
    /// (spec.md §4.4 "MaxThroughput"), maximized over observed candidates.
    fn max_throughput_allocation(&self) -> Option<u64> {
        if self.memory.histogram.count() == 0 {
            return self.first_allocation.memory_mb;
        }
        let a_max = self.memory.histogram.max_seen() as f64;
        let mean_wall = self.wall_time.histogram.mean();
        let mut best: Option<(u64, f64)> = None;
        for &candidate in self.candidate_allocations() {
            if candidate == 0 {
                continue;
            }
            let p_over = 1.0 - self.memory.histogram.fraction_at_most(candidate);
            let p_under = self.memory.histogram.fraction_at_most(candidate);
            let tail_time = self.memory.histogram.tail_wall_time_sum(candidate, &self.memory.paired_wall_times) as f64;
            let denom = mean_wall + tail_time;
            if denom <= 0.0 {
                continue;
            }
            let throughput = (p_over * a_max / candidate as f64 + p_under) / denom;
            if best.map(|(_, t)| throughput > t).unwrap_or(true) {
                best = Some((candidate, throughput));
            }
        }
        best.map(|(a, _)| a)
    }

    fn candidate_allocations(&self) -> &[u64] {
        &self.memory.histogram.samples
    }

    /// The two-step retry contract (spec.md §4.4 "next_label").
    pub fn next_label(
        &self,
        current_label: AllocationLabel,
        overflow_happened: bool,
        user_supplied: Option<u64>,
        _measured: Option<u64>,
    ) -> AllocationLabel {
        if !overflow_happened {
            return current_label;
        }
        match (self.mode, current_label) {
            (CategoryMode::Fixed, _) => AllocationLabel::Error,
            (_, AllocationLabel::First) => {
                if user_supplied.is_some() || self.max_allocation.memory_mb.is_some() {
                    AllocationLabel::Max
                } else {
                    AllocationLabel::Error
                }
            }
            (_, AllocationLabel::Max) => AllocationLabel::Error,
            (_, AllocationLabel::Error) => AllocationLabel::Error,
        }
    }

    /// The resource vector to use for a task's current allocation label.
    pub fn dynamic_task_resources(&self, user: &ResourceVector, label: AllocationLabel) -> ResourceVector {
        match label {
            AllocationLabel::Max => user.or(&self.max_allocation),
            _ => {
                let mut auto = ResourceVector::new();
                auto.memory_mb = self.compute_first_allocation_memory();
                user.or(&auto)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_mode_first_allocation_is_monotone_in_samples() {
        // Property 5: first_allocation(S1) <= first_allocation(S2) for S1 subset S2.
        let mut small = Category::new("c", CategoryMode::Max);
        for m in [100, 200, 150] {
            small.record_completion(m, 10);
        }
        let mut big = small.clone();
        for m in [400, 50] {
            big.record_completion(m, 10);
        }
        let a1 = small.compute_first_allocation_memory().unwrap();
        let a2 = big.compute_first_allocation_memory().unwrap();
        assert!(a1 <= a2);
    }

    #[test]
    fn next_label_escalates_first_to_max_then_errors() {
        let mut cat = Category::new("c", CategoryMode::Max);
        cat.max_allocation.memory_mb = Some(1024);
        let label = cat.next_label(AllocationLabel::First, true, None, Some(700));
        assert_eq!(label, AllocationLabel::Max);
        let label2 = cat.next_label(AllocationLabel::Max, true, None, Some(1024));
        assert_eq!(label2, AllocationLabel::Error);
    }

    #[test]
    fn fixed_mode_overflow_is_terminal() {
        let cat = Category::new("c", CategoryMode::Fixed);
        let label = cat.next_label(AllocationLabel::First, true, Some(512), Some(700));
        assert_eq!(label, AllocationLabel::Error);
    }

    #[test]
    fn steady_state_requires_both_thresholds() {
        let mut cat = Category::new("c", CategoryMode::Max);
        for _ in 0..STEADY_STATE_MIN_COMPLETIONS {
            cat.record_completion(100, 1);
        }
        // Enough completions, but max was just updated -- not steady yet.
        assert!(!cat.steady_state);
    }

    #[test]
    fn overflow_retry_scenario_matches_spec_example() {
        // scenario 4 in spec.md §8: first attempt at 512 overflows
        // (observed peak 700); the engine escalates to max_allocation
        // (1024); after that completion, subsequent first-allocations
        // start from the observed max (700).
        let mut cat = Category::new("c", CategoryMode::Max);
        cat.max_allocation.memory_mb = Some(1024);
        let label = cat.next_label(AllocationLabel::First, true, None, Some(700));
        assert_eq!(label, AllocationLabel::Max);
        cat.record_completion(700, 12);
        assert_eq!(cat.compute_first_allocation_memory(), Some(700));
    }
}
