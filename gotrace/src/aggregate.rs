//! Per-(function, call path) statistic accumulators.

use serde::{Deserialize, Serialize};

/// Timing of one completed call, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSample {
    pub inclusive: i64,
    pub exclusive: i64,
    pub callees: u64,
    pub growth: i64,
}

/// Strategy for folding call samples into a running record
pub trait Accumulator: Default {
    fn update(&mut self, sample: &CallSample);

    fn summary(&self) -> &FlatStats;

    /// Individual call samples, for strategies that retain them
    fn samples(&self) -> Option<&[CallSample]> {
        None
    }
}

/// Running sums and extremes; O(1) memory per record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatStats {
    pub call_count: u64,
    pub callee_count: u64,
    pub inclusive_sum: i64,
    pub exclusive_sum: i64,
    pub growth_sum: i64,
    pub inclusive_min: i64,
    pub inclusive_max: i64,
    pub exclusive_min: i64,
    pub exclusive_max: i64,
}

impl Accumulator for FlatStats {
    fn update(&mut self, sample: &CallSample) {
        if self.call_count == 0 {
            self.inclusive_min = sample.inclusive;
            self.inclusive_max = sample.inclusive;
            self.exclusive_min = sample.exclusive;
            self.exclusive_max = sample.exclusive;
        } else {
            self.inclusive_min = self.inclusive_min.min(sample.inclusive);
            self.inclusive_max = self.inclusive_max.max(sample.inclusive);
            self.exclusive_min = self.exclusive_min.min(sample.exclusive);
            self.exclusive_max = self.exclusive_max.max(sample.exclusive);
        }
        self.call_count += 1;
        self.callee_count += sample.callees;
        self.inclusive_sum = self.inclusive_sum.saturating_add(sample.inclusive);
        self.exclusive_sum = self.exclusive_sum.saturating_add(sample.exclusive);
        self.growth_sum = self.growth_sum.saturating_add(sample.growth);
    }

    fn summary(&self) -> &FlatStats {
        self
    }
}

/// Flat statistics plus every call sample in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailedStats {
    flat: FlatStats,
    samples: Vec<CallSample>,
}

impl Accumulator for DetailedStats {
    fn update(&mut self, sample: &CallSample) {
        self.flat.update(sample);
        self.samples.push(*sample);
    }

    fn summary(&self) -> &FlatStats {
        &self.flat
    }

    fn samples(&self) -> Option<&[CallSample]> {
        Some(&self.samples)
    }
}
