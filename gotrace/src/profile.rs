//! Aggregated timing model handed to exporters and visualizers.

use crate::aggregate::{Accumulator, CallSample};
use crate::probes::ProbeSites;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Recoverable anomalies observed while interpreting one event stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Frames popped while searching for the frame an exit belongs to
    pub mismatched_frames: u64,
    /// Exits with no matching entry on their goroutine stack
    pub unmatched_exits: u64,
    pub negative_durations: u64,
    pub malformed_records: u64,
    /// Goroutine stacks reset for exceeding the depth limit
    pub evicted_goroutines: u64,
    /// Exit events fired on growth frames, which folding closes instead
    pub growth_exits: u64,
    /// Frames still open when the stream ended
    pub unclosed_frames: u64,
    /// Functions without return probes, whose exit timing is unavailable
    pub functions_without_exits: Vec<String>,
}

/// Statistics of one function reached through one call path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub function_index: u32,
    pub function_name: String,
    pub trace_id: u32,
    /// Ancestors from the outermost caller down to the direct caller
    pub call_path: Vec<String>,
    pub call_count: u64,
    pub callee_count: u64,
    pub inclusive_sum: i64,
    pub exclusive_sum: i64,
    pub growth_sum: i64,
    pub inclusive_min: i64,
    pub inclusive_max: i64,
    pub exclusive_min: i64,
    pub exclusive_max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<CallSample>>,
}

impl ProfileRecord {
    pub fn new<A: Accumulator>(
        function_index: u32,
        function_name: String,
        trace_id: u32,
        call_path: Vec<String>,
        stats: &A,
    ) -> Self {
        let flat = stats.summary();
        ProfileRecord {
            function_index,
            function_name,
            trace_id,
            call_path,
            call_count: flat.call_count,
            callee_count: flat.callee_count,
            inclusive_sum: flat.inclusive_sum,
            exclusive_sum: flat.exclusive_sum,
            growth_sum: flat.growth_sum,
            inclusive_min: flat.inclusive_min,
            inclusive_max: flat.inclusive_max,
            exclusive_min: flat.exclusive_min,
            exclusive_max: flat.exclusive_max,
            samples: stats.samples().map(<[CallSample]>::to_vec),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Last timestamp minus first timestamp of the stream
    pub total_runtime_ns: i64,
    pub records: Vec<ProfileRecord>,
    pub diagnostics: Diagnostics,
}

impl Profile {
    /// All records of one function, across call paths
    pub fn records_for<'a>(&'a self, function_name: &'a str) -> impl Iterator<Item = &'a ProfileRecord> + 'a {
        self.records
            .iter()
            .filter(move |record| record.function_name == function_name)
    }

    /// The record of `function_name` reached through exactly `call_path`
    pub fn find(&self, function_name: &str, call_path: &[&str]) -> Option<&ProfileRecord> {
        self.records.iter().find(|record| {
            record.function_name == function_name
                && record.call_path.iter().map(String::as_str).eq(call_path.iter().copied())
        })
    }

    /// Record which resolved functions can never report exit timing
    pub fn flag_functions_without_exits(&mut self, sites: &ProbeSites) {
        self.diagnostics.functions_without_exits =
            sites.without_exits().map(|site| site.name.clone()).collect();
    }

    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, self)
    }
}
