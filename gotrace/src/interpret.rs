//! Trace reconstruction.
//!
//! Replays the enter/exit event stream on one stack per goroutine and folds
//! every completed call into an accumulator keyed by function and call path.
//!
//! When the Go runtime grows a goroutine stack inside a function prologue,
//! the tracer sees the function entered twice: once before the call into
//! `runtime.morestack` and again after the stack was copied. The first probe
//! is followed by a growth marker frame. On exit the matched frame absorbs the
//! marker and the first activation beneath it, so the relocation shows up
//! as growth time instead of as a spurious recursive call.

use crate::aggregate::{Accumulator, CallSample, DetailedStats, FlatStats};
use crate::config::{AggregationMode, InterpretOptions};
use crate::error::RecordError;
use crate::profile::{Diagnostics, Profile, ProfileRecord};
use crate::traces::TraceTable;
use gotrace_common::{
    user::{Event, EventKind},
    ROOT_FUNCTION_INDEX,
};
use log::{debug, error, info, warn};
use std::collections::HashMap;

/// Live activation on a goroutine stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    function_index: u32,
    entry_timestamp: u64,
    is_growth_frame: bool,
    callee_count: u64,
    callee_time: i64,
    growth_time: i64,
}

impl Frame {
    fn new(function_index: u32, entry_timestamp: u64, is_growth_frame: bool) -> Self {
        Frame {
            function_index,
            entry_timestamp,
            is_growth_frame,
            callee_count: 0,
            callee_time: 0,
            growth_time: 0,
        }
    }

    /// Sentinel that absorbs callee accounting for top-level calls
    fn root() -> Self {
        Frame::new(ROOT_FUNCTION_INDEX, 0, false)
    }
}

/// Signed distance between two timestamps, wrapping instead of overflowing
fn elapsed(from: u64, to: u64) -> i64 {
    to.wrapping_sub(from) as i64
}

fn display_name(names: &[String], index: u32) -> String {
    names
        .get(index as usize)
        .cloned()
        .unwrap_or_else(|| index.to_string())
}

/// Ancestor indices of the stack, with growth markers and the activation
/// they interrupted left out
fn call_path(stack: &[Frame]) -> Vec<u32> {
    let mut path: Vec<u32> = Vec::with_capacity(stack.len());
    for frame in stack.iter().skip(1) {
        if frame.is_growth_frame {
            if path.last() == Some(&frame.function_index) {
                path.pop();
            }
            continue;
        }
        path.push(frame.function_index);
    }
    path
}

/// Per-run interpreter state; nothing outlives `finish`
pub struct Interpreter<'n, A> {
    names: &'n [String],
    stacks: HashMap<i64, Vec<Frame>>,
    traces: TraceTable,
    aggregates: HashMap<(u32, u32), A>,
    first_timestamp: Option<u64>,
    last_timestamp: u64,
    max_stack_depth: Option<usize>,
    diagnostics: Diagnostics,
}

impl<'n, A: Accumulator> Interpreter<'n, A> {
    pub fn new(names: &'n [String], max_stack_depth: Option<usize>) -> Self {
        Interpreter {
            names,
            stacks: HashMap::new(),
            traces: TraceTable::default(),
            aggregates: HashMap::new(),
            first_timestamp: None,
            last_timestamp: 0,
            max_stack_depth,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn malformed(&mut self, err: &RecordError) {
        warn!("Skipping malformed event: {}", err);
        self.diagnostics.malformed_records += 1;
    }

    pub fn process(&mut self, event: Event) {
        self.first_timestamp.get_or_insert(event.timestamp);
        self.last_timestamp = event.timestamp;

        match event.kind {
            EventKind::Enter => self.enter(event),
            EventKind::Exit => self.exit(event),
        }
    }

    fn enter(&mut self, event: Event) {
        let stack = self
            .stacks
            .entry(event.goroutine_id)
            .or_insert_with(|| vec![Frame::root()]);

        if let Some(limit) = self.max_stack_depth {
            if stack.len() > limit {
                warn!(
                    "Goroutine {} exceeded stack depth {}, discarding its {} open frames",
                    event.goroutine_id,
                    limit,
                    stack.len() - 1
                );
                stack.truncate(1);
                self.diagnostics.evicted_goroutines += 1;
            }
        }

        stack.push(Frame::new(event.function_index, event.timestamp, event.is_growth_frame));
    }

    fn exit(&mut self, event: Event) {
        if event.is_growth_frame {
            debug!(
                "Ignoring growth frame exit of {} on goroutine {}",
                display_name(self.names, event.function_index),
                event.goroutine_id
            );
            self.diagnostics.growth_exits += 1;
            return;
        }

        let stack = self
            .stacks
            .entry(event.goroutine_id)
            .or_insert_with(|| vec![Frame::root()]);

        let mut matched = None;
        while stack.len() > 1 {
            let Some(top) = stack.pop() else { break };
            if top.function_index == event.function_index && !top.is_growth_frame {
                matched = Some(top);
                break;
            }
            warn!(
                "Mismatched function ids on goroutine {}: {} open, {} exiting (skipping)",
                event.goroutine_id,
                display_name(self.names, top.function_index),
                display_name(self.names, event.function_index)
            );
            self.diagnostics.mismatched_frames += 1;
        }
        let Some(mut matched) = matched else {
            warn!(
                "No matching entry for {} on goroutine {}",
                display_name(self.names, event.function_index),
                event.goroutine_id
            );
            self.diagnostics.unmatched_exits += 1;
            return;
        };

        // Fold growth markers of this function together with the
        // activation each of them interrupted
        while let Some(top) = stack.last() {
            if top.function_index != matched.function_index || !top.is_growth_frame {
                break;
            }
            let Some(marker) = stack.pop() else { break };
            matched.growth_time = matched
                .growth_time
                .saturating_add(elapsed(marker.entry_timestamp, matched.entry_timestamp));

            let interrupted = stack.len() > 1
                && stack
                    .last()
                    .is_some_and(|f| f.function_index == matched.function_index && !f.is_growth_frame);
            if !interrupted {
                debug!(
                    "Growth marker of {} on goroutine {} has no interrupted activation",
                    display_name(self.names, matched.function_index),
                    event.goroutine_id
                );
                continue;
            }
            if let Some(first_entry) = stack.pop() {
                matched.entry_timestamp = first_entry.entry_timestamp;
                matched.callee_count += first_entry.callee_count;
                matched.callee_time = matched.callee_time.saturating_add(first_entry.callee_time);
                matched.growth_time = matched.growth_time.saturating_add(first_entry.growth_time);
            }
        }

        let duration = elapsed(matched.entry_timestamp, event.timestamp);
        if duration < 0 {
            error!(
                "Corrupted log: {} on goroutine {} exited {}ns before it was entered",
                display_name(self.names, matched.function_index),
                event.goroutine_id,
                -duration
            );
            self.diagnostics.negative_durations += 1;
        }

        if let Some(caller) = stack.last_mut() {
            caller.callee_count += 1;
            caller.callee_time = caller.callee_time.saturating_add(duration);
        }

        let trace_id = self.traces.intern(call_path(stack));
        let sample = CallSample {
            inclusive: duration,
            exclusive: duration.saturating_sub(matched.callee_time),
            callees: matched.callee_count,
            growth: matched.growth_time,
        };
        self.aggregates
            .entry((matched.function_index, trace_id))
            .or_default()
            .update(&sample);
    }

    pub fn finish(mut self) -> Profile {
        self.diagnostics.unclosed_frames = self
            .stacks
            .values()
            .map(|stack| stack.len().saturating_sub(1) as u64)
            .sum();
        if self.diagnostics.unclosed_frames > 0 {
            info!(
                "{} frames were still open at the end of the stream and are dropped",
                self.diagnostics.unclosed_frames
            );
        }

        let total_runtime_ns = self
            .first_timestamp
            .map(|first| elapsed(first, self.last_timestamp))
            .unwrap_or(0);

        let mut keys: Vec<(u32, u32)> = self.aggregates.keys().copied().collect();
        keys.sort_unstable();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let (function_index, trace_id) = key;
            let Some(stats) = self.aggregates.get(&key) else { continue };
            let call_path = self
                .traces
                .path(trace_id)
                .unwrap_or_default()
                .iter()
                .map(|&index| display_name(self.names, index))
                .collect();
            records.push(ProfileRecord::new(
                function_index,
                display_name(self.names, function_index),
                trace_id,
                call_path,
                stats,
            ));
        }

        info!(
            "Interpreted {} records over {} call paths, total runtime {}ns",
            records.len(),
            self.traces.len(),
            total_runtime_ns
        );

        Profile {
            total_runtime_ns,
            records,
            diagnostics: self.diagnostics,
        }
    }
}

fn run<A, I>(events: I, names: &[String], max_stack_depth: Option<usize>) -> Profile
where
    A: Accumulator,
    I: IntoIterator<Item = Result<Event, RecordError>>,
{
    let mut interpreter = Interpreter::<A>::new(names, max_stack_depth);
    for event in events {
        match event {
            Ok(event) => interpreter.process(event),
            Err(e) => interpreter.malformed(&e),
        }
    }
    interpreter.finish()
}

/// Interpret a complete event stream; `names[i]` is the name of function index `i`
pub fn interpret<I>(events: I, names: &[String], options: &InterpretOptions) -> Profile
where
    I: IntoIterator<Item = Result<Event, RecordError>>,
{
    match options.mode {
        AggregationMode::Flat => run::<FlatStats, _>(events, names, options.max_stack_depth),
        AggregationMode::Detailed => run::<DetailedStats, _>(events, names, options.max_stack_depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TextEvents;
    use std::io::Cursor;

    const F1: u32 = 1;
    const F2: u32 = 2;
    const F3: u32 = 3;
    const F7: u32 = 7;

    fn names() -> Vec<String> {
        (0..8).map(|i| format!("main.f{}", i)).collect()
    }

    fn interpret_events(events: Vec<Event>) -> Profile {
        interpret(events.into_iter().map(Ok), &names(), &InterpretOptions::default())
    }

    fn only_record<'a>(profile: &'a Profile, function: &'a str) -> &'a ProfileRecord {
        let records: Vec<_> = profile.records_for(function).collect();
        assert_eq!(records.len(), 1, "expected one record for {}", function);
        records[0]
    }

    #[test]
    fn test_balanced_trivial_trace() {
        let profile = interpret_events(vec![Event::enter(F1, 0, 0), Event::exit(F1, 0, 100)]);

        assert_eq!(profile.records.len(), 1);
        let record = only_record(&profile, "main.f1");
        assert_eq!(record.call_count, 1);
        assert_eq!(record.inclusive_sum, 100);
        assert_eq!(record.exclusive_sum, 100);
        assert_eq!(record.callee_count, 0);
        assert!(record.call_path.is_empty());
        assert_eq!(profile.total_runtime_ns, 100);
        assert_eq!(profile.diagnostics, Diagnostics::default());
    }

    #[test]
    fn test_nested_exclusive_accounting() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F2, 0, 10),
            Event::exit(F2, 0, 40),
            Event::exit(F1, 0, 50),
        ]);

        let f2 = only_record(&profile, "main.f2");
        assert_eq!((f2.inclusive_sum, f2.exclusive_sum), (30, 30));
        assert_eq!(f2.call_path, vec!["main.f1"]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!((f1.inclusive_sum, f1.exclusive_sum), (50, 20));
        assert_eq!(f1.callee_count, 1);
    }

    #[test]
    fn test_growth_frame_folding() {
        // f1 enters, hits morestack at 5, is re-entered on the new stack at 8
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F1, 0, 5).growth(),
            Event::enter(F1, 0, 8),
            Event::exit(F1, 0, 60),
        ]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!(f1.call_count, 1);
        assert_eq!(f1.growth_sum, 3);
        assert_eq!(f1.inclusive_sum, 60);
        assert_eq!(f1.exclusive_sum, 60);
        assert!(f1.call_path.is_empty());
        assert_eq!(profile.diagnostics.unclosed_frames, 0);
    }

    #[test]
    fn test_growth_frame_folding_depth_two() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F1, 0, 5).growth(),
            Event::enter(F1, 0, 10),
            Event::enter(F1, 0, 20).growth(),
            Event::enter(F1, 0, 26),
            Event::enter(F2, 0, 30),
            Event::exit(F2, 0, 40),
            Event::exit(F1, 0, 100),
        ]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!(f1.call_count, 1);
        assert_eq!(f1.growth_sum, 5 + 6);
        assert_eq!(f1.inclusive_sum, 100);
        assert_eq!(f1.exclusive_sum, 90);
        assert_eq!(f1.callee_count, 1);

        // the callee sees a single f1 ancestor, not the relocation artifacts
        let f2 = only_record(&profile, "main.f2");
        assert_eq!(f2.call_path, vec!["main.f1"]);
        assert_eq!(profile.diagnostics.unclosed_frames, 0);
    }

    #[test]
    fn test_genuine_recursion_is_not_folded() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F1, 0, 10),
            Event::exit(F1, 0, 30),
            Event::exit(F1, 0, 50),
        ]);

        let inner = profile.find("main.f1", &["main.f1"]).unwrap();
        assert_eq!((inner.call_count, inner.inclusive_sum, inner.growth_sum), (1, 20, 0));

        let outer = profile.find("main.f1", &[]).unwrap();
        assert_eq!((outer.call_count, outer.inclusive_sum, outer.exclusive_sum), (1, 50, 30));
    }

    #[test]
    fn test_recursion_inside_grown_frame() {
        // the outer f1 grew its stack, then recursed
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F1, 0, 2).growth(),
            Event::enter(F1, 0, 4),
            Event::enter(F1, 0, 10),
            Event::exit(F1, 0, 20),
            Event::exit(F1, 0, 30),
        ]);

        let inner = profile.find("main.f1", &["main.f1"]).unwrap();
        assert_eq!((inner.call_count, inner.inclusive_sum, inner.growth_sum), (1, 10, 0));

        let outer = profile.find("main.f1", &[]).unwrap();
        assert_eq!((outer.call_count, outer.inclusive_sum, outer.growth_sum), (1, 30, 2));
        assert_eq!(profile.records.len(), 2);
    }

    #[test]
    fn test_growth_exit_events_are_ignored() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F1, 0, 5).growth(),
            Event::exit(F1, 0, 6).growth(),
            Event::enter(F1, 0, 8),
            Event::exit(F1, 0, 60),
        ]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!((f1.call_count, f1.growth_sum), (1, 3));
        assert_eq!(profile.diagnostics.growth_exits, 1);
    }

    #[test]
    fn test_mismatch_recovery() {
        let profile = interpret_events(vec![
            Event::enter(F7, 0, 0),
            Event::enter(F3, 0, 10),
            Event::exit(F7, 0, 50),
        ]);

        assert!(profile.records_for("main.f3").next().is_none());
        let f7 = only_record(&profile, "main.f7");
        assert_eq!((f7.call_count, f7.inclusive_sum), (1, 50));
        assert_eq!(profile.diagnostics.mismatched_frames, 1);
        assert_eq!(profile.diagnostics.unclosed_frames, 0);
    }

    #[test]
    fn test_exit_without_entry() {
        let profile = interpret_events(vec![
            Event::exit(F2, 0, 5),
            Event::enter(F1, 0, 10),
            Event::exit(F2, 0, 20),
            Event::enter(F1, 0, 30),
            Event::exit(F1, 0, 40),
        ]);

        // the second exit drains f1 while searching for f2
        assert_eq!(profile.diagnostics.unmatched_exits, 2);
        assert_eq!(profile.diagnostics.mismatched_frames, 1);
        let f1 = only_record(&profile, "main.f1");
        assert_eq!((f1.call_count, f1.inclusive_sum), (1, 10));
        assert_eq!(profile.total_runtime_ns, 35);
    }

    #[test]
    fn test_trace_deduplication() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F2, 0, 1),
            Event::enter(F3, 0, 2),
            Event::exit(F3, 0, 3),
            Event::exit(F2, 0, 4),
            Event::exit(F1, 0, 5),
            Event::enter(F1, 0, 10),
            Event::enter(F2, 0, 11),
            Event::enter(F3, 0, 12),
            Event::exit(F3, 0, 14),
            Event::exit(F2, 0, 15),
            Event::enter(F3, 0, 16),
            Event::exit(F3, 0, 19),
            Event::exit(F1, 0, 20),
        ]);

        let via_f2 = profile.find("main.f3", &["main.f1", "main.f2"]).unwrap();
        assert_eq!(via_f2.call_count, 2);
        assert_eq!(via_f2.inclusive_sum, 3);
        assert_eq!((via_f2.inclusive_min, via_f2.inclusive_max), (1, 2));

        let direct = profile.find("main.f3", &["main.f1"]).unwrap();
        assert_eq!(direct.call_count, 1);
        assert_ne!(direct.trace_id, via_f2.trace_id);

        let f2 = profile.find("main.f2", &["main.f1"]).unwrap();
        assert_eq!(f2.trace_id, direct.trace_id);
        assert_eq!(f2.call_count, 2);
    }

    #[test]
    fn test_goroutines_are_interleaved_independently() {
        let profile = interpret_events(vec![
            Event::enter(F1, 1, 0),
            Event::enter(F2, 2, 5),
            Event::enter(F3, 1, 10),
            Event::exit(F2, 2, 25),
            Event::exit(F3, 1, 30),
            Event::exit(F1, 1, 40),
        ]);

        let f2 = only_record(&profile, "main.f2");
        assert!(f2.call_path.is_empty());
        assert_eq!(f2.inclusive_sum, 20);

        let f3 = only_record(&profile, "main.f3");
        assert_eq!(f3.call_path, vec!["main.f1"]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!((f1.inclusive_sum, f1.exclusive_sum), (40, 20));
        assert_eq!(profile.diagnostics.mismatched_frames, 0);
    }

    #[test]
    fn test_negative_duration_is_recorded() {
        let profile = interpret_events(vec![Event::enter(F1, 0, 100), Event::exit(F1, 0, 40)]);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!(f1.inclusive_sum, -60);
        assert_eq!(profile.diagnostics.negative_durations, 1);
        assert_eq!(profile.total_runtime_ns, -60);
    }

    #[test]
    fn test_empty_stream() {
        let profile = interpret_events(vec![]);

        assert!(profile.records.is_empty());
        assert_eq!(profile.total_runtime_ns, 0);
    }

    #[test]
    fn test_truncated_stream_keeps_completed_calls() {
        let profile = interpret_events(vec![
            Event::enter(F1, 0, 0),
            Event::enter(F2, 0, 10),
            Event::exit(F2, 0, 15),
            Event::enter(F3, 0, 20),
        ]);

        assert_eq!(profile.records.len(), 1);
        assert_eq!(profile.diagnostics.unclosed_frames, 2);
        assert_eq!(profile.total_runtime_ns, 20);
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let events = vec![
            Ok(Event::enter(F1, 0, 0)),
            Err(RecordError::FieldCount { record: 2, found: 1 }),
            Ok(Event::exit(F1, 0, 10)),
        ];
        let profile = interpret(events, &names(), &InterpretOptions::default());

        assert_eq!(profile.diagnostics.malformed_records, 1);
        assert_eq!(only_record(&profile, "main.f1").inclusive_sum, 10);
    }

    #[test]
    fn test_out_of_range_timestamp_is_malformed() {
        let data = b"1;0;0;0;9223372036854775808\n1;1;0;0;1\n".to_vec();
        let events = TextEvents::new(Cursor::new(data));
        let profile = interpret(events, &names(), &InterpretOptions::default());

        assert_eq!(profile.diagnostics.malformed_records, 1);
        assert_eq!(profile.diagnostics.unmatched_exits, 1);
        assert!(profile.records.is_empty());
        assert_eq!(profile.total_runtime_ns, 0);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        // events handed over directly skip the decoder's range check
        let profile = interpret_events(vec![
            Event::enter(F1, 0, u64::MAX - 5),
            Event::exit(F1, 0, u64::MAX),
            Event::enter(F2, 1, 1 << 63),
            Event::exit(F2, 1, 1),
        ]);

        assert_eq!(only_record(&profile, "main.f1").inclusive_sum, 5);
        assert_eq!(only_record(&profile, "main.f2").inclusive_sum, -i64::MAX);
        assert_eq!(profile.diagnostics.negative_durations, 1);
    }

    #[test]
    fn test_unknown_function_index_uses_number() {
        let profile = interpret_events(vec![Event::enter(42, 0, 0), Event::exit(42, 0, 1)]);

        assert_eq!(profile.records[0].function_name, "42");
    }

    #[test]
    fn test_depth_limit_evicts_goroutine() {
        let options = InterpretOptions {
            max_stack_depth: Some(2),
            ..Default::default()
        };
        let events = vec![
            Event::enter(F1, 0, 0),
            Event::enter(F2, 0, 1),
            Event::enter(F3, 0, 2),
            Event::exit(F3, 0, 3),
            Event::exit(F2, 0, 4),
        ];
        let profile = interpret(events.into_iter().map(Ok), &names(), &options);

        assert_eq!(profile.diagnostics.evicted_goroutines, 1);
        let f3 = only_record(&profile, "main.f3");
        assert!(f3.call_path.is_empty());
        assert_eq!(profile.diagnostics.unmatched_exits, 1);
    }

    #[test]
    fn test_unbounded_depth() {
        let options = InterpretOptions {
            max_stack_depth: None,
            ..Default::default()
        };
        let mut events: Vec<Event> = (0..1000).map(|t| Event::enter(F1, 0, t)).collect();
        events.extend((0..1000).map(|t| Event::exit(F1, 0, 1000 + t)));
        let profile = interpret(events.into_iter().map(Ok), &names(), &options);

        assert_eq!(profile.diagnostics.evicted_goroutines, 0);
        assert_eq!(profile.records.len(), 1000);
        assert_eq!(profile.diagnostics.unclosed_frames, 0);
    }

    #[test]
    fn test_detailed_mode_keeps_samples() {
        let options = InterpretOptions {
            mode: AggregationMode::Detailed,
            ..Default::default()
        };
        let events = vec![
            Event::enter(F1, 0, 0),
            Event::exit(F1, 0, 10),
            Event::enter(F1, 0, 20),
            Event::exit(F1, 0, 50),
        ];
        let profile = interpret(events.into_iter().map(Ok), &names(), &options);

        let f1 = only_record(&profile, "main.f1");
        assert_eq!(f1.call_count, 2);
        let samples = f1.samples.as_ref().unwrap();
        assert_eq!(samples.iter().map(|s| s.inclusive).collect::<Vec<_>>(), vec![10, 30]);

        let flat = interpret_events(vec![Event::enter(F1, 0, 0), Event::exit(F1, 0, 10)]);
        assert!(only_record(&flat, "main.f1").samples.is_none());
    }

    #[test]
    fn test_call_path_skips_growth_markers() {
        let stack = vec![
            Frame::root(),
            Frame::new(F1, 0, false),
            Frame::new(F1, 1, true),
            Frame::new(F1, 2, false),
            Frame::new(F2, 3, false),
        ];
        assert_eq!(call_path(&stack), vec![F1, F2]);
    }
}
