//! Step-level instrumentation over a bounded schedule.
//!
//! Mirrors the usual profiler cadence: per cycle, `wait` idle steps, then
//! `warmup` steps that advance the schedule without recording, then
//! `active` recorded steps; the cycle repeats `repeat` times and the
//! profiler goes quiet. Recorded steps become chrome-trace events
//! (loadable in Perfetto or chrome://tracing) flushed to the trace
//! directory on `stop`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to serialize trace: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerPhase {
    Wait,
    Warmup,
    Active,
    /// All cycles exhausted; steps are no-ops.
    Idle,
}

impl ProfilerPhase {
    fn name(&self) -> &'static str {
        match self {
            ProfilerPhase::Wait => "wait",
            ProfilerPhase::Warmup => "warmup",
            ProfilerPhase::Active => "active",
            ProfilerPhase::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileSchedule {
    pub wait: u32,
    pub warmup: u32,
    pub active: u32,
    pub repeat: u32,
}

impl Default for ProfileSchedule {
    fn default() -> Self {
        Self {
            wait: 1,
            warmup: 1,
            active: 3,
            repeat: 2,
        }
    }
}

impl ProfileSchedule {
    fn cycle_len(&self) -> u32 {
        self.wait + self.warmup + self.active
    }

    fn phase(&self, position: u32, cycles_done: u32) -> ProfilerPhase {
        if cycles_done >= self.repeat {
            ProfilerPhase::Idle
        } else if position < self.wait {
            ProfilerPhase::Wait
        } else if position < self.wait + self.warmup {
            ProfilerPhase::Warmup
        } else {
            ProfilerPhase::Active
        }
    }
}

#[derive(Debug, Serialize)]
struct TraceArgs {
    step: u64,
    epoch: usize,
    phase: &'static str,
    param_bytes: u64,
}

#[derive(Debug, Serialize)]
struct TraceEvent {
    name: &'static str,
    ph: &'static str,
    pid: usize,
    tid: usize,
    ts: u64,
    dur: u64,
    args: TraceArgs,
}

#[derive(Debug, Serialize)]
struct TraceFile {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<TraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
}

/// Wraps the inner batch loop of one epoch.
///
/// `start` before the first batch, `step` once per batch, `stop` after the
/// last batch on every code path (a dryrun exit included), or the trace
/// file for the epoch never materializes.
#[derive(Debug)]
pub struct StepProfiler {
    schedule: ProfileSchedule,
    trace_dir: PathBuf,
    rank: usize,
    param_bytes: u64,

    epoch: usize,
    position: u32,
    cycles_done: u32,
    origin: Instant,
    last: Instant,
    events: Vec<TraceEvent>,
    running: bool,
}

impl StepProfiler {
    pub fn new(
        trace_dir: &Path,
        rank: usize,
        param_bytes: u64,
        schedule: ProfileSchedule,
    ) -> Self {
        let now = Instant::now();
        Self {
            schedule,
            trace_dir: trace_dir.to_path_buf(),
            rank,
            param_bytes,
            epoch: 0,
            position: 0,
            cycles_done: 0,
            origin: now,
            last: now,
            events: Vec::new(),
            running: false,
        }
    }

    /// Arm the schedule for an epoch. Must precede the epoch's first batch.
    pub fn start(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.position = 0;
        self.cycles_done = 0;
        self.events.clear();
        self.origin = Instant::now();
        self.last = self.origin;
        self.running = true;
    }

    pub fn phase(&self) -> ProfilerPhase {
        self.schedule.phase(self.position, self.cycles_done)
    }

    /// Advance the schedule by one batch; records the batch's wall time
    /// when the schedule is in an active span.
    pub fn step(&mut self, step: u64) {
        if !self.running {
            return;
        }
        let now = Instant::now();
        let phase = self.phase();
        if phase == ProfilerPhase::Active {
            self.events.push(TraceEvent {
                name: "train/batch",
                ph: "X",
                pid: self.rank,
                tid: 0,
                ts: self.last.duration_since(self.origin).as_micros() as u64,
                dur: now.duration_since(self.last).as_micros() as u64,
                args: TraceArgs {
                    step,
                    epoch: self.epoch,
                    phase: phase.name(),
                    param_bytes: self.param_bytes,
                },
            });
        }
        if phase != ProfilerPhase::Idle {
            self.position += 1;
            if self.position == self.schedule.cycle_len() {
                self.position = 0;
                self.cycles_done += 1;
            }
        }
        self.last = now;
    }

    /// Flush the epoch's trace artifact. Safe to call after a truncated
    /// epoch; an interrupted schedule still yields a complete JSON file.
    pub fn stop(&mut self) -> Result<PathBuf, ProfilerError> {
        self.running = false;
        let path = self
            .trace_dir
            .join(format!("trace_epoch{:03}_rank{}.json", self.epoch, self.rank));
        let file = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(
            file,
            &TraceFile {
                trace_events: std::mem::take(&mut self.events),
                display_time_unit: "ms",
            },
        )?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_phase_sequence() {
        let schedule = ProfileSchedule::default();
        let expected = [
            ProfilerPhase::Wait,
            ProfilerPhase::Warmup,
            ProfilerPhase::Active,
            ProfilerPhase::Active,
            ProfilerPhase::Active,
        ];
        for (position, want) in expected.iter().enumerate() {
            assert_eq!(schedule.phase(position as u32, 0), *want);
        }
        assert_eq!(schedule.phase(0, 2), ProfilerPhase::Idle);
    }

    #[test]
    fn test_full_schedule_records_active_steps_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler =
            StepProfiler::new(dir.path(), 0, 1024, ProfileSchedule::default());
        profiler.start(0);
        for step in 0..12 {
            profiler.step(step);
        }
        // two cycles of three active steps each, then idle
        assert_eq!(profiler.events.len(), 6);
        assert_eq!(profiler.phase(), ProfilerPhase::Idle);

        let path = profiler.stop().unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["traceEvents"].as_array().unwrap().len(), 6);
        assert_eq!(parsed["traceEvents"][0]["args"]["phase"], "active");
    }

    #[test]
    fn test_truncated_epoch_still_writes_valid_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = StepProfiler::new(dir.path(), 1, 0, ProfileSchedule::default());
        profiler.start(3);
        for step in 0..3 {
            profiler.step(step);
        }
        let path = profiler.stop().unwrap();
        assert!(path.to_string_lossy().contains("trace_epoch003_rank1"));
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // positions 0 (wait), 1 (warmup), 2 (active)
        assert_eq!(parsed["traceEvents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_without_steps_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = StepProfiler::new(dir.path(), 0, 0, ProfileSchedule::default());
        profiler.start(0);
        let path = profiler.stop().unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    }

    #[test]
    fn test_steps_before_start_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = StepProfiler::new(dir.path(), 0, 0, ProfileSchedule::default());
        for step in 0..5 {
            profiler.step(step);
        }
        assert!(profiler.events.is_empty());
    }
}
