// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Unit State Machine: the per-WU lifecycle from assignment through upload.
//!
//! This module owns the state transitions, retry policy, and progress
//! model described in spec.md §3/§4.1. It does not perform I/O itself —
//! callers feed it the outcome of each network/kernel operation and it
//! decides what happens next. That keeps the transition logic synchronous
//! and trivially testable, matching the single-threaded event-loop model
//! in spec.md §5.

pub use crate::frame_timer::{CreditEstimate, ProgressModel};

pub mod ops;

use crate::error::{FahError, Result};
use crate::kv::KvTable;
use crate::wire::UnitEnvelopes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Cumulative cap on viewer-file bytes read for a single unit (spec.md §4.1
/// "Run"): past this, topology/frame harvesting stops for the rest of the run.
pub const MAX_VIEWER_BYTES: u64 = 25_000_000;

/// Consecutive read failures before a viewer file is given up on.
pub const VIEWER_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoneReason {
    Credited,
    Rejected,
    Dumped,
    Expired,
    /// The retry counter's limit for the current state was exceeded
    /// (`clean("retries")` in spec.md §4.1's retry policy).
    Retries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Assign,
    Download,
    Core,
    /// Resources assigned and kernel cached, waiting for the group
    /// scheduler to allocate CPUs/GPUs and lift the pause.
    RunPaused,
    Run,
    Upload,
    Dump,
    Done(DoneReason),
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Done(_))
    }

    /// States in which a fresh `dumpWU()` request is honored per spec.md
    /// §4.1's transition table (`ASSIGN|DUMP|DONE` are excluded).
    pub fn accepts_dump(&self) -> bool {
        !matches!(
            self,
            UnitState::Assign | UnitState::Dump | UnitState::Done(_)
        )
    }
}

/// Exit codes from the real Folding@home kernel binaries
/// (examples/original_source/src/fah/client/ExitCode.h).
pub mod exit_code {
    pub const FINISHED_UNIT: i32 = 100;
    pub const UNSTABLE_MACHINE: i32 = 97;
    pub const CORE_RESTART: i32 = 98;
    pub const CORE_UNINSTALLED: i32 = 99;
    pub const NO_ASSIGNMENT: i32 = 99;
    pub const INTERRUPTED: i32 = 102;
    pub const BAD_WORK_UNIT: i32 = 114;
    pub const BAD_FRAME_CHECKSUM: i32 = 109;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOutcome {
    Finished,
    Interrupted,
    CoreRestart,
    /// Any other exit code, signal kill, or structured-exception crash.
    Failed,
}

impl KernelOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            exit_code::FINISHED_UNIT => KernelOutcome::Finished,
            exit_code::INTERRUPTED => KernelOutcome::Interrupted,
            exit_code::CORE_RESTART => KernelOutcome::CoreRestart,
            _ => KernelOutcome::Failed,
        }
    }

    /// Windows' unhandled structured-exception codes are all `>= 0xc0000000`
    /// and always count as a failure regardless of the numeric table above.
    pub fn from_raw(code: i32, killed_by_signal: bool, core_dumped: bool) -> Self {
        if killed_by_signal || core_dumped || (code as u32) >= 0xc000_0000 {
            return KernelOutcome::Failed;
        }
        Self::from_exit_code(code)
    }
}

/// Retry policy: `wait = 2^min(retries, 9)` seconds, with a state-dependent
/// cap (spec.md §4.1 "Retry policy").
///
/// Deliberately not persisted: spec.md §9 "Retry state" calls out that
/// `retries`/`wait`/`cs` live in memory only and reset on restart. See
/// `Unit::persist`/`Unit::reload`, which snapshot around this field.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCounter {
    retries: u32,
}

impl RetryCounter {
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(1u64 << self.retries.min(9))
    }

    pub fn limit_for(state: UnitState) -> u32 {
        match state {
            UnitState::Assign | UnitState::Upload => 50,
            _ => 10,
        }
    }

    /// Returns `true` if the limit for `state` has been exceeded and the WU
    /// should be cleaned up (`clean("retries")` in the original).
    pub fn bump(&mut self, state: UnitState) -> bool {
        self.retries += 1;
        self.retries > Self::limit_for(state)
    }

    /// After running successfully for >= 2 minutes, the counter resets.
    pub fn maybe_reset(&mut self, stable_run_time: Duration) {
        if stable_run_time >= Duration::from_secs(120) {
            self.retries = 0;
        }
    }

    pub fn cancel(&mut self) {
        self.retries = 0;
    }
}

/// A single work unit, tracked from assignment through completion.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: String,
    pub state: UnitState,
    pub cpus: u32,
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub gpus: Vec<String>,
    pub data: UnitEnvelopes,

    pub start_time: Option<std::time::SystemTime>,
    pub run_time: Duration,
    pub clock_skew: Duration,

    pub last_known_done: u64,
    pub last_known_total: u64,
    pub last_known_progress_update_run_time: Duration,

    pub retry: RetryCounter,
    pub wait_until: Option<std::time::SystemTime>,
    /// Index into `wu.data.cs[]`, the fallback collector list, used once the
    /// primary work server has rejected enough upload attempts.
    pub collector_index: usize,

    /// `viewerTop.json`, read once and cached for the life of the run.
    pub viewer_topology: Option<Value>,
    /// `viewerFrame<N>.json` snapshots harvested so far, in order.
    pub viewer_frames: Vec<Value>,
    /// Cumulative bytes read from viewer files, checked against
    /// [`MAX_VIEWER_BYTES`] before every read.
    pub viewer_bytes: u64,
    viewer_top_failures: u32,
    /// Set once topology has been read, or given up on after
    /// [`VIEWER_FAILURE_LIMIT`] consecutive failures.
    pub viewer_top_stopped: bool,
    viewer_frame_failures: u32,
    /// Next frame index to attempt; advances on both success and
    /// give-up, so a single stuck index can't wedge the harvester.
    pub viewer_next_frame: u32,
}

impl Unit {
    pub fn new(id: String, request: serde_json::Value) -> Self {
        Self {
            id,
            state: UnitState::Assign,
            cpus: 0,
            min_cpus: 1,
            max_cpus: 1,
            gpus: Vec::new(),
            data: UnitEnvelopes {
                request: Some(request),
                ..Default::default()
            },
            start_time: None,
            run_time: Duration::ZERO,
            clock_skew: Duration::ZERO,
            last_known_done: 0,
            last_known_total: 0,
            last_known_progress_update_run_time: Duration::ZERO,
            retry: RetryCounter::default(),
            wait_until: None,
            collector_index: 0,
            viewer_topology: None,
            viewer_frames: Vec::new(),
            viewer_bytes: 0,
            viewer_top_failures: 0,
            viewer_top_stopped: false,
            viewer_frame_failures: 0,
            viewer_next_frame: 0,
        }
    }

    /// Invariant 2 from spec.md §3: `cpus` must stay within the bounds the
    /// assignment granted.
    pub fn set_cpus(&mut self, requested: u32) {
        self.cpus = requested.clamp(self.min_cpus, self.max_cpus.max(self.min_cpus));
    }

    pub fn on_assigned(&mut self, assignment: crate::wire::SignedEnvelope) {
        self.data.assignment = Some(assignment);
        self.state = UnitState::Download;
        self.retry.cancel();
    }

    pub fn on_assign_rejected(&mut self) {
        self.state = UnitState::Done(DoneReason::Rejected);
    }

    pub fn on_downloaded(&mut self, wu: crate::wire::SignedEnvelope, min_cpus: u32, max_cpus: u32) {
        self.data.wu = Some(wu);
        self.min_cpus = min_cpus;
        self.max_cpus = max_cpus;
        self.state = UnitState::Core;
        self.retry.cancel();
    }

    pub fn on_core_ready(&mut self, gpus: Vec<String>) {
        self.gpus = gpus;
        self.state = UnitState::RunPaused;
    }

    /// The group scheduler allocated resources; the kernel may now spawn.
    pub fn on_scheduled(&mut self) {
        if self.state == UnitState::RunPaused {
            self.state = UnitState::Run;
            self.start_time.get_or_insert_with(std::time::SystemTime::now);
        }
    }

    pub fn on_kernel_exit(&mut self, outcome: KernelOutcome) {
        match outcome {
            KernelOutcome::Finished => {
                self.last_known_done = self.last_known_total.max(1);
                self.state = UnitState::Upload;
            }
            KernelOutcome::Interrupted => {
                // No state change and no retry penalty; the kernel is
                // expected to be re-spawned by the scheduler later.
            }
            KernelOutcome::CoreRestart => {
                self.state = UnitState::RunPaused;
            }
            KernelOutcome::Failed => {
                self.state = UnitState::Dump;
            }
        }
    }

    pub fn on_results_packaged(&mut self, results: Value) {
        self.data.results = Some(results);
    }

    pub fn on_upload_succeeded(&mut self) {
        self.state = UnitState::Done(DoneReason::Credited);
    }

    pub fn on_upload_rejected(&mut self) {
        self.state = UnitState::Done(DoneReason::Rejected);
    }

    /// HTTP 503 on upload: if we're past DOWNLOAD we need a fresh
    /// assignment before retrying.
    pub fn on_upload_transient_failure(&mut self, needs_fresh_assignment: bool) {
        if needs_fresh_assignment {
            self.state = UnitState::Assign;
        }
    }

    pub fn on_dump_acked(&mut self) {
        self.state = UnitState::Done(DoneReason::Dumped);
    }

    /// Cycle the upload target: `collector_index == 0` means the primary
    /// work server, `1..=cs.len()` indexes `wu.data.cs[]`. Wraps back to the
    /// primary once every collector has been tried. Returns `true` if the
    /// new target is a collector rather than the primary.
    pub fn advance_collector(&mut self) -> bool {
        let count = self
            .data
            .wu
            .as_ref()
            .and_then(|wu| wu.data.get("cs"))
            .and_then(|cs| cs.as_array())
            .map(|cs| cs.len())
            .unwrap_or(0);
        if count == 0 {
            self.collector_index = 0;
            return false;
        }
        self.collector_index = (self.collector_index + 1) % (count + 1);
        self.collector_index != 0
    }

    /// Record a successfully read `viewerTop.json`, bumping the byte budget
    /// and clearing the failure streak.
    pub fn on_viewer_top_read(&mut self, value: Value, bytes: u64) {
        self.viewer_topology = Some(value);
        self.viewer_bytes += bytes;
        self.viewer_top_failures = 0;
    }

    /// A topology read attempt failed or wasn't ready; give up for good
    /// after [`VIEWER_FAILURE_LIMIT`] consecutive misses.
    pub fn on_viewer_top_failed(&mut self) {
        self.viewer_top_failures += 1;
        if self.viewer_top_failures >= VIEWER_FAILURE_LIMIT {
            self.viewer_top_stopped = true;
        }
    }

    /// Record a successfully read `viewerFrame<N>.json`, advancing to the
    /// next frame index.
    pub fn on_viewer_frame_read(&mut self, value: Value, bytes: u64) {
        self.viewer_frames.push(value);
        self.viewer_bytes += bytes;
        self.viewer_frame_failures = 0;
        self.viewer_next_frame += 1;
    }

    /// A frame read attempt failed or wasn't ready; after
    /// [`VIEWER_FAILURE_LIMIT`] consecutive misses on this index, move on to
    /// the next one rather than getting stuck.
    pub fn on_viewer_frame_failed(&mut self) {
        self.viewer_frame_failures += 1;
        if self.viewer_frame_failures >= VIEWER_FAILURE_LIMIT {
            self.viewer_frame_failures = 0;
            self.viewer_next_frame += 1;
        }
    }

    /// Remaining bytes available under [`MAX_VIEWER_BYTES`] before viewer
    /// harvesting must stop.
    pub fn viewer_budget_remaining(&self) -> u64 {
        MAX_VIEWER_BYTES.saturating_sub(self.viewer_bytes)
    }

    /// The retry counter exceeded its limit for the current state; clean
    /// up with reason `retries` per spec.md §4.1.
    pub fn on_retries_exceeded(&mut self) {
        self.state = UnitState::Done(DoneReason::Retries);
    }

    pub fn dump(&mut self) {
        if self.state.accepts_dump() {
            self.state = UnitState::Dump;
            self.retry.cancel();
        }
    }

    pub fn expire_if_past_deadline(&mut self, deadline: std::time::SystemTime, now: std::time::SystemTime) {
        if self.state.is_terminal() || matches!(self.state, UnitState::Assign | UnitState::Dump) {
            return;
        }
        if now >= deadline {
            self.state = UnitState::Done(DoneReason::Expired);
        }
    }

    pub fn get_run_time(&self, now: std::time::SystemTime) -> Duration {
        let live = match self.start_time {
            Some(start) => now
                .duration_since(start)
                .unwrap_or(Duration::ZERO)
                .saturating_sub(self.clock_skew),
            None => Duration::ZERO,
        };
        self.run_time + live
    }

    pub fn known_progress(&self) -> f64 {
        if self.last_known_total == 0 {
            0.0
        } else {
            self.last_known_done as f64 / self.last_known_total as f64
        }
    }

    /// Persist this WU's state to the `units` table, per spec.md §3's
    /// "persisted on every state change at or beyond CORE" rule. Retry
    /// state is intentionally excluded (spec.md §9).
    pub fn persist(&self, table: &KvTable) -> Result<()> {
        let snapshot = UnitSnapshot::from(self);
        let json = serde_json::to_string(&snapshot).map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
        table.set(&self.id, &json)
    }

    /// Remove this WU's persisted record, done on reaching any `DONE` state.
    pub fn erase(table: &KvTable, id: &str) -> Result<()> {
        table.remove(id)
    }

    /// Reload a persisted WU. A unit found in `RUN` is demoted to `CORE`
    /// since no kernel process survives a restart (testable property 7);
    /// the retry counter and collector index always come back at zero.
    pub fn reload(table: &KvTable, id: &str) -> Result<Option<Unit>> {
        let Some(raw) = table.get(id)? else {
            return Ok(None);
        };
        let snapshot: UnitSnapshot = serde_json::from_str(&raw)
            .map_err(|e| FahError::Integrity(format!("corrupt unit record {id}: {e}")))?;
        Ok(Some(snapshot.into_unit()))
    }
}

/// Persisted shape of a [`Unit`]. Timestamps are stored as unix seconds
/// since `SystemTime` has no native serde support; `retries` and
/// `collector_index` are dropped per spec.md §9.
#[derive(Serialize, Deserialize)]
struct UnitSnapshot {
    id: String,
    state: UnitState,
    cpus: u32,
    min_cpus: u32,
    max_cpus: u32,
    gpus: Vec<String>,
    data: UnitEnvelopes,
    start_time_unix: Option<u64>,
    run_time: Duration,
    clock_skew: Duration,
    last_known_done: u64,
    last_known_total: u64,
    last_known_progress_update_run_time: Duration,
}

fn system_time_to_unix(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

fn unix_to_system_time(secs: u64) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + Duration::from_secs(secs)
}

impl From<&Unit> for UnitSnapshot {
    fn from(u: &Unit) -> Self {
        Self {
            id: u.id.clone(),
            state: u.state,
            cpus: u.cpus,
            min_cpus: u.min_cpus,
            max_cpus: u.max_cpus,
            gpus: u.gpus.clone(),
            data: u.data.clone(),
            start_time_unix: u.start_time.map(system_time_to_unix),
            run_time: u.run_time,
            clock_skew: u.clock_skew,
            last_known_done: u.last_known_done,
            last_known_total: u.last_known_total,
            last_known_progress_update_run_time: u.last_known_progress_update_run_time,
        }
    }
}

impl UnitSnapshot {
    fn into_unit(self) -> Unit {
        let mut state = self.state;
        let mut start_time = self.start_time_unix.map(unix_to_system_time);
        if state == UnitState::Run {
            state = UnitState::Core;
            start_time = None;
        }
        Unit {
            id: self.id,
            state,
            cpus: self.cpus,
            min_cpus: self.min_cpus,
            max_cpus: self.max_cpus,
            gpus: self.gpus,
            data: self.data,
            start_time,
            run_time: self.run_time,
            clock_skew: self.clock_skew,
            last_known_done: self.last_known_done,
            last_known_total: self.last_known_total,
            last_known_progress_update_run_time: self.last_known_progress_update_run_time,
            retry: RetryCounter::default(),
            wait_until: None,
            collector_index: 0,
            viewer_topology: None,
            viewer_frames: Vec::new(),
            viewer_bytes: 0,
            viewer_top_failures: 0,
            viewer_top_stopped: false,
            viewer_frame_failures: 0,
            viewer_next_frame: 0,
        }
    }
}

/// An entry in the `wu_log` table, written once a WU reaches `DONE`. This
/// is the "credit-record file" spec.md's S1 scenario expects on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub id: String,
    pub reason: DoneReason,
    pub credit: Option<f64>,
    pub completed_unix: u64,
}

impl CompletionRecord {
    pub fn new(unit: &Unit, reason: DoneReason, credit: Option<f64>, now: std::time::SystemTime) -> Self {
        Self {
            id: unit.id.clone(),
            reason,
            credit,
            completed_unix: system_time_to_unix(now),
        }
    }

    pub fn persist(&self, table: &KvTable) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
        table.set(&self.id, &json)
    }
}
