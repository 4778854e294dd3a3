// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Group Scheduler: allocates CPUs/GPUs across a group's WUs and enforces
//! pause/idle/battery/finish policies, per spec.md §4.4.

use crate::unit::{Unit, UnitState};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub paused: bool,
    pub finish: bool,
    pub cpus: u32,
    /// gpu_id -> enabled
    pub gpu_enabled: std::collections::BTreeMap<String, bool>,
    pub cause: String,
    pub passkey: Option<String>,
    pub user: String,
    pub team: u32,
    pub project_key: Option<String>,
    pub beta: bool,
    pub on_idle: bool,
    pub on_battery: bool,
    pub keep_awake: bool,
    pub max_uploads: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paused: false,
            finish: false,
            cpus: num_cpus_fallback(),
            gpu_enabled: Default::default(),
            cause: "ANY".to_string(),
            passkey: None,
            user: "Anonymous".to_string(),
            team: 0,
            project_key: None,
            beta: false,
            on_idle: false,
            on_battery: true,
            keep_awake: false,
            max_uploads: 2,
        }
    }
}

fn num_cpus_fallback() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

impl Config {
    /// Persist this group's config, keyed by group name, per spec.md §3's
    /// "Groups persist their config on every change" rule.
    pub fn persist(&self, table: &crate::kv::KvTable, group_name: &str) -> crate::error::Result<()> {
        let json = serde_json::to_string(self).map_err(|e| crate::error::FahError::Other(anyhow::anyhow!(e)))?;
        table.set(group_name, &json)
    }

    pub fn reload(table: &crate::kv::KvTable, group_name: &str) -> crate::error::Result<Option<Config>> {
        let Some(raw) = table.get(group_name)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| crate::error::FahError::Integrity(format!("corrupt group config {group_name}: {e}")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailureState {
    pub failures: u32,
    pub lost_wus: u32,
    pub wait_until: Option<SystemTime>,
    pub failed_reason: Option<String>,
}

const LOST_WU_PAUSE_THRESHOLD: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WuTerminalReason {
    Credited,
    Dumped,
    Aborted,
    Rejected,
    Expired,
    Retries,
}

impl FailureState {
    /// Apply a WU's terminal reason to the group's failure-accounting state.
    pub fn on_unit_terminal(&mut self, reason: WuTerminalReason, was_downloaded: bool, now: SystemTime) {
        if reason == WuTerminalReason::Credited {
            self.failures = 0;
            self.wait_until = None;
            self.failed_reason = None;
            return;
        }

        if !matches!(reason, WuTerminalReason::Dumped | WuTerminalReason::Aborted) {
            self.failures = self.failures.saturating_add(1);
            let backoff_secs = 1u64 << self.failures.min(10);
            self.wait_until = Some(now + Duration::from_secs(backoff_secs));
        }

        if was_downloaded {
            self.lost_wus += 1;
            if self.lost_wus > LOST_WU_PAUSE_THRESHOLD {
                self.failed_reason = Some(format!(
                    "auto-paused after {} lost work units",
                    self.lost_wus
                ));
            }
        }
    }

    pub fn is_auto_paused(&self) -> bool {
        self.failed_reason.is_some()
    }
}

/// Named bundle of config + WUs sharing a CPU/GPU budget.
pub struct Group {
    pub name: String,
    pub config: Config,
    pub units: Vec<Unit>,
    pub failure: FailureState,
}

impl Group {
    pub fn new(name: String) -> Self {
        Self {
            name,
            config: Config::default(),
            units: Vec::new(),
            failure: FailureState::default(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    fn wait_predicates(&self, system_idle: bool, system_on_battery: bool, gpu_wait: bool) -> bool {
        (self.config.on_idle && !system_idle)
            || (!self.config.on_battery && system_on_battery)
            || gpu_wait
    }

    /// One scheduler pass. Returns the CPU allocation decided for each unit,
    /// by index into `self.units`, and whether a new WU should be requested.
    pub fn schedule(
        &mut self,
        total_cpus: u32,
        available_gpu_ids: &[String],
        system_idle: bool,
        system_on_battery: bool,
        gpu_wait: bool,
        uptime: Duration,
        max_wait_time: Duration,
        now: SystemTime,
    ) -> SchedulePass {
        self.units.retain(|u| u.state != UnitState::Done(crate::unit::DoneReason::Credited)
            && !matches!(u.state, UnitState::Done(_)));

        if self.failure.is_auto_paused() || self.config.paused {
            return SchedulePass::retry_later();
        }
        if self.wait_predicates(system_idle, system_on_battery, gpu_wait) && uptime < max_wait_time {
            return SchedulePass::retry_later();
        }
        if let Some(wait_until) = self.failure.wait_until {
            if now < wait_until {
                return SchedulePass::retry_later();
            }
        }

        let mut remaining_cpus = total_cpus.min(self.config.cpus);
        let mut remaining_gpus: Vec<String> = available_gpu_ids
            .iter()
            .filter(|id| self.config.gpu_enabled.get(*id).copied().unwrap_or(false))
            .cloned()
            .collect();

        let mut allocations = vec![0u32; self.units.len()];
        let mut eligible = vec![false; self.units.len()];

        // Pass 1: GPU-bound WUs in insertion order.
        for (i, unit) in self.units.iter().enumerate() {
            if unit.gpus.is_empty() {
                continue;
            }
            let all_gpus_available = unit.gpus.iter().all(|g| remaining_gpus.contains(g));
            let cpu_ok = unit.min_cpus <= remaining_cpus || unit.min_cpus < 2;
            if all_gpus_available && cpu_ok {
                allocations[i] = unit.min_cpus.min(remaining_cpus);
                remaining_cpus -= allocations[i];
                remaining_gpus.retain(|g| !unit.gpus.contains(g));
                eligible[i] = true;
            }
        }

        // Pass 2: leftover CPUs to eligible GPU WUs, up to max_cpus.
        for (i, unit) in self.units.iter().enumerate() {
            if !eligible[i] || unit.gpus.is_empty() {
                continue;
            }
            let headroom = unit.max_cpus.saturating_sub(allocations[i]).min(remaining_cpus);
            allocations[i] += headroom;
            remaining_cpus -= headroom;
        }

        // Pass 3: pure-CPU WUs in insertion order, clamped to max_cpus.
        for (i, unit) in self.units.iter().enumerate() {
            if !unit.gpus.is_empty() {
                continue;
            }
            let grant = unit.max_cpus.min(remaining_cpus);
            if grant > 0 || unit.max_cpus == 0 {
                allocations[i] = grant;
                remaining_cpus -= grant;
                eligible[i] = true;
            }
        }

        let should_add_unit = !self.config.finish
            && (self.units.len() as u32)
                < available_gpu_ids.len() as u32 + self.config.cpus / 64 + self.config.max_uploads;

        SchedulePass {
            cpu_allocations: allocations,
            eligible,
            should_add_unit,
            retry_after: None,
        }
    }
}

pub struct SchedulePass {
    pub cpu_allocations: Vec<u32>,
    pub eligible: Vec<bool>,
    pub should_add_unit: bool,
    /// `Some(duration)` when the pass did no allocation work and should be
    /// retried after `duration` (the 250 ms reschedule in spec.md §4.4).
    pub retry_after: Option<Duration>,
}

impl SchedulePass {
    fn retry_later() -> Self {
        Self {
            cpu_allocations: Vec::new(),
            eligible: Vec::new(),
            should_add_unit: false,
            retry_after: Some(Duration::from_millis(250)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cpu_unit(max_cpus: u32) -> Unit {
        let mut u = Unit::new(format!("u{max_cpus}"), json!({}));
        u.min_cpus = 1;
        u.max_cpus = max_cpus;
        u.state = UnitState::Run;
        u
    }

    #[test]
    fn pure_cpu_units_split_in_insertion_order() {
        let mut group = Group::new(String::new());
        group.config.cpus = 4;
        group.units.push(cpu_unit(2));
        group.units.push(cpu_unit(4));

        let pass = group.schedule(4, &[], true, false, false, Duration::from_secs(10), Duration::ZERO, SystemTime::now());
        assert_eq!(pass.cpu_allocations, vec![2, 2]);
    }

    #[test]
    fn paused_group_retries_without_allocating() {
        let mut group = Group::new(String::new());
        group.config.paused = true;
        group.units.push(cpu_unit(2));
        let pass = group.schedule(4, &[], true, false, false, Duration::from_secs(10), Duration::ZERO, SystemTime::now());
        assert!(pass.retry_after.is_some());
        assert!(pass.cpu_allocations.is_empty());
    }

    #[test]
    fn fifth_lost_wu_auto_pauses_group() {
        let mut state = FailureState::default();
        let now = SystemTime::now();
        for _ in 0..4 {
            state.on_unit_terminal(WuTerminalReason::Expired, true, now);
        }
        assert!(!state.is_auto_paused());
        state.on_unit_terminal(WuTerminalReason::Expired, true, now);
        assert!(state.is_auto_paused());
    }

    #[test]
    fn credited_clears_failure_state() {
        let mut state = FailureState::default();
        let now = SystemTime::now();
        state.on_unit_terminal(WuTerminalReason::Expired, true, now);
        assert_eq!(state.failures, 1);
        state.on_unit_terminal(WuTerminalReason::Credited, false, now);
        assert_eq!(state.failures, 0);
        assert!(state.wait_until.is_none());
    }

    #[test]
    fn dumped_does_not_bump_failures() {
        let mut state = FailureState::default();
        state.on_unit_terminal(WuTerminalReason::Dumped, false, SystemTime::now());
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn should_add_unit_respects_finish_flag() {
        let mut group = Group::new(String::new());
        group.config.finish = true;
        let pass = group.schedule(4, &[], true, false, false, Duration::from_secs(10), Duration::ZERO, SystemTime::now());
        assert!(!pass.should_add_unit);
    }
}
