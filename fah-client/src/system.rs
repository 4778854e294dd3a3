// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Injected OS facts the Group Scheduler's wait predicates depend on:
//! whether the machine is idle and whether it is running on battery.
//!
//! Real detection is platform-specific and blocking, so it runs on a
//! dedicated thread per spec.md §5 and publishes through this trait rather
//! than being queried synchronously from the event loop.

pub trait SystemMonitor: Send + Sync {
    /// True if no keyboard/mouse/screen activity has been seen for the
    /// platform's idle threshold.
    fn is_idle(&self) -> bool;

    /// True if the machine is currently running on battery power.
    fn is_on_battery(&self) -> bool;
}

/// Always-active, always-on-mains monitor, appropriate for servers and as a
/// safe fallback when platform detection is unavailable.
pub struct AlwaysAvailable;

impl SystemMonitor for AlwaysAvailable {
    fn is_idle(&self) -> bool {
        false
    }

    fn is_on_battery(&self) -> bool {
        false
    }
}
