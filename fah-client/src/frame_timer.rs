// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-WU progress, ETA, and credit-bonus estimation.
//!
//! Named after the original client's `FrameTimer`, which tracked the same
//! quantities from core log "frame" markers; here the inputs come from the
//! `wuinfo_01.dat` progress header instead, but the estimation arithmetic
//! (known-fraction plus bounded extrapolation, clock-skew-robust run time)
//! is unchanged.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditEstimate {
    pub base_credit: f64,
    pub bonus: f64,
}

impl CreditEstimate {
    pub fn total(&self) -> f64 {
        self.base_credit * self.bonus
    }
}

/// Pure functions over a WU's progress fields; kept free of `Unit` so they
/// can be tested against hand-built scenarios without constructing a full
/// state machine.
pub struct ProgressModel;

impl ProgressModel {
    /// `runTimeEstimate`: server estimate if present, else derived from
    /// known progress, else a time-based fallback.
    pub fn run_time_estimate(
        server_estimate: Option<Duration>,
        last_known_progress_update_run_time: Duration,
        known_progress: f64,
        timeout: Duration,
    ) -> Duration {
        if let Some(est) = server_estimate {
            return est;
        }
        if known_progress > 0.0 {
            return Duration::from_secs_f64(
                last_known_progress_update_run_time.as_secs_f64() / known_progress,
            );
        }
        timeout.mul_f64(0.2).min(Duration::from_secs(24 * 60 * 60))
    }

    /// `estimatedProgress = lastKnownDone/lastKnownTotal + min(0.01, δ·runtime)`,
    /// clamped to `[0, 1)`.
    pub fn estimated_progress(
        last_known_done: u64,
        last_known_total: u64,
        delta_per_second: f64,
        run_time: Duration,
    ) -> f64 {
        let known = if last_known_total == 0 {
            0.0
        } else {
            last_known_done as f64 / last_known_total as f64
        };
        let extrapolated = (delta_per_second * run_time.as_secs_f64()).min(0.01);
        (known + extrapolated).clamp(0.0, 0.999_999)
    }

    /// `bonus = sqrt(0.75 * deadline / (now - requested + eta))`. Returns
    /// `None` if the estimated completion time falls past the timeout (no
    /// bonus should be offered/shown in that case).
    pub fn credit_bonus(
        deadline: Duration,
        elapsed_since_requested: Duration,
        eta: Duration,
        timeout: Duration,
    ) -> Option<f64> {
        let projected_completion = elapsed_since_requested + eta;
        if projected_completion > timeout {
            return None;
        }
        let denominator = projected_completion.as_secs_f64().max(1.0);
        Some((0.75 * deadline.as_secs_f64() / denominator).sqrt())
    }

    pub fn credit_estimate(
        base_credit: f64,
        deadline: Duration,
        elapsed_since_requested: Duration,
        eta: Duration,
        timeout: Duration,
    ) -> Option<CreditEstimate> {
        let bonus = Self::credit_bonus(deadline, elapsed_since_requested, eta, timeout)?;
        Some(CreditEstimate { base_credit, bonus })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_uses_known_fraction_plus_bounded_extrapolation() {
        let p = ProgressModel::estimated_progress(50, 100, 10.0, Duration::from_secs(1));
        assert!((p - 0.51).abs() < 1e-9);
    }

    #[test]
    fn progress_extrapolation_caps_at_one_percent() {
        let p = ProgressModel::estimated_progress(0, 100, 10.0, Duration::from_secs(100));
        assert!((p - 0.01).abs() < 1e-9);
    }

    #[test]
    fn progress_is_clamped_below_one() {
        let p = ProgressModel::estimated_progress(100, 100, 10.0, Duration::from_secs(100));
        assert!(p < 1.0);
    }

    #[test]
    fn credit_bonus_none_past_timeout() {
        let bonus = ProgressModel::credit_bonus(
            Duration::from_secs(3600),
            Duration::from_secs(3000),
            Duration::from_secs(1000),
            Duration::from_secs(3600),
        );
        assert!(bonus.is_none());
    }

    #[test]
    fn credit_bonus_present_within_timeout() {
        let bonus = ProgressModel::credit_bonus(
            Duration::from_secs(3600),
            Duration::from_secs(100),
            Duration::from_secs(100),
            Duration::from_secs(3600),
        );
        assert!(bonus.unwrap() > 0.0);
    }
}
