// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Kernel Supervisor: spawns and monitors the compute-kernel subprocess.
//!
//! Grounded on the teacher's `ProcessHandle` (spawn/pid/is_running/wait/
//! kill/shutdown-with-timeout), generalized for clock-skew detection and
//! the two-phase (interrupt-then-kill) stop spec.md §4.2 requires.

use crate::error::{FahError, Result};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Grace period between the interrupt signal and the forced kill.
const INTERRUPT_GRACE: Duration = Duration::from_secs(60);

/// Clock-skew threshold: a sampling gap outside `[0, 300s]` is treated as a
/// sleep/hibernate/NTP jump rather than real elapsed run time.
const CLOCK_SKEW_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    ExitedGracefully,
    Killed,
}

pub struct KernelSupervisor {
    child: Child,
    pub pid: u32,
    pub start_time: SystemTime,
    last_sample: SystemTime,
    clock_skew: Duration,
    stop_requested: bool,
}

impl KernelSupervisor {
    /// Spawn `program` with `args` in `working_dir`, with its own directory
    /// prepended to the dynamic-library search path via `lib_path_var`
    /// (e.g. `LD_LIBRARY_PATH`), stdout/stderr silenced per spec.md §4.1
    /// "Run": the log is tailed separately from the kernel's own log file,
    /// not from the child's stdio streams.
    pub fn spawn(
        program: &std::path::Path,
        args: &[String],
        working_dir: &std::path::Path,
        lib_path_var: &str,
    ) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = program.parent() {
            let existing = std::env::var(lib_path_var).unwrap_or_default();
            let joined = if existing.is_empty() {
                dir.display().to_string()
            } else {
                format!("{}:{existing}", dir.display())
            };
            command.env(lib_path_var, joined);
        }

        let child = command
            .spawn()
            .map_err(|e| FahError::Kernel(format!("failed to spawn kernel: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| FahError::Kernel("kernel exited before pid was available".into()))?;
        let now = SystemTime::now();

        Ok(Self {
            child,
            pid,
            start_time: now,
            last_sample: now,
            clock_skew: Duration::ZERO,
            stop_requested: false,
        })
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Take a wall-clock (`SystemTime`) sample, not a monotonic one: only
    /// the wall clock sees an NTP correction or a sleep/hibernate gap, and
    /// `Unit::get_run_time` subtracts this total from a `SystemTime`-based
    /// elapsed, so the two must be measured on the same clock. Any gap
    /// outside `[0, 300s]` since the last sample — forward or backward — is
    /// added to the cumulative clock-skew total.
    pub fn sample_clock(&mut self) -> Duration {
        let now = SystemTime::now();
        match now.duration_since(self.last_sample) {
            Ok(delta) if delta > CLOCK_SKEW_THRESHOLD => {
                self.clock_skew += delta - CLOCK_SKEW_THRESHOLD;
            }
            Err(_) => {
                // The wall clock went backward (NTP step correction). Absorb
                // the whole gap as skew so run time never moves backward.
                if let Ok(backward) = self.last_sample.duration_since(now) {
                    self.clock_skew += backward;
                }
            }
            _ => {}
        }
        self.last_sample = now;
        self.clock_skew
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Two-phase stop: send an interrupt, wait up to 60s, then kill. Further
    /// calls after the first are no-ops per spec.md §4.2.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        if self.stop_requested {
            return Ok(StopOutcome::Killed);
        }
        self.stop_requested = true;

        self.send_interrupt()?;
        match timeout(INTERRUPT_GRACE, self.child.wait()).await {
            Ok(Ok(_)) => Ok(StopOutcome::ExitedGracefully),
            _ => {
                self.child
                    .kill()
                    .await
                    .map_err(|e| FahError::Kernel(format!("failed to kill kernel: {e}")))?;
                Ok(StopOutcome::Killed)
            }
        }
    }

    #[cfg(unix)]
    fn send_interrupt(&self) -> Result<()> {
        // SAFETY: libc::kill with a valid pid and SIGTERM is a pure signal
        // delivery; the subprocess is guaranteed alive at call time because
        // `stop_requested` gates re-entry.
        let result = unsafe { libc::kill(self.pid as i32, libc::SIGTERM) };
        if result != 0 {
            return Err(FahError::Kernel(format!(
                "failed to signal kernel pid {}: {}",
                self.pid,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn send_interrupt(&self) -> Result<()> {
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| FahError::Kernel(format!("failed to wait on kernel: {e}")))
    }
}

/// Build the compute kernel's argv, per spec.md §6 "External Interfaces":
/// common flags, then either the GPU or CPU resource branch.
pub fn build_kernel_args(
    unit_id: &str,
    core_version: &str,
    lifeline_pid: u32,
    cpus: u32,
    gpu: Option<&crate::resource::GpuDescriptor>,
) -> Vec<String> {
    let mut args = vec![
        "-dir".to_string(),
        unit_id.to_string(),
        "-suffix".to_string(),
        "01".to_string(),
        "-version".to_string(),
        core_version.to_string(),
        "-lifeline".to_string(),
        lifeline_pid.to_string(),
    ];

    match gpu {
        Some(gpu) => {
            use crate::resource::ComputeApiKind;

            if let Some(uuid) = gpu.compute_apis.iter().find_map(|api| api.uuid.clone()) {
                args.push("-gpu-uuid".to_string());
                args.push(uuid);
            }

            let cuda_supported = gpu.compute_apis.iter().any(|api| api.api == ComputeApiKind::Cuda);
            args.push("-gpu-platform".to_string());
            args.push(if cuda_supported { "cuda" } else { "opencl" }.to_string());
            args.push("-gpu-vendor".to_string());
            args.push(gpu.vendor_name.clone());

            for (kind, flag) in [
                (ComputeApiKind::OpenCl, "opencl"),
                (ComputeApiKind::Cuda, "cuda"),
                (ComputeApiKind::Hip, "hip"),
            ] {
                if let Some(api) = gpu.compute_apis.iter().find(|api| api.api == kind) {
                    args.push(format!("-{flag}-platform"));
                    args.push(api.platform_index.to_string());
                    args.push(format!("-{flag}-device"));
                    args.push(api.device_index.to_string());
                }
            }

            if let Some(opencl) = gpu.compute_apis.iter().find(|api| api.api == ComputeApiKind::OpenCl) {
                args.push("-gpu".to_string());
                args.push(opencl.device_index.to_string());
            }
        }
        None => {
            args.push("-np".to_string());
            args.push(cpus.to_string());
        }
    }

    args
}

/// One second's worth of progress polling for a running WU: re-read
/// `wuinfo_01.dat` and harvest any stable viewer JSON, per spec.md §4.1
/// "Run". `unit_dir` is the WU's working directory
/// (`app_home::get_work_dir`), `core_kind` the running core's kernel type.
pub fn poll_progress(unit: &mut crate::unit::Unit, unit_dir: &std::path::Path, core_kind: u32, now: SystemTime) {
    if let Some(info) = crate::progress::read_wuinfo(unit_dir, core_kind) {
        unit.last_known_done = info.done as u64;
        unit.last_known_total = info.total as u64;
        unit.last_known_progress_update_run_time = unit.run_time;
    }

    if unit.viewer_budget_remaining() == 0 {
        return;
    }

    if unit.viewer_topology.is_none() && !unit.viewer_top_stopped {
        let path = crate::progress::viewer_top_path(unit_dir);
        match crate::progress::read_json_if_ready(&path, now) {
            Some((value, len)) => unit.on_viewer_top_read(value, len),
            None if path.exists() => unit.on_viewer_top_failed(),
            None => {}
        }
    }

    if unit.viewer_budget_remaining() == 0 {
        return;
    }

    let frame_path = crate::progress::viewer_frame_path(unit_dir, unit.viewer_next_frame);
    match crate::progress::read_json_if_ready(&frame_path, now) {
        Some((value, len)) => unit.on_viewer_frame_read(value, len),
        None if frame_path.exists() => unit.on_viewer_frame_failed(),
        None => {}
    }
}

impl Drop for KernelSupervisor {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `Child` can't be constructed without actually spawning, so these unit
    // tests exercise the clock-skew arithmetic against a real, trivially
    // exiting child process instead of mocking `Child`.
    fn spawn_noop() -> KernelSupervisor {
        let mut command = Command::new("true");
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = command.spawn().expect("`true` must be available in PATH");
        let pid = child.id().unwrap_or(0);
        let now = SystemTime::now();
        KernelSupervisor {
            child,
            pid,
            start_time: now,
            last_sample: now,
            clock_skew: Duration::ZERO,
            stop_requested: false,
        }
    }

    #[tokio::test]
    async fn clock_skew_threshold_ignores_normal_ticks() {
        let mut sup = spawn_noop();
        sup.last_sample = SystemTime::now() - Duration::from_secs(1);
        let skew = sup.sample_clock();
        assert_eq!(skew, Duration::ZERO);
        let _ = sup.wait().await;
    }

    #[tokio::test]
    async fn clock_skew_accumulates_past_threshold() {
        let mut sup = spawn_noop();
        sup.last_sample = SystemTime::now() - Duration::from_secs(400);
        let skew = sup.sample_clock();
        assert_eq!(skew, Duration::from_secs(100));
        let _ = sup.wait().await;
    }

    #[tokio::test]
    async fn clock_skew_absorbs_backward_jump() {
        let mut sup = spawn_noop();
        sup.last_sample = SystemTime::now() + Duration::from_secs(500);
        let skew = sup.sample_clock();
        assert!(skew >= Duration::from_secs(500));
        let _ = sup.wait().await;
    }

    #[tokio::test]
    async fn second_stop_call_is_a_noop() {
        let mut sup = spawn_noop();
        let _ = sup.wait().await;
        sup.stop_requested = true;
        assert_eq!(sup.stop().await.unwrap(), StopOutcome::Killed);
    }

    use crate::resource::{ComputeApi, ComputeApiKind, GpuDescriptor};

    fn gpu(apis: Vec<ComputeApi>) -> GpuDescriptor {
        GpuDescriptor {
            pci_bus: 1,
            pci_slot: 0,
            pci_function: 0,
            vendor_id: 0x10de,
            device_id: 0x1234,
            vendor_name: "nvidia".into(),
            species: 1,
            compute_apis: apis,
        }
    }

    fn api(kind: ComputeApiKind, platform: u32, device: u32) -> ComputeApi {
        ComputeApi {
            api: kind,
            platform_index: platform,
            device_index: device,
            driver_version: "550".into(),
            compute_version: "8.9".into(),
            uuid: None,
        }
    }

    #[test]
    fn cpu_only_args_use_np() {
        let args = build_kernel_args("wu1", "0.0.18", 4242, 6, None);
        assert_eq!(
            args,
            vec!["-dir", "wu1", "-suffix", "01", "-version", "0.0.18", "-lifeline", "4242", "-np", "6"]
        );
    }

    #[test]
    fn gpu_args_prefer_cuda_platform_when_supported() {
        let g = gpu(vec![api(ComputeApiKind::OpenCl, 0, 1), api(ComputeApiKind::Cuda, 0, 0)]);
        let args = build_kernel_args("wu1", "0.0.18", 4242, 1, Some(&g));
        assert!(args.contains(&"-gpu-platform".to_string()));
        let idx = args.iter().position(|a| a == "-gpu-platform").unwrap();
        assert_eq!(args[idx + 1], "cuda");
        assert!(args.contains(&"-opencl-platform".to_string()));
        assert!(args.contains(&"-cuda-platform".to_string()));
        assert!(!args.contains(&"-hip-platform".to_string()));
        assert!(args.contains(&"-gpu".to_string()));
    }

    #[test]
    fn gpu_args_fall_back_to_opencl_platform_without_cuda() {
        let g = gpu(vec![api(ComputeApiKind::OpenCl, 2, 0)]);
        let args = build_kernel_args("wu1", "0.0.18", 4242, 1, Some(&g));
        let idx = args.iter().position(|a| a == "-gpu-platform").unwrap();
        assert_eq!(args[idx + 1], "opencl");
    }

    fn wuinfo_header(kind: u32, total: u32, done: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(crate::progress::WUINFO_HEADER_LEN);
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(&[0u8; 80]);
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&done.to_le_bytes());
        buf
    }

    #[test]
    fn poll_progress_reads_wuinfo_header_into_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wuinfo_01.dat"), wuinfo_header(7, 100, 42)).unwrap();

        let mut unit = crate::unit::Unit::new("u".into(), serde_json::json!({}));
        poll_progress(&mut unit, dir.path(), 7, SystemTime::now());

        assert_eq!(unit.last_known_total, 100);
        assert_eq!(unit.last_known_done, 42);
    }

    #[test]
    fn poll_progress_ignores_a_header_for_the_wrong_core_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wuinfo_01.dat"), wuinfo_header(7, 100, 42)).unwrap();

        let mut unit = crate::unit::Unit::new("u".into(), serde_json::json!({}));
        poll_progress(&mut unit, dir.path(), 8, SystemTime::now());

        assert_eq!(unit.last_known_total, 0);
    }

    #[test]
    fn poll_progress_harvests_a_stable_viewer_top() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewerTop.json");
        std::fs::write(&path, br#"{"atoms": 10}"#).unwrap();

        // The file's real mtime is "now"; advancing the `now` argument 20s
        // past that clears the 10s-untouched rule without needing to
        // backdate the file itself.
        let later = std::time::SystemTime::now() + Duration::from_secs(20);

        let mut unit = crate::unit::Unit::new("u".into(), serde_json::json!({}));
        poll_progress(&mut unit, dir.path(), 7, later);

        assert!(unit.viewer_topology.is_some());
        assert!(unit.viewer_bytes > 0);
    }

    #[test]
    fn poll_progress_stops_viewer_harvest_once_budget_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewerTop.json");
        std::fs::write(&path, br#"{"atoms": 10}"#).unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(20);

        let mut unit = crate::unit::Unit::new("u".into(), serde_json::json!({}));
        unit.viewer_bytes = crate::unit::MAX_VIEWER_BYTES;

        poll_progress(&mut unit, dir.path(), 7, later);

        assert!(unit.viewer_topology.is_none());
    }
}
