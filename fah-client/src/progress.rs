// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Progress-file reading: the kernel's `wuinfo_01.dat` frame-count header
//! and the `viewerTop.json`/`viewerFrame<N>.json` snapshots it writes
//! alongside it, per spec.md §4.1 "Run".

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Fixed-size `wuinfo_01.dat` header: `u32 type`, 80 reserved bytes,
/// `u32 total`, `u32 done`.
pub const WUINFO_HEADER_LEN: usize = 4 + 80 + 4 + 4;

/// A viewer file is only treated as a stable, complete snapshot once it has
/// gone untouched for this long; the kernel writes it non-atomically.
const VIEWER_UNTOUCHED: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WuInfo {
    pub kind: u32,
    pub total: u32,
    pub done: u32,
}

/// Parse a `wuinfo_01.dat` header, validating `type` against the running
/// core's kind. Returns `None` (treated as "not ready yet") rather than
/// erroring — a partially-written file is routine while the kernel starts.
pub fn parse_wuinfo(bytes: &[u8], expected_kind: u32) -> Option<WuInfo> {
    if bytes.len() < WUINFO_HEADER_LEN {
        return None;
    }
    let kind = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    if kind != expected_kind {
        return None;
    }
    let total = u32::from_le_bytes(bytes[84..88].try_into().ok()?);
    let done = u32::from_le_bytes(bytes[88..92].try_into().ok()?);
    Some(WuInfo { kind, total, done })
}

/// Read and parse `wuinfo_01.dat` from a WU's working directory, if present.
pub fn read_wuinfo(unit_dir: &Path, expected_kind: u32) -> Option<WuInfo> {
    let bytes = std::fs::read(unit_dir.join("wuinfo_01.dat")).ok()?;
    parse_wuinfo(&bytes, expected_kind)
}

/// True once `modified` is far enough in the past that the file is unlikely
/// to still be mid-write.
pub fn is_untouched(modified: SystemTime, now: SystemTime) -> bool {
    now.duration_since(modified).map(|age| age > VIEWER_UNTOUCHED).unwrap_or(false)
}

fn ready_to_read(path: &Path, now: SystemTime) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    is_untouched(modified, now)
}

/// Read and parse `path` as JSON if it's untouched long enough to be stable,
/// returning the parsed value and its byte length for budget accounting.
pub fn read_json_if_ready(path: &Path, now: SystemTime) -> Option<(serde_json::Value, u64)> {
    if !ready_to_read(path, now) {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    let len = bytes.len() as u64;
    let value = serde_json::from_slice(&bytes).ok()?;
    Some((value, len))
}

pub fn viewer_top_path(unit_dir: &Path) -> PathBuf {
    unit_dir.join("viewerTop.json")
}

pub fn viewer_frame_path(unit_dir: &Path, index: u32) -> PathBuf {
    unit_dir.join(format!("viewerFrame{index}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: u32, total: u32, done: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WUINFO_HEADER_LEN);
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(&[0u8; 80]);
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&done.to_le_bytes());
        buf
    }

    #[test]
    fn parses_well_formed_header() {
        let bytes = header(0x21, 100, 37);
        let info = parse_wuinfo(&bytes, 0x21).unwrap();
        assert_eq!(info, WuInfo { kind: 0x21, total: 100, done: 37 });
    }

    #[test]
    fn rejects_mismatched_core_kind() {
        let bytes = header(0x21, 100, 37);
        assert!(parse_wuinfo(&bytes, 0x22).is_none());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(parse_wuinfo(&[0u8; 10], 0x21).is_none());
    }

    #[test]
    fn untouched_requires_past_the_10s_threshold() {
        let now = SystemTime::now();
        assert!(!is_untouched(now - Duration::from_secs(5), now));
        assert!(is_untouched(now - Duration::from_secs(11), now));
    }

    #[test]
    fn read_wuinfo_round_trips_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wuinfo_01.dat"), header(0x21, 10, 5)).unwrap();
        let info = read_wuinfo(dir.path(), 0x21).unwrap();
        assert_eq!(info.done, 5);
    }

    #[test]
    fn read_json_if_ready_skips_a_freshly_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewerTop.json");
        std::fs::write(&path, b"{}").unwrap();
        assert!(read_json_if_ready(&path, SystemTime::now()).is_none());
    }
}
