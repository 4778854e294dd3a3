// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU Registry: downloads the vendor/species index, matches it against
//! PCI-enumerated devices, and caches the result.

use super::GpuDescriptor;
use crate::backoff::Backoff;
use crate::error::{FahError, Result};
use crate::http_client::HttpClient;
use crate::kv::KvTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const INDEX_URL: &str = "https://api.foldingathome.org/gpus";
const CACHE_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// One row of the downloaded vendor/species index: `(vendor_id, device_id)
/// -> species`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpeciesIndex {
    entries: HashMap<String, u32>,
}

impl SpeciesIndex {
    fn lookup(&self, vendor_id: u32, device_id: u32) -> u32 {
        self.entries
            .get(&format!("{vendor_id:04x}:{device_id:04x}"))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    fetched_at_secs: u64,
    index: SpeciesIndex,
}

/// Probe for PCI-enumerated GPUs and their compute-API bindings. Swappable
/// so tests can supply a fixed device list without touching real hardware.
pub trait DeviceProbe: Send + Sync {
    fn enumerate(&self) -> Vec<GpuDescriptor>;
}

/// No devices found — the registry still functions with a CPU-only resource
/// set, matching a headless or GPU-less host.
pub struct NoDevices;

impl DeviceProbe for NoDevices {
    fn enumerate(&self) -> Vec<GpuDescriptor> {
        Vec::new()
    }
}

pub struct GpuRegistry<P: DeviceProbe = NoDevices> {
    probe: P,
    cache: KvTable,
    backoff: Backoff,
}

impl<P: DeviceProbe> GpuRegistry<P> {
    pub fn new(probe: P, cache: KvTable) -> Self {
        Self {
            probe,
            cache,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(24 * 60 * 60)),
        }
    }

    /// Refresh the vendor/species index (from cache if fresh, else over the
    /// network), then enumerate and match devices. On network failure the
    /// last cached index is reused if present; the call only errors if there
    /// is neither a fresh nor a stale cache to fall back on.
    pub async fn refresh(&mut self, http: &dyn HttpClient) -> Result<Vec<GpuDescriptor>> {
        let index = self.load_index(http).await?;
        let devices = self.probe.enumerate();
        Ok(devices
            .into_iter()
            .map(|mut gpu| {
                gpu.species = index.lookup(gpu.vendor_id, gpu.device_id);
                gpu
            })
            .collect())
    }

    async fn load_index(&mut self, http: &dyn HttpClient) -> Result<SpeciesIndex> {
        if let Some(cached) = self.cached_entry() {
            if self.is_fresh(&cached) {
                return Ok(cached.index);
            }
        }

        match self.fetch_index(http).await {
            Ok(index) => {
                self.backoff.reset();
                self.store_entry(&index)?;
                Ok(index)
            }
            Err(e) => {
                self.backoff.next();
                if let Some(cached) = self.cached_entry() {
                    tracing::warn!(
                        "gpu index refresh failed ({e}), falling back to stale cache"
                    );
                    Ok(cached.index)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn fetch_index(&self, http: &dyn HttpClient) -> Result<SpeciesIndex> {
        let resp = http.get(INDEX_URL).await?;
        if !resp.is_success() {
            return Err(FahError::Transport(format!(
                "gpu index request failed with status {}",
                resp.status
            )));
        }
        serde_json::from_slice(&resp.body)
            .map_err(|e| FahError::Integrity(format!("malformed gpu index: {e}")))
    }

    fn cached_entry(&self) -> Option<CacheEntry> {
        let raw = self.cache.get("gpus.json").ok()??;
        serde_json::from_str(&raw).ok()
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let age = now_secs().saturating_sub(entry.fetched_at_secs);
        Duration::from_secs(age) < CACHE_TTL
    }

    fn store_entry(&self, index: &SpeciesIndex) -> Result<()> {
        let entry = CacheEntry {
            fetched_at_secs: now_secs(),
            index: index.clone(),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
        self.cache.set("gpus.json", &raw)
    }

    pub fn backoff_delay(&self) -> Duration {
        self.backoff.current()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::fake::FakeHttpClient;
    use crate::resource::{ComputeApi, ComputeApiKind};

    struct OneDevice;
    impl DeviceProbe for OneDevice {
        fn enumerate(&self) -> Vec<GpuDescriptor> {
            vec![GpuDescriptor {
                pci_bus: 1,
                pci_slot: 0,
                pci_function: 0,
                vendor_id: 0x10de,
                device_id: 0xabcd,
                vendor_name: "nvidia".into(),
                species: 0,
                compute_apis: vec![ComputeApi {
                    api: ComputeApiKind::Cuda,
                    platform_index: 0,
                    device_index: 0,
                    driver_version: "550".into(),
                    compute_version: "8.9".into(),
                    uuid: None,
                }],
            }]
        }
    }

    fn store() -> (tempfile::TempDir, KvTable) {
        let dir = tempfile::tempdir().unwrap();
        let kv = crate::kv::KvStore::open(dir.path()).unwrap();
        let table = kv.table("cores").unwrap();
        (dir, table)
    }

    #[tokio::test]
    async fn matches_species_from_index() {
        let (_dir, table) = store();
        let http = FakeHttpClient::new();
        http.respond(
            INDEX_URL,
            200,
            serde_json::json!({"entries": {"10de:abcd": 7}}).to_string().into_bytes(),
        );
        let mut registry = GpuRegistry::new(OneDevice, table);
        let gpus = registry.refresh(&http).await.unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].species, 7);
        assert!(gpus[0].is_supported());
    }

    #[tokio::test]
    async fn falls_back_to_stale_cache_on_network_failure() {
        let (_dir, table) = store();
        let http = FakeHttpClient::new();
        http.respond(
            INDEX_URL,
            200,
            serde_json::json!({"entries": {"10de:abcd": 3}}).to_string().into_bytes(),
        );
        let mut registry = GpuRegistry::new(OneDevice, table);
        registry.refresh(&http).await.unwrap();

        http.fail(INDEX_URL, FahError::Transport("down".into()));
        let gpus = registry.refresh(&http).await.unwrap();
        assert_eq!(gpus[0].species, 3);
    }

    #[tokio::test]
    async fn errors_when_no_cache_and_network_down() {
        let (_dir, table) = store();
        let http = FakeHttpClient::new();
        http.fail(INDEX_URL, FahError::Transport("down".into()));
        let mut registry = GpuRegistry::new(OneDevice, table);
        assert!(registry.refresh(&http).await.is_err());
    }
}
