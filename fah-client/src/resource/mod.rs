// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Resource data model: the CPU pseudo-device and GPU descriptors that
//! groups allocate against, plus the registry that discovers GPUs.

mod gpu_registry;

pub use gpu_registry::GpuRegistry;

use serde::{Deserialize, Serialize};

/// A GPU's compute-API binding (OpenCL/CUDA/HIP), one per API that
/// enumerated the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeApi {
    pub api: ComputeApiKind,
    pub platform_index: u32,
    pub device_index: u32,
    pub driver_version: String,
    pub compute_version: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeApiKind {
    OpenCl,
    Cuda,
    Hip,
}

/// A PCI-enumerated GPU, optionally matched against the downloaded
/// vendor/species index and bound to zero or more compute APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub pci_bus: u32,
    pub pci_slot: u32,
    pub pci_function: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub vendor_name: String,
    /// Model family as assigned by the vendor/species index; 0 means unknown.
    pub species: u32,
    pub compute_apis: Vec<ComputeApi>,
}

impl GpuDescriptor {
    /// A GPU is supported iff the index assigned a non-zero species AND at
    /// least one compute API enumerated it. See spec.md §3.
    pub fn is_supported(&self) -> bool {
        self.species != 0 && !self.compute_apis.is_empty()
    }

    /// Stable identifier used in Config's per-GPU enable map and in WU
    /// assignments: `bus:slot:function`.
    pub fn gpu_id(&self) -> String {
        format!("{:02x}:{:02x}.{}", self.pci_bus, self.pci_slot, self.pci_function)
    }
}

/// A schedulable resource: the logical CPU pool or a specific GPU.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Cpu { logical_cpus: u32 },
    Gpu(GpuDescriptor),
}
