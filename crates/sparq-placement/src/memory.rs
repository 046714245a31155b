//! Per-device memory budgets.

use std::fs;

use indexmap::IndexMap;
use sparq_core::{Device, Error, Result};
use tracing::{debug, warn};

use crate::units::PlacementUnit;

/// Fraction of each balanced accelerator budget left available to weights.
///
/// The remainder is kept free for activations during evaluation.
pub const ACCELERATOR_HEADROOM: f64 = 0.8;

/// Host memory assumed when `/proc/meminfo` is unavailable.
pub const FALLBACK_HOST_MEMORY: u64 = 16 * GIB;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Byte limits per placement target, in fill order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxMemory {
    limits: IndexMap<Device, u64>,
}

impl MaxMemory {
    /// Creates an empty budget set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `device:size` entries such as `0:10GiB`, `cpu:30GiB` or `disk:1TB`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut out = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (key, size) = entry.rsplit_once(':').ok_or_else(|| {
                Error::precondition(format!("max memory entry '{entry}' is not of the form device:size"))
            })?;
            out.set(key.parse()?, parse_size(size)?);
        }
        Ok(out)
    }

    /// Sets the limit of a device.
    pub fn set(&mut self, device: Device, bytes: u64) {
        self.limits.insert(device, bytes);
        self.limits.sort_keys();
    }

    /// Limit of a device, if budgeted.
    #[must_use]
    pub fn get(&self, device: Device) -> Option<u64> {
        self.limits.get(&device).copied()
    }

    /// Iterates budgets in fill order.
    pub fn iter(&self) -> impl Iterator<Item = (Device, u64)> + '_ {
        self.limits.iter().map(|(d, b)| (*d, *b))
    }

    /// Accelerator ids with a non-zero budget, ascending.
    #[must_use]
    pub fn accelerators(&self) -> Vec<usize> {
        self.limits
            .iter()
            .filter_map(|(d, b)| match d {
                Device::Accelerator(id) if *b > 0 => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Number of budgeted devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Returns true if nothing is budgeted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Scales every accelerator budget by `factor`, rounding down.
    pub fn derate_accelerators(&mut self, factor: f64) {
        for (device, bytes) in self.limits.iter_mut() {
            if device.is_accelerator() {
                *bytes = (*bytes as f64 * factor) as u64;
            }
        }
    }
}

/// Parses a byte size: plain bytes, decimal `KB/MB/GB/TB` or binary `KiB/MiB/GiB/TiB`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let invalid = || Error::precondition(format!("invalid memory size '{s}'"));

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => KIB,
        "MIB" => MIB,
        "GIB" => GIB,
        "TIB" => 1024 * GIB,
        _ => return Err(invalid()),
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    Ok((value * multiplier as f64) as u64)
}

/// Devices available to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInventory {
    /// Accelerator id -> capacity in bytes.
    pub accelerators: IndexMap<usize, u64>,
    /// Host memory in bytes.
    pub host: u64,
}

impl DeviceInventory {
    /// Builds an inventory from configured accelerators and detected host memory.
    pub fn detect(accelerators: &MaxMemory) -> Self {
        let host = host_memory().unwrap_or_else(|| {
            warn!(
                "could not read host memory, assuming {} GiB",
                FALLBACK_HOST_MEMORY / GIB
            );
            FALLBACK_HOST_MEMORY
        });
        let mut inventory = Self {
            accelerators: IndexMap::new(),
            host,
        };
        for (device, bytes) in accelerators.iter() {
            if let Device::Accelerator(id) = device {
                inventory.accelerators.insert(id, bytes);
            }
        }
        inventory.accelerators.sort_keys();
        debug!(
            host_bytes = inventory.host,
            accelerators = inventory.accelerators.len(),
            "detected device inventory"
        );
        inventory
    }

    /// Full capacity of every device. Disk is left unbudgeted.
    #[must_use]
    pub fn max_memory(&self) -> MaxMemory {
        let mut out = MaxMemory::new();
        for (&id, &bytes) in &self.accelerators {
            out.set(Device::Accelerator(id), bytes);
        }
        out.set(Device::Host, self.host);
        out
    }
}

fn host_memory() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let field = |key: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(key)?.strip_prefix(':')?;
            let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            Some(kib * KIB)
        })
    };
    field("MemAvailable").or_else(|| field("MemTotal"))
}

/// Budgets that spread the model evenly across accelerators.
///
/// Every accelerator but the last is capped at `total / n + largest unit`
/// (or its capacity, whichever is smaller); the last accelerator and the
/// host keep their full capacity. Accelerator budgets are then derated by
/// [`ACCELERATOR_HEADROOM`].
///
/// With no accelerators the budgets are returned unchanged.
pub fn balanced_memory(
    units: &[PlacementUnit],
    max_memory: Option<&MaxMemory>,
    inventory: &DeviceInventory,
) -> MaxMemory {
    let mut budgets = max_memory.cloned().unwrap_or_else(|| inventory.max_memory());
    let accelerators = budgets.accelerators();

    if !accelerators.is_empty() {
        let total: u64 = units.iter().map(|u| u.bytes).sum();
        let buffer = units.iter().map(|u| u.bytes).max().unwrap_or(0);
        let per_device = total / accelerators.len() as u64 + buffer;

        for &id in &accelerators[..accelerators.len() - 1] {
            let device = Device::Accelerator(id);
            let cap = budgets.get(device).unwrap_or(0);
            budgets.set(device, per_device.min(cap));
        }
    }

    budgets.derate_accelerators(ACCELERATOR_HEADROOM);
    debug!(?budgets, "balanced memory budgets");
    budgets
}
