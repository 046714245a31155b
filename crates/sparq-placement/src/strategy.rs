//! Device maps and the strategies that produce them.

use indexmap::IndexMap;
use sparq_core::{Device, Error, Result};
use tracing::debug;

use crate::memory::MaxMemory;
use crate::units::PlacementUnit;

/// Placement unit name -> target device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    assignments: IndexMap<String, Device>,
}

impl DeviceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a unit to a device.
    pub fn assign(&mut self, unit: impl Into<String>, device: Device) {
        self.assignments.insert(unit.into(), device);
    }

    /// Device of a unit.
    #[must_use]
    pub fn get(&self, unit: &str) -> Option<Device> {
        self.assignments.get(unit).copied()
    }

    /// Iterates assignments in unit order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Device)> {
        self.assignments.iter().map(|(u, d)| (u.as_str(), *d))
    }

    /// Number of assigned units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Returns true if nothing is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Bytes assigned to each device.
    #[must_use]
    pub fn usage(&self, units: &[PlacementUnit]) -> IndexMap<Device, u64> {
        let mut usage: IndexMap<Device, u64> = IndexMap::new();
        for unit in units {
            if let Some(device) = self.get(&unit.name) {
                *usage.entry(device).or_default() += unit.bytes;
            }
        }
        usage.sort_keys();
        usage
    }

    /// Checks that every unit is placed exactly once and no budget is exceeded.
    ///
    /// Disk is unbounded unless it has a budget. Any other device without a
    /// budget cannot hold anything.
    pub fn verify(&self, units: &[PlacementUnit], budgets: &MaxMemory) -> Result<()> {
        if self.assignments.len() != units.len() {
            return Err(Error::placement(format!(
                "device map places {} units, model has {}",
                self.assignments.len(),
                units.len()
            )));
        }
        for unit in units {
            if self.get(&unit.name).is_none() {
                return Err(Error::placement(format!("unit '{}' is not placed", unit.name)));
            }
        }
        for (device, used) in self.usage(units) {
            let limit = match (device, budgets.get(device)) {
                (_, Some(limit)) => limit,
                (Device::Disk, None) => u64::MAX,
                (_, None) => 0,
            };
            if used > limit {
                return Err(Error::placement(format!(
                    "device {device} holds {used} bytes, budget is {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// Computes a device map from placement units and budgets.
pub trait PlacementStrategy {
    /// Places every unit on exactly one device within its budget.
    fn place(&self, units: &[PlacementUnit], budgets: &MaxMemory) -> Result<DeviceMap>;
}

/// Fills devices in order (accelerators by id, host, disk), moving on when a
/// unit does not fit the current device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialFill;

impl PlacementStrategy for SequentialFill {
    fn place(&self, units: &[PlacementUnit], budgets: &MaxMemory) -> Result<DeviceMap> {
        let mut targets: Vec<(Device, u64)> = budgets.iter().filter(|(_, b)| *b > 0).collect();
        if budgets.get(Device::Disk).is_none() {
            targets.push((Device::Disk, u64::MAX));
        }

        let mut map = DeviceMap::new();
        let mut current = 0;
        for unit in units {
            while current < targets.len() && unit.bytes > targets[current].1 {
                current += 1;
            }
            let Some((device, remaining)) = targets.get_mut(current) else {
                return Err(Error::placement(format!(
                    "unit '{}' ({} bytes) fits no remaining device",
                    unit.name, unit.bytes
                )));
            };
            *remaining -= unit.bytes;
            map.assign(unit.name.clone(), *device);
        }

        debug!(usage = ?map.usage(units), "sequential placement");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(sizes: &[u64]) -> Vec<PlacementUnit> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &bytes)| PlacementUnit {
                name: format!("block.{i}"),
                params: vec![format!("block.{i}.weight")],
                bytes,
            })
            .collect()
    }

    #[test]
    fn test_fills_in_order() {
        let units = units(&[40, 40, 40, 40]);
        let budgets = MaxMemory::parse(&["0:100", "1:50", "cpu:1000"]).unwrap();
        let map = SequentialFill.place(&units, &budgets).unwrap();

        let devices: Vec<Device> = map.iter().map(|(_, d)| d).collect();
        assert_eq!(
            devices,
            vec![
                Device::Accelerator(0),
                Device::Accelerator(0),
                Device::Accelerator(1),
                Device::Host
            ]
        );
        map.verify(&units, &budgets).unwrap();
    }

    #[test]
    fn test_overflow_to_disk() {
        let units = units(&[60, 60]);
        let budgets = MaxMemory::parse(&["cpu:100"]).unwrap();
        let map = SequentialFill.place(&units, &budgets).unwrap();
        assert_eq!(map.get("block.0"), Some(Device::Host));
        assert_eq!(map.get("block.1"), Some(Device::Disk));
    }

    #[test]
    fn test_bounded_disk_can_be_infeasible() {
        let units = units(&[60, 60]);
        let budgets = MaxMemory::parse(&["cpu:100", "disk:10"]).unwrap();
        let err = SequentialFill.place(&units, &budgets).unwrap_err();
        assert_eq!(err.category(), "placement");
    }

    #[test]
    fn test_verify_rejects_over_budget() {
        let units = units(&[60]);
        let budgets = MaxMemory::parse(&["0:50"]).unwrap();
        let mut map = DeviceMap::new();
        map.assign("block.0", Device::Accelerator(0));
        assert!(map.verify(&units, &budgets).is_err());

        let mut missing = DeviceMap::new();
        missing.assign("other", Device::Disk);
        assert!(missing.verify(&units, &budgets).is_err());
    }
}
