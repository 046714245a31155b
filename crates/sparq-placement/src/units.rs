//! Atomic placement units.

use indexmap::IndexMap;
use sparq_core::{module_of, Model};

/// A group of parameters that must land on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementUnit {
    /// Decoder block or module path.
    pub name: String,
    /// Member parameters, in model order.
    pub params: Vec<String>,
    /// Storage footprint of all members.
    pub bytes: u64,
}

/// Unit that owns `param`: its decoder block if it lives in one, otherwise its module.
#[must_use]
pub fn unit_of(model: &Model, param: &str) -> String {
    model
        .block_of(param)
        .unwrap_or_else(|| module_of(param).to_string())
}

/// Splits a model into placement units, in first-appearance order.
///
/// Decoder blocks of the architecture's block container are never split, and
/// they keep numeric block order (`layers.2` before `layers.10`) whatever
/// order the checkpoint lists them in. Tied aliases own no storage and add
/// nothing.
#[must_use]
pub fn placement_units(model: &Model) -> Vec<PlacementUnit> {
    let mut units: IndexMap<String, PlacementUnit> = IndexMap::new();
    for (name, tensor) in model.named_parameters() {
        let key = unit_of(model, name);
        let unit = units.entry(key.clone()).or_insert_with(|| PlacementUnit {
            name: key,
            params: Vec::new(),
            bytes: 0,
        });
        unit.params.push(name.to_string());
        unit.bytes += tensor.size_bytes();
    }
    let mut units: Vec<PlacementUnit> = units.into_values().collect();

    // Block units are reordered among the slots block units already occupy.
    let slots: Vec<usize> = units
        .iter()
        .enumerate()
        .filter(|(_, unit)| {
            unit.params
                .first()
                .and_then(|param| model.block_of(param))
                .is_some_and(|block| block == unit.name)
        })
        .map(|(i, _)| i)
        .collect();
    let mut blocks: Vec<PlacementUnit> = slots.iter().map(|&i| units[i].clone()).collect();
    blocks.sort_by_key(|unit| block_index(&unit.name));
    for (slot, unit) in slots.into_iter().zip(blocks) {
        units[slot] = unit;
    }
    units
}

/// Numeric index of a block unit name (`model.layers.7` gives 7).
fn block_index(unit: &str) -> Option<usize> {
    unit.rsplit('.').next()?.parse().ok()
}
