//! # sparq placement
//!
//! Decides where every parameter of a model lives and moves it there.
//!
//! ```text
//!  Model ──► placement_units ──► balanced_memory ──► PlacementStrategy ──► DeviceMap ──► dispatch
//!            (blocks unsplit)    (even split, 0.8)    (SequentialFill)                   (+ OffloadStore)
//! ```
//!
//! Decoder blocks are atomic: a block and all of its parameters always land
//! on the same device. Devices are filled in order accelerators, host, disk.

mod dispatch;
mod memory;
mod offload;
mod strategy;
mod units;

pub use dispatch::dispatch;
pub use memory::{
    balanced_memory, parse_size, DeviceInventory, MaxMemory, ACCELERATOR_HEADROOM,
    FALLBACK_HOST_MEMORY,
};
pub use offload::{Encoding, OffloadEntry, OffloadStore};
pub use strategy::{DeviceMap, PlacementStrategy, SequentialFill};
pub use units::{placement_units, unit_of, PlacementUnit};
