//! Activation-aware weight scaling.
//!
//! A search produces per-channel scales for groups of layers that share an
//! input, plus per-group clipping thresholds. Applying the results rescales
//! the weights so that quantization error lands on unimportant channels.

mod apply;
mod search;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sparq_core::Result;

use crate::io::{load_bincode, save_bincode};

pub use apply::apply_awq;
pub use search::{scale_groups, CalibrationConfig, ScaleGroup, ScaleSearch, WeightOnlySearch};

/// Scales shared by the layers reading the output of `prev_op`.
///
/// `prev_op` output channel `j` is divided by `scales[j]`; input channel `j`
/// of every layer in `layers` is multiplied by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleEntry {
    /// Module producing the scaled activations (norm or linear).
    pub prev_op: String,
    /// Linear modules consuming them.
    pub layers: Vec<String>,
    /// One scale per channel.
    pub scales: Vec<f32>,
}

/// Clipping thresholds of one linear module, `[out, n_groups]` row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipEntry {
    /// Linear module.
    pub layer: String,
    /// Absolute clip value per (row, group).
    pub max_val: Vec<f32>,
}

/// Output of a scale search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwqResults {
    /// Scale entries, in application order.
    pub scales: Vec<ScaleEntry>,
    /// Clip entries, applied after all scales.
    pub clips: Vec<ClipEntry>,
}

impl AwqResults {
    /// Loads results from a bincode file.
    pub fn load(path: &Path) -> Result<Self> {
        load_bincode(path)
    }

    /// Saves results to a bincode file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_bincode(path, self)
    }
}
