//! Weight quantization backends.
//!
//! Two modes share one config:
//!
//! - **fake**: weights are rounded onto the quantization grid and stored
//!   back as floats. The model stays usable for evaluation and the pass
//!   reports how sparse the quantized weights are.
//! - **real**: each quantizable `X.weight` is replaced by packed levels
//!   `X.qweight`, per-group `X.scales` and, with a zero point, `X.qzeros`.
//!   The float weights are gone afterwards.

mod rtn;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sparq_core::{Model, QuantConfig, Result};

pub(crate) use rtn::round_groups;
pub use rtn::{dequantize, pack_levels, unpack_levels, RtnQuantizer};

/// Zero fractions after fake quantization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityReport {
    /// Zero fraction per quantized layer (module name).
    pub sparsity_per_layer: IndexMap<String, f64>,
    /// Zero fraction over all quantized layers.
    pub model_sparsity: f64,
}

/// A quantization kernel.
pub trait Quantizer {
    /// Rounds every quantizable weight onto the grid in place.
    fn fake_quantize(&self, model: &mut Model, config: &QuantConfig) -> Result<SparsityReport>;

    /// Replaces every quantizable weight with its packed representation.
    ///
    /// With `init_only`, placeholders of the packed layout are created
    /// instead, ready to be filled from a checkpoint.
    fn real_quantize(&self, model: &mut Model, config: &QuantConfig, init_only: bool) -> Result<()>;
}
