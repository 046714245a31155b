//! Weight-only scale and clip search.
//!
//! The search never sees activations. Per-channel importance is estimated
//! from the operator feeding each layer group: the magnitude of a norm's
//! gain, or the mean magnitude of a linear layer's output rows.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sparq_core::{Architecture, Error, Model, QuantConfig, Result, Tensor};
use tracing::{debug, info};

use super::apply::{apply_clip, apply_scale};
use super::{AwqResults, ClipEntry, ScaleEntry};
use crate::quant::round_groups;

/// Calibration parameters handed to the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Calibration samples.
    pub n_samples: usize,
    /// Tokens per sample.
    pub seqlen: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            n_samples: 128,
            seqlen: 512,
        }
    }
}

/// Produces AWQ results for a model.
///
/// Implementations may modify the model while searching; the caller is
/// expected to discard it afterwards.
pub trait ScaleSearch {
    /// Runs the search.
    fn search(
        &self,
        model: &mut Model,
        config: &QuantConfig,
        calibration: &CalibrationConfig,
    ) -> Result<AwqResults>;
}

/// Layers sharing one input, and the operator that produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleGroup {
    /// Producing module.
    pub prev_op: String,
    /// Consuming linear modules.
    pub layers: Vec<String>,
}

/// Grid search over the scale exponent, then over the clip ratio.
#[derive(Debug, Clone, Copy)]
pub struct WeightOnlySearch {
    /// Grid points per search.
    pub grid: usize,
    /// Largest fraction of a group's range that clipping may remove.
    pub max_shrink: f32,
}

impl Default for WeightOnlySearch {
    fn default() -> Self {
        Self {
            grid: 20,
            max_shrink: 0.5,
        }
    }
}

impl ScaleSearch for WeightOnlySearch {
    fn search(
        &self,
        model: &mut Model,
        config: &QuantConfig,
        calibration: &CalibrationConfig,
    ) -> Result<AwqResults> {
        info!(
            n_samples = calibration.n_samples,
            seqlen = calibration.seqlen,
            w_bit = config.w_bit,
            "Running weight-only scale search"
        );
        let mut results = AwqResults::default();

        for group in scale_groups(model) {
            let entry = self.search_scale(model, &group, config)?;
            apply_scale(model, &entry)?;
            results.scales.push(entry);
        }

        for layer in model.quantizable_layers() {
            if skips_clip(&layer) {
                continue;
            }
            let entry = self.search_clip(model, &layer, config)?;
            apply_clip(model, &entry)?;
            results.clips.push(entry);
        }

        info!(
            "Search found {} scale and {} clip entries",
            results.scales.len(),
            results.clips.len()
        );
        Ok(results)
    }
}

impl WeightOnlySearch {
    fn search_scale(
        &self,
        model: &Model,
        group: &ScaleGroup,
        config: &QuantConfig,
    ) -> Result<ScaleEntry> {
        let importance = importance(model, &group.prev_op)?;
        let weights = group
            .layers
            .iter()
            .map(|layer| {
                let name = format!("{layer}.weight");
                let tensor = param(model, &name)?;
                Ok((values(tensor, &name)?, config.group_len(importance.len())?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut best: Option<(f64, Vec<f32>)> = None;
        for step in 0..self.grid {
            let ratio = step as f32 / self.grid as f32;
            let scales = scales_for(&importance, ratio);
            let loss: f64 = weights
                .iter()
                .map(|(w, group_len)| scaled_loss(w, &scales, &importance, *group_len, config))
                .sum();
            if best.as_ref().map_or(true, |(b, _)| loss < *b) {
                best = Some((loss, scales));
            }
        }
        let scales = best.map_or_else(|| vec![1.0; importance.len()], |(_, s)| s);
        debug!(prev_op = %group.prev_op, layers = group.layers.len(), "scale searched");

        Ok(ScaleEntry {
            prev_op: group.prev_op.clone(),
            layers: group.layers.clone(),
            scales,
        })
    }

    fn search_clip(&self, model: &Model, layer: &str, config: &QuantConfig) -> Result<ClipEntry> {
        let name = format!("{layer}.weight");
        let tensor = param(model, &name)?;
        let [_, cols] = tensor.shape[..] else {
            return Err(Error::unsupported(format!("'{name}' is not a 2-D weight")));
        };
        let group = config.group_len(cols)?;
        let steps = (self.grid as f32 * self.max_shrink) as usize;

        let mut max_val = Vec::new();
        let mut scratch = vec![0.0f32; group];
        for chunk in values(tensor, &name)?.chunks(group) {
            let absmax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let mut best = (f64::INFINITY, absmax);
            for step in 0..steps.max(1) {
                let limit = absmax * (1.0 - step as f32 / self.grid as f32);
                for (dst, src) in scratch.iter_mut().zip(chunk) {
                    *dst = src.clamp(-limit, limit);
                }
                round_groups(&mut scratch, group, config);
                let err: f64 = chunk
                    .iter()
                    .zip(&scratch)
                    .map(|(a, b)| f64::from(a - b).powi(2))
                    .sum();
                if err < best.0 {
                    best = (err, limit);
                }
            }
            max_val.push(best.1);
        }

        Ok(ClipEntry {
            layer: layer.to_string(),
            max_val,
        })
    }
}

/// Scale groups of every decoder block, in block order.
///
/// Groups whose modules are missing or whose shapes do not line up are
/// skipped.
pub fn scale_groups(model: &Model) -> Vec<ScaleGroup> {
    let arch = model.architecture();
    let blocks: IndexSet<String> = model
        .named_parameters()
        .filter_map(|(name, _)| model.block_of(name))
        .collect();

    blocks
        .iter()
        .flat_map(|block| block_groups(arch, block))
        .filter(|group| is_compatible(model, group))
        .collect()
}

fn block_groups(arch: Architecture, block: &str) -> Vec<ScaleGroup> {
    let table: &[(&str, &[&str])] = match arch {
        Architecture::Llama => &[
            ("input_layernorm", &["self_attn.q_proj", "self_attn.k_proj", "self_attn.v_proj"]),
            ("self_attn.v_proj", &["self_attn.o_proj"]),
            ("post_attention_layernorm", &["mlp.gate_proj", "mlp.up_proj"]),
            ("mlp.up_proj", &["mlp.down_proj"]),
        ],
        Architecture::Opt => &[
            ("self_attn_layer_norm", &["self_attn.q_proj", "self_attn.k_proj", "self_attn.v_proj"]),
            ("self_attn.v_proj", &["self_attn.out_proj"]),
            ("final_layer_norm", &["fc1"]),
            ("fc1", &["fc2"]),
        ],
        Architecture::Bloom => &[
            ("input_layernorm", &["self_attention.query_key_value"]),
            ("post_attention_layernorm", &["mlp.dense_h_to_4h"]),
        ],
        Architecture::Mpt => &[("norm_1", &["attn.Wqkv"]), ("norm_2", &["ffn.up_proj"])],
        Architecture::Generic => &[],
    };
    table
        .iter()
        .map(|(prev, layers)| ScaleGroup {
            prev_op: format!("{block}.{prev}"),
            layers: layers.iter().map(|l| format!("{block}.{l}")).collect(),
        })
        .collect()
}

fn is_compatible(model: &Model, group: &ScaleGroup) -> bool {
    let Some(prev) = model.get(&format!("{}.weight", group.prev_op)) else {
        return false;
    };
    let channels = match prev.shape[..] {
        [channels] | [channels, _] => channels,
        _ => return false,
    };
    group.layers.iter().all(|layer| {
        model
            .get(&format!("{layer}.weight"))
            .is_some_and(|w| w.shape.len() == 2 && w.shape[1] == channels)
    })
}

/// Clipping the query/key projections distorts attention scores.
fn skips_clip(layer: &str) -> bool {
    let leaf = layer.rsplit('.').next().unwrap_or(layer);
    matches!(leaf, "q_proj" | "k_proj" | "query_key_value" | "Wqkv")
}

fn importance(model: &Model, prev_op: &str) -> Result<Vec<f32>> {
    let name = format!("{prev_op}.weight");
    let tensor = param(model, &name)?;
    let data = values(tensor, &name)?;
    Ok(match tensor.shape[..] {
        [_] => data.iter().map(|v| v.abs()).collect(),
        [_, cols] => data
            .chunks(cols)
            .map(|row| row.iter().map(|v| v.abs()).sum::<f32>() / cols as f32)
            .collect(),
        _ => return Err(Error::unsupported(format!("'{name}' cannot feed a scale group"))),
    })
}

fn scales_for(importance: &[f32], ratio: f32) -> Vec<f32> {
    let mut scales: Vec<f32> = importance.iter().map(|x| x.powf(ratio).max(1e-4)).collect();
    let max = scales.iter().copied().fold(f32::MIN, f32::max);
    let min = scales.iter().copied().fold(f32::MAX, f32::min);
    let norm = (max * min).sqrt();
    if norm.is_finite() && norm > 0.0 {
        for s in &mut scales {
            *s /= norm;
        }
    }
    scales
}

/// Importance-weighted error of quantizing `w` after scaling its columns.
fn scaled_loss(
    w: &[f32],
    scales: &[f32],
    importance: &[f32],
    group: usize,
    config: &QuantConfig,
) -> f64 {
    let cols = scales.len();
    let mut scaled: Vec<f32> = w
        .chunks(cols)
        .flat_map(|row| row.iter().zip(scales).map(|(v, s)| v * s))
        .collect();
    round_groups(&mut scaled, group, config);
    w.iter()
        .zip(&scaled)
        .enumerate()
        .map(|(i, (orig, q))| {
            let j = i % cols;
            f64::from(importance[j] * (orig - q / scales[j])).powi(2)
        })
        .sum()
}

fn param<'a>(model: &'a Model, name: &str) -> Result<&'a Tensor> {
    model
        .get(name)
        .ok_or_else(|| Error::precondition(format!("missing parameter '{name}'")))
}

fn values<'a>(tensor: &'a Tensor, name: &str) -> Result<&'a [f32]> {
    if tensor.is_meta() {
        return Err(Error::precondition(format!(
            "cannot search '{name}': parameter has no materialized storage"
        )));
    }
    tensor
        .as_f32()
        .ok_or_else(|| Error::unsupported(format!("cannot search '{name}' with {} storage", tensor.dtype.tag())))
}
