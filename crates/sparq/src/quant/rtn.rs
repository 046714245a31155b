//! Round-to-nearest group quantization.

use sparq_core::{DType, Error, Model, QuantConfig, Result, Tensor};
use tracing::{debug, info};

use super::{Quantizer, SparsityReport};

/// Smallest scale a group may use.
const MIN_SCALE: f32 = 1e-5;

/// Per-group round-to-nearest quantizer.
///
/// With a zero point the grid is `[0, 2^w - 1]` shifted by a per-group zero;
/// without one it is symmetric, `[-2^(w-1), 2^(w-1) - 1]`. Exact zeros stay
/// exactly zero in both modes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtnQuantizer;

/// Grid of one group.
#[derive(Debug, Clone, Copy)]
struct Grid {
    scale: f32,
    zero: f32,
    min_int: f32,
    max_int: f32,
}

impl Grid {
    fn fit(group: &[f32], config: &QuantConfig) -> Self {
        if config.zero_point {
            let max = group.iter().copied().fold(f32::MIN, f32::max);
            let min = group.iter().copied().fold(f32::MAX, f32::min);
            let max_int = config.max_level() as f32;
            let scale = (max - min).max(MIN_SCALE) / max_int;
            let zero = (-(min / scale).round()).clamp(0.0, max_int);
            Self { scale, zero, min_int: 0.0, max_int }
        } else {
            let abs_max = group.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let max_int = ((1u32 << (config.w_bit - 1)) as f32 - 1.0).max(1.0);
            let min_int = -((1u32 << (config.w_bit - 1)) as f32);
            let scale = abs_max.max(MIN_SCALE) / max_int;
            Self { scale, zero: 0.0, min_int, max_int }
        }
    }

    /// Grid level of `value`, clamped to range.
    fn level(&self, value: f32) -> f32 {
        ((value / self.scale).round() + self.zero).clamp(self.min_int, self.max_int)
    }

    fn dequantize(&self, level: f32) -> f32 {
        (level - self.zero) * self.scale
    }
}

/// Rounds `values` onto the grid in place, `group` elements at a time.
pub(crate) fn round_groups(values: &mut [f32], group: usize, config: &QuantConfig) {
    for chunk in values.chunks_mut(group) {
        let grid = Grid::fit(chunk, config);
        for v in chunk.iter_mut() {
            *v = grid.dequantize(grid.level(*v));
        }
    }
}

/// A symmetric grid needs at least two bits to hold both signs.
fn check_levels(config: &QuantConfig) -> Result<()> {
    if config.w_bit < 2 && !config.zero_point {
        return Err(Error::precondition(
            "1-bit quantization requires a zero point",
        ));
    }
    Ok(())
}

/// Rows and row length of a 2-D weight, with its group length.
fn layout(name: &str, tensor: &Tensor, config: &QuantConfig) -> Result<(usize, usize, usize)> {
    let [rows, cols] = tensor.shape[..] else {
        return Err(Error::unsupported(format!("'{name}' is not a 2-D weight")));
    };
    let group = config.group_len(cols)?;
    Ok((rows, cols, group))
}

/// Packs levels of `w_bit` bits each, least significant bit first.
#[must_use]
pub fn pack_levels(levels: &[u8], w_bit: u8) -> Vec<u8> {
    let bits = w_bit as usize;
    let mut out = vec![0u8; (levels.len() * bits).div_ceil(8)];
    for (i, &level) in levels.iter().enumerate() {
        for b in 0..bits {
            if level >> b & 1 == 1 {
                let pos = i * bits + b;
                out[pos / 8] |= 1 << (pos % 8);
            }
        }
    }
    out
}

/// Inverse of [`pack_levels`] for `count` levels.
#[must_use]
pub fn unpack_levels(packed: &[u8], w_bit: u8, count: usize) -> Vec<u8> {
    let bits = w_bit as usize;
    (0..count)
        .map(|i| {
            (0..bits).fold(0u8, |level, b| {
                let pos = i * bits + b;
                let bit = packed.get(pos / 8).map_or(0, |byte| byte >> (pos % 8) & 1);
                level | (bit << b)
            })
        })
        .collect()
}

/// Rebuilds the `[out, in_features]` float weight of a real-quantized module.
pub fn dequantize(model: &Model, module: &str, config: &QuantConfig, in_features: usize) -> Result<Tensor> {
    let get = |suffix: &str| {
        let name = format!("{module}.{suffix}");
        model
            .get(&name)
            .ok_or_else(|| Error::precondition(format!("'{name}' not found")))
    };
    let qweight = get("qweight")?;
    let scales = get("scales")?;
    let packed = qweight
        .as_u8()
        .ok_or_else(|| Error::precondition(format!("'{module}.qweight' has no storage")))?;
    let scale_values = scales
        .as_f32()
        .ok_or_else(|| Error::precondition(format!("'{module}.scales' has no storage")))?;
    let zeros = if config.zero_point {
        Some(
            get("qzeros")?
                .as_u8()
                .ok_or_else(|| Error::precondition(format!("'{module}.qzeros' has no storage")))?,
        )
    } else {
        None
    };

    let rows = qweight.shape[0];
    let row_bytes = qweight.shape[1];
    let cols = in_features;
    let group = config.group_len(cols)?;
    let n_groups = cols / group;
    if scales.shape != [rows, n_groups] || row_bytes != (cols * config.w_bit as usize).div_ceil(8) {
        return Err(Error::shape_mismatch(
            format!("{module}.qweight"),
            rows * cols,
            packed.len() * 8 / config.w_bit as usize,
        ));
    }
    let min_int = if config.zero_point {
        0.0
    } else {
        -((1u32 << (config.w_bit - 1)) as f32)
    };

    let mut values = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let levels = unpack_levels(&packed[r * row_bytes..(r + 1) * row_bytes], config.w_bit, cols);
        for (c, level) in levels.into_iter().enumerate() {
            let g = r * n_groups + c / group;
            let zero = zeros.map_or(0.0, |z| z[g] as f32);
            values.push((level as f32 + min_int - zero) * scale_values[g]);
        }
    }
    let mut tensor = Tensor::from_f32(vec![rows, cols], DType::F16, values)?;
    tensor.device = qweight.device;
    Ok(tensor)
}

impl Quantizer for RtnQuantizer {
    fn fake_quantize(&self, model: &mut Model, config: &QuantConfig) -> Result<SparsityReport> {
        check_levels(config)?;
        info!("pseudo weight quantization (w_bit={})", config.w_bit);
        let mut report = SparsityReport::default();
        let (mut zeros, mut total) = (0usize, 0usize);

        for module in model.quantizable_layers() {
            let name = format!("{module}.weight");
            let Some(weight) = model.get_mut(&name) else {
                continue;
            };
            let (_, _, group) = layout(&name, weight, config)?;
            let values = weight.as_f32_mut().ok_or_else(|| {
                Error::precondition(format!("'{name}' has no storage to quantize"))
            })?;

            round_groups(values, group, config);

            let layer_zeros = values.iter().filter(|&&v| v == 0.0).count();
            let sparsity = if values.is_empty() {
                0.0
            } else {
                layer_zeros as f64 / values.len() as f64
            };
            debug!(layer = %module, sparsity, "quantized");
            zeros += layer_zeros;
            total += values.len();
            report.sparsity_per_layer.insert(module, sparsity);
        }

        report.model_sparsity = if total == 0 {
            0.0
        } else {
            zeros as f64 / total as f64
        };
        info!("model sparsity after quantization: {:.4}", report.model_sparsity);
        Ok(report)
    }

    fn real_quantize(&self, model: &mut Model, config: &QuantConfig, init_only: bool) -> Result<()> {
        check_levels(config)?;
        info!(
            "real weight quantization (w_bit={}, init_only={})",
            config.w_bit, init_only
        );
        for module in model.quantizable_layers() {
            let name = format!("{module}.weight");
            let Some(weight) = model.get(&name) else {
                continue;
            };
            let (rows, cols, group) = layout(&name, weight, config)?;
            let n_groups = cols / group;
            let row_bytes = (cols * config.w_bit as usize).div_ceil(8);
            let device = weight.device;

            let mut parts = if init_only {
                let mut parts = vec![
                    (format!("{module}.qweight"), Tensor::meta(vec![rows, row_bytes], DType::U8)),
                    (format!("{module}.scales"), Tensor::meta(vec![rows, n_groups], DType::F16)),
                ];
                if config.zero_point {
                    parts.push((format!("{module}.qzeros"), Tensor::meta(vec![rows, n_groups], DType::U8)));
                }
                parts
            } else {
                let values = weight.as_f32().ok_or_else(|| {
                    Error::precondition(format!("'{name}' has no storage to quantize"))
                })?;
                let mut qweight = Vec::with_capacity(rows * row_bytes);
                let mut scales = Vec::with_capacity(rows * n_groups);
                let mut qzeros = Vec::with_capacity(rows * n_groups);
                for row in values.chunks(cols) {
                    let mut levels = Vec::with_capacity(cols);
                    for chunk in row.chunks(group) {
                        let grid = Grid::fit(chunk, config);
                        levels.extend(chunk.iter().map(|&v| (grid.level(v) - grid.min_int) as u8));
                        scales.push(grid.scale);
                        qzeros.push(grid.zero as u8);
                    }
                    qweight.extend(pack_levels(&levels, config.w_bit));
                }
                let mut parts = vec![
                    (format!("{module}.qweight"), Tensor::from_u8(vec![rows, row_bytes], qweight)?),
                    (format!("{module}.scales"), Tensor::from_f32(vec![rows, n_groups], DType::F16, scales)?),
                ];
                if config.zero_point {
                    parts.push((format!("{module}.qzeros"), Tensor::from_u8(vec![rows, n_groups], qzeros)?));
                }
                parts
            };
            for (_, tensor) in &mut parts {
                tensor.device = device;
            }
            model.replace(&name, parts);
            debug!(layer = %module, "packed");
        }
        Ok(())
    }
}
