//! Applying searched scales and clips to model weights.

use sparq_core::{Error, Model, Result, Tensor};
use tracing::info;

use super::{AwqResults, ClipEntry, ScaleEntry};

/// Applies every scale entry, then every clip entry, in place.
///
/// Each entry is validated against the model before it mutates anything.
/// The change is permanent.
pub fn apply_awq(model: &mut Model, results: &AwqResults) -> Result<()> {
    for entry in &results.scales {
        apply_scale(model, entry)?;
    }
    for entry in &results.clips {
        apply_clip(model, entry)?;
    }
    info!(
        "Applied {} scale and {} clip entries",
        results.scales.len(),
        results.clips.len()
    );
    Ok(())
}

pub(crate) fn apply_scale(model: &mut Model, entry: &ScaleEntry) -> Result<()> {
    let s = &entry.scales;
    let prev_name = format!("{}.weight", entry.prev_op);
    let prev = weight(model, &prev_name)?;
    let first_row = match prev.shape[..] {
        [channels] if channels == s.len() => 0,
        [rows, _] if rows >= s.len() => rows - s.len(),
        _ => return Err(Error::shape_mismatch(prev_name, s.len(), prev.shape.first().copied().unwrap_or(0))),
    };
    for layer in &entry.layers {
        let name = format!("{layer}.weight");
        let tensor = weight(model, &name)?;
        match tensor.shape[..] {
            [_, cols] if cols == s.len() => {}
            _ => return Err(Error::shape_mismatch(name, s.len(), tensor.shape.last().copied().unwrap_or(0))),
        }
    }

    // prev_op: divide its trailing output channels.
    let prev = weight_mut(model, &prev_name)?;
    let row_len = if prev.shape.len() == 2 { prev.shape[1] } else { 1 };
    let values = floats(prev, &prev_name)?;
    for (j, &scale) in s.iter().enumerate() {
        let row = first_row + j;
        for v in &mut values[row * row_len..(row + 1) * row_len] {
            *v /= scale;
        }
    }
    let bias_name = format!("{}.bias", entry.prev_op);
    if let Some(bias) = model.get_mut(&bias_name) {
        let values = floats(bias, &bias_name)?;
        for (j, &scale) in s.iter().enumerate() {
            if let Some(v) = values.get_mut(first_row + j) {
                *v /= scale;
            }
        }
    }

    // Consumers: multiply their input channels.
    for layer in &entry.layers {
        let name = format!("{layer}.weight");
        let values = floats(weight_mut(model, &name)?, &name)?;
        for row in values.chunks_mut(s.len()) {
            for (v, &scale) in row.iter_mut().zip(s) {
                *v *= scale;
            }
        }
    }
    Ok(())
}

pub(crate) fn apply_clip(model: &mut Model, entry: &ClipEntry) -> Result<()> {
    let name = format!("{}.weight", entry.layer);
    let tensor = weight_mut(model, &name)?;
    let [rows, cols] = tensor.shape[..] else {
        return Err(Error::unsupported(format!("'{name}' is not a 2-D weight")));
    };
    let n = entry.max_val.len();
    if n == 0 || n % rows != 0 || cols % (n / rows) != 0 {
        return Err(Error::shape_mismatch(name, rows, n));
    }
    let group = cols / (n / rows);
    let values = floats(tensor, &name)?;
    for (chunk, &limit) in values.chunks_mut(group).zip(&entry.max_val) {
        for v in chunk {
            *v = v.clamp(-limit, limit);
        }
    }
    Ok(())
}

fn weight<'a>(model: &'a Model, name: &str) -> Result<&'a Tensor> {
    model
        .get(name)
        .ok_or_else(|| Error::precondition(format!("AWQ results reference unknown parameter '{name}'")))
}

fn weight_mut<'a>(model: &'a mut Model, name: &str) -> Result<&'a mut Tensor> {
    model
        .get_mut(name)
        .ok_or_else(|| Error::precondition(format!("AWQ results reference unknown parameter '{name}'")))
}

fn floats<'a>(tensor: &'a mut Tensor, name: &str) -> Result<&'a mut [f32]> {
    if tensor.is_meta() {
        return Err(Error::precondition(format!("'{name}' has no storage")));
    }
    let dtype = tensor.dtype;
    tensor
        .as_f32_mut()
        .ok_or_else(|| Error::unsupported(format!("cannot scale '{name}' with {} storage", dtype.tag())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparq_core::{DType, ModelConfig};

    fn model() -> Model {
        let mut model = Model::new("toy", ModelConfig::default());
        model.insert("norm.weight", Tensor::from_f32(vec![2], DType::F32, vec![2.0, 4.0]).unwrap());
        model.insert("fc.weight", Tensor::from_f32(vec![3, 2], DType::F32, vec![1.0; 6]).unwrap());
        model.insert("fc.bias", Tensor::from_f32(vec![3], DType::F32, vec![3.0; 3]).unwrap());
        model.insert("out.weight", Tensor::from_f32(vec![1, 2], DType::F32, vec![1.0, 1.0]).unwrap());
        model
    }

    #[test]
    fn test_norm_scale_preserves_product() {
        let mut model = model();
        let results = AwqResults {
            scales: vec![ScaleEntry {
                prev_op: "norm".into(),
                layers: vec!["fc".into()],
                scales: vec![2.0, 0.5],
            }],
            clips: vec![],
        };
        apply_awq(&mut model, &results).unwrap();
        assert_eq!(model.get("norm.weight").unwrap().as_f32().unwrap(), &[1.0, 8.0]);
        assert_eq!(model.get("fc.weight").unwrap().as_f32().unwrap(), &[2.0, 0.5, 2.0, 0.5, 2.0, 0.5]);
    }

    #[test]
    fn test_linear_prev_scales_trailing_rows_and_bias() {
        let mut model = model();
        let entry = ScaleEntry {
            prev_op: "fc".into(),
            layers: vec!["out".into()],
            scales: vec![2.0, 4.0],
        };
        apply_scale(&mut model, &entry).unwrap();
        assert_eq!(model.get("fc.weight").unwrap().as_f32().unwrap(), &[1.0, 1.0, 0.5, 0.5, 0.25, 0.25]);
        assert_eq!(model.get("fc.bias").unwrap().as_f32().unwrap(), &[3.0, 1.5, 0.75]);
        assert_eq!(model.get("out.weight").unwrap().as_f32().unwrap(), &[2.0, 4.0]);
    }

    #[test]
    fn test_clip_per_group() {
        let mut model = model();
        model.insert("fc.weight", Tensor::from_f32(vec![1, 4], DType::F32, vec![-3.0, 1.0, 5.0, -0.5]).unwrap());
        let entry = ClipEntry {
            layer: "fc".into(),
            max_val: vec![2.0, 1.0],
        };
        apply_clip(&mut model, &entry).unwrap();
        assert_eq!(model.get("fc.weight").unwrap().as_f32().unwrap(), &[-2.0, 1.0, 1.0, -0.5]);
    }

    #[test]
    fn test_rejects_before_mutating() {
        let mut model = model();
        let entry = ScaleEntry {
            prev_op: "norm".into(),
            layers: vec!["fc".into(), "missing".into()],
            scales: vec![2.0, 2.0],
        };
        assert_eq!(apply_scale(&mut model, &entry).unwrap_err().category(), "precondition");
        assert_eq!(model.get("norm.weight").unwrap().as_f32().unwrap(), &[2.0, 4.0]);

        let wrong = ScaleEntry {
            prev_op: "norm".into(),
            layers: vec!["fc".into()],
            scales: vec![1.0; 3],
        };
        assert_eq!(apply_scale(&mut model, &wrong).unwrap_err().category(), "shape_mismatch");
    }
}
