//! Zeroing masked parameter elements in place.

use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use sparq_core::{Error, Model, Result, Tensor};
use tracing::info;

use crate::codec::unpack_named;
use crate::dictionary::MaskDictionary;

/// Outcome of a mask application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskReport {
    /// Masked element count per parameter, in model order.
    pub per_param: IndexMap<String, usize>,
    /// Total masked elements.
    pub total_zeroed: usize,
}

/// Loads a mask dictionary from `path` and applies it to `model`.
pub fn apply_mask_file(model: &mut Model, path: &Path) -> Result<MaskReport> {
    info!("Applying mask dict {}", path.display());
    let dict = MaskDictionary::load(path)?;
    apply_mask(model, &dict)
}

/// Zeroes every masked element of the matching parameters.
///
/// Parameters are visited in model order. Each dictionary entry is consumed
/// by the parameter of the same name; entries left over after the full pass
/// fail with [`Error::UnconsumedMask`]. Parameters visited before that check
/// have already been modified: the mutation is not rolled back.
///
/// Applying the same dictionary twice leaves the model unchanged the second
/// time.
pub fn apply_mask(model: &mut Model, dict: &MaskDictionary) -> Result<MaskReport> {
    let mut remaining: IndexSet<&str> = dict.names().collect();
    let mut report = MaskReport::default();

    for (name, param) in model.named_parameters_mut() {
        let Some(encoded) = dict.get(name) else {
            continue;
        };
        info!("Applying mask to {}", name);

        let mask = unpack_named(encoded, name)?.to_device(param.device);
        if mask.shape != param.shape {
            return Err(Error::shape_mismatch(name, param.numel(), mask.numel()));
        }
        if param.is_meta() {
            return Err(Error::precondition(format!(
                "cannot mask '{name}': parameter has no materialized storage"
            )));
        }
        let dtype = param.dtype;
        let values = param.as_f32_mut().ok_or_else(|| {
            Error::unsupported(format!("cannot mask '{name}' with {} storage", dtype.tag()))
        })?;
        let masked = zero_masked(values, &mask, name)?;

        remaining.shift_remove(name);
        report.total_zeroed += masked;
        report.per_param.insert(name.to_string(), masked);
    }

    if !remaining.is_empty() {
        return Err(Error::UnconsumedMask {
            keys: remaining.into_iter().map(str::to_string).collect(),
        });
    }
    Ok(report)
}

/// Zeroes the elements of `values` whose mask bit is set; returns how many.
fn zero_masked(values: &mut [f32], mask: &Tensor, name: &str) -> Result<usize> {
    let bits = mask.as_bool().ok_or_else(|| {
        Error::corrupted(format!(
            "mask for '{name}' decoded to {} instead of bool",
            mask.dtype.tag()
        ))
    })?;
    let mut masked = 0;
    for (value, &set) in values.iter_mut().zip(bits) {
        if set {
            *value = 0.0;
            masked += 1;
        }
    }
    Ok(masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodedMask;
    use sparq_core::{DType, Device, ModelConfig, Tensor};

    fn model() -> Model {
        let mut model = Model::new("toy", ModelConfig::default());
        let values: Vec<f32> = (1..=4).map(|v| v as f32).collect();
        model.insert("a.weight", Tensor::from_f32(vec![2, 2], DType::F32, values.clone()).unwrap());
        model.insert("b.weight", Tensor::from_f32(vec![4], DType::F16, values).unwrap());
        model
    }

    #[test]
    fn test_zeroes_only_masked_elements() {
        let mut model = model();
        let mut dict = MaskDictionary::new();
        dict.insert(
            "a.weight",
            EncodedMask::from_bits(vec![2, 2], &[true, false, false, true]).unwrap(),
        );

        let report = apply_mask(&mut model, &dict).unwrap();
        assert_eq!(report.total_zeroed, 2);
        assert_eq!(report.per_param["a.weight"], 2);
        assert_eq!(model.get("a.weight").unwrap().as_f32().unwrap(), &[0.0, 2.0, 3.0, 0.0]);
        assert_eq!(model.get("b.weight").unwrap().as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_mask_follows_parameter_device() {
        let mut model = model();
        model.get_mut("b.weight").unwrap().device = Device::Accelerator(1);
        let mut dict = MaskDictionary::new();
        dict.insert("b.weight", EncodedMask::from_bits(vec![4], &[true; 4]).unwrap());

        apply_mask(&mut model, &dict).unwrap();
        let b = model.get("b.weight").unwrap();
        assert_eq!(b.device, Device::Accelerator(1));
        assert_eq!(b.zero_count(), Some(4));
    }

    #[test]
    fn test_unmatched_key_detected_after_full_pass() {
        let mut model = model();
        let mut dict = MaskDictionary::new();
        dict.insert("stale.weight", EncodedMask::from_bits(vec![1], &[true]).unwrap());
        dict.insert("b.weight", EncodedMask::from_bits(vec![4], &[true; 4]).unwrap());

        match apply_mask(&mut model, &dict) {
            Err(Error::UnconsumedMask { keys }) => assert_eq!(keys, vec!["stale.weight"]),
            other => panic!("expected UnconsumedMask, got {other:?}"),
        }
        // The matching entry was still applied before the final check.
        assert_eq!(model.get("b.weight").unwrap().zero_count(), Some(4));
    }

    #[test]
    fn test_shape_disagreement() {
        let mut model = model();
        let mut dict = MaskDictionary::new();
        dict.insert("a.weight", EncodedMask::from_bits(vec![4], &[true; 4]).unwrap());
        let err = apply_mask(&mut model, &dict).unwrap_err();
        assert_eq!(err.category(), "shape_mismatch");
    }

    #[test]
    fn test_non_bool_mask_is_an_error() {
        let mut values = vec![1.0, 2.0];
        let mask = Tensor::from_f32(vec![2], DType::F32, vec![1.0, 0.0]).unwrap();
        let err = zero_masked(&mut values, &mask, "a.weight").unwrap_err();
        assert_eq!(err.category(), "corrupted_data");
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_placeholder_parameter_rejected() {
        let mut model = model();
        model.insert("a.weight", Tensor::meta(vec![2, 2], DType::F16));
        let mut dict = MaskDictionary::new();
        dict.insert("a.weight", EncodedMask::from_bits(vec![2, 2], &[true; 4]).unwrap());
        let err = apply_mask(&mut model, &dict).unwrap_err();
        assert_eq!(err.category(), "precondition");
    }
}
