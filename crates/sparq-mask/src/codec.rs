//! Bit-packed boolean tensors.
//!
//! One bit per element, most significant bit first, final byte zero-padded.
//! The original shape travels alongside the packed buffer.

use serde::{Deserialize, Serialize};
use sparq_core::{Error, Result, Tensor};

/// A boolean tensor packed at 1 bit per element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedMask {
    /// Packed bits, MSB first.
    pub packed: Vec<u8>,
    /// Original tensor shape.
    pub shape: Vec<usize>,
}

impl EncodedMask {
    /// Packs flat boolean values for a tensor of `shape`.
    pub fn from_bits(shape: Vec<usize>, bits: &[bool]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if bits.len() != expected {
            return Err(Error::shape_mismatch("mask", expected, bits.len()));
        }
        Ok(Self {
            packed: pack_bits(bits),
            shape,
        })
    }

    /// Number of elements described by the shape.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of set bits within the described elements.
    #[must_use]
    pub fn count_set(&self) -> usize {
        let numel = self.numel();
        let full = (numel / 8).min(self.packed.len());
        let mut count: usize = self.packed[..full]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum();
        let rem = numel % 8;
        if rem > 0 {
            if let Some(&last) = self.packed.get(full) {
                count += (last >> (8 - rem)).count_ones() as usize;
            }
        }
        count
    }

    /// Fraction of set bits.
    #[must_use]
    pub fn density(&self) -> f64 {
        match self.numel() {
            0 => 0.0,
            n => self.count_set() as f64 / n as f64,
        }
    }
}

/// Packs booleans 8 per byte, most significant bit first.
#[must_use]
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &set)| if set { byte | (0x80 >> i) } else { byte })
        })
        .collect()
}

/// Inflates every bit of `packed`, most significant bit first.
#[must_use]
pub fn unpack_bits(packed: &[u8]) -> Vec<bool> {
    packed
        .iter()
        .flat_map(|&byte| (0..8).map(move |i| byte & (0x80 >> i) != 0))
        .collect()
}

/// Flattens and bit-packs a tensor. Numeric values count as set when non-zero.
///
/// Placement does not matter: the result is always a host-side buffer.
pub fn pack(tensor: &Tensor) -> Result<EncodedMask> {
    let bits = tensor.truth_values()?;
    Ok(EncodedMask {
        packed: pack_bits(&bits),
        shape: tensor.shape.clone(),
    })
}

/// Restores a boolean tensor from its packed form.
///
/// Padding bits beyond `product(shape)` are discarded. Fails with
/// [`Error::ShapeMismatch`] when the buffer holds fewer bits than the shape needs.
pub fn unpack(encoded: &EncodedMask) -> Result<Tensor> {
    unpack_named(encoded, "mask")
}

pub(crate) fn unpack_named(encoded: &EncodedMask, name: &str) -> Result<Tensor> {
    let numel = encoded.numel();
    let available = encoded.packed.len() * 8;
    if numel > available {
        return Err(Error::shape_mismatch(name, numel, available));
    }
    let mut bits = unpack_bits(&encoded.packed);
    bits.truncate(numel);
    Tensor::from_bool(encoded.shape.clone(), bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparq_core::DType;

    #[test]
    fn test_msb_first_layout() {
        let bits = [true, false, false, false, false, false, false, true, true];
        assert_eq!(pack_bits(&bits), vec![0b1000_0001, 0b1000_0000]);
    }

    #[test]
    fn test_roundtrip_with_padding() {
        let bits: Vec<bool> = (0..15).map(|i| i % 3 == 0).collect();
        let tensor = Tensor::from_bool(vec![3, 5], bits.clone()).unwrap();
        let encoded = pack(&tensor).unwrap();
        assert_eq!(encoded.packed.len(), 2);
        assert_eq!(encoded.shape, vec![3, 5]);

        let restored = unpack(&encoded).unwrap();
        assert_eq!(restored.shape, vec![3, 5]);
        assert_eq!(restored.as_bool().unwrap(), bits.as_slice());
    }

    #[test]
    fn test_numeric_input_is_thresholded() {
        let tensor = Tensor::from_f32(vec![4], DType::F32, vec![0.0, 2.0, -1.0, 0.0]).unwrap();
        let restored = unpack(&pack(&tensor).unwrap()).unwrap();
        assert_eq!(restored.as_bool().unwrap(), &[false, true, true, false]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let encoded = EncodedMask {
            packed: vec![0xFF],
            shape: vec![3, 3],
        };
        match unpack(&encoded) {
            Err(Error::ShapeMismatch { expected, available, .. }) => {
                assert_eq!(expected, 9);
                assert_eq!(available, 8);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_count_set_ignores_padding() {
        let encoded = EncodedMask {
            packed: vec![0xFF, 0xFF],
            shape: vec![10],
        };
        assert_eq!(encoded.count_set(), 10);
        assert!((encoded.density() - 1.0).abs() < f64::EPSILON);

        let half = EncodedMask::from_bits(vec![2, 2], &[true, false, true, false]).unwrap();
        assert_eq!(half.count_set(), 2);
        assert!((half.density() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scalar_and_empty_shapes() {
        let scalar = EncodedMask::from_bits(vec![], &[true]).unwrap();
        assert_eq!(unpack(&scalar).unwrap().as_bool().unwrap(), &[true]);

        let empty = EncodedMask::from_bits(vec![0, 4], &[]).unwrap();
        assert!(empty.packed.is_empty());
        assert_eq!(unpack(&empty).unwrap().numel(), 0);
    }

    #[test]
    fn test_placeholder_cannot_be_packed() {
        let tensor = Tensor::meta(vec![4], DType::Bool);
        assert!(pack(&tensor).is_err());
    }
}
