//! Owned tensors with an explicit storage dtype and placement tag.

use crate::{DType, Device, Error, Result};

/// Tensor storage.
///
/// Floating point tensors are held as `f32` regardless of their storage
/// dtype; the dtype decides their byte footprint and on-disk encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Floating point values.
    F32(Vec<f32>),
    /// Raw bytes (packed low-bit weights, zero points).
    U8(Vec<u8>),
    /// Boolean values.
    Bool(Vec<bool>),
    /// Placeholder storage: empty weights, or contents offloaded to disk.
    Meta,
}

/// An n-dimensional tensor addressed by name in a model's parameter table.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Storage dtype.
    pub dtype: DType,
    /// Storage.
    pub data: TensorData,
    /// Placement target.
    pub device: Device,
}

impl Tensor {
    /// Creates a host-resident floating point tensor.
    pub fn from_f32(shape: Vec<usize>, dtype: DType, values: Vec<f32>) -> Result<Self> {
        check_len(&shape, values.len())?;
        if !dtype.is_float() {
            return Err(Error::unsupported(format!(
                "{} is not a floating point dtype",
                dtype.tag()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            data: TensorData::F32(values),
            device: Device::Host,
        })
    }

    /// Creates a host-resident byte tensor.
    pub fn from_u8(shape: Vec<usize>, values: Vec<u8>) -> Result<Self> {
        check_len(&shape, values.len())?;
        Ok(Self {
            shape,
            dtype: DType::U8,
            data: TensorData::U8(values),
            device: Device::Host,
        })
    }

    /// Creates a host-resident boolean tensor.
    pub fn from_bool(shape: Vec<usize>, values: Vec<bool>) -> Result<Self> {
        check_len(&shape, values.len())?;
        Ok(Self {
            shape,
            dtype: DType::Bool,
            data: TensorData::Bool(values),
            device: Device::Host,
        })
    }

    /// Creates a placeholder tensor with no storage.
    #[must_use]
    pub fn meta(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            data: TensorData::Meta,
            device: Device::Host,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Storage footprint in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        (self.numel() * self.dtype.element_size()) as u64
    }

    /// Returns true if the tensor has no materialized storage.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        matches!(self.data, TensorData::Meta)
    }

    /// Floating point view.
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable floating point view.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Byte view.
    #[must_use]
    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Elementwise truth values: booleans as-is, numbers by `!= 0`.
    pub fn truth_values(&self) -> Result<Vec<bool>> {
        match &self.data {
            TensorData::Bool(v) => Ok(v.clone()),
            TensorData::F32(v) => Ok(v.iter().map(|&x| x != 0.0).collect()),
            TensorData::U8(v) => Ok(v.iter().map(|&x| x != 0).collect()),
            TensorData::Meta => Err(Error::precondition(
                "cannot read values of a placeholder tensor",
            )),
        }
    }

    /// Returns the tensor retagged to `device`.
    #[must_use]
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Number of exactly-zero elements of a floating point tensor.
    #[must_use]
    pub fn zero_count(&self) -> Option<usize> {
        self.as_f32().map(|v| v.iter().filter(|&&x| x == 0.0).count())
    }

    /// Replaces storage with a placeholder, returning the previous storage.
    pub fn take_data(&mut self) -> TensorData {
        std::mem::replace(&mut self.data, TensorData::Meta)
    }
}

fn check_len(shape: &[usize], len: usize) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(Error::shape_mismatch(
            format!("{shape:?}"),
            expected,
            len,
        ));
    }
    Ok(())
}
