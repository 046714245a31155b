//! Core type definitions: storage dtypes, placement targets and the
//! quantization config shared by every quantization call of a run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Storage data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 16-bit float.
    F16,
    /// BFloat16.
    BF16,
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer (packed low-bit storage).
    U8,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Boolean.
    Bool,
}

impl DType {
    /// Returns the size of one element in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::I64 => 8,
        }
    }

    /// Returns true for floating point dtypes.
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Parses a safetensors dtype tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(DType::F32),
            "F16" => Some(DType::F16),
            "BF16" => Some(DType::BF16),
            "I8" => Some(DType::I8),
            "U8" => Some(DType::U8),
            "I32" => Some(DType::I32),
            "I64" => Some(DType::I64),
            "BOOL" => Some(DType::Bool),
            _ => None,
        }
    }

    /// Returns the safetensors dtype tag.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::I8 => "I8",
            DType::U8 => "U8",
            DType::I32 => "I32",
            DType::I64 => "I64",
            DType::Bool => "BOOL",
        }
    }

    /// Maps a `torch_dtype` string from a model config.
    pub fn from_torch(s: &str) -> Option<Self> {
        match s.trim_start_matches("torch.") {
            "float32" | "float" => Some(DType::F32),
            "float16" | "half" => Some(DType::F16),
            "bfloat16" => Some(DType::BF16),
            _ => None,
        }
    }
}

/// Placement target for parameter storage.
///
/// Ordering follows fill order: accelerators by id, then host memory, then disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    /// Accelerator with the given ordinal.
    Accelerator(usize),
    /// Host memory.
    Host,
    /// On-disk offload.
    Disk,
}

impl Device {
    /// Returns true for accelerator targets.
    #[must_use]
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Accelerator(id) => write!(f, "{id}"),
            Device::Host => f.write_str("cpu"),
            Device::Disk => f.write_str("disk"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(Device::Host),
            "disk" => Ok(Device::Disk),
            other => {
                let id = other.strip_prefix("cuda:").unwrap_or(other);
                id.parse::<usize>()
                    .map(Device::Accelerator)
                    .map_err(|_| Error::precondition(format!("unknown device '{s}'")))
            }
        }
    }
}

/// Quantization configuration, fixed for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Bits per quantized weight (1-8).
    pub w_bit: u8,
    /// Elements sharing one scale. `None` means one group per output row.
    pub group_size: Option<usize>,
    /// Asymmetric quantization with a per-group zero point.
    pub zero_point: bool,
}

impl QuantConfig {
    /// Builds a config from raw flag values.
    ///
    /// `group_size` uses the command-line convention where a negative value
    /// means per-row grouping.
    pub fn new(w_bit: u8, group_size: i64, zero_point: bool) -> Result<Self> {
        if !(1..=8).contains(&w_bit) {
            return Err(Error::precondition(format!(
                "w_bit must be in 1..=8, got {w_bit}"
            )));
        }
        if w_bit < 2 && !zero_point {
            return Err(Error::precondition(
                "1-bit quantization requires a zero point",
            ));
        }
        let group_size = match group_size {
            0 => return Err(Error::precondition("q_group_size must not be 0")),
            g if g < 0 => None,
            g => Some(g as usize),
        };
        Ok(Self {
            w_bit,
            group_size,
            zero_point,
        })
    }

    /// Largest quantized level.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        (1u32 << self.w_bit) - 1
    }

    /// Group length for a row of `row_len` elements.
    pub fn group_len(&self, row_len: usize) -> Result<usize> {
        match self.group_size {
            None => Ok(row_len),
            Some(g) if row_len % g == 0 => Ok(g),
            Some(g) => Err(Error::precondition(format!(
                "row length {row_len} is not divisible by group size {g}"
            ))),
        }
    }

    /// Group size in the command-line convention (`-1` for per-row).
    #[must_use]
    pub fn group_size_flag(&self) -> i64 {
        self.group_size.map_or(-1, |g| g as i64)
    }
}
