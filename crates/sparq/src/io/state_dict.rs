//! Safetensors state-dict writer with quantization metadata.
//!
//! The header's `__metadata__` records the quantization config the weights
//! were produced with and an xxh3 checksum per tensor, so a later load can
//! reject a mismatched config or a damaged file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use sparq_core::{DType, Error, Model, QuantConfig, Result, Tensor, TensorData};
use tracing::info;

use super::shard_reader::METADATA_KEY;

/// Metadata key of the per-tensor checksum table.
pub const CHECKSUMS_KEY: &str = "xxh3";

/// Quantization parameters recorded in a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantMetadata {
    /// Bits per weight.
    pub w_bit: u8,
    /// Group size in flag convention (`-1` per row).
    pub q_group_size: i64,
    /// Zero point enabled.
    pub zero_point: bool,
}

impl From<&QuantConfig> for QuantMetadata {
    fn from(config: &QuantConfig) -> Self {
        Self {
            w_bit: config.w_bit,
            q_group_size: config.group_size_flag(),
            zero_point: config.zero_point,
        }
    }
}

impl QuantMetadata {
    /// Reads the fields from header metadata. Returns `None` when absent.
    pub fn from_header(metadata: &IndexMap<String, String>) -> Result<Option<Self>> {
        let (Some(w_bit), Some(group), Some(zero)) = (
            metadata.get("w_bit"),
            metadata.get("q_group_size"),
            metadata.get("zero_point"),
        ) else {
            return Ok(None);
        };
        let bad = |key: &str, value: &str| {
            Error::corrupted(format!("invalid {key} '{value}' in checkpoint metadata"))
        };
        Ok(Some(Self {
            w_bit: w_bit.parse().map_err(|_| bad("w_bit", w_bit))?,
            q_group_size: group.parse().map_err(|_| bad("q_group_size", group))?,
            zero_point: zero.parse().map_err(|_| bad("zero_point", zero))?,
        }))
    }

    /// Fails with a precondition error if `config` disagrees with this metadata.
    pub fn check(&self, config: &QuantConfig) -> Result<()> {
        let requested = Self::from(config);
        if *self != requested {
            return Err(Error::precondition(format!(
                "checkpoint was quantized with w_bit={} q_group_size={} zero_point={}, \
                 requested w_bit={} q_group_size={} zero_point={}",
                self.w_bit,
                self.q_group_size,
                self.zero_point,
                requested.w_bit,
                requested.q_group_size,
                requested.zero_point
            )));
        }
        Ok(())
    }

    fn write_into(&self, metadata: &mut IndexMap<String, String>) {
        metadata.insert("w_bit".into(), self.w_bit.to_string());
        metadata.insert("q_group_size".into(), self.q_group_size.to_string());
        metadata.insert("zero_point".into(), self.zero_point.to_string());
    }
}

/// Little-endian bytes of a tensor in its storage dtype.
pub fn encode(name: &str, tensor: &Tensor) -> Result<Vec<u8>> {
    match (&tensor.data, tensor.dtype) {
        (TensorData::F32(v), DType::F32) => Ok(v.iter().flat_map(|x| x.to_le_bytes()).collect()),
        (TensorData::F32(v), DType::F16) => Ok(v
            .iter()
            .flat_map(|&x| half::f16::from_f32(x).to_le_bytes())
            .collect()),
        (TensorData::F32(v), DType::BF16) => Ok(v
            .iter()
            .flat_map(|&x| half::bf16::from_f32(x).to_le_bytes())
            .collect()),
        (TensorData::U8(v), _) => Ok(v.clone()),
        (TensorData::Bool(v), _) => Ok(v.iter().map(|&b| u8::from(b)).collect()),
        (TensorData::Meta, _) => Err(Error::precondition(format!(
            "cannot save '{name}': parameter has no storage"
        ))),
        (_, dtype) => Err(Error::unsupported(format!(
            "cannot save '{name}' as {}",
            dtype.tag()
        ))),
    }
}

/// Writes every owned parameter of `model` to a safetensors file.
///
/// Parent directories are created. The file is written to a temp path and
/// renamed into place.
pub fn save_state_dict(model: &Model, path: &Path, quant: Option<&QuantMetadata>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::external(parent, e))?;
    }

    let mut header = serde_json::Map::new();
    let mut checksums: IndexMap<String, String> = IndexMap::new();
    let mut blobs = Vec::with_capacity(model.len());
    let mut offset = 0usize;
    for (name, tensor) in model.named_parameters() {
        let bytes = encode(name, tensor)?;
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": tensor.dtype.tag(),
                "shape": tensor.shape,
                "data_offsets": [offset, offset + bytes.len()],
            }),
        );
        checksums.insert(
            name.to_string(),
            format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes)),
        );
        offset += bytes.len();
        blobs.push(bytes);
    }

    let mut metadata: IndexMap<String, String> = IndexMap::new();
    metadata.insert("format".into(), "pt".into());
    if let Some(quant) = quant {
        quant.write_into(&mut metadata);
    }
    metadata.insert(CHECKSUMS_KEY.into(), serde_json::to_string(&checksums)?);
    header.insert(METADATA_KEY.into(), serde_json::to_value(&metadata)?);

    let mut header_json = serde_json::to_vec(&header)?;
    // Pad to 8-byte alignment
    let padded_len = (header_json.len() + 7) & !7;
    header_json.resize(padded_len, b' ');

    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path).map_err(|e| Error::external(&temp_path, e))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&(padded_len as u64).to_le_bytes())?;
    writer.write_all(&header_json)?;
    for blob in &blobs {
        writer.write_all(blob)?;
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::io(format!("failed to rename state dict: {}", e)))?;
    info!("Saved {} tensors ({} bytes) to {}", blobs.len(), offset, path.display());
    Ok(())
}

/// Per-tensor checksums recorded in header metadata.
pub fn checksums(metadata: &IndexMap<String, String>) -> Result<IndexMap<String, u64>> {
    let Some(raw) = metadata.get(CHECKSUMS_KEY) else {
        return Ok(IndexMap::new());
    };
    let table: IndexMap<String, String> = serde_json::from_str(raw)?;
    table
        .into_iter()
        .map(|(name, hex)| {
            u64::from_str_radix(&hex, 16)
                .map(|sum| (name.clone(), sum))
                .map_err(|_| Error::corrupted(format!("invalid checksum for '{name}'")))
        })
        .collect()
}
