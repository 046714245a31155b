//! Memory-mapped safetensors shard reader.
//!
//! Tensor bytes are read straight from the mapping; nothing is copied until
//! a tensor is materialized.

use std::fs::File;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use memmap2::Mmap;
use serde::Deserialize;
use sparq_core::{DType, Error, Result, Tensor};

/// Header key holding string metadata.
pub const METADATA_KEY: &str = "__metadata__";

/// Header entry for one tensor.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    /// Tensor name.
    pub name: String,
    /// Storage dtype.
    pub dtype: DType,
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Offset in the data section.
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
}

impl TensorEntry {
    /// Number of elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Deserialize)]
struct RawTensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// A memory-mapped safetensors file.
pub struct ShardReader {
    path: PathBuf,
    mmap: Mmap,
    tensors: IndexMap<String, TensorEntry>,
    metadata: IndexMap<String, String>,
    data_offset: usize,
}

impl ShardReader {
    /// Maps a shard and parses its header. Tensors keep header order.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::external(path, e))?;

        // SAFETY: the mapping is read-only and the file is not modified while mapped.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::external(path, e))? };

        if mmap.len() < 8 {
            return Err(Error::corrupted(format!(
                "{}: too small for a safetensors header",
                path.display()
            )));
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_end = 8 + u64::from_le_bytes(len_bytes) as usize;
        if mmap.len() < header_end {
            return Err(Error::corrupted(format!(
                "{}: truncated before header end",
                path.display()
            )));
        }

        let mut header: IndexMap<String, serde_json::Value> =
            serde_json::from_slice(&mmap[8..header_end]).map_err(|e| {
                Error::corrupted(format!("{}: invalid header: {}", path.display(), e))
            })?;

        let metadata = match header.shift_remove(METADATA_KEY) {
            Some(value) => serde_json::from_value(value)?,
            None => IndexMap::new(),
        };

        let data_len = mmap.len() - header_end;
        let mut tensors = IndexMap::with_capacity(header.len());
        for (name, value) in header {
            let info: RawTensorInfo = serde_json::from_value(value)
                .map_err(|e| Error::corrupted(format!("tensor '{}': {}", name, e)))?;
            let dtype = DType::parse(&info.dtype).ok_or_else(|| {
                Error::unsupported(format!("tensor '{}' has dtype {}", name, info.dtype))
            })?;
            let (start, end) = info.data_offsets;
            let expected = info.shape.iter().product::<usize>() * dtype.element_size();
            if end < start || end > data_len || end - start != expected {
                return Err(Error::corrupted(format!(
                    "tensor '{}' has invalid data offsets [{}, {})",
                    name, start, end
                )));
            }
            tensors.insert(
                name.clone(),
                TensorEntry {
                    name,
                    dtype,
                    shape: info.shape,
                    offset: start,
                    size: end - start,
                },
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            tensors,
            metadata,
            data_offset: header_end,
        })
    }

    /// Path of the shard.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of tensors.
    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Tensor entries in header order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorEntry> {
        self.tensors.values()
    }

    /// Entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.get(name)
    }

    /// String metadata from the header.
    #[must_use]
    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.metadata
    }

    /// Raw tensor bytes (zero-copy).
    pub fn tensor_bytes(&self, name: &str) -> Result<&[u8]> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::corrupted(format!("tensor '{}' not found in shard", name)))?;
        let start = self.data_offset + entry.offset;
        Ok(&self.mmap[start..start + entry.size])
    }

    /// Materializes a tensor on the host.
    ///
    /// Floating point data of any width is widened to `f32`.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let entry = self
            .get(name)
            .ok_or_else(|| Error::corrupted(format!("tensor '{}' not found in shard", name)))?;
        decode(entry, self.tensor_bytes(name)?)
    }
}

/// Decodes little-endian tensor bytes.
pub fn decode(entry: &TensorEntry, bytes: &[u8]) -> Result<Tensor> {
    let shape = entry.shape.clone();
    match entry.dtype {
        DType::F32 => {
            let values = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_f32(shape, DType::F32, values)
        }
        DType::F16 => {
            let values = bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            Tensor::from_f32(shape, DType::F16, values)
        }
        DType::BF16 => {
            let values = bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect();
            Tensor::from_f32(shape, DType::BF16, values)
        }
        DType::U8 => Tensor::from_u8(shape, bytes.to_vec()),
        DType::Bool => Tensor::from_bool(shape, bytes.iter().map(|&b| b != 0).collect()),
        other => Err(Error::unsupported(format!(
            "tensor '{}' has dtype {}",
            entry.name,
            other.tag()
        ))),
    }
}

/// Finds the safetensors shards of a model.
///
/// Accepts a single `.safetensors` file, a directory of shards, or a
/// Hugging Face hub id present in the local cache.
pub fn discover_shards(model_path: &Path) -> Result<Vec<PathBuf>> {
    if model_path.is_file() && model_path.extension().is_some_and(|e| e == "safetensors") {
        return Ok(vec![model_path.to_path_buf()]);
    }

    if model_path.is_dir() {
        let shards = safetensors_in(model_path)?;
        if shards.is_empty() {
            return Err(Error::external(
                model_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no safetensors files"),
            ));
        }
        return Ok(shards);
    }

    if let Some(snapshot) = find_in_hf_cache(model_path) {
        let shards = safetensors_in(&snapshot)?;
        if !shards.is_empty() {
            return Ok(shards);
        }
    }

    Err(Error::external(
        model_path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "model not found"),
    ))
}

/// Directory holding `config.json` for a model path.
#[must_use]
pub fn model_dir(model_path: &Path) -> Option<PathBuf> {
    if model_path.is_dir() {
        return Some(model_path.to_path_buf());
    }
    if model_path.is_file() {
        return model_path.parent().map(Path::to_path_buf);
    }
    find_in_hf_cache(model_path)
}

fn safetensors_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::external(dir, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "safetensors"))
        .collect();
    shards.sort();
    Ok(shards)
}

/// Latest snapshot directory of a hub id (`org/model`) in the local cache.
fn find_in_hf_cache(model_id: &Path) -> Option<PathBuf> {
    let model_str = model_id.to_string_lossy();
    if !model_str.contains('/') || model_id.is_absolute() {
        return None;
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let snapshots = PathBuf::from(home)
        .join(".cache/huggingface/hub")
        .join(format!("models--{}", model_str.replace('/', "--")))
        .join("snapshots");

    std::fs::read_dir(&snapshots)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())
        .map(|e| e.path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_shard(path: &Path, header: &str, data: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(header.as_bytes()).unwrap();
        file.write_all(data).unwrap();
    }

    #[test]
    fn test_reads_tensors_in_header_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut data = Vec::new();
        data.extend_from_slice(&half::f16::from_f32(1.5).to_le_bytes());
        data.extend_from_slice(&half::f16::from_f32(-2.0).to_le_bytes());
        data.extend_from_slice(&[7u8, 9]);
        let header = r#"{"z.weight":{"dtype":"F16","shape":[2],"data_offsets":[0,4]},"a.qweight":{"dtype":"U8","shape":[2],"data_offsets":[4,6]},"__metadata__":{"format":"pt"}}"#;
        write_shard(&path, header, &data);

        let reader = ShardReader::open(&path).unwrap();
        let names: Vec<&str> = reader.tensors().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["z.weight", "a.qweight"]);
        assert_eq!(reader.metadata()["format"], "pt");

        let z = reader.tensor("z.weight").unwrap();
        assert_eq!(z.dtype, DType::F16);
        assert_eq!(z.as_f32().unwrap(), &[1.5, -2.0]);
        assert_eq!(reader.tensor("a.qweight").unwrap().as_u8().unwrap(), &[7, 9]);
    }

    #[test]
    fn test_bad_offsets_are_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        let header = r#"{"w":{"dtype":"F32","shape":[4],"data_offsets":[0,16]}}"#;
        write_shard(&path, header, &[0u8; 8]);
        let err = ShardReader::open(&path).err().unwrap();
        assert_eq!(err.category(), "corrupted_data");
    }

    #[test]
    fn test_missing_model_is_external_io() {
        let err = discover_shards(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.category(), "external_io");
    }

    #[test]
    fn test_discover_sorts_shards() {
        let dir = tempdir().unwrap();
        for name in ["model-00002-of-00002.safetensors", "model-00001-of-00002.safetensors"] {
            write_shard(&dir.path().join(name), "{}", &[]);
        }
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let shards = discover_shards(dir.path()).unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards[0].ends_with("model-00001-of-00002.safetensors"));
        assert_eq!(model_dir(dir.path()).as_deref(), Some(dir.path()));
    }
}
