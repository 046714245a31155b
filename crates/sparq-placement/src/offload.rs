//! On-disk storage for parameters placed on [`Device::Disk`].
//!
//! Each parameter is one raw little-endian file named `<param>.dat`; an
//! `index.json` beside them records shape, dtype and encoding. Files are
//! written to a temp path and renamed, so a reader never sees a partial file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sparq_core::{DType, Device, Error, Result, Tensor, TensorData};
use tracing::debug;

const INDEX_FILE: &str = "index.json";

/// Element encoding of an offloaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 4-byte little-endian floats.
    F32,
    /// Raw bytes.
    U8,
    /// One byte per boolean.
    Bool,
}

/// Index entry of an offloaded parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadEntry {
    /// File name relative to the store directory.
    pub file: String,
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Storage dtype.
    pub dtype: DType,
    /// Element encoding.
    pub encoding: Encoding,
}

/// A directory of offloaded parameters.
#[derive(Debug)]
pub struct OffloadStore {
    dir: PathBuf,
    index: IndexMap<String, OffloadEntry>,
}

impl OffloadStore {
    /// Opens a store, reading an existing index if present.
    ///
    /// The directory is created on the first write.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let file = File::open(&index_path).map_err(|e| Error::external(&index_path, e))?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            IndexMap::new()
        };
        Ok(Self { dir, index })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns true if `name` has been offloaded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of offloaded parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing has been offloaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Writes a parameter's storage and records it in the index.
    pub fn write(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let (encoding, bytes) = match &tensor.data {
            TensorData::F32(v) => (Encoding::F32, v.iter().flat_map(|x| x.to_le_bytes()).collect()),
            TensorData::U8(v) => (Encoding::U8, v.clone()),
            TensorData::Bool(v) => (Encoding::Bool, v.iter().map(|&b| u8::from(b)).collect()),
            TensorData::Meta => {
                return Err(Error::precondition(format!(
                    "cannot offload '{name}': parameter has no storage"
                )))
            }
        };

        fs::create_dir_all(&self.dir).map_err(|e| Error::external(&self.dir, e))?;
        let file = format!("{name}.dat");
        write_atomic(&self.dir.join(&file), &bytes)?;
        self.index.insert(
            name.to_string(),
            OffloadEntry {
                file,
                shape: tensor.shape.clone(),
                dtype: tensor.dtype,
                encoding,
            },
        );
        self.save_index()?;
        debug!(param = name, bytes = bytes.len(), "offloaded to disk");
        Ok(())
    }

    /// Reads an offloaded parameter back, tagged as disk-resident.
    pub fn read(&self, name: &str) -> Result<Tensor> {
        let entry = self
            .index
            .get(name)
            .ok_or_else(|| Error::precondition(format!("'{name}' is not in the offload store")))?;
        let path = self.dir.join(&entry.file);
        let bytes = fs::read(&path).map_err(|e| Error::external(&path, e))?;

        let tensor = match entry.encoding {
            Encoding::F32 => {
                if bytes.len() % 4 != 0 {
                    return Err(Error::corrupted(format!(
                        "offloaded '{name}' has {} bytes, not a multiple of 4",
                        bytes.len()
                    )));
                }
                let values = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Tensor::from_f32(entry.shape.clone(), entry.dtype, values)?
            }
            Encoding::U8 => {
                let mut t = Tensor::from_u8(entry.shape.clone(), bytes)?;
                t.dtype = entry.dtype;
                t
            }
            Encoding::Bool => Tensor::from_bool(entry.shape.clone(), bytes.iter().map(|&b| b != 0).collect())?,
        };
        Ok(tensor.to_device(Device::Disk))
    }

    fn save_index(&self) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path).map_err(|e| Error::external(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.index)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp_path, &path)
            .map_err(|e| Error::io(format!("failed to rename offload index: {}", e)))?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).map_err(|e| Error::external(&temp_path, e))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)
        .map_err(|e| Error::io(format!("failed to rename {}: {}", path.display(), e)))?;
    Ok(())
}
