//! Building models from safetensors checkpoints.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use sparq_core::{DType, Device, Error, Model, ModelConfig, QuantConfig, Result, Tensor};
use sparq_placement::{unit_of, DeviceMap, OffloadStore};
use tracing::{info, warn};

use crate::io::{checksums, discover_shards, model_dir, QuantMetadata, ShardReader};

/// Loads model configs and weights from a path or hub id.
#[derive(Debug, Clone)]
pub struct ModelLoader {
    path: PathBuf,
}

impl ModelLoader {
    /// Creates a loader for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Model path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `config.json` next to the weights. A missing file yields defaults.
    pub fn config(&self) -> Result<ModelConfig> {
        let Some(path) = model_dir(&self.path).map(|dir| dir.join("config.json")) else {
            return Err(not_found(&self.path));
        };
        if !path.exists() {
            warn!("{} not found, using default model config", path.display());
            return Ok(ModelConfig::default());
        }
        let file = File::open(&path).map_err(|e| Error::external(&path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::corrupted(format!("invalid {}: {}", path.display(), e)))
    }

    /// Loads full-precision weights onto the host and ties embeddings.
    pub fn load(&self) -> Result<Model> {
        info!("* Building model {}", self.path.display());
        let config = self.config()?;
        let shards = discover_shards(&self.path)?;
        let mut model = Model::new(self.path.display().to_string(), config);

        let readers = shards
            .iter()
            .map(ShardReader::open)
            .collect::<Result<Vec<_>>>()?;
        let total = readers.iter().map(ShardReader::tensor_count).sum::<usize>();
        let pb = progress(total as u64);
        for reader in &readers {
            for entry in reader.tensors() {
                model.insert(entry.name.clone(), reader.tensor(&entry.name)?);
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        model.tie_weights();
        info!(
            "Loaded {} parameters ({} bytes)",
            model.len(),
            model.total_bytes()
        );
        Ok(model)
    }

    /// Builds the model with placeholder storage from shard headers only.
    ///
    /// Floating point parameters are declared as `F16`.
    pub fn load_empty(&self) -> Result<Model> {
        let config = self.config()?;
        let mut model = Model::new(self.path.display().to_string(), config);
        for shard in discover_shards(&self.path)? {
            let reader = ShardReader::open(&shard)?;
            for entry in reader.tensors() {
                let dtype = if entry.dtype.is_float() {
                    DType::F16
                } else {
                    entry.dtype
                };
                model.insert(entry.name.clone(), Tensor::meta(entry.shape.clone(), dtype));
            }
        }
        Ok(model)
    }
}

/// Streams a quantized checkpoint into a model with placeholder storage.
///
/// Every parameter of the model must be present in the checkpoint with the
/// same shape. Parameters whose unit is mapped to disk go straight to
/// `offload` and stay placeholders; the rest are materialized in place.
/// Recorded checksums are verified, and recorded quantization metadata
/// must agree with `quant`.
pub fn stream_checkpoint(
    model: &mut Model,
    checkpoint: &Path,
    quant: &QuantConfig,
    map: &DeviceMap,
    offload: &mut OffloadStore,
) -> Result<usize> {
    let readers = discover_shards(checkpoint)?
        .iter()
        .map(ShardReader::open)
        .collect::<Result<Vec<_>>>()?;

    for reader in &readers {
        match QuantMetadata::from_header(reader.metadata())? {
            Some(recorded) => recorded.check(quant)?,
            None => warn!(
                "{} records no quantization config, assuming it matches",
                reader.path().display()
            ),
        }
    }

    let sums = readers
        .iter()
        .map(|r| checksums(r.metadata()))
        .collect::<Result<Vec<_>>>()?;

    let names = model.parameter_names();
    let pb = progress(names.len() as u64);
    for name in &names {
        let shard = readers
            .iter()
            .position(|r| r.get(name).is_some())
            .ok_or_else(|| Error::corrupted(format!("checkpoint lacks '{name}'")))?;
        let reader = &readers[shard];
        let bytes = reader.tensor_bytes(name)?;
        if let Some(&expected) = sums[shard].get(name.as_str()) {
            if xxhash_rust::xxh3::xxh3_64(bytes) != expected {
                return Err(Error::corrupted(format!("checksum mismatch for '{name}'")));
            }
        }

        let mut tensor = reader.tensor(name)?;
        let device = map.get(&unit_of(model, name)).unwrap_or(Device::Host);
        let Some(slot) = model.get_mut(name) else {
            continue;
        };
        if tensor.shape != slot.shape {
            return Err(Error::shape_mismatch(name.clone(), slot.numel(), tensor.numel()));
        }
        if tensor.dtype.is_float() != slot.dtype.is_float() {
            return Err(Error::corrupted(format!(
                "'{name}' is {} in the checkpoint, model expects {}",
                tensor.dtype.tag(),
                slot.dtype.tag()
            )));
        }
        tensor.dtype = slot.dtype;

        if device == Device::Disk {
            offload.write(name, &tensor)?;
        } else {
            slot.data = tensor.data;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let known: std::collections::HashSet<&str> = names.iter().map(String::as_str).collect();
    for reader in &readers {
        for entry in reader.tensors() {
            if !known.contains(entry.name.as_str()) && !model.tied().contains_key(&entry.name) {
                warn!("checkpoint tensor '{}' matches no parameter", entry.name);
            }
        }
    }
    info!("Loaded {} tensors from {}", names.len(), checkpoint.display());
    Ok(names.len())
}

fn progress(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

fn not_found(path: &Path) -> Error {
    Error::external(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "model not found"),
    )
}
