//! Run options.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sparq_core::{Error, Result};

/// Every knob of a pipeline run.
///
/// Loadable from a JSON file; fields left out take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Model directory, safetensors file, or hub id in the local cache
    #[serde(default)]
    pub model_path: PathBuf,

    /// Evaluation batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Comma-separated evaluation tasks
    #[serde(default)]
    pub tasks: Option<String>,

    /// Evaluation results file
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    /// Folder for the fake-quantization sparsity report
    #[serde(default)]
    pub output_folder: Option<PathBuf>,

    /// Few-shot examples per evaluation prompt
    #[serde(default)]
    pub num_fewshot: usize,

    /// Per-device budgets, `<id|cpu|disk>:<size>`
    #[serde(default)]
    pub max_memory: Vec<String>,

    /// Bits per weight; quantization is skipped when unset
    #[serde(default)]
    pub w_bit: Option<u8>,

    /// Quantization group size, -1 for one group per row
    #[serde(default = "default_q_group_size")]
    pub q_group_size: i64,

    /// Asymmetric quantization with a zero point
    #[serde(default = "default_zero_point")]
    pub zero_point: bool,

    /// Quantization backend: `fake` or `real`
    #[serde(default = "default_q_backend")]
    pub q_backend: String,

    /// Where to save real-quantized weights
    #[serde(default)]
    pub dump_quant: Option<PathBuf>,

    /// Real-quantized weights to load
    #[serde(default)]
    pub load_quant: Option<PathBuf>,

    /// Run the AWQ scale search
    #[serde(default)]
    pub run_awq: bool,

    /// Where to save AWQ search results
    #[serde(default)]
    pub dump_awq: Option<PathBuf>,

    /// AWQ search results to apply
    #[serde(default)]
    pub load_awq: Option<PathBuf>,

    /// Mask dictionary to apply before anything else
    #[serde(default)]
    pub apply_sparse_mask: Option<PathBuf>,

    /// Spread the model across devices after quantization
    #[serde(default = "default_auto_dispatch")]
    pub auto_dispatch: bool,

    /// Accelerator inventory, `<id>:<size>`
    #[serde(default)]
    pub accelerators: Vec<String>,

    /// Directory for disk-offloaded parameters
    #[serde(default = "default_offload_dir")]
    pub offload_dir: PathBuf,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            batch_size: default_batch_size(),
            tasks: None,
            output_path: None,
            output_folder: None,
            num_fewshot: 0,
            max_memory: Vec::new(),
            w_bit: None,
            q_group_size: default_q_group_size(),
            zero_point: default_zero_point(),
            q_backend: default_q_backend(),
            dump_quant: None,
            load_quant: None,
            run_awq: false,
            dump_awq: None,
            load_awq: None,
            apply_sparse_mask: None,
            auto_dispatch: default_auto_dispatch(),
            accelerators: Vec::new(),
            offload_dir: default_offload_dir(),
            log_level: default_log_level(),
        }
    }
}

impl RunOptions {
    /// Reads options from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::external(path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::corrupted(format!("invalid run config {}: {}", path.display(), e)))
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_q_group_size() -> i64 {
    -1
}

fn default_zero_point() -> bool {
    true
}

fn default_q_backend() -> String {
    "fake".to_string()
}

fn default_auto_dispatch() -> bool {
    true
}

fn default_offload_dir() -> PathBuf {
    PathBuf::from("offload")
}

fn default_log_level() -> String {
    "info".to_string()
}
