//! sparq command line.
//!
//! ## Usage
//!
//! ```bash
//! # Search AWQ scales and save them
//! sparq --model-path models/llama-7b --w-bit 4 --q-group-size 128 \
//!     --run-awq --dump-awq awq_cache/llama-7b-w4-g128.pt
//!
//! # Apply them, fake-quantize, and report sparsity
//! sparq --model-path models/llama-7b --w-bit 4 --q-group-size 128 \
//!     --load-awq awq_cache/llama-7b-w4-g128.pt --tasks sparsity \
//!     --output-path results.json
//!
//! # Dump real-quantized weights, then load them on two accelerators
//! sparq --model-path models/llama-7b --w-bit 4 --q-group-size 128 \
//!     --load-awq awq_cache/llama-7b-w4-g128.pt --q-backend real \
//!     --dump-quant quant_cache/llama-7b-w4-g128.safetensors
//! sparq --model-path models/llama-7b --w-bit 4 --q-group-size 128 \
//!     --load-quant quant_cache/llama-7b-w4-g128.safetensors \
//!     --accelerator 0:24GiB --accelerator 1:24GiB --tasks footprint
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use sparq::pipeline::{Driver, RunOptions, StageOutcome, Termination};

#[derive(Parser, Debug)]
#[command(name = "sparq")]
#[command(version)]
#[command(about = "Sparse-aware AWQ quantization and dispatch", long_about = None)]
struct Args {
    /// Model directory, safetensors file, or cached hub id
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Evaluation batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Comma-separated evaluation tasks
    #[arg(long)]
    tasks: Option<String>,

    /// Evaluation results file
    #[arg(long)]
    output_path: Option<PathBuf>,

    /// Folder for the sparsity report of fake quantization
    #[arg(long)]
    output_folder: Option<PathBuf>,

    /// Few-shot examples per prompt
    #[arg(long)]
    num_fewshot: Option<usize>,

    /// Device budgets, e.g. `0:10GiB 1:10GiB cpu:30GiB`
    #[arg(long, num_args = 1..)]
    max_memory: Vec<String>,

    /// Bits per weight
    #[arg(long)]
    w_bit: Option<u8>,

    /// Group size, -1 for one group per row
    #[arg(long, allow_hyphen_values = true)]
    q_group_size: Option<i64>,

    /// Disable the quantization zero point
    #[arg(long)]
    no_zero_point: bool,

    /// Quantization backend (fake, real)
    #[arg(long)]
    q_backend: Option<String>,

    /// Save real-quantized weights here and stop
    #[arg(long)]
    dump_quant: Option<PathBuf>,

    /// Load real-quantized weights
    #[arg(long)]
    load_quant: Option<PathBuf>,

    /// Run the AWQ scale search
    #[arg(long)]
    run_awq: bool,

    /// Save AWQ search results here and stop
    #[arg(long)]
    dump_awq: Option<PathBuf>,

    /// Apply saved AWQ search results
    #[arg(long)]
    load_awq: Option<PathBuf>,

    /// Apply a sparsity mask dictionary
    #[arg(long)]
    apply_sparse_mask: Option<PathBuf>,

    /// Keep the model on the host after quantization
    #[arg(long)]
    no_auto_dispatch: bool,

    /// Available accelerator, `<id>:<size>` (repeatable)
    #[arg(long = "accelerator")]
    accelerators: Vec<String>,

    /// Directory for disk-offloaded parameters
    #[arg(long)]
    offload_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Run configuration file (JSON); flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_options(self) -> sparq::Result<RunOptions> {
        let mut options = match &self.config {
            Some(path) => RunOptions::load(path)?,
            None => RunOptions::default(),
        };

        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    options.$field = value;
                })*
            };
        }
        overlay!(model_path, batch_size, num_fewshot, q_group_size, q_backend, offload_dir, log_level);

        macro_rules! overlay_option {
            ($($field:ident),*) => {
                $(if self.$field.is_some() {
                    options.$field = self.$field;
                })*
            };
        }
        overlay_option!(
            tasks,
            output_path,
            output_folder,
            w_bit,
            dump_quant,
            load_quant,
            dump_awq,
            load_awq,
            apply_sparse_mask
        );

        if !self.max_memory.is_empty() {
            options.max_memory = self.max_memory;
        }
        if !self.accelerators.is_empty() {
            options.accelerators = self.accelerators;
        }
        options.run_awq |= self.run_awq;
        if self.no_zero_point {
            options.zero_point = false;
        }
        if self.no_auto_dispatch {
            options.auto_dispatch = false;
        }
        Ok(options)
    }
}

fn main() -> ExitCode {
    let options = match Args::parse().into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let level = match options.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {e}");
    }

    info!("Run options: {:?}", options);

    match Driver::new(options).run() {
        Ok(StageOutcome::Continue(model)) => {
            info!("Finished with {} parameters", model.len());
            ExitCode::SUCCESS
        }
        Ok(StageOutcome::Terminate(reason)) => {
            match reason {
                Termination::SearchResultsExist(path) => {
                    info!("AWQ results already exist at {}", path.display())
                }
                Termination::SearchResultsSaved(path) => {
                    info!("AWQ results written to {}", path.display())
                }
                Termination::QuantizedDumpSaved(path) => {
                    info!("Quantized weights written to {}", path.display())
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(category = e.category(), "{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
