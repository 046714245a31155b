//! # sparq
//!
//! Post-training weight quantization of decoder checkpoints.
//!
//! A run loads a full-precision safetensors model, optionally zeroes the
//! elements of a sparsity mask, searches or applies activation-aware (AWQ)
//! weight scales, quantizes the weights, and places the result across
//! accelerators, host memory and disk before evaluation.
//!
//! ## Stages
//!
//! | Stage | Module |
//! |-------|--------|
//! | load | [`loader`] |
//! | mask | [`sparq_mask`] |
//! | scales | [`awq`] |
//! | quantize | [`quant`] |
//! | dispatch | [`sparq_placement`] |
//! | sequencing | [`pipeline`] |
//!
//! Conflicting options are rejected before the model is loaded:
//!
//! ```ignore
//! use sparq::pipeline::{Driver, RunOptions, StageOutcome};
//!
//! let options = RunOptions {
//!     model_path: "models/llama-7b".into(),
//!     w_bit: Some(4),
//!     q_group_size: 128,
//!     ..RunOptions::default()
//! };
//! match Driver::new(options).run()? {
//!     StageOutcome::Continue(model) => println!("{} parameters", model.len()),
//!     StageOutcome::Terminate(reason) => println!("stopped: {reason:?}"),
//! }
//! ```

pub mod awq;
pub mod io;
pub mod loader;
pub mod pipeline;
pub mod quant;

pub use loader::{stream_checkpoint, ModelLoader};
pub use pipeline::{Driver, RunOptions, RunPlan, StageOutcome, Termination};
pub use sparq_core::{Error, Result};
