//! Top-level sequencing of a run.

use std::path::PathBuf;

use serde_json::json;
use sparq_core::{Model, Result};
use sparq_placement::{DeviceInventory, MaxMemory, PlacementStrategy, SequentialFill};
use tracing::info;

use super::evaluator::{EvalRequest, Evaluator, SummaryEvaluator};
use super::selector::Selector;
use super::{RunOptions, RunPlan};
use crate::awq::{ScaleSearch, WeightOnlySearch};
use crate::io::save_json;
use crate::loader::ModelLoader;
use crate::quant::{Quantizer, RtnQuantizer};

/// Why a run stopped before evaluation. Every variant is a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Search results were already on disk; nothing was done.
    SearchResultsExist(PathBuf),
    /// Search results were written.
    SearchResultsSaved(PathBuf),
    /// The real-quantized state dict was written.
    QuantizedDumpSaved(PathBuf),
}

/// Result of a stage: keep going with a value, or stop the run.
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// Continue with the value.
    Continue(T),
    /// Stop; the run succeeded.
    Terminate(Termination),
}

/// The pluggable collaborators of a run.
pub struct Components {
    /// AWQ scale search.
    pub search: Box<dyn ScaleSearch>,
    /// Quantization kernel.
    pub quantizer: Box<dyn Quantizer>,
    /// Device placement heuristic.
    pub strategy: Box<dyn PlacementStrategy>,
    /// Evaluation harness.
    pub evaluator: Box<dyn Evaluator>,
}

impl Default for Components {
    fn default() -> Self {
        Self {
            search: Box::new(WeightOnlySearch::default()),
            quantizer: Box::new(RtnQuantizer),
            strategy: Box::new(SequentialFill),
            evaluator: Box::new(SummaryEvaluator),
        }
    }
}

/// Runs the pipeline for one set of options.
pub struct Driver {
    options: RunOptions,
    components: Components,
}

impl Driver {
    /// Creates a driver with the default components.
    pub fn new(options: RunOptions) -> Self {
        Self::with_components(options, Components::default())
    }

    /// Creates a driver with custom components.
    pub fn with_components(options: RunOptions, components: Components) -> Self {
        Self {
            options,
            components,
        }
    }

    /// Options of this run.
    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Builds, quantizes, dispatches and evaluates.
    ///
    /// Returns the final model, or the reason the run stopped early.
    pub fn run(&self) -> Result<StageOutcome<Model>> {
        let options = &self.options;

        if let Some(output) = options.output_path.as_ref().filter(|p| p.exists()) {
            info!("Results {} already generated. Overwrite.", output.display());
        }
        // Existing search results end the run before options are validated.
        if let Some(dump) = options.dump_awq.as_ref().filter(|p| p.exists()) {
            info!("Found existing AWQ results {}, exit.", dump.display());
            return Ok(StageOutcome::Terminate(Termination::SearchResultsExist(
                dump.clone(),
            )));
        }
        let plan = RunPlan::resolve(options)?;

        let inventory = DeviceInventory::detect(&MaxMemory::parse(&options.accelerators)?);
        let selector = Selector::new(
            ModelLoader::new(&options.model_path),
            &self.components,
            inventory,
            options.offload_dir.clone(),
        );
        let model = match selector.execute(&plan)? {
            StageOutcome::Continue(model) => model,
            StageOutcome::Terminate(reason) => return Ok(StageOutcome::Terminate(reason)),
        };

        if let Some(tasks) = &options.tasks {
            let request = EvalRequest::new(tasks, options.batch_size, options.num_fewshot);
            let mut results = self.components.evaluator.evaluate(&model, &request)?;
            results
                .config
                .insert("model".into(), json!(options.model_path.display().to_string()));

            if let Some(output) = &options.output_path {
                save_json(output, &results, true)?;
                info!("Evaluation results saved at {}", output.display());
            }
        }
        Ok(StageOutcome::Continue(model))
    }
}
