//! Executing a resolved plan against the model.

use std::path::{Path, PathBuf};

use sparq_core::{Model, QuantConfig, Result};
use sparq_mask::apply_mask_file;
use sparq_placement::{
    balanced_memory, dispatch, placement_units, DeviceInventory, MaxMemory, OffloadStore,
};
use tracing::info;

use super::driver::{Components, StageOutcome, Termination};
use super::plan::{DispatchPlan, QuantStep, RunPlan};
use crate::awq::{apply_awq, AwqResults};
use crate::io::{save_json, save_state_dict, QuantMetadata};
use crate::loader::{stream_checkpoint, ModelLoader};

/// File name of the fake-quantization sparsity report.
pub const SPARSITY_REPORT: &str = "quantized_sparsity.json";

/// Runs the stages of a plan in order: mask, scales, quantize, dispatch.
pub struct Selector<'a> {
    loader: ModelLoader,
    components: &'a Components,
    inventory: DeviceInventory,
    offload_dir: PathBuf,
}

impl<'a> Selector<'a> {
    /// Creates a selector.
    pub fn new(
        loader: ModelLoader,
        components: &'a Components,
        inventory: DeviceInventory,
        offload_dir: PathBuf,
    ) -> Self {
        Self {
            loader,
            components,
            inventory,
            offload_dir,
        }
    }

    /// Produces the model the plan describes, or stops at a terminal stage.
    pub fn execute(&self, plan: &RunPlan) -> Result<StageOutcome<Model>> {
        match plan {
            RunPlan::LoadPrequantized {
                checkpoint,
                quant,
                max_memory,
            } => self
                .load_prequantized(checkpoint, quant, max_memory.as_ref())
                .map(StageOutcome::Continue),
            RunPlan::Search {
                mask,
                quant,
                output,
                calibration,
            } => {
                let mut model = self.build(mask.as_deref())?;
                let results = self
                    .components
                    .search
                    .search(&mut model, quant, calibration)?;
                results.save(output)?;
                info!("AWQ results saved at {}", output.display());
                Ok(StageOutcome::Terminate(Termination::SearchResultsSaved(
                    output.clone(),
                )))
            }
            RunPlan::Fresh {
                mask,
                scales,
                quant,
                dispatch,
            } => self.fresh(mask.as_deref(), scales.as_deref(), quant, dispatch),
        }
    }

    fn load_prequantized(
        &self,
        checkpoint: &Path,
        quant: &QuantConfig,
        max_memory: Option<&MaxMemory>,
    ) -> Result<Model> {
        info!("Loading pre-computed quantized weights from {}", checkpoint.display());
        let mut model = self.loader.load_empty()?;
        self.components.quantizer.real_quantize(&mut model, quant, true)?;
        model.tie_weights();

        let units = placement_units(&model);
        let budgets = max_memory
            .cloned()
            .unwrap_or_else(|| self.inventory.max_memory());
        let map = self.components.strategy.place(&units, &budgets)?;
        map.verify(&units, &budgets)?;

        let mut offload = OffloadStore::open(&self.offload_dir)?;
        stream_checkpoint(&mut model, checkpoint, quant, &map, &mut offload)?;
        dispatch(&mut model, &map, &mut offload)?;
        model.eval();
        Ok(model)
    }

    fn build(&self, mask: Option<&Path>) -> Result<Model> {
        let mut model = self.loader.load()?;
        if let Some(path) = mask {
            let report = apply_mask_file(&mut model, path)?;
            info!(
                "Masked {} elements in {} parameters",
                report.total_zeroed,
                report.per_param.len()
            );
        }
        model.eval();
        Ok(model)
    }

    fn fresh(
        &self,
        mask: Option<&Path>,
        scales: Option<&Path>,
        quant: &QuantStep,
        plan: &DispatchPlan,
    ) -> Result<StageOutcome<Model>> {
        let mut model = self.build(mask)?;

        if let Some(path) = scales {
            info!("Loading pre-computed AWQ results from {}", path.display());
            let results = AwqResults::load(path)?;
            apply_awq(&mut model, &results)?;
        }

        match quant {
            QuantStep::Skip => {}
            QuantStep::Fake { config, report_dir } => {
                let report = self.components.quantizer.fake_quantize(&mut model, config)?;
                info!("Model sparsity after quantization: {:.6}", report.model_sparsity);
                if let Some(dir) = report_dir {
                    save_json(&dir.join(SPARSITY_REPORT), &report, true)?;
                }
            }
            QuantStep::Real { config, dump } => {
                self.components.quantizer.real_quantize(&mut model, config, false)?;
                if let Some(path) = dump {
                    info!("Saving the quantized model at {}", path.display());
                    model.to_host()?;
                    save_state_dict(&model, path, Some(&QuantMetadata::from(config)))?;
                    return Ok(StageOutcome::Terminate(Termination::QuantizedDumpSaved(
                        path.clone(),
                    )));
                }
            }
        }

        if let DispatchPlan::Balanced { max_memory } = plan {
            let units = placement_units(&model);
            let budgets = balanced_memory(&units, max_memory.as_ref(), &self.inventory);
            let map = self.components.strategy.place(&units, &budgets)?;
            map.verify(&units, &budgets)?;
            let mut offload = OffloadStore::open(&self.offload_dir)?;
            dispatch(&mut model, &map, &mut offload)?;
        }
        Ok(StageOutcome::Continue(model))
    }
}
