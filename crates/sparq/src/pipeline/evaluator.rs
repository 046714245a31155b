//! Evaluation of the finished model.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sparq_core::{Error, Model, Result};
use tracing::info;

/// Evaluation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    /// Task names.
    pub tasks: Vec<String>,
    /// Batch size.
    pub batch_size: usize,
    /// Few-shot examples per prompt.
    pub num_fewshot: usize,
}

impl EvalRequest {
    /// Splits a comma-separated task list.
    pub fn new(tasks: &str, batch_size: usize, num_fewshot: usize) -> Self {
        Self {
            tasks: tasks
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            batch_size,
            num_fewshot,
        }
    }
}

/// Results in the layout of common evaluation harnesses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    /// Metrics per task.
    pub results: IndexMap<String, Value>,
    /// Run configuration; the driver records the model path under `model`.
    pub config: Map<String, Value>,
    /// Version per task.
    pub versions: IndexMap<String, u32>,
}

/// Scores a dispatched model.
pub trait Evaluator {
    /// Runs every requested task.
    fn evaluate(&self, model: &Model, request: &EvalRequest) -> Result<EvalResults>;
}

/// Reports storage statistics of the model.
///
/// Tasks: `footprint` (bytes per device) and `sparsity` (zero fraction of
/// materialized float parameters).
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryEvaluator;

impl Evaluator for SummaryEvaluator {
    fn evaluate(&self, model: &Model, request: &EvalRequest) -> Result<EvalResults> {
        let mut out = EvalResults::default();
        for task in &request.tasks {
            let metrics = match task.as_str() {
                "footprint" => footprint(model),
                "sparsity" => sparsity(model),
                other => return Err(Error::unsupported(format!("unknown evaluation task '{other}'"))),
            };
            info!("{}: {}", task, metrics);
            out.results.insert(task.clone(), metrics);
            out.versions.insert(task.clone(), 0);
        }
        out.config.insert("tasks".into(), json!(request.tasks));
        out.config.insert("batch_size".into(), json!(request.batch_size));
        out.config.insert("num_fewshot".into(), json!(request.num_fewshot));
        Ok(out)
    }
}

fn footprint(model: &Model) -> Value {
    let per_device: Map<String, Value> = model
        .footprint()
        .into_iter()
        .map(|(device, bytes)| (device.to_string(), json!(bytes)))
        .collect();
    json!({
        "num_parameters": model.len(),
        "total_bytes": model.total_bytes(),
        "per_device": per_device,
    })
}

fn sparsity(model: &Model) -> Value {
    let (zeros, elements) = model
        .named_parameters()
        .filter(|(_, t)| t.dtype.is_float())
        .filter_map(|(_, t)| t.zero_count().map(|z| (z, t.numel())))
        .fold((0usize, 0usize), |(z, n), (tz, tn)| (z + tz, n + tn));
    let fraction = if elements == 0 {
        0.0
    } else {
        zeros as f64 / elements as f64
    };
    json!({ "zeros": zeros, "elements": elements, "zero_fraction": fraction })
}
