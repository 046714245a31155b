//! The quantization pipeline: plan resolution, stage execution and the driver.

mod driver;
mod evaluator;
mod options;
mod plan;
mod selector;

pub use driver::{Components, Driver, StageOutcome, Termination};
pub use evaluator::{EvalRequest, EvalResults, Evaluator, SummaryEvaluator};
pub use options::RunOptions;
pub use plan::{DispatchPlan, QuantBackend, QuantStep, RunPlan};
pub use selector::{Selector, SPARSITY_REPORT};
