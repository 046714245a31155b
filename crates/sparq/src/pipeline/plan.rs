//! Resolving run options into exactly one plan.
//!
//! Every conflict between options is rejected here, before the model is
//! loaded or any file is touched.

use std::path::PathBuf;
use std::str::FromStr;

use sparq_core::{Error, QuantConfig, Result};
use sparq_placement::MaxMemory;

use super::RunOptions;
use crate::awq::CalibrationConfig;

/// Quantization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBackend {
    /// Round onto the grid, keep float storage.
    Fake,
    /// Replace weights with packed levels.
    Real,
}

impl FromStr for QuantBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fake" => Ok(QuantBackend::Fake),
            "real" => Ok(QuantBackend::Real),
            other => Err(Error::precondition(format!(
                "unsupported quantization backend '{other}'"
            ))),
        }
    }
}

/// What to do with the weights after masking and scaling.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantStep {
    /// Keep full precision.
    Skip,
    /// Fake quantization; the sparsity report goes to `report_dir` if set.
    Fake {
        config: QuantConfig,
        report_dir: Option<PathBuf>,
    },
    /// Real quantization; the state dict goes to `dump` if set, ending the run.
    Real {
        config: QuantConfig,
        dump: Option<PathBuf>,
    },
}

/// Device placement after quantization.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchPlan {
    /// Leave every parameter on the host.
    Keep,
    /// Balance budgets across accelerators, then place.
    Balanced { max_memory: Option<MaxMemory> },
}

/// One resolved pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunPlan {
    /// Build placeholders, stream a real-quantized checkpoint into place.
    LoadPrequantized {
        checkpoint: PathBuf,
        quant: QuantConfig,
        max_memory: Option<MaxMemory>,
    },
    /// Search AWQ scales, save them, stop.
    Search {
        mask: Option<PathBuf>,
        quant: QuantConfig,
        output: PathBuf,
        calibration: CalibrationConfig,
    },
    /// Load full precision, then mask, scale, quantize and dispatch.
    Fresh {
        mask: Option<PathBuf>,
        scales: Option<PathBuf>,
        quant: QuantStep,
        dispatch: DispatchPlan,
    },
}

impl RunPlan {
    /// Checks every precondition and picks the plan.
    pub fn resolve(options: &RunOptions) -> Result<Self> {
        let backend: QuantBackend = options.q_backend.parse()?;
        let quant = options
            .w_bit
            .map(|w_bit| QuantConfig::new(w_bit, options.q_group_size, options.zero_point))
            .transpose()?;
        let max_memory = if options.max_memory.is_empty() {
            None
        } else {
            Some(MaxMemory::parse(&options.max_memory)?)
        };
        MaxMemory::parse(&options.accelerators)?;

        if let Some(checkpoint) = &options.load_quant {
            let quant = quant.ok_or_else(|| {
                Error::precondition("loading quantized weights requires --w-bit")
            })?;
            let conflicts = [
                (options.run_awq, "--run-awq"),
                (options.load_awq.is_some(), "--load-awq"),
                (options.dump_quant.is_some(), "--dump-quant"),
                (options.apply_sparse_mask.is_some(), "--apply-sparse-mask"),
            ];
            if let Some((_, flag)) = conflicts.iter().find(|(set, _)| *set) {
                return Err(Error::precondition(format!(
                    "--load-quant cannot be combined with {flag}"
                )));
            }
            return Ok(RunPlan::LoadPrequantized {
                checkpoint: checkpoint.clone(),
                quant,
                max_memory,
            });
        }

        if options.run_awq && options.load_awq.is_none() {
            let output = options
                .dump_awq
                .clone()
                .ok_or_else(|| Error::precondition("save the awq results with --dump-awq"))?;
            let quant = quant.ok_or_else(|| Error::precondition("the AWQ search requires --w-bit"))?;
            if options.dump_quant.is_some() {
                return Err(Error::precondition(
                    "--run-awq ends the run after saving results and cannot be combined with --dump-quant",
                ));
            }
            return Ok(RunPlan::Search {
                mask: options.apply_sparse_mask.clone(),
                quant,
                output,
                calibration: CalibrationConfig::default(),
            });
        }

        let quant = match (quant, backend) {
            (None, _) if options.dump_quant.is_some() => {
                return Err(Error::precondition("--dump-quant requires --w-bit"));
            }
            (None, _) => QuantStep::Skip,
            (Some(_), QuantBackend::Fake) if options.dump_quant.is_some() => {
                return Err(Error::precondition(
                    "cannot dump fake-quantized weights, use --q-backend real",
                ));
            }
            (Some(config), QuantBackend::Fake) => QuantStep::Fake {
                config,
                report_dir: options.output_folder.clone(),
            },
            (Some(config), QuantBackend::Real) => QuantStep::Real {
                config,
                dump: options.dump_quant.clone(),
            },
        };
        let dispatch = if options.auto_dispatch {
            DispatchPlan::Balanced { max_memory }
        } else {
            DispatchPlan::Keep
        };

        Ok(RunPlan::Fresh {
            mask: options.apply_sparse_mask.clone(),
            scales: options.load_awq.clone(),
            quant,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RunOptions {
        RunOptions {
            model_path: "model".into(),
            ..RunOptions::default()
        }
    }

    fn precondition(options: &RunOptions) -> String {
        match RunPlan::resolve(options) {
            Err(Error::Precondition(msg)) => msg,
            other => panic!("expected Precondition, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_resolve_to_fresh_skip() {
        match RunPlan::resolve(&options()).unwrap() {
            RunPlan::Fresh {
                mask: None,
                scales: None,
                quant: QuantStep::Skip,
                dispatch: DispatchPlan::Balanced { max_memory: None },
            } => {}
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_search_requires_output() {
        let mut opts = options();
        opts.run_awq = true;
        opts.w_bit = Some(4);
        assert!(precondition(&opts).contains("--dump-awq"));

        opts.dump_awq = Some("awq.pt".into());
        assert!(matches!(RunPlan::resolve(&opts).unwrap(), RunPlan::Search { .. }));

        opts.dump_quant = Some("q.safetensors".into());
        precondition(&opts);
    }

    #[test]
    fn test_search_with_loaded_scales_applies_them() {
        let mut opts = options();
        opts.run_awq = true;
        opts.load_awq = Some("awq.pt".into());
        match RunPlan::resolve(&opts).unwrap() {
            RunPlan::Fresh { scales: Some(path), .. } => assert_eq!(path, PathBuf::from("awq.pt")),
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_fake_dump_rejected() {
        let mut opts = options();
        opts.w_bit = Some(4);
        opts.dump_quant = Some("q.safetensors".into());
        assert!(precondition(&opts).contains("fake"));

        opts.q_backend = "real".into();
        match RunPlan::resolve(&opts).unwrap() {
            RunPlan::Fresh { quant: QuantStep::Real { dump: Some(_), .. }, .. } => {}
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_dump_without_bits_rejected() {
        let mut opts = options();
        opts.q_backend = "real".into();
        opts.dump_quant = Some("q.safetensors".into());
        assert!(precondition(&opts).contains("--w-bit"));
    }

    #[test]
    fn test_unknown_backend() {
        let mut opts = options();
        opts.q_backend = "gptq".into();
        assert!(precondition(&opts).contains("unsupported quantization backend"));
    }

    #[test]
    fn test_load_quant_conflicts() {
        let mut opts = options();
        opts.load_quant = Some("q.safetensors".into());
        assert!(precondition(&opts).contains("--w-bit"));

        opts.w_bit = Some(4);
        opts.max_memory = vec!["0:1GiB".into(), "cpu:4GiB".into()];
        match RunPlan::resolve(&opts).unwrap() {
            RunPlan::LoadPrequantized { max_memory: Some(m), .. } => assert_eq!(m.len(), 2),
            other => panic!("unexpected plan {other:?}"),
        }

        opts.apply_sparse_mask = Some("mask.bin".into());
        assert!(precondition(&opts).contains("--apply-sparse-mask"));
        opts.apply_sparse_mask = None;
        opts.run_awq = true;
        assert!(precondition(&opts).contains("--run-awq"));
    }

    #[test]
    fn test_no_auto_dispatch_keeps_placement() {
        let mut opts = options();
        opts.auto_dispatch = false;
        opts.w_bit = Some(3);
        opts.q_group_size = 128;
        opts.output_folder = Some("out".into());
        match RunPlan::resolve(&opts).unwrap() {
            RunPlan::Fresh {
                quant: QuantStep::Fake { config, report_dir: Some(_) },
                dispatch: DispatchPlan::Keep,
                ..
            } => assert_eq!(config.group_size, Some(128)),
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_invalid_budget_entry() {
        let mut opts = options();
        opts.max_memory = vec!["0".into()];
        assert!(RunPlan::resolve(&opts).is_err());
    }
}
