//! End-to-end runs of the pipeline driver against toy checkpoints on disk.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use sparq::awq::{AwqResults, CalibrationConfig, ScaleSearch, WeightOnlySearch};
use sparq::io::save_state_dict;
use sparq::pipeline::{Components, Driver, RunOptions, StageOutcome, Termination, SPARSITY_REPORT};
use sparq::quant::{Quantizer, RtnQuantizer, SparsityReport};
use sparq::ModelLoader;
use sparq_core::{DType, Error, Mode, Model, ModelConfig, QuantConfig, Result, Tensor};
use sparq_mask::{EncodedMask, MaskDictionary};
use tempfile::tempdir;

struct CountingSearch {
    calls: Rc<Cell<usize>>,
}

impl ScaleSearch for CountingSearch {
    fn search(
        &self,
        model: &mut Model,
        config: &QuantConfig,
        calibration: &CalibrationConfig,
    ) -> Result<AwqResults> {
        self.calls.set(self.calls.get() + 1);
        WeightOnlySearch::default().search(model, config, calibration)
    }
}

fn counting_components() -> (Components, Rc<Cell<usize>>) {
    let calls = Rc::new(Cell::new(0));
    let components = Components {
        search: Box::new(CountingSearch {
            calls: Rc::clone(&calls),
        }),
        ..Components::default()
    };
    (components, calls)
}

fn random(rng: &mut StdRng, shape: Vec<usize>) -> Tensor {
    let n = shape.iter().product();
    let values = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_f32(shape, DType::F32, values).unwrap()
}

fn write_checkpoint(dir: &Path, model: &Model, config: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("config.json"), config).unwrap();
    save_state_dict(model, &dir.join("model.safetensors"), None).unwrap();
    dir.to_path_buf()
}

/// Two-block llama with hidden size 8 and intermediate size 16.
fn write_llama(dir: &Path) -> PathBuf {
    let mut rng = StdRng::seed_from_u64(42);
    let config = ModelConfig {
        model_type: "llama".into(),
        tie_word_embeddings: true,
        torch_dtype: Some("float32".into()),
    };
    let mut model = Model::new("toy-llama", config);
    model.insert("model.embed_tokens.weight", random(&mut rng, vec![32, 8]));
    for i in 0..2 {
        let p = format!("model.layers.{i}");
        model.insert(
            format!("{p}.input_layernorm.weight"),
            Tensor::from_f32(vec![8], DType::F32, vec![1.0; 8]).unwrap(),
        );
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            model.insert(format!("{p}.self_attn.{proj}.weight"), random(&mut rng, vec![8, 8]));
        }
        model.insert(
            format!("{p}.post_attention_layernorm.weight"),
            Tensor::from_f32(vec![8], DType::F32, vec![1.0; 8]).unwrap(),
        );
        model.insert(format!("{p}.mlp.gate_proj.weight"), random(&mut rng, vec![16, 8]));
        model.insert(format!("{p}.mlp.up_proj.weight"), random(&mut rng, vec![16, 8]));
        model.insert(format!("{p}.mlp.down_proj.weight"), random(&mut rng, vec![8, 16]));
    }
    model.insert(
        "model.norm.weight",
        Tensor::from_f32(vec![8], DType::F32, vec![1.0; 8]).unwrap(),
    );
    write_checkpoint(
        dir,
        &model,
        r#"{"model_type": "llama", "tie_word_embeddings": true, "torch_dtype": "float32"}"#,
    )
}

/// Generic model with `layer0.weight` and `layer1.weight`, no zeros anywhere.
fn write_two_layer(dir: &Path) -> PathBuf {
    let mut model = Model::new("toy", ModelConfig::default());
    let values: Vec<f32> = (0..16).map(|i| (i % 4 + 1) as f32).collect();
    for name in ["layer0.weight", "layer1.weight"] {
        model.insert(name, Tensor::from_f32(vec![4, 4], DType::F32, values.clone()).unwrap());
    }
    write_checkpoint(dir, &model, r#"{"model_type": "toy"}"#)
}

fn options(root: &Path, model_path: PathBuf) -> RunOptions {
    RunOptions {
        model_path,
        offload_dir: root.join("offload"),
        ..RunOptions::default()
    }
}

#[test]
fn test_existing_search_results_skip_the_search() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("awq.pt");
    fs::write(&dump, b"previous results").unwrap();

    let mut opts = options(dir.path(), model_path);
    opts.run_awq = true;
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.dump_awq = Some(dump.clone());

    let (components, calls) = counting_components();
    match Driver::with_components(opts, components).run().unwrap() {
        StageOutcome::Terminate(Termination::SearchResultsExist(path)) => assert_eq!(path, dump),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(calls.get(), 0);
    assert_eq!(fs::read(&dump).unwrap(), b"previous results");
}

#[test]
fn test_existing_search_results_end_the_run_before_validation() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("awq.pt");
    fs::write(&dump, b"previous results").unwrap();

    // --run-awq with --dump-quant alone would be rejected.
    let mut opts = options(dir.path(), model_path);
    opts.run_awq = true;
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.q_backend = "real".into();
    opts.dump_awq = Some(dump.clone());
    opts.dump_quant = Some(dir.path().join("q.safetensors"));

    let (components, calls) = counting_components();
    match Driver::with_components(opts, components).run().unwrap() {
        StageOutcome::Terminate(Termination::SearchResultsExist(path)) => assert_eq!(path, dump),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(calls.get(), 0);
    assert!(!dir.path().join("q.safetensors").exists());
}

#[test]
fn test_search_saves_results_and_stops() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("awq_cache/llama-w4-g4.pt");
    let output = dir.path().join("results.json");

    let mut opts = options(dir.path(), model_path);
    opts.run_awq = true;
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.dump_awq = Some(dump.clone());
    opts.tasks = Some("sparsity".into());
    opts.output_path = Some(output.clone());

    let (components, calls) = counting_components();
    match Driver::with_components(opts, components).run().unwrap() {
        StageOutcome::Terminate(Termination::SearchResultsSaved(path)) => assert_eq!(path, dump),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(calls.get(), 1);
    let results = AwqResults::load(&dump).unwrap();
    assert_eq!(results.scales.len(), 8);
    assert!(!output.exists(), "search runs must not evaluate");
}

#[test]
fn test_loaded_scales_applied_before_quantization() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("awq.pt");

    let mut search = options(dir.path(), model_path.clone());
    search.run_awq = true;
    search.w_bit = Some(4);
    search.q_group_size = 4;
    search.dump_awq = Some(dump.clone());
    Driver::new(search).run().unwrap();

    let mut apply = options(dir.path(), model_path);
    apply.run_awq = true;
    apply.load_awq = Some(dump);
    apply.auto_dispatch = false;
    let (components, calls) = counting_components();
    match Driver::with_components(apply, components).run().unwrap() {
        StageOutcome::Continue(model) => assert_eq!(model.mode(), Mode::Eval),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_conflicts_fail_before_touching_anything() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");

    let mut opts = options(dir.path(), dir.path().join("absent-model"));
    opts.run_awq = true;
    opts.w_bit = Some(4);
    opts.dump_awq = Some(out.join("awq.pt"));
    opts.dump_quant = Some(out.join("q.safetensors"));
    opts.q_backend = "real".into();
    assert!(matches!(Driver::new(opts).run(), Err(Error::Precondition(_))));

    let mut opts = options(dir.path(), dir.path().join("absent-model"));
    opts.w_bit = Some(4);
    opts.dump_quant = Some(out.join("q.safetensors"));
    opts.output_folder = Some(out.clone());
    assert!(matches!(Driver::new(opts).run(), Err(Error::Precondition(_))));

    assert!(!out.exists());
    assert!(!dir.path().join("offload").exists());
}

#[test]
fn test_fake_quantization_reports_sparsity() {
    let dir = tempdir().unwrap();
    let model_path = write_two_layer(&dir.path().join("model"));
    let report_dir = dir.path().join("reports/run");

    let mut opts = options(dir.path(), model_path);
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.output_folder = Some(report_dir.clone());

    let model = match Driver::new(opts).run().unwrap() {
        StageOutcome::Continue(model) => model,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(model.mode(), Mode::Eval);

    let report: SparsityReport =
        serde_json::from_str(&fs::read_to_string(report_dir.join(SPARSITY_REPORT)).unwrap()).unwrap();
    assert_eq!(report.model_sparsity, 0.0);
    assert_eq!(
        report.sparsity_per_layer.keys().collect::<Vec<_>>(),
        vec!["layer0", "layer1"]
    );
}

#[test]
fn test_mask_applied_before_quantization() {
    let dir = tempdir().unwrap();
    let model_path = write_two_layer(&dir.path().join("model"));
    let mask_path = dir.path().join("mask.bin");
    let mut dict = MaskDictionary::new();
    dict.insert("layer0.weight", EncodedMask::from_bits(vec![4, 4], &[true; 16]).unwrap());
    dict.insert("layer1.weight", EncodedMask::from_bits(vec![4, 4], &[false; 16]).unwrap());
    dict.save(&mask_path).unwrap();

    let mut opts = options(dir.path(), model_path);
    opts.apply_sparse_mask = Some(mask_path);
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.output_folder = Some(dir.path().to_path_buf());
    opts.auto_dispatch = false;
    Driver::new(opts).run().unwrap();

    let report: SparsityReport =
        serde_json::from_str(&fs::read_to_string(dir.path().join(SPARSITY_REPORT)).unwrap()).unwrap();
    assert_eq!(report.sparsity_per_layer["layer0"], 1.0);
    assert_eq!(report.sparsity_per_layer["layer1"], 0.0);
    assert_eq!(report.model_sparsity, 0.5);
}

#[test]
fn test_stale_mask_entry_aborts_run() {
    let dir = tempdir().unwrap();
    let model_path = write_two_layer(&dir.path().join("model"));
    let mask_path = dir.path().join("mask.bin");
    let mut dict = MaskDictionary::new();
    dict.insert("layer9.weight", EncodedMask::from_bits(vec![1], &[true]).unwrap());
    dict.save(&mask_path).unwrap();

    let mut opts = options(dir.path(), model_path);
    opts.apply_sparse_mask = Some(mask_path);
    let err = Driver::new(opts).run().unwrap_err();
    assert_eq!(err.category(), "unconsumed_mask");
}

#[test]
fn test_real_dump_reloads_identically() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("quant_cache/llama-w4-g4.safetensors");

    let mut opts = options(dir.path(), model_path.clone());
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.q_backend = "real".into();
    opts.dump_quant = Some(dump.clone());
    match Driver::new(opts).run().unwrap() {
        StageOutcome::Terminate(Termination::QuantizedDumpSaved(path)) => assert_eq!(path, dump),
        other => panic!("unexpected outcome {other:?}"),
    }

    let mut opts = options(dir.path(), model_path.clone());
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.load_quant = Some(dump.clone());
    let loaded = match Driver::new(opts).run().unwrap() {
        StageOutcome::Continue(model) => model,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(loaded.mode(), Mode::Eval);

    let mut expected = ModelLoader::new(&model_path).load().unwrap();
    let config = QuantConfig::new(4, 4, true).unwrap();
    RtnQuantizer.real_quantize(&mut expected, &config, false).unwrap();

    let mut packed = 0;
    for (name, tensor) in expected.named_parameters() {
        if name.ends_with(".qweight") || name.ends_with(".qzeros") {
            assert_eq!(loaded.get(name).unwrap().as_u8(), tensor.as_u8(), "{name}");
            packed += 1;
        }
    }
    assert_eq!(packed, 2 * 7 * 2);
    assert!(!loaded.contains("model.layers.0.self_attn.q_proj.weight"));
}

#[test]
fn test_prequantized_config_mismatch_rejected() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let dump = dir.path().join("q.safetensors");

    let mut opts = options(dir.path(), model_path.clone());
    opts.w_bit = Some(4);
    opts.q_group_size = 4;
    opts.q_backend = "real".into();
    opts.dump_quant = Some(dump.clone());
    Driver::new(opts).run().unwrap();

    let mut opts = options(dir.path(), model_path);
    opts.w_bit = Some(4);
    opts.q_group_size = 8;
    opts.load_quant = Some(dump);
    assert!(matches!(Driver::new(opts).run(), Err(Error::Precondition(_))));
}

#[test]
fn test_evaluation_overwrites_results() {
    let dir = tempdir().unwrap();
    let model_path = write_llama(&dir.path().join("model"));
    let output = dir.path().join("results.json");
    fs::write(&output, "stale").unwrap();

    let mut opts = options(dir.path(), model_path.clone());
    opts.tasks = Some("footprint,sparsity".into());
    opts.output_path = Some(output.clone());
    opts.accelerators = vec!["0:4KiB".into()];
    Driver::new(opts).run().unwrap();

    let text = fs::read_to_string(&output).unwrap();
    assert!(text.starts_with("{\n  \""));
    let results: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(results["config"]["model"], Value::from(model_path.display().to_string()));
    let per_device = &results["results"]["footprint"]["per_device"];
    assert!(per_device.get("0").is_some());
    assert!(per_device.get("cpu").is_some());
    assert_eq!(results["versions"]["sparsity"], Value::from(0));
}
