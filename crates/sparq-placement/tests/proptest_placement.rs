//! Property-based tests for placement.
//!
//! Run with: cargo test -p sparq-placement --test proptest_placement

use std::collections::HashMap;

use proptest::prelude::*;
use tempfile::tempdir;

use sparq_core::{DType, Device, Model, ModelConfig, Tensor};
use sparq_placement::{
    balanced_memory, dispatch, placement_units, unit_of, DeviceInventory, MaxMemory, OffloadStore,
    PlacementStrategy, SequentialFill,
};

/// Strategy for a toy llama model: block count and per-block row counts.
fn block_rows_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..8, 1..10)
}

/// Strategy for accelerator count.
fn accelerator_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![Just(0usize), Just(1), Just(2), Just(4)]
}

fn llama(block_rows: &[usize]) -> Model {
    let config = ModelConfig {
        model_type: "llama".into(),
        tie_word_embeddings: false,
        torch_dtype: None,
    };
    let mut model = Model::new("prop-llama", config);
    model.insert(
        "model.embed_tokens.weight",
        Tensor::from_f32(vec![8, 4], DType::F16, vec![0.5; 32]).unwrap(),
    );
    for (i, &rows) in block_rows.iter().enumerate() {
        for proj in ["self_attn.q_proj", "mlp.up_proj"] {
            model.insert(
                format!("model.layers.{i}.{proj}.weight"),
                Tensor::from_f32(vec![rows, 4], DType::F16, vec![0.5; rows * 4]).unwrap(),
            );
        }
    }
    model
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    /// Property: after dispatch every parameter of a block sits on the block's
    /// single device, and no budget is exceeded.
    #[test]
    fn prop_sequential_fill_respects_budgets(
        block_rows in block_rows_strategy(),
        accelerators in accelerator_strategy(),
        capacity in 32u64..256,
    ) {
        let mut model = llama(&block_rows);
        let units = placement_units(&model);
        prop_assert_eq!(units.len(), block_rows.len() + 1);

        let mut configured = MaxMemory::new();
        for id in 0..accelerators {
            configured.set(Device::Accelerator(id), capacity);
        }
        let inventory = DeviceInventory { accelerators: Default::default(), host: capacity };
        let mut max_memory = DeviceInventory::detect(&configured).max_memory();
        max_memory.set(Device::Host, inventory.host);

        let budgets = balanced_memory(&units, Some(&max_memory), &inventory);
        let map = SequentialFill.place(&units, &budgets).unwrap();
        map.verify(&units, &budgets).unwrap();

        let dir = tempdir().unwrap();
        let mut store = OffloadStore::open(dir.path().join("offload")).unwrap();
        dispatch(&mut model, &map, &mut store).unwrap();

        let mut block_devices: HashMap<String, Device> = HashMap::new();
        for (name, tensor) in model.named_parameters() {
            prop_assert_eq!(Some(tensor.device), map.get(&unit_of(&model, name)));
            if let Some(block) = model.block_of(name) {
                let first = *block_devices.entry(block).or_insert(tensor.device);
                prop_assert_eq!(first, tensor.device);
            }
        }
        prop_assert_eq!(block_devices.len(), block_rows.len());
        for (_, device) in map.iter() {
            if let Device::Accelerator(id) = device {
                prop_assert!(id < accelerators);
            }
        }
    }
}
