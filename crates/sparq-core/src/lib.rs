//! # sparq core
//!
//! Shared types for the sparq quantization pipeline: the error taxonomy,
//! storage dtypes and placement targets, owned tensors, and the model
//! handle whose parameter table every pipeline stage mutates in turn.
//!
//! ## Ownership
//!
//! A pipeline run owns exactly one [`Model`]. Masking, scale application,
//! quantization and dispatch each take `&mut Model`, complete their
//! mutation, and return. The stages never overlap.
//!
//! ```ignore
//! use sparq_core::{DType, Model, ModelConfig, Tensor};
//!
//! let mut model = Model::new("toy", ModelConfig::default());
//! model.insert("layer0.weight", Tensor::from_f32(vec![4, 4], DType::F32, vec![1.0; 16])?);
//! ```

pub mod error;
pub mod model;
pub mod tensor;
pub mod types;

pub use error::{Error, Result};
pub use model::{module_of, Architecture, Mode, Model, ModelConfig};
pub use tensor::{Tensor, TensorData};
pub use types::{DType, Device, QuantConfig};
