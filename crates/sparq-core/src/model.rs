//! The model handle: an ordered parameter table plus architecture metadata.
//!
//! The parameter table is the one mutable resource of a pipeline run. Stages
//! receive `&mut Model`, finish their mutation, and hand it back; nothing
//! keeps a reference across stages.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Device, Error, Result, Tensor};

/// Known decoder architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// LLaMA family (`model.layers.N`).
    Llama,
    /// OPT family (`model.decoder.layers.N`).
    Opt,
    /// BLOOM family (`transformer.h.N`).
    Bloom,
    /// MPT family (`transformer.blocks.N`).
    Mpt,
    /// Anything else: no known block container.
    Generic,
}

impl Architecture {
    /// Maps a `model_type` string from `config.json`.
    pub fn from_model_type(model_type: &str) -> Self {
        match model_type.to_ascii_lowercase().as_str() {
            "llama" | "mistral" | "qwen2" => Architecture::Llama,
            "opt" => Architecture::Opt,
            "bloom" => Architecture::Bloom,
            "mpt" => Architecture::Mpt,
            _ => Architecture::Generic,
        }
    }

    /// Prefix under which the numbered decoder blocks live.
    #[must_use]
    pub fn block_container(&self) -> Option<&'static str> {
        match self {
            Architecture::Llama => Some("model.layers"),
            Architecture::Opt => Some("model.decoder.layers"),
            Architecture::Bloom => Some("transformer.h"),
            Architecture::Mpt => Some("transformer.blocks"),
            Architecture::Generic => None,
        }
    }

    /// Name of the decoder block class that must never be split across devices.
    #[must_use]
    pub fn block_class(&self) -> &'static str {
        match self {
            Architecture::Llama => "LlamaDecoderLayer",
            Architecture::Opt => "OPTDecoderLayer",
            Architecture::Bloom => "BloomBlock",
            Architecture::Mpt => "MPTBlock",
            Architecture::Generic => "DecoderLayer",
        }
    }

    /// (input embedding, output head) parameter names for weight tying.
    #[must_use]
    pub fn tied_pair(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Architecture::Llama => Some(("model.embed_tokens.weight", "lm_head.weight")),
            Architecture::Opt => Some(("model.decoder.embed_tokens.weight", "lm_head.weight")),
            Architecture::Bloom => Some(("transformer.word_embeddings.weight", "lm_head.weight")),
            Architecture::Mpt => Some(("transformer.wte.weight", "lm_head.weight")),
            Architecture::Generic => None,
        }
    }
}

/// Subset of a Hugging Face `config.json` the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family tag.
    #[serde(default)]
    pub model_type: String,
    /// Whether the output head shares the input embedding.
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
    /// Declared parameter dtype.
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: String::new(),
            tie_word_embeddings: false,
            torch_dtype: None,
        }
    }
}

fn default_tie_word_embeddings() -> bool {
    true
}

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Training mode (initial state).
    #[default]
    Train,
    /// Evaluation mode.
    Eval,
}

/// A model: named parameters in definition order.
#[derive(Debug, Clone)]
pub struct Model {
    /// Model identifier (path or hub id).
    pub name: String,
    /// Model configuration.
    pub config: ModelConfig,
    params: IndexMap<String, Tensor>,
    tied: IndexMap<String, String>,
    mode: Mode,
}

impl Model {
    /// Creates an empty model.
    pub fn new(name: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            params: IndexMap::new(),
            tied: IndexMap::new(),
            mode: Mode::Train,
        }
    }

    /// Architecture derived from the config.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        Architecture::from_model_type(&self.config.model_type)
    }

    /// Inserts or replaces a parameter, keeping its position if it existed.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.params.insert(name.into(), tensor)
    }

    /// Removes a parameter, preserving the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.params.shift_remove(name)
    }

    /// Replaces parameter `name` with `replacements`, inserted at its position.
    ///
    /// Returns the removed tensor, or `None` (and inserts nothing) if `name`
    /// is not owned by the table.
    pub fn replace(&mut self, name: &str, replacements: Vec<(String, Tensor)>) -> Option<Tensor> {
        let index = self.params.get_index_of(name)?;
        let removed = self.params.shift_remove(name);
        for (offset, (key, tensor)) in replacements.into_iter().enumerate() {
            self.params.shift_insert(index + offset, key, tensor);
        }
        removed
    }

    /// Gets a parameter, following tied aliases.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        let name = self.tied.get(name).map_or(name, String::as_str);
        self.params.get(name)
    }

    /// Gets a mutable parameter (aliases are not followed).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.params.get_mut(name)
    }

    /// Returns true if the parameter table owns `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Iterates parameters in definition order.
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates parameters mutably in definition order.
    pub fn named_parameters_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.params.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Parameter names in definition order.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    /// Number of owned parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Returns true if the model has no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Tied aliases (alias -> source).
    #[must_use]
    pub fn tied(&self) -> &IndexMap<String, String> {
        &self.tied
    }

    /// Ties the output head to the input embedding when the config asks for it.
    ///
    /// The head's own storage is dropped; lookups through [`Model::get`]
    /// resolve to the embedding.
    pub fn tie_weights(&mut self) {
        if !self.config.tie_word_embeddings {
            return;
        }
        let Some((embed, head)) = self.architecture().tied_pair() else {
            return;
        };
        if !self.params.contains_key(embed) {
            return;
        }
        self.params.shift_remove(head);
        self.tied.insert(head.to_string(), embed.to_string());
    }

    /// Switches to evaluation mode.
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Total storage footprint in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.params.values().map(Tensor::size_bytes).sum()
    }

    /// Storage footprint per placement target.
    #[must_use]
    pub fn footprint(&self) -> IndexMap<Device, u64> {
        let mut out: IndexMap<Device, u64> = IndexMap::new();
        for tensor in self.params.values() {
            *out.entry(tensor.device).or_default() += tensor.size_bytes();
        }
        out.sort_keys();
        out
    }

    /// Retags every parameter as host-resident.
    ///
    /// Fails if any parameter has been offloaded to disk, since its contents
    /// are no longer held by the table.
    pub fn to_host(&mut self) -> Result<()> {
        for (name, tensor) in &mut self.params {
            if tensor.device == Device::Disk {
                return Err(Error::precondition(format!(
                    "'{name}' is offloaded to disk and cannot be moved to host"
                )));
            }
            tensor.device = Device::Host;
        }
        Ok(())
    }

    /// The decoder block containing `param`, e.g. `model.layers.3`.
    #[must_use]
    pub fn block_of(&self, param: &str) -> Option<String> {
        let container = self.architecture().block_container()?;
        let rest = param.strip_prefix(container)?.strip_prefix('.')?;
        let index = rest.split('.').next()?;
        index
            .parse::<usize>()
            .ok()
            .map(|i| format!("{container}.{i}"))
    }

    /// Module names of the linear layers that quantization rewrites.
    ///
    /// For known architectures these are the 2-D `.weight` parameters inside
    /// decoder blocks. For generic models every 2-D `.weight` except
    /// embeddings and the output head.
    #[must_use]
    pub fn quantizable_layers(&self) -> Vec<String> {
        let arch = self.architecture();
        self.params
            .iter()
            .filter(|(_, t)| t.shape.len() == 2 && t.dtype.is_float())
            .filter_map(|(name, _)| name.strip_suffix(".weight").map(|m| (name, m)))
            .filter(|(name, module)| match arch.block_container() {
                Some(_) => self.block_of(name).is_some(),
                None => !is_embedding_or_head(module),
            })
            .map(|(_, module)| module.to_string())
            .collect()
    }
}

/// Module path of a parameter (its name without the final component).
#[must_use]
pub fn module_of(param: &str) -> &str {
    param.rsplit_once('.').map_or(param, |(module, _)| module)
}

fn is_embedding_or_head(module: &str) -> bool {
    let leaf = module.rsplit('.').next().unwrap_or(module);
    leaf.contains("embed") || matches!(leaf, "lm_head" | "wte" | "wpe")
}
