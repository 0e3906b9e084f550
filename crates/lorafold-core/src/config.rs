//! Model and adapter configuration
//!
//! Both records are validated before any tensor is allocated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{FinetuneError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub layer_norm_eps: f64,
    /// Whether linear projections carry a bias vector
    pub linear_bias: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 2048,
            layer_norm_eps: 1e-5,
            linear_bias: false,
        }
    }
}

impl ModelConfig {
    pub fn tiny() -> Self {
        Self {
            hidden_size: 256,
            num_layers: 4,
            num_heads: 4,
            intermediate_size: 1024,
            max_position_embeddings: 512,
            ..Default::default()
        }
    }

    pub fn small() -> Self {
        Self {
            hidden_size: 512,
            num_layers: 8,
            num_heads: 8,
            intermediate_size: 2048,
            max_position_embeddings: 1024,
            ..Default::default()
        }
    }

    pub fn medium() -> Self {
        Self::default()
    }

    /// Preset lookup used by the CLI
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            "medium" => Ok(Self::medium()),
            _ => Err(FinetuneError::config(format!(
                "unknown model size: {name}. Use: tiny, small, medium"
            ))),
        }
    }

    /// Builder: set vocab_size (must match tokenizer)
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn with_linear_bias(mut self, linear_bias: bool) -> Self {
        self.linear_bias = linear_bias;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Total parameter count of the dense model
    pub fn total_params(&self) -> usize {
        let h = self.hidden_size;
        let bias = |n: usize| if self.linear_bias { n } else { 0 };

        let embeddings = self.vocab_size * h + self.max_position_embeddings * h;
        let attention = 4 * (h * h + bias(h));
        let mlp = 2 * (h * self.intermediate_size + bias(self.intermediate_size))
            + self.intermediate_size * h
            + bias(h);
        let norms = 2 * 2 * h;
        let per_layer = attention + mlp + norms;
        let head = h * self.vocab_size + bias(self.vocab_size) + 2 * h;

        embeddings + self.num_layers * per_layer + head
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_layers == 0 {
            return Err(FinetuneError::config(
                "vocab_size, hidden_size and num_layers must be > 0",
            ));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(FinetuneError::config(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.intermediate_size == 0 || self.max_position_embeddings == 0 {
            return Err(FinetuneError::config(
                "intermediate_size and max_position_embeddings must be > 0",
            ));
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(FinetuneError::config("layer_norm_eps must be > 0"));
        }
        Ok(())
    }
}

/// Which bias vectors become trainable alongside the low-rank matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    #[default]
    None,
    All,
    LoraOnly,
}

impl std::str::FromStr for BiasMode {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(BiasMode::None),
            "all" => Ok(BiasMode::All),
            "lora_only" => Ok(BiasMode::LoraOnly),
            _ => Err(FinetuneError::config(format!(
                "unknown bias mode: {s}. Use: none, all, lora_only"
            ))),
        }
    }
}

/// LoRA adapter configuration, fixed for the lifetime of a run.
///
/// Fields are private so that every instance went through [`AdapterConfig::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAdapterConfig", into = "RawAdapterConfig")]
pub struct AdapterConfig {
    rank: usize,
    alpha: f64,
    dropout: f64,
    target_modules: BTreeSet<String>,
    bias_mode: BiasMode,
    init_seed: u64,
}

impl AdapterConfig {
    pub fn new<I, S>(
        rank: usize,
        alpha: f64,
        dropout: f64,
        target_modules: I,
        bias_mode: BiasMode,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config = Self {
            rank,
            alpha,
            dropout,
            target_modules: target_modules.into_iter().map(Into::into).collect(),
            bias_mode,
            init_seed: 0,
        };
        config.validate()?;
        Ok(config)
    }

    /// Builder: seed for the `A` matrix initialisation
    pub fn with_init_seed(mut self, seed: u64) -> Self {
        self.init_seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(FinetuneError::config("adapter rank must be > 0"));
        }
        if !(self.alpha > 0.0) {
            return Err(FinetuneError::config(format!(
                "adapter alpha must be > 0, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FinetuneError::config(format!(
                "adapter dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(FinetuneError::config("target_modules must not be empty"));
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn dropout(&self) -> f64 {
        self.dropout
    }

    pub fn target_modules(&self) -> &BTreeSet<String> {
        &self.target_modules
    }

    pub fn bias_mode(&self) -> BiasMode {
        self.bias_mode
    }

    pub fn init_seed(&self) -> u64 {
        self.init_seed
    }

    /// `alpha / r`
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// A module is targeted when its full dotted name, or its last
    /// component, appears in `target_modules`.
    pub fn targets(&self, module_name: &str) -> bool {
        if self.target_modules.contains(module_name) {
            return true;
        }
        module_name
            .rsplit('.')
            .next()
            .map(|leaf| self.target_modules.contains(leaf))
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize)]
struct RawAdapterConfig {
    rank: usize,
    alpha: f64,
    dropout: f64,
    target_modules: BTreeSet<String>,
    #[serde(default)]
    bias_mode: BiasMode,
    #[serde(default)]
    init_seed: u64,
}

impl TryFrom<RawAdapterConfig> for AdapterConfig {
    type Error = FinetuneError;

    fn try_from(raw: RawAdapterConfig) -> Result<Self> {
        let config = AdapterConfig::new(
            raw.rank,
            raw.alpha,
            raw.dropout,
            raw.target_modules,
            raw.bias_mode,
        )?;
        Ok(config.with_init_seed(raw.init_seed))
    }
}

impl From<AdapterConfig> for RawAdapterConfig {
    fn from(config: AdapterConfig) -> Self {
        Self {
            rank: config.rank,
            alpha: config.alpha,
            dropout: config.dropout,
            target_modules: config.target_modules,
            bias_mode: config.bias_mode,
            init_seed: config.init_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_sizes() {
        let tiny = ModelConfig::tiny();
        let small = ModelConfig::small();
        let medium = ModelConfig::medium();

        assert!(tiny.total_params() < small.total_params());
        assert!(small.total_params() < medium.total_params());
    }

    #[test]
    fn test_model_validation() {
        assert!(ModelConfig::default().validate().is_ok());

        let mut invalid = ModelConfig::default();
        invalid.hidden_size = 777; // Not divisible by num_heads
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_adapter_rejects_bad_values() {
        assert!(AdapterConfig::new(0, 16.0, 0.0, ["q_proj"], BiasMode::None).is_err());
        assert!(AdapterConfig::new(8, 0.0, 0.0, ["q_proj"], BiasMode::None).is_err());
        assert!(AdapterConfig::new(8, 16.0, 1.0, ["q_proj"], BiasMode::None).is_err());
        assert!(AdapterConfig::new(8, 16.0, 0.1, Vec::<String>::new(), BiasMode::None).is_err());
    }

    #[test]
    fn test_target_matching() -> Result<()> {
        let config = AdapterConfig::new(8, 16.0, 0.05, ["q_proj", "v_proj"], BiasMode::None)?;
        assert!(config.targets("layers.3.self_attn.q_proj"));
        assert!(config.targets("v_proj"));
        assert!(!config.targets("layers.3.self_attn.k_proj"));
        assert_eq!(config.scaling(), 2.0);
        Ok(())
    }

    #[test]
    fn test_adapter_config_json_is_validated() {
        let json = r#"{"rank":0,"alpha":16.0,"dropout":0.0,"target_modules":["q_proj"]}"#;
        assert!(serde_json::from_str::<AdapterConfig>(json).is_err());

        let json = r#"{"rank":4,"alpha":16.0,"dropout":0.0,"target_modules":["q_proj"],"bias_mode":"lora_only"}"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bias_mode(), BiasMode::LoraOnly);
    }
}
