//! Frozen base model and its causal LM forward pass
//!
//! `BaseModel` is the dense parameter set (name -> tensor) plus its config.
//! `CausalLm` is the runnable pre-norm transformer assembled from it, with
//! optional low-rank deltas attached to any linear module.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Embedding;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::path::Path;

use crate::adapter::{AdapterParams, LoraLinear};
use crate::attention::{build_attention_mask, MultiHeadAttention};
use crate::config::{AdapterConfig, ModelConfig};
use crate::error::{FinetuneError, Result};

pub const MODEL_WEIGHTS_FILENAME: &str = "model.safetensors";
pub const MODEL_CONFIG_FILENAME: &str = "config.json";

const INIT_STD: f64 = 0.02;

/// A linear module of the base model: `weight` is `[d_out, d_in]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearSpec {
    pub name: String,
    pub d_in: usize,
    pub d_out: usize,
}

impl LinearSpec {
    fn new(name: impl Into<String>, d_in: usize, d_out: usize) -> Self {
        Self {
            name: name.into(),
            d_in,
            d_out,
        }
    }

    pub fn weight_key(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_key(&self) -> String {
        format!("{}.bias", self.name)
    }
}

impl ModelConfig {
    /// Every linear module, in forward order
    pub fn linear_modules(&self) -> Vec<LinearSpec> {
        let h = self.hidden_size;
        let ffn = self.intermediate_size;
        let mut modules = Vec::with_capacity(self.num_layers * 7 + 1);

        for layer in 0..self.num_layers {
            let attn = format!("layers.{layer}.self_attn");
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                modules.push(LinearSpec::new(format!("{attn}.{proj}"), h, h));
            }
            let mlp = format!("layers.{layer}.mlp");
            modules.push(LinearSpec::new(format!("{mlp}.gate_proj"), h, ffn));
            modules.push(LinearSpec::new(format!("{mlp}.up_proj"), h, ffn));
            modules.push(LinearSpec::new(format!("{mlp}.down_proj"), ffn, h));
        }
        modules.push(LinearSpec::new("lm_head", h, self.vocab_size));
        modules
    }

    /// Expected name and shape of every tensor in the dense model
    pub fn expected_tensors(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let mut tensors = vec![
            ("embed_tokens.weight".to_string(), vec![self.vocab_size, h]),
            ("embed_positions.weight".to_string(), vec![self.max_position_embeddings, h]),
        ];
        for layer in 0..self.num_layers {
            for norm in ["input_layernorm", "post_attention_layernorm"] {
                tensors.push((format!("layers.{layer}.{norm}.weight"), vec![h]));
                tensors.push((format!("layers.{layer}.{norm}.bias"), vec![h]));
            }
        }
        tensors.push(("final_norm.weight".to_string(), vec![h]));
        tensors.push(("final_norm.bias".to_string(), vec![h]));

        for spec in self.linear_modules() {
            tensors.push((spec.weight_key(), vec![spec.d_out, spec.d_in]));
            if self.linear_bias {
                tensors.push((spec.bias_key(), vec![spec.d_out]));
            }
        }
        tensors
    }
}

/// Dense, frozen parameter set of a pretrained causal LM
#[derive(Debug, Clone)]
pub struct BaseModel {
    config: ModelConfig,
    weights: HashMap<String, Tensor>,
    device: Device,
}

impl BaseModel {
    /// Wrap an existing weight map, checking every expected tensor is present
    /// with the right shape.
    pub fn new(config: ModelConfig, weights: HashMap<String, Tensor>, device: Device) -> Result<Self> {
        config.validate()?;
        for (name, shape) in config.expected_tensors() {
            let tensor = weights
                .get(&name)
                .ok_or_else(|| FinetuneError::config(format!("base model is missing tensor '{name}'")))?;
            if tensor.dims() != shape.as_slice() {
                return Err(FinetuneError::config(format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    tensor.dims(),
                    shape
                )));
            }
        }
        Ok(Self {
            config,
            weights,
            device,
        })
    }

    /// Seeded random initialisation (normal(0, 0.02) weights, unit norms)
    pub fn random(config: ModelConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, INIT_STD as f32)
            .map_err(|e| FinetuneError::config(format!("invalid init distribution: {e}")))?;

        let mut weights = HashMap::new();
        for (name, shape) in config.expected_tensors() {
            let numel: usize = shape.iter().product();
            let data: Vec<f32> = if name.ends_with("norm.weight") {
                vec![1.0; numel]
            } else if name.ends_with(".bias") {
                vec![0.0; numel]
            } else {
                (0..numel).map(|_| normal.sample(&mut rng)).collect()
            };
            let tensor = Tensor::from_vec(data, shape, device)?;
            weights.insert(name, tensor);
        }

        Self::new(config, weights, device.clone())
    }

    /// Load `config.json` + `model.safetensors` from a directory
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(MODEL_CONFIG_FILENAME);
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| FinetuneError::config(format!("cannot read {}: {e}", config_path.display())))?;
        let config: ModelConfig = serde_json::from_str(&raw)
            .map_err(|e| FinetuneError::config(format!("invalid {}: {e}", config_path.display())))?;

        let weights_path = dir.join(MODEL_WEIGHTS_FILENAME);
        let weights = candle_core::safetensors::load(&weights_path, device).map_err(|e| {
            FinetuneError::config(format!("cannot load {}: {e}", weights_path.display()))
        })?;

        tracing::debug!(path = %dir.display(), tensors = weights.len(), "loaded base model");
        Self::new(config, weights, device.clone())
    }

    /// Write the dense artifact: `config.json` + `model.safetensors`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| FinetuneError::io(dir, e))?;

        let config_path = dir.join(MODEL_CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| FinetuneError::config(format!("cannot serialize model config: {e}")))?;
        std::fs::write(&config_path, json).map_err(|e| FinetuneError::io(&config_path, e))?;

        let weights_path = dir.join(MODEL_WEIGHTS_FILENAME);
        candle_core::safetensors::save(&self.weights, &weights_path)?;
        Ok(())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    pub fn weight(&self, name: &str) -> Result<&Tensor> {
        self.weights
            .get(name)
            .ok_or_else(|| FinetuneError::config(format!("base model has no tensor '{name}'")))
    }

    pub fn linear_modules(&self) -> Vec<LinearSpec> {
        self.config.linear_modules()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let weights = self
            .weights
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.to_device(device)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self {
            config: self.config.clone(),
            weights,
            device: device.clone(),
        })
    }

    /// Dense model with no adapter attached
    pub fn to_model(&self) -> Result<CausalLm> {
        CausalLm::build(self, None)
    }

    pub(crate) fn into_parts(self) -> (ModelConfig, HashMap<String, Tensor>, Device) {
        (self.config, self.weights, self.device)
    }
}

/// Pre-norm causal transformer with learned positions
pub struct CausalLm {
    config: ModelConfig,
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    lm_head: LoraLinear,
    device: Device,
}

impl CausalLm {
    /// Assemble the runnable model. With an adapter, targeted linears get
    /// their low-rank delta and (depending on bias mode) a trainable bias.
    pub(crate) fn build(
        base: &BaseModel,
        adapter: Option<(&AdapterConfig, &AdapterParams)>,
    ) -> Result<Self> {
        let config = base.config().clone();
        let h = config.hidden_size;

        let linear = |name: String| -> Result<LoraLinear> {
            let weight = base.weight(&format!("{name}.weight"))?.clone();
            let base_bias = if config.linear_bias {
                Some(base.weight(&format!("{name}.bias"))?.clone())
            } else {
                None
            };
            LoraLinear::assemble(&name, weight, base_bias, adapter)
        };

        let embed_tokens = Embedding::new(base.weight("embed_tokens.weight")?.clone(), h);
        let embed_positions = Embedding::new(base.weight("embed_positions.weight")?.clone(), h);

        let mut layers = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            let attn = format!("layers.{layer}.self_attn");
            let attention = MultiHeadAttention::new(
                h,
                config.num_heads,
                linear(format!("{attn}.q_proj"))?,
                linear(format!("{attn}.k_proj"))?,
                linear(format!("{attn}.v_proj"))?,
                linear(format!("{attn}.o_proj"))?,
            );
            let mlp = format!("layers.{layer}.mlp");
            let mlp = GatedMlp {
                gate_proj: linear(format!("{mlp}.gate_proj"))?,
                up_proj: linear(format!("{mlp}.up_proj"))?,
                down_proj: linear(format!("{mlp}.down_proj"))?,
            };
            layers.push(DecoderLayer {
                input_layernorm: LayerNorm::from_base(base, &format!("layers.{layer}.input_layernorm"))?,
                attention,
                post_attention_layernorm: LayerNorm::from_base(
                    base,
                    &format!("layers.{layer}.post_attention_layernorm"),
                )?,
                mlp,
            });
        }

        Ok(Self {
            final_norm: LayerNorm::from_base(base, "final_norm")?,
            lm_head: linear("lm_head".to_string())?,
            embed_tokens,
            embed_positions,
            layers,
            device: base.device().clone(),
            config,
        })
    }

    /// `input_ids`: `(batch, seq)` u32; `attention_mask`: `(batch, seq)` u32 of 1/0.
    /// Returns logits `(batch, seq, vocab)`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(FinetuneError::config(format!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            )));
        }

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let tokens = self.embed_tokens.forward(input_ids)?;
        let positions = self.embed_positions.forward(&positions)?;
        let mut hidden_states = tokens.broadcast_add(&positions)?;

        let mask = build_attention_mask(seq_len, attention_mask, &self.device)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask, train)?;
        }

        let hidden_states = self.final_norm.forward(&hidden_states)?;
        Ok(self.lm_head.forward(&hidden_states, train)?)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

struct DecoderLayer {
    input_layernorm: LayerNorm,
    attention: MultiHeadAttention,
    post_attention_layernorm: LayerNorm,
    mlp: GatedMlp,
}

impl DecoderLayer {
    fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_out = self.attention.forward(&normed, mask, train)?;
        let hidden_states = hidden_states.add(&attn_out)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_out = self.mlp.forward(&normed, train)?;
        hidden_states.add(&mlp_out)
    }
}

struct GatedMlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl GatedMlp {
    fn forward(&self, hidden_states: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let gate = silu(&self.gate_proj.forward(hidden_states, train)?)?;
        let up = self.up_proj.forward(hidden_states, train)?;
        self.down_proj.forward(&gate.mul(&up)?, train)
    }
}

/// x * sigmoid(x), built from differentiable primitives
fn silu(x: &Tensor) -> candle_core::Result<Tensor> {
    let denom = (x.neg()?.exp()? + 1.0)?;
    x.div(&denom)
}

/// Layer norm written with plain ops so gradients flow through it to the
/// adapters of earlier layers (the fused kernel has no backward pass).
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn from_base(base: &BaseModel, prefix: &str) -> Result<Self> {
        Ok(Self {
            weight: base.weight(&format!("{prefix}.weight"))?.clone(),
            bias: base.weight(&format!("{prefix}.bias"))?.clone(),
            eps: base.config().layer_norm_eps,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = x.dim(D::Minus1)? as f64;
        let mean = (x.sum_keepdim(D::Minus1)? / hidden)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Largest absolute element-wise difference of two same-shaped tensors
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    Ok(diff)
}
