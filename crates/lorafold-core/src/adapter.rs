//! LoRA - Low-Rank Adaptation of frozen linear modules
//!
//! Each targeted module computes `W·x + b + (alpha/r)·B·A·dropout(x)` where
//! `W` (and `b` unless the bias mode trains it) stays frozen. `A` starts
//! Kaiming-uniform from a seeded RNG and `B` starts at zero, so a freshly
//! adapted model reproduces the base model exactly.

use candle_core::{Device, Module, Tensor, Var};
use candle_nn::Linear;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};

use crate::artifact::SavedAdapter;
use crate::config::{AdapterConfig, BiasMode};
use crate::error::{FinetuneError, Result};
use crate::model::{BaseModel, CausalLm, LinearSpec};

pub fn lora_a_key(module: &str) -> String {
    format!("{module}.lora_a")
}

pub fn lora_b_key(module: &str) -> String {
    format!("{module}.lora_b")
}

pub fn bias_key(module: &str) -> String {
    format!("{module}.bias")
}

/// Linear layer with an optional low-rank delta.
///
/// Without a delta this is a plain `candle_nn::Linear` over frozen tensors.
pub struct LoraLinear {
    base: Linear,
    delta: Option<LowRankDelta>,
}

struct LowRankDelta {
    // A: [r, d_in], B: [d_out, r]
    lora_a: Linear,
    lora_b: Linear,
    scaling: f64,
    dropout: f64,
}

impl LoraLinear {
    pub fn frozen(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            base: Linear::new(weight, bias),
            delta: None,
        }
    }

    /// Build the layer for module `name`, picking trainable tensors out of
    /// `adapter` when the module is targeted or its bias is trained.
    pub(crate) fn assemble(
        name: &str,
        weight: Tensor,
        base_bias: Option<Tensor>,
        adapter: Option<(&AdapterConfig, &AdapterParams)>,
    ) -> Result<Self> {
        let Some((config, params)) = adapter else {
            return Ok(Self::frozen(weight, base_bias));
        };

        let bias = match params.get(&bias_key(name)) {
            Some(var) => Some(var.as_tensor().clone()),
            None => base_bias,
        };

        let delta = if config.targets(name) {
            let a = params.require(&lora_a_key(name))?;
            let b = params.require(&lora_b_key(name))?;
            Some(LowRankDelta {
                lora_a: Linear::new(a.as_tensor().clone(), None),
                lora_b: Linear::new(b.as_tensor().clone(), None),
                scaling: config.scaling(),
                dropout: config.dropout(),
            })
        } else {
            None
        };

        Ok(Self {
            base: Linear::new(weight, bias),
            delta,
        })
    }

    pub fn is_adapted(&self) -> bool {
        self.delta.is_some()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let base_out = self.base.forward(x)?;

        let Some(delta) = &self.delta else {
            return Ok(base_out);
        };

        let x = if train && delta.dropout > 0.0 {
            candle_nn::ops::dropout(x, delta.dropout as f32)?
        } else {
            x.clone()
        };
        let down = delta.lora_a.forward(&x)?; // [.., r]
        let up = delta.lora_b.forward(&down)?; // [.., d_out]
        base_out.add(&(up * delta.scaling)?)
    }
}

/// The trainable tensors of an adapter, keyed by
/// `{module}.lora_a`, `{module}.lora_b` and `{module}.bias`.
#[derive(Clone, Default)]
pub struct AdapterParams {
    vars: BTreeMap<String, Var>,
}

impl AdapterParams {
    pub fn insert(&mut self, name: impl Into<String>, var: Var) {
        self.vars.insert(name.into(), var);
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    fn require(&self, name: &str) -> Result<&Var> {
        self.get(name)
            .ok_or_else(|| FinetuneError::config(format!("adapter parameter '{name}' is missing")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.vars.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Vars in name order, for optimizers that take a plain list
    pub fn all_vars(&self) -> Vec<Var> {
        self.vars.values().cloned().collect()
    }

    pub fn num_elements(&self) -> usize {
        self.vars.values().map(|v| v.elem_count()).sum()
    }

    /// Detached snapshot of every tensor, ready for safetensors
    pub fn to_tensors(&self) -> HashMap<String, Tensor> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect()
    }

    /// Overwrite every var in place. The tensor set must match exactly.
    pub fn load_tensors(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for name in tensors.keys() {
            if !self.vars.contains_key(name) {
                return Err(FinetuneError::checkpoint(format!(
                    "unexpected adapter tensor '{name}'"
                )));
            }
        }
        for (name, var) in &self.vars {
            let tensor = tensors.get(name).ok_or_else(|| {
                FinetuneError::checkpoint(format!("adapter tensor '{name}' is missing"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(FinetuneError::checkpoint(format!(
                    "adapter tensor '{name}' has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }
        Ok(())
    }
}

/// A frozen base model with an adapter attached
pub struct AdaptedModel {
    config: AdapterConfig,
    params: AdapterParams,
    model: CausalLm,
    adapted_modules: Vec<LinearSpec>,
}

impl AdaptedModel {
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.model.forward(input_ids, attention_mask, train)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn params(&self) -> &AdapterParams {
        &self.params
    }

    pub fn model(&self) -> &CausalLm {
        &self.model
    }

    pub fn device(&self) -> &Device {
        self.model.device()
    }

    /// Modules carrying a low-rank delta, in forward order
    pub fn adapted_modules(&self) -> &[LinearSpec] {
        &self.adapted_modules
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.params.num_elements()
    }

    /// Snapshot of the adapter as a standalone artifact
    pub fn to_saved(&self) -> SavedAdapter {
        SavedAdapter::new(self.config.clone(), self.params.to_tensors())
    }

    /// Load previously saved adapter tensors into this model
    pub fn load_saved(&self, saved: &SavedAdapter) -> Result<()> {
        check_compatible(&self.config, saved.config())?;
        self.params.load_tensors(saved.tensors())
    }
}

/// Rank and target modules must agree for adapter state to be reusable
pub fn check_compatible(expected: &AdapterConfig, found: &AdapterConfig) -> Result<()> {
    if expected.rank() != found.rank() {
        return Err(FinetuneError::checkpoint(format!(
            "adapter rank mismatch: run uses {}, saved state has {}",
            expected.rank(),
            found.rank()
        )));
    }
    if expected.target_modules() != found.target_modules() {
        return Err(FinetuneError::checkpoint(format!(
            "target modules mismatch: run uses {:?}, saved state has {:?}",
            expected.target_modules(),
            found.target_modules()
        )));
    }
    Ok(())
}

/// Every target module must name at least one linear module, by full
/// dotted name or by its last component
pub(crate) fn check_targets(config: &AdapterConfig, modules: &[LinearSpec]) -> Result<()> {
    for target in config.target_modules() {
        let matched = modules
            .iter()
            .any(|m| m.name == *target || m.name.rsplit('.').next() == Some(target.as_str()));
        if !matched {
            return Err(FinetuneError::config(format!(
                "target module '{target}' matches no linear module of the base model"
            )));
        }
    }
    Ok(())
}

/// Attach a fresh adapter to `base`, placing everything on `device`.
pub fn apply_adapter(base: &BaseModel, config: &AdapterConfig, device: &Device) -> Result<AdaptedModel> {
    config.validate()?;
    let base = if base.device().same_device(device) {
        base.clone()
    } else {
        base.to_device(device)?
    };

    let modules = base.linear_modules();
    check_targets(config, &modules)?;

    let mut rng = StdRng::seed_from_u64(config.init_seed());
    let mut params = AdapterParams::default();
    let mut adapted_modules = Vec::new();

    for spec in &modules {
        let targeted = config.targets(&spec.name);

        if targeted {
            // Kaiming-uniform with a = sqrt(5) reduces to bound = 1/sqrt(d_in)
            let bound = 1.0 / (spec.d_in as f32).sqrt();
            let uniform = Uniform::new_inclusive(-bound, bound);
            let data: Vec<f32> = (0..config.rank() * spec.d_in)
                .map(|_| uniform.sample(&mut rng))
                .collect();
            let a = Tensor::from_vec(data, (config.rank(), spec.d_in), device)?;
            let b = Tensor::zeros((spec.d_out, config.rank()), candle_core::DType::F32, device)?;

            params.insert(lora_a_key(&spec.name), Var::from_tensor(&a)?);
            params.insert(lora_b_key(&spec.name), Var::from_tensor(&b)?);
            adapted_modules.push(spec.clone());
        }

        let trains_bias = match config.bias_mode() {
            BiasMode::None => false,
            BiasMode::LoraOnly => targeted,
            BiasMode::All => true,
        };
        if trains_bias {
            let initial = match base.weights().get(&spec.bias_key()) {
                Some(bias) => bias.copy()?,
                None => Tensor::zeros(spec.d_out, candle_core::DType::F32, device)?,
            };
            params.insert(bias_key(&spec.name), Var::from_tensor(&initial)?);
        }
    }

    let model = CausalLm::build(&base, Some((config, &params)))?;

    tracing::info!(
        modules = adapted_modules.len(),
        rank = config.rank(),
        trainable = params.num_elements(),
        "adapter attached"
    );

    Ok(AdaptedModel {
        config: config.clone(),
        params,
        model,
        adapted_modules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::max_abs_diff;

    fn one_layer(hidden: usize) -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            hidden_size: hidden,
            num_layers: 1,
            num_heads: 4,
            intermediate_size: 2 * hidden,
            max_position_embeddings: 8,
            layer_norm_eps: 1e-5,
            linear_bias: false,
        }
    }

    #[test]
    fn test_trainable_count_rank8_qv() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(512), 0, &device)?;
        let config = AdapterConfig::new(8, 16.0, 0.0, ["q_proj", "v_proj"], BiasMode::None)?;

        let adapted = apply_adapter(&base, &config, &device)?;
        assert_eq!(adapted.trainable_parameter_count(), 2 * 8 * (512 + 512));
        assert_eq!(adapted.trainable_parameter_count(), 16384);
        assert_eq!(adapted.adapted_modules().len(), 2);
        Ok(())
    }

    #[test]
    fn test_trainable_count_two_layers() -> Result<()> {
        let device = Device::Cpu;
        let mut model_config = one_layer(256);
        model_config.num_layers = 2;
        let base = BaseModel::random(model_config, 0, &device)?;
        let config = AdapterConfig::new(4, 8.0, 0.0, ["q_proj", "v_proj"], BiasMode::None)?;

        let adapted = apply_adapter(&base, &config, &device)?;
        assert_eq!(adapted.trainable_parameter_count(), 8192);
        Ok(())
    }

    #[test]
    fn test_bias_modes_count() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32).with_linear_bias(true), 0, &device)?;

        let lora_only = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::LoraOnly)?;
        let adapted = apply_adapter(&base, &lora_only, &device)?;
        assert_eq!(adapted.trainable_parameter_count(), 2 * (32 + 32) + 32);

        let all = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::All)?;
        let adapted = apply_adapter(&base, &all, &device)?;
        let bias_elems: usize = base.linear_modules().iter().map(|m| m.d_out).sum();
        assert_eq!(adapted.trainable_parameter_count(), 2 * (32 + 32) + bias_elems);
        Ok(())
    }

    #[test]
    fn test_unknown_target_rejected() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32), 0, &device)?;
        let config = AdapterConfig::new(2, 4.0, 0.0, ["c_attn"], BiasMode::None)?;

        assert!(matches!(
            apply_adapter(&base, &config, &device),
            Err(FinetuneError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_fresh_adapter_matches_base() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32), 5, &device)?;
        let config = AdapterConfig::new(4, 8.0, 0.1, ["q_proj", "v_proj", "down_proj"], BiasMode::None)?;
        let adapted = apply_adapter(&base, &config, &device)?;

        let input_ids = Tensor::new(&[[1u32, 4, 2, 7]], &device)?;
        let expected = base.to_model()?.forward(&input_ids, None, false)?;
        let actual = adapted.forward(&input_ids, None, false)?;

        assert!(max_abs_diff(&expected, &actual)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_init_is_seeded() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32), 0, &device)?;
        let config = AdapterConfig::new(4, 8.0, 0.0, ["q_proj"], BiasMode::None)?.with_init_seed(9);

        let first = apply_adapter(&base, &config, &device)?;
        let second = apply_adapter(&base, &config, &device)?;
        let key = lora_a_key("layers.0.self_attn.q_proj");
        let a1 = first.params().get(&key).map(|v| v.as_tensor().clone());
        let a2 = second.params().get(&key).map(|v| v.as_tensor().clone());
        let (a1, a2) = (a1.unwrap(), a2.unwrap());

        assert_eq!(max_abs_diff(&a1, &a2)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_gradients_reach_only_adapter() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32), 1, &device)?;
        let config = AdapterConfig::new(2, 4.0, 0.0, ["q_proj", "v_proj"], BiasMode::None)?;
        let adapted = apply_adapter(&base, &config, &device)?;

        // B starts at zero, so dL/dA is zero; nudge B to get a signal everywhere
        for (name, var) in adapted.params().iter() {
            if name.ends_with(".lora_b") {
                var.set(&Tensor::ones(var.dims(), candle_core::DType::F32, &device)?)?;
            }
        }

        let input_ids = Tensor::new(&[[1u32, 2, 3]], &device)?;
        let loss = adapted.forward(&input_ids, None, true)?.sqr()?.mean_all()?;
        let grads = loss.backward()?;

        for (name, var) in adapted.params().iter() {
            assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
        }
        let frozen = base.weight("layers.0.self_attn.q_proj.weight")?;
        assert!(grads.get(frozen).is_none());
        Ok(())
    }

    #[test]
    fn test_load_tensors_rejects_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseModel::random(one_layer(32), 0, &device)?;
        let config = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::None)?;
        let adapted = apply_adapter(&base, &config, &device)?;

        let mut tensors = adapted.params().to_tensors();
        tensors.insert(
            lora_a_key("layers.0.self_attn.q_proj"),
            Tensor::zeros((3, 32), candle_core::DType::F32, &device)?,
        );
        assert!(matches!(
            adapted.params().load_tensors(&tensors),
            Err(FinetuneError::Checkpoint(_))
        ));
        Ok(())
    }
}
