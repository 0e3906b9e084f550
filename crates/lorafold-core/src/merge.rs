//! Fold a trained adapter into the base weights
//!
//! `W' = W + (alpha/r) * B @ A` for every adapted module. Trained biases
//! replace the base biases. The result is a plain dense `BaseModel`.

use candle_core::{DType, Tensor};
use std::collections::{BTreeSet, HashMap};

use crate::adapter::{bias_key, check_targets, lora_a_key, lora_b_key};
use crate::artifact::SavedAdapter;
use crate::error::{FinetuneError, Result};
use crate::model::BaseModel;

pub fn merge_adapter(base: &BaseModel, adapter: &SavedAdapter) -> Result<BaseModel> {
    let config = adapter.config();
    let scaling = config.scaling();
    let device = base.device();
    let modules = base.linear_modules();
    check_targets(config, &modules)?;

    // Every adapter tensor must belong to a base module
    let known: BTreeSet<String> = modules
        .iter()
        .flat_map(|m| [lora_a_key(&m.name), lora_b_key(&m.name), bias_key(&m.name)])
        .collect();
    if let Some(stray) = adapter.tensors().keys().find(|name| !known.contains(*name)) {
        return Err(FinetuneError::config(format!(
            "adapter tensor '{stray}' refers to a module absent from the base model"
        )));
    }

    let mut model_config = base.config().clone();
    let trains_bias = modules
        .iter()
        .any(|m| adapter.tensors().contains_key(&bias_key(&m.name)));
    let add_bias = trains_bias && !model_config.linear_bias;
    model_config.linear_bias |= trains_bias;

    let mut weights: HashMap<String, Tensor> = base.weights().clone();
    let mut merged = 0usize;

    for spec in &modules {
        let a = adapter.tensors().get(&lora_a_key(&spec.name));
        let b = adapter.tensors().get(&lora_b_key(&spec.name));

        match (a, b) {
            (Some(a), Some(b)) => {
                let a = a.to_device(device)?.to_dtype(DType::F32)?;
                let b = b.to_device(device)?.to_dtype(DType::F32)?;
                if a.dims() != [config.rank(), spec.d_in] || b.dims() != [spec.d_out, config.rank()] {
                    return Err(FinetuneError::config(format!(
                        "adapter shapes for '{}' are A{:?} B{:?}, base expects A[{}, {}] B[{}, {}]",
                        spec.name,
                        a.dims(),
                        b.dims(),
                        config.rank(),
                        spec.d_in,
                        spec.d_out,
                        config.rank()
                    )));
                }

                let weight = base.weight(&spec.weight_key())?;
                let delta = (b.matmul(&a)? * scaling)?;
                let merged_weight = weight.add(&delta.to_dtype(weight.dtype())?)?;
                weights.insert(spec.weight_key(), merged_weight);
                merged += 1;
            }
            (None, None) => {}
            _ => {
                return Err(FinetuneError::config(format!(
                    "adapter for '{}' has only one of lora_a / lora_b",
                    spec.name
                )))
            }
        }
        if a.is_some() != config.targets(&spec.name) {
            let problem = if a.is_some() { "is not a target module" } else { "has no lora_a / lora_b" };
            return Err(FinetuneError::config(format!("adapter module '{}' {problem}", spec.name)));
        }

        if let Some(bias) = adapter.tensors().get(&bias_key(&spec.name)) {
            if bias.dims() != [spec.d_out] {
                return Err(FinetuneError::config(format!(
                    "trained bias for '{}' has shape {:?}, expected [{}]",
                    spec.name,
                    bias.dims(),
                    spec.d_out
                )));
            }
            weights.insert(spec.bias_key(), bias.to_device(device)?);
        } else if add_bias {
            weights.insert(spec.bias_key(), Tensor::zeros(spec.d_out, DType::F32, device)?);
        }
    }

    tracing::info!(modules = merged, scaling, "merged adapter into base weights");
    BaseModel::new(model_config, weights, device.clone())
}
