//! AdamW over named parameters
//!
//! Candle has no `.grad()` on tensors, so gradients come in explicitly as a
//! name -> tensor map. Moments are keyed by the same names, which lets the
//! whole state be exported next to an adapter checkpoint and imported again
//! on resume.

use candle_core::{DType, Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STEP_KEY: &str = "__step";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value before each step
    pub max_grad_norm: Option<f64>,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: Some(1.0),
        }
    }
}

struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

pub struct AdamW {
    config: AdamWConfig,
    lr: f64,
    step: usize,
    last_grad_norm: Option<f64>,
    state: HashMap<String, Moments>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            lr: config.lr,
            config,
            step: 0,
            last_grad_norm: None,
            state: HashMap::new(),
        }
    }

    /// One update of every parameter that has a gradient.
    ///
    /// Parameters without an entry in `grads` are left untouched, as are
    /// their moments.
    pub fn step<'a, I>(&mut self, params: I, grads: &HashMap<String, Tensor>) -> Result<()>
    where
        I: IntoIterator<Item = (&'a String, &'a Var)>,
    {
        self.step += 1;

        let clip_scale = match self.config.max_grad_norm {
            Some(max_norm) => {
                let norm = global_norm(grads.values())?;
                self.last_grad_norm = Some(norm);
                if norm > max_norm {
                    Some(max_norm / (norm + 1e-6))
                } else {
                    None
                }
            }
            None => None,
        };

        let bias_correction1 = 1.0 - self.config.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.config.beta2.powi(self.step as i32);

        for (name, param) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = match clip_scale {
                Some(scale) => (grad * scale)?,
                None => grad.clone(),
            };
            self.update_param(name, param, &grad, bias_correction1, bias_correction2)?;
        }

        Ok(())
    }

    fn update_param(
        &mut self,
        name: &str,
        param: &Var,
        grad: &Tensor,
        bias_correction1: f64,
        bias_correction2: f64,
    ) -> Result<()> {
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;

        if !self.state.contains_key(name) {
            self.state.insert(
                name.to_string(),
                Moments {
                    exp_avg: param.as_tensor().zeros_like()?,
                    exp_avg_sq: param.as_tensor().zeros_like()?,
                },
            );
        }
        let Some(moments) = self.state.get_mut(name) else {
            return Ok(());
        };

        moments.exp_avg = ((&moments.exp_avg * beta1)? + (grad * (1.0 - beta1))?)?;
        moments.exp_avg_sq = ((&moments.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let m_hat = (&moments.exp_avg / bias_correction1)?;
        let v_hat = (&moments.exp_avg_sq / bias_correction2)?;
        let update = (m_hat / (v_hat.sqrt()? + self.config.eps)?)?;

        // Decoupled weight decay
        let decayed = (param.as_tensor() * (1.0 - self.lr * self.config.weight_decay))?;
        let updated = (decayed - (update * self.lr)?)?;
        param.set(&updated.detach())
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Global gradient norm measured by the last step (clipping enabled only)
    pub fn last_grad_norm(&self) -> Option<f64> {
        self.last_grad_norm
    }

    /// Moments as `{name}.exp_avg` / `{name}.exp_avg_sq`, plus the step counter
    pub fn export_state(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::with_capacity(self.state.len() * 2 + 1);
        for (name, moments) in &self.state {
            tensors.insert(format!("{name}.{EXP_AVG}"), moments.exp_avg.detach());
            tensors.insert(format!("{name}.{EXP_AVG_SQ}"), moments.exp_avg_sq.detach());
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step as i64], &Device::Cpu)?,
        );
        Ok(tensors)
    }

    /// Replace the optimizer state with a previously exported one.
    ///
    /// Moments are moved to `device`; every moment pair must be complete.
    pub fn import_state(&mut self, tensors: &HashMap<String, Tensor>, device: &Device) -> Result<()> {
        let step = tensors
            .get(STEP_KEY)
            .ok_or_else(|| candle_core::Error::Msg("optimizer state has no step counter".into()))?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;
        let step = step
            .first()
            .copied()
            .ok_or_else(|| candle_core::Error::Msg("optimizer step counter is empty".into()))?;

        let mut state = HashMap::new();
        for (key, exp_avg) in tensors {
            let Some(name) = key.strip_suffix(&format!(".{EXP_AVG}")) else {
                continue;
            };
            let exp_avg_sq = tensors.get(&format!("{name}.{EXP_AVG_SQ}")).ok_or_else(|| {
                candle_core::Error::Msg(format!("optimizer state for '{name}' lacks {EXP_AVG_SQ}"))
            })?;
            state.insert(
                name.to_string(),
                Moments {
                    exp_avg: exp_avg.to_device(device)?,
                    exp_avg_sq: exp_avg_sq.to_device(device)?,
                },
            );
        }

        self.state = state;
        self.step = step.max(0) as usize;
        Ok(())
    }
}

/// sqrt of the sum of squares over every gradient
pub fn global_norm<'a>(grads: impl IntoIterator<Item = &'a Tensor>) -> Result<f64> {
    let mut total = 0f64;
    for grad in grads {
        let sq = grad
            .to_dtype(DType::F32)?
            .sqr()?
            .sum_all()?
            .to_scalar::<f32>()?;
        total += sq as f64;
    }
    Ok(total.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_param(value: f32) -> Result<(String, Var)> {
        let var = Var::from_tensor(&Tensor::new(&[value], &Device::Cpu)?)?;
        Ok(("w".to_string(), var))
    }

    #[test]
    fn test_optimizer_creation() {
        let optimizer = AdamW::new(AdamWConfig::default());
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(optimizer.lr(), 2e-4);
    }

    #[test]
    fn test_step_moves_against_gradient() -> Result<()> {
        let (name, var) = single_param(1.0)?;
        let mut grads = HashMap::new();
        grads.insert(name.clone(), Tensor::new(&[0.5f32], &Device::Cpu)?);

        let mut optimizer = AdamW::new(AdamWConfig {
            lr: 0.1,
            max_grad_norm: None,
            ..Default::default()
        });
        optimizer.step([(&name, &var)], &grads)?;

        // First Adam step moves by ~lr regardless of gradient magnitude
        let value = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((value - 0.9).abs() < 1e-4);
        assert_eq!(optimizer.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_param_without_grad_untouched() -> Result<()> {
        let (name, var) = single_param(3.0)?;
        let mut optimizer = AdamW::new(AdamWConfig::default());
        optimizer.step([(&name, &var)], &HashMap::new())?;

        assert_eq!(var.as_tensor().to_vec1::<f32>()?[0], 3.0);
        Ok(())
    }

    #[test]
    fn test_clipping_reports_norm() -> Result<()> {
        let name = "w".to_string();
        let var = Var::from_tensor(&Tensor::new(&[0f32, 0.0], &Device::Cpu)?)?;
        let mut grads = HashMap::new();
        grads.insert(name.clone(), Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?);

        let mut optimizer = AdamW::new(AdamWConfig {
            max_grad_norm: Some(1.0),
            ..Default::default()
        });
        optimizer.step([(&name, &var)], &grads)?;

        let norm = optimizer.last_grad_norm().unwrap_or_default();
        assert!((norm - 5.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_state_export_import_continues_identically() -> Result<()> {
        let config = AdamWConfig {
            lr: 0.05,
            weight_decay: 0.01,
            max_grad_norm: None,
            ..Default::default()
        };
        let grad = |v: f32| -> Result<HashMap<String, Tensor>> {
            let mut grads = HashMap::new();
            grads.insert("w".to_string(), Tensor::new(&[v], &Device::Cpu)?);
            Ok(grads)
        };

        // Reference: three uninterrupted steps
        let (name, reference) = single_param(1.0)?;
        let mut optimizer = AdamW::new(config.clone());
        for g in [0.3, -0.2, 0.1] {
            optimizer.step([(&name, &reference)], &grad(g)?)?;
        }

        // Two steps, export, fresh optimizer, import, third step
        let (name, resumed) = single_param(1.0)?;
        let mut first = AdamW::new(config.clone());
        for g in [0.3, -0.2] {
            first.step([(&name, &resumed)], &grad(g)?)?;
        }
        let exported = first.export_state()?;
        let mut second = AdamW::new(config);
        second.import_state(&exported, &Device::Cpu)?;
        assert_eq!(second.step_count(), 2);
        second.step([(&name, &resumed)], &grad(0.1)?)?;

        let a = reference.as_tensor().to_vec1::<f32>()?[0];
        let b = resumed.as_tensor().to_vec1::<f32>()?[0];
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_import_requires_step_counter() {
        let mut optimizer = AdamW::new(AdamWConfig::default());
        assert!(optimizer.import_state(&HashMap::new(), &Device::Cpu).is_err());
    }
}
