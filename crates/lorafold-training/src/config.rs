//! Training run configuration

use lorafold_core::{FinetuneError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingRunConfig {
    pub epochs: usize,
    pub per_step_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub checkpoint_retention_limit: usize,
    /// Optimizer steps between checkpoints; epoch-end checkpoints are always written
    pub save_interval: Option<usize>,
    pub log_interval: usize,
    pub max_steps: Option<usize>,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
    /// Steps between intermediate checkpoints of the fallback loop
    pub fallback_save_interval: usize,
    /// `None` keeps dataset order
    pub shuffle_seed: Option<u64>,
    pub prefetch_depth: usize,
}

impl Default for TrainingRunConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            per_step_batch_size: 1,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-5,
            checkpoint_retention_limit: 1,
            save_interval: None,
            log_interval: 1,
            max_steps: None,
            warmup_steps: 0,
            weight_decay: 0.0,
            max_grad_norm: Some(1.0),
            fallback_save_interval: 10,
            shuffle_seed: None,
            prefetch_depth: 2,
        }
    }
}

impl TrainingRunConfig {
    /// Reject invalid combinations before anything is allocated
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(FinetuneError::config("epochs must be > 0"));
        }
        if self.per_step_batch_size == 0 {
            return Err(FinetuneError::config("per_step_batch_size must be > 0"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(FinetuneError::config("gradient_accumulation_steps must be > 0"));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(FinetuneError::config(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if self.checkpoint_retention_limit == 0 {
            return Err(FinetuneError::config("checkpoint_retention_limit must be > 0"));
        }
        if self.save_interval == Some(0) {
            return Err(FinetuneError::config("save_interval must be > 0 when set"));
        }
        if self.log_interval == 0 {
            return Err(FinetuneError::config("log_interval must be > 0"));
        }
        if self.max_steps == Some(0) {
            return Err(FinetuneError::config("max_steps must be > 0 when set"));
        }
        if self.weight_decay < 0.0 {
            return Err(FinetuneError::config("weight_decay must be >= 0"));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return Err(FinetuneError::config("max_grad_norm must be > 0 when set"));
            }
        }
        if self.fallback_save_interval == 0 {
            return Err(FinetuneError::config("fallback_save_interval must be > 0"));
        }
        if self.prefetch_depth == 0 {
            return Err(FinetuneError::config("prefetch_depth must be > 0"));
        }
        Ok(())
    }

    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn batches_per_epoch(&self, dataset_len: usize) -> usize {
        dataset_len.div_ceil(self.per_step_batch_size)
    }

    /// Optimizer steps a full run takes, including the partial window flushed
    /// at each epoch end, capped by `max_steps`
    pub fn total_optimizer_steps(&self, dataset_len: usize) -> usize {
        let per_epoch = self
            .batches_per_epoch(dataset_len)
            .div_ceil(self.gradient_accumulation_steps);
        let total = per_epoch * self.epochs;
        match self.max_steps {
            Some(max) => total.min(max),
            None => total,
        }
    }

    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| FinetuneError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| FinetuneError::config(format!("invalid {}: {e}", path.display())))?;
        config.validated()
    }
}
