//! Adapter-only artifact: `adapter_model.safetensors` + `adapter_config.json`

use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

use crate::config::AdapterConfig;
use crate::error::{FinetuneError, Result};

pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Trained adapter tensors detached from any model
#[derive(Debug, Clone)]
pub struct SavedAdapter {
    config: AdapterConfig,
    tensors: HashMap<String, Tensor>,
}

impl SavedAdapter {
    pub fn new(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Self {
        Self { config, tensors }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }

    pub fn save_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| FinetuneError::io(dir, e))?;

        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| FinetuneError::config(format!("cannot serialize adapter config: {e}")))?;
        std::fs::write(&config_path, json).map_err(|e| FinetuneError::io(&config_path, e))?;

        candle_core::safetensors::save(&self.tensors, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        Ok(())
    }

    /// Missing or unreadable files are reported as checkpoint errors.
    pub fn load_dir(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();

        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let raw = std::fs::read_to_string(&config_path).map_err(|e| {
            FinetuneError::checkpoint(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let config: AdapterConfig = serde_json::from_str(&raw).map_err(|e| {
            FinetuneError::checkpoint(format!("corrupt {}: {e}", config_path.display()))
        })?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILENAME);
        if !weights_path.exists() {
            return Err(FinetuneError::checkpoint(format!(
                "missing {}",
                weights_path.display()
            )));
        }
        let tensors = candle_core::safetensors::load(&weights_path, device).map_err(|e| {
            FinetuneError::checkpoint(format!("corrupt {}: {e}", weights_path.display()))
        })?;

        Ok(Self { config, tensors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BiasMode;

    #[test]
    fn test_save_and_load_dir() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().map_err(|e| FinetuneError::io("tempdir", e))?;
        let config = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::None)?;

        let mut tensors = HashMap::new();
        tensors.insert("q_proj.lora_a".to_string(), Tensor::ones((2, 4), candle_core::DType::F32, &device)?);
        tensors.insert("q_proj.lora_b".to_string(), Tensor::zeros((4, 2), candle_core::DType::F32, &device)?);
        SavedAdapter::new(config.clone(), tensors).save_dir(dir.path())?;

        let loaded = SavedAdapter::load_dir(dir.path(), &device)?;
        assert_eq!(loaded.config(), &config);
        assert_eq!(loaded.tensors().len(), 2);
        assert_eq!(loaded.num_elements(), 16);
        Ok(())
    }

    #[test]
    fn test_missing_weights_is_checkpoint_error() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| FinetuneError::io("tempdir", e))?;
        let config = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::None)?;
        let json = serde_json::to_string(&config).map_err(|e| FinetuneError::config(e.to_string()))?;
        std::fs::write(dir.path().join(ADAPTER_CONFIG_FILENAME), json)
            .map_err(|e| FinetuneError::io(dir.path(), e))?;

        assert!(matches!(
            SavedAdapter::load_dir(dir.path(), &Device::Cpu),
            Err(FinetuneError::Checkpoint(_))
        ));
        Ok(())
    }
}
