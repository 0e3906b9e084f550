//! Where an engine gets its frozen base model from

use candle_core::Device;
use lorafold_core::{BaseModel, Result};
use std::path::PathBuf;

/// Each engine loads its own copy, so the fallback never shares tensors
/// with a failed primary.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Directory with `config.json` + `model.safetensors`
    Directory(PathBuf),
    /// Already loaded weights, moved to the run device on load
    InMemory(BaseModel),
}

impl ModelSource {
    pub fn load(&self, device: &Device) -> Result<BaseModel> {
        match self {
            ModelSource::Directory(dir) => BaseModel::load(dir, device),
            ModelSource::InMemory(base) => base.to_device(device),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelSource::Directory(dir) => dir.display().to_string(),
            ModelSource::InMemory(_) => "in-memory model".to_string(),
        }
    }
}
