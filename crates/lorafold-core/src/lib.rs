//! lorafold core - frozen causal LM with low-rank adapters
//!
//! Small pre-norm transformer on Hugging Face Candle, the LoRA adapter
//! factory, adapter artifacts and the adapter merger.

pub mod adapter;
pub mod artifact;
pub mod attention;
pub mod config;
pub mod error;
pub mod merge;
pub mod model;

pub use adapter::{apply_adapter, check_compatible, AdaptedModel, AdapterParams, LoraLinear};
pub use artifact::SavedAdapter;
pub use config::{AdapterConfig, BiasMode, ModelConfig};
pub use error::{FinetuneError, Result};
pub use merge::merge_adapter;
pub use model::{BaseModel, CausalLm, LinearSpec};

/// lorafold version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
