//! Error taxonomy shared by every stage of the fine-tuning pipeline

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Unified error type for lorafold operations
#[derive(Error, Debug)]
pub enum FinetuneError {
    /// Malformed or incomplete source table
    #[error("data error: {0}")]
    Data(String),

    /// Unencodable text or a length-policy violation
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Invalid adapter, model or training configuration
    #[error("config error: {0}")]
    Config(String),

    /// Device, driver or numeric-engine failure (kernel mismatch, OOM, ...)
    #[error("device error: {0}")]
    Device(String),

    /// Incompatible, missing or corrupt persisted state
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem failure outside checkpoint handling
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FinetuneError {
    pub fn data<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Data(msg.into())
    }

    pub fn tokenization<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Tokenization(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Config(msg.into())
    }

    pub fn device<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Device(msg.into())
    }

    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        FinetuneError::Checkpoint(msg.into())
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        FinetuneError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Short kind label used in failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            FinetuneError::Data(_) => "DataError",
            FinetuneError::Tokenization(_) => "TokenizationError",
            FinetuneError::Config(_) => "ConfigError",
            FinetuneError::Device(_) => "DeviceError",
            FinetuneError::Checkpoint(_) => "CheckpointError",
            FinetuneError::Io { .. } => "IoError",
        }
    }
}

/// Anything the numeric engine reports is treated as a device failure.
impl From<candle_core::Error> for FinetuneError {
    fn from(err: candle_core::Error) -> Self {
        FinetuneError::Device(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
