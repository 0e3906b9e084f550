//! lorafold training pipeline
//!
//! CSV datasets, fixed-length tokenization, adapter checkpoints and the two
//! training engines (library-backed primary, manual-loop fallback).

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod engine;
pub mod fallback;
pub mod source;
pub mod tokenize;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointKey, CheckpointManager, CheckpointMarker, CheckpointMeta, TrainingPosition};
pub use config::TrainingRunConfig;
pub use context::{DeviceToggles, RunContext};
pub use dataset::{DatasetBuilder, PromptTemplate, TrainingExample};
pub use engine::{
    run_with_fallback, EngineState, Outcome, PipelineResult, ResumeFrom, Stage, TrainingEngine, TrainingFailure,
    TrainingReport,
};
pub use fallback::ManualLoopEngine;
pub use source::ModelSource;
pub use tokenize::{
    LabelPadding, TokenizeOptions, TokenizedDataset, TokenizedRecord, TokenizerAdapter, TruncationPolicy, IGNORE_INDEX,
};
pub use trainer::{EngineWorkarounds, LibraryBackedEngine};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
