//! Training engine interface and the fallback driver

use lorafold_core::FinetuneError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::CheckpointKey;
use crate::context::RunContext;
use crate::tokenize::TokenizedDataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Loading,
    Running,
    Completed,
    Failed,
}

/// Pipeline stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Loading,
    Resuming,
    Training,
    Checkpointing,
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loading => "loading",
            Stage::Resuming => "resuming",
            Stage::Training => "training",
            Stage::Checkpointing => "checkpointing",
            Stage::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Where a run starts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeFrom {
    /// Ignore existing checkpoints
    #[default]
    Fresh,
    /// Newest checkpoint of the run; fails if there is none
    Latest,
    /// Newest checkpoint if one exists, otherwise a fresh start
    LatestOrFresh,
    Key(CheckpointKey),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub engine: String,
    /// Last completed optimizer step
    pub global_step: usize,
    /// First optimizer step executed by this run
    pub start_step: usize,
    pub resumed_from: Option<usize>,
    pub epochs_completed: usize,
    pub final_loss: Option<f32>,
    pub step_losses: Vec<f32>,
    pub interrupted: bool,
    pub trainable_parameters: usize,
    pub adapter_dir: PathBuf,
}

/// A failed run, with enough context to resume from the last good checkpoint
#[derive(Debug, Error)]
#[error("{engine} failed while {stage} (run {run_id}, epoch {last_epoch}, step {last_step}): {error}")]
pub struct TrainingFailure {
    pub stage: Stage,
    pub run_id: String,
    pub engine: String,
    pub last_step: usize,
    pub last_epoch: usize,
    #[source]
    pub error: FinetuneError,
}

#[derive(Debug)]
pub enum Outcome {
    Success(TrainingReport),
    Failure(TrainingFailure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn report(&self) -> Option<&TrainingReport> {
        match self {
            Outcome::Success(report) => Some(report),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TrainingFailure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }
}

pub trait TrainingEngine {
    fn name(&self) -> &'static str;

    /// Train on `data`. Never panics on engine errors; every failure comes
    /// back as `Outcome::Failure`.
    fn run(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Outcome;
}

/// An error tagged with the stage it happened in
#[derive(Debug)]
pub(crate) struct StageError {
    pub stage: Stage,
    pub error: FinetuneError,
}

pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, StageError>;
}

impl<T, E: Into<FinetuneError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StageError> {
        self.map_err(|e| StageError {
            stage,
            error: e.into(),
        })
    }
}

#[derive(Debug)]
pub struct PipelineResult {
    pub outcome: Outcome,
    pub primary_failure: Option<TrainingFailure>,
    pub fallback_invoked: bool,
}

/// Run `primary`; if it fails, release it, reset the context and run
/// `fallback` once. The fallback's outcome is final.
pub fn run_with_fallback<P, F>(
    mut primary: P,
    mut fallback: F,
    ctx: &RunContext,
    data: &TokenizedDataset,
) -> PipelineResult
where
    P: TrainingEngine,
    F: TrainingEngine,
{
    let primary_name = primary.name();
    let failure = match primary.run(ctx, data) {
        Outcome::Success(report) => {
            return PipelineResult {
                outcome: Outcome::Success(report),
                primary_failure: None,
                fallback_invoked: false,
            }
        }
        Outcome::Failure(failure) => failure,
    };
    drop(primary);

    tracing::warn!(
        engine = primary_name,
        kind = failure.error.kind(),
        "primary engine failed, switching to {}: {failure}",
        fallback.name()
    );

    if let Err(error) = ctx.teardown().and_then(|_| ctx.prepare()) {
        let outcome = Outcome::Failure(TrainingFailure {
            stage: Stage::Loading,
            run_id: ctx.run_id().to_string(),
            engine: fallback.name().to_string(),
            last_step: 0,
            last_epoch: 0,
            error,
        });
        return PipelineResult {
            outcome,
            primary_failure: Some(failure),
            fallback_invoked: false,
        };
    }

    let outcome = fallback.run(ctx, data);
    if let Outcome::Failure(terminal) = &outcome {
        tracing::error!(engine = fallback.name(), kind = terminal.error.kind(), "fallback failed, giving up: {terminal}");
    }

    PipelineResult {
        outcome,
        primary_failure: Some(failure),
        fallback_invoked: true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Always fails with a device error
    pub struct FailingEngine {
        pub name: &'static str,
    }

    impl TrainingEngine for FailingEngine {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&mut self, ctx: &RunContext, _data: &TokenizedDataset) -> Outcome {
            Outcome::Failure(TrainingFailure {
                stage: Stage::Training,
                run_id: ctx.run_id().to_string(),
                engine: self.name.to_string(),
                last_step: 0,
                last_epoch: 0,
                error: FinetuneError::device("simulated kernel failure"),
            })
        }
    }

    /// Counts `run` calls of the wrapped engine
    pub struct Counting<E> {
        pub inner: E,
        pub calls: Arc<AtomicUsize>,
    }

    impl<E: TrainingEngine> TrainingEngine for Counting<E> {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn run(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.run(ctx, data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Counting, FailingEngine};
    use super::*;
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn empty_data() -> TokenizedDataset {
        TokenizedDataset::new(Vec::new(), 4).unwrap()
    }

    #[test]
    fn test_failing_fallback_is_terminal() -> lorafold_core::Result<()> {
        let dir = tempfile::tempdir().map_err(|e| FinetuneError::io("tempdir", e))?;
        let ctx = RunContext::new("run", Device::Cpu, dir.path().join("c"), dir.path().join("o"))?;

        let primary_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let primary = Counting {
            inner: FailingEngine { name: "primary" },
            calls: Arc::clone(&primary_calls),
        };
        let fallback = Counting {
            inner: FailingEngine { name: "fallback" },
            calls: Arc::clone(&fallback_calls),
        };

        let result = run_with_fallback(primary, fallback, &ctx, &empty_data());

        assert!(result.fallback_invoked);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        let failure = result.outcome.failure().map(|f| f.engine.clone());
        assert_eq!(failure.as_deref(), Some("fallback"));
        assert_eq!(result.primary_failure.map(|f| f.error.kind()), Some("DeviceError"));
        Ok(())
    }

    #[test]
    fn test_failure_display_has_context() {
        let failure = TrainingFailure {
            stage: Stage::Checkpointing,
            run_id: "r1".to_string(),
            engine: "library".to_string(),
            last_step: 12,
            last_epoch: 1,
            error: FinetuneError::checkpoint("disk full"),
        };
        let text = failure.to_string();
        assert!(text.contains("checkpointing"));
        assert!(text.contains("r1"));
        assert!(text.contains("step 12"));
        assert!(text.contains("disk full"));
    }
}
