//! Manual training loop, used once the library-backed engine has failed
//!
//! Shares nothing with the failed engine: the base model is reloaded from
//! its source, the adapter is re-applied fresh, and the optimizer is
//! candle-nn's own AdamW. One forward, one backward and one optimizer step
//! per batch, batches in dataset order.

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use lorafold_core::{apply_adapter, AdaptedModel, AdapterConfig, FinetuneError};

use crate::batch::{compute_loss, HostBatch};
use crate::checkpoint::{CheckpointKey, CheckpointManager, TrainingPosition};
use crate::config::TrainingRunConfig;
use crate::context::RunContext;
use crate::engine::{
    AtStage, EngineState, Outcome, Stage, StageError, TrainingEngine, TrainingFailure, TrainingReport,
};
use crate::source::ModelSource;
use crate::tokenize::TokenizedDataset;

pub struct ManualLoopEngine {
    source: ModelSource,
    adapter_config: AdapterConfig,
    run_config: TrainingRunConfig,
    state: EngineState,
    last_step: usize,
    last_epoch: usize,
}

impl ManualLoopEngine {
    pub const NAME: &'static str = "manual";

    pub fn new(
        source: ModelSource,
        adapter_config: AdapterConfig,
        run_config: TrainingRunConfig,
    ) -> lorafold_core::Result<Self> {
        adapter_config.validate()?;
        run_config.validate()?;
        Ok(Self {
            source,
            adapter_config,
            run_config,
            state: EngineState::Idle,
            last_step: 0,
            last_epoch: 0,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Checkpoints go under their own run id so they never mix with the
    /// failed engine's snapshots
    pub fn checkpoint_run_id(run_id: &str) -> String {
        format!("{run_id}-fallback")
    }

    fn execute(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Result<TrainingReport, StageError> {
        let config = &self.run_config;
        if data.is_empty() {
            return Err(StageError {
                stage: Stage::Loading,
                error: FinetuneError::config("dataset has no records"),
            });
        }

        let base = self.source.load(ctx.device()).at(Stage::Loading)?;
        let model = apply_adapter(&base, &self.adapter_config, ctx.device()).at(Stage::Loading)?;
        drop(base);

        let run_id = Self::checkpoint_run_id(ctx.run_id());
        let manager = CheckpointManager::new(ctx.checkpoint_root(), config.checkpoint_retention_limit)
            .at(Stage::Loading)?;
        let _lock = manager.acquire(&run_id).at(Stage::Loading)?;

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(model.params().all_vars(), params).at(Stage::Loading)?;

        self.state = EngineState::Running;
        tracing::info!(
            run_id = %run_id,
            engine = Self::NAME,
            records = data.len(),
            trainable = model.trainable_parameter_count(),
            "starting fallback training"
        );

        let batch_size = config.per_step_batch_size;
        let batches_per_epoch = config.batches_per_epoch(data.len());
        let order: Vec<usize> = (0..data.len()).collect();

        let mut global_step = 0usize;
        let mut last_loss = None;
        let mut step_losses = Vec::new();
        let mut epochs_completed = 0usize;
        let mut interrupted = false;

        'epochs: for epoch in 0..config.epochs {
            self.last_epoch = epoch;

            for (index, rows) in order.chunks(batch_size).enumerate() {
                if ctx.is_interrupted() {
                    let position = TrainingPosition {
                        epoch,
                        step: global_step,
                        batch_in_epoch: index,
                        loss: last_loss,
                    };
                    save(&manager, &CheckpointKey::step(run_id.as_str(), global_step), position, &model)?;
                    tracing::warn!(step = global_step, epoch = epoch + 1, "fallback interrupted, checkpoint saved");
                    interrupted = true;
                    break 'epochs;
                }

                let host = HostBatch::assemble(data, index, rows);
                let loss = self.step(&model, &mut optimizer, &host, ctx).at(Stage::Training)?;
                global_step += 1;
                self.last_step = global_step;
                last_loss = Some(loss);
                step_losses.push(loss);

                if global_step % config.log_interval == 0 || global_step == 1 {
                    tracing::info!(step = global_step, epoch = epoch + 1, loss, "fallback step");
                }

                let position = TrainingPosition {
                    epoch,
                    step: global_step,
                    batch_in_epoch: index + 1,
                    loss: last_loss,
                };
                if global_step % config.fallback_save_interval == 0 {
                    let key = CheckpointKey::step(run_id.as_str(), global_step);
                    save(&manager, &key, position, &model)?;
                }
                if config.max_steps.is_some_and(|max| global_step >= max) {
                    tracing::info!(step = global_step, "reached max_steps, stopping");
                    break 'epochs;
                }
            }

            let position = TrainingPosition {
                epoch,
                step: global_step,
                batch_in_epoch: batches_per_epoch,
                loss: last_loss,
            };
            save(&manager, &CheckpointKey::epoch(run_id.as_str(), epoch), position, &model)?;
            epochs_completed = epoch + 1;
            tracing::info!(epoch = epoch + 1, step = global_step, loss = ?last_loss, "fallback epoch complete");
        }

        let adapter_dir = ctx.output_dir().to_path_buf();
        model.to_saved().save_dir(&adapter_dir).at(Stage::Finalizing)?;
        tracing::info!(path = %adapter_dir.display(), step = global_step, "wrote final adapter");

        Ok(TrainingReport {
            run_id,
            engine: Self::NAME.to_string(),
            global_step,
            start_step: 1,
            resumed_from: None,
            epochs_completed,
            final_loss: last_loss,
            step_losses,
            interrupted,
            trainable_parameters: model.trainable_parameter_count(),
            adapter_dir,
        })
    }

    fn step(
        &self,
        model: &AdaptedModel,
        optimizer: &mut AdamW,
        host: &HostBatch,
        ctx: &RunContext,
    ) -> lorafold_core::Result<f32> {
        let batch = host.to_device(ctx.device(), true)?;
        let logits = model.forward(&batch.input_ids, Some(&batch.attention_mask), true)?;
        let loss = compute_loss(&logits, &batch)?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(FinetuneError::device(format!("non-finite loss {value}")));
        }
        optimizer.backward_step(&loss)?;
        Ok(value)
    }
}

fn save(
    manager: &CheckpointManager,
    key: &CheckpointKey,
    position: TrainingPosition,
    model: &AdaptedModel,
) -> Result<(), StageError> {
    manager
        .save(key, position, ManualLoopEngine::NAME, &model.to_saved(), None)
        .at(Stage::Checkpointing)?;
    Ok(())
}

impl TrainingEngine for ManualLoopEngine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Outcome {
        self.state = EngineState::Loading;

        match self.execute(ctx, data) {
            Ok(report) => {
                self.state = EngineState::Completed;
                tracing::info!(run_id = %report.run_id, steps = report.global_step, "fallback training finished");
                Outcome::Success(report)
            }
            Err(StageError { stage, error }) => {
                self.state = EngineState::Failed;
                let failure = TrainingFailure {
                    stage,
                    run_id: Self::checkpoint_run_id(ctx.run_id()),
                    engine: Self::NAME.to_string(),
                    last_step: self.last_step,
                    last_epoch: self.last_epoch,
                    error,
                };
                tracing::error!(kind = failure.error.kind(), "{failure}");
                Outcome::Failure(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run_with_fallback;
    use crate::engine::testing::{Counting, FailingEngine};
    use crate::tokenize::{TokenizedRecord, IGNORE_INDEX};
    use candle_core::Device;
    use lorafold_core::{BaseModel, BiasMode, ModelConfig, SavedAdapter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn source() -> ModelSource {
        let config = ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_layers: 1,
            num_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 8,
            layer_norm_eps: 1e-5,
            linear_bias: false,
        };
        ModelSource::InMemory(BaseModel::random(config, 0, &Device::Cpu).unwrap())
    }

    fn data(rows: usize) -> TokenizedDataset {
        let records = (0..rows)
            .map(|i| {
                let ids: Vec<u32> = (0..6).map(|t| ((i + t) % 16) as u32).collect();
                let mut labels: Vec<i64> = ids.iter().map(|&x| x as i64).collect();
                labels[5] = IGNORE_INDEX;
                TokenizedRecord {
                    attention_mask: vec![1, 1, 1, 1, 1, 0],
                    input_ids: ids,
                    labels,
                }
            })
            .collect();
        TokenizedDataset::new(records, 6).unwrap()
    }

    fn manual(run_config: TrainingRunConfig) -> ManualLoopEngine {
        let adapter = AdapterConfig::new(2, 4.0, 0.0, ["q_proj", "v_proj"], BiasMode::None).unwrap();
        ManualLoopEngine::new(source(), adapter, run_config).unwrap()
    }

    #[test]
    fn test_one_step_per_batch_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new("run", Device::Cpu, dir.path().join("ckpt"), dir.path().join("out")).unwrap();
        let mut engine = manual(TrainingRunConfig {
            epochs: 2,
            per_step_batch_size: 2,
            gradient_accumulation_steps: 4,
            fallback_save_interval: 2,
            checkpoint_retention_limit: 10,
            ..Default::default()
        });

        // 5 rows -> 3 batches per epoch, accumulation ignored
        let report = engine.run(&ctx, &data(5)).report().cloned().unwrap();
        assert_eq!(report.global_step, 6);
        assert_eq!(report.run_id, "run-fallback");
        assert_eq!(engine.state(), EngineState::Completed);

        let manager = CheckpointManager::new(ctx.checkpoint_root(), 10).unwrap();
        let keys: Vec<String> = manager
            .list("run-fallback")
            .unwrap()
            .iter()
            .map(|m| m.key.marker.dir_name())
            .collect();
        assert_eq!(keys, vec!["step-00000002", "epoch-0000", "step-00000004", "step-00000006", "epoch-0001"]);
    }

    #[test]
    fn test_fallback_after_primary_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new("run", Device::Cpu, dir.path().join("ckpt"), dir.path().join("out")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let fallback = Counting {
            inner: manual(TrainingRunConfig {
                epochs: 1,
                per_step_batch_size: 2,
                ..Default::default()
            }),
            calls: Arc::clone(&calls),
        };

        let result = run_with_fallback(FailingEngine { name: "library" }, fallback, &ctx, &data(4));

        assert!(result.fallback_invoked);
        assert!(result.outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.primary_failure.map(|f| f.engine), Some("library".to_string()));

        let saved = SavedAdapter::load_dir(ctx.output_dir(), &Device::Cpu).unwrap();
        assert_eq!(saved.num_elements(), 2 * 2 * (8 + 8));
    }

    #[test]
    fn test_failure_is_terminal_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new("run", Device::Cpu, dir.path().join("ckpt"), dir.path().join("out")).unwrap();
        let adapter = AdapterConfig::new(2, 4.0, 0.0, ["q_proj"], BiasMode::None).unwrap();
        let mut engine = ManualLoopEngine::new(
            ModelSource::Directory(dir.path().join("missing")),
            adapter,
            TrainingRunConfig::default(),
        )
        .unwrap();

        let outcome = engine.run(&ctx, &data(2));
        let failure = outcome.failure().unwrap();
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(failure.run_id, "run-fallback");
        assert_eq!(failure.stage, Stage::Loading);
    }
}
