//! Training orchestration: the primary, library-backed engine

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use lorafold_core::{apply_adapter, AdaptedModel, AdapterConfig, FinetuneError};
use lorafold_optim::{AdamW, AdamWConfig, LrSchedule};
use std::collections::HashMap;

use crate::batch::{compute_loss, epoch_order, BatchPrefetcher, HostBatch};
use crate::checkpoint::{CheckpointKey, CheckpointManager, TrainingPosition};
use crate::config::TrainingRunConfig;
use crate::context::RunContext;
use crate::engine::{
    AtStage, EngineState, Outcome, ResumeFrom, Stage, StageError, TrainingEngine, TrainingFailure,
    TrainingReport,
};
use crate::source::ModelSource;
use crate::tokenize::TokenizedDataset;

/// Engine-specific workarounds, as explicit switches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineWorkarounds {
    /// Build batch tensors on the model's device rather than the context's
    pub place_batches_on_model_device: bool,
    /// Force contiguous input tensors before the forward pass
    pub contiguous_inputs: bool,
}

impl Default for EngineWorkarounds {
    fn default() -> Self {
        Self {
            place_batches_on_model_device: true,
            contiguous_inputs: false,
        }
    }
}

/// Where the epoch loop picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StartPoint {
    step: usize,
    epoch: usize,
    skip_batches: usize,
    resumed_from: Option<usize>,
}

impl StartPoint {
    fn fresh() -> Self {
        Self {
            step: 0,
            epoch: 0,
            skip_batches: 0,
            resumed_from: None,
        }
    }
}

enum EpochEnd {
    Finished,
    MaxSteps,
    Interrupted,
}

/// Mutable bookkeeping of one run
struct Progress {
    global_step: usize,
    epoch: usize,
    batch_in_epoch: usize,
    last_loss: Option<f32>,
    step_losses: Vec<f32>,
}

pub struct LibraryBackedEngine {
    source: ModelSource,
    adapter_config: AdapterConfig,
    run_config: TrainingRunConfig,
    resume: ResumeFrom,
    workarounds: EngineWorkarounds,
    show_progress: bool,
    state: EngineState,
    last_step: usize,
    last_epoch: usize,
}

impl LibraryBackedEngine {
    pub const NAME: &'static str = "library";

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
            resume: ResumeFrom::Fresh,
            workarounds: EngineWorkarounds::default(),
            show_progress: false,
            state: EngineState::Idle,
            last_step: 0,
            last_epoch: 0,
        })
    }

    pub fn with_resume(mut self, resume: ResumeFrom) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_workarounds(mut self, workarounds: EngineWorkarounds) -> Self {
        self.workarounds = workarounds;
        self
    }

    /// Draw an `indicatif` progress bar per epoch
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn execute(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Result<TrainingReport, StageError> {
        let config = self.run_config.clone();
        if data.is_empty() {
            return Err(StageError {
                stage: Stage::Loading,
                error: FinetuneError::config("dataset has no records"),
            });
        }

        let base = self.source.load(ctx.device()).at(Stage::Loading)?;
        let model = apply_adapter(&base, &self.adapter_config, ctx.device()).at(Stage::Loading)?;
        drop(base);

        let manager = CheckpointManager::new(ctx.checkpoint_root(), config.checkpoint_retention_limit)
            .at(Stage::Loading)?;
        let _lock = manager.acquire(ctx.run_id()).at(Stage::Loading)?;

        let mut optimizer = AdamW::new(AdamWConfig {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            max_grad_norm: config.max_grad_norm,
            ..Default::default()
        });
        let schedule = LrSchedule::new(
            config.learning_rate,
            config.warmup_steps,
            Some(config.total_optimizer_steps(data.len())),
        );
        let batches_per_epoch = config.batches_per_epoch(data.len());

        let start = self
            .resolve_start(ctx, &manager, &model, &mut optimizer, batches_per_epoch)
            .at(Stage::Resuming)?;

        self.state = EngineState::Running;
        tracing::info!(
            run_id = ctx.run_id(),
            engine = Self::NAME,
            records = data.len(),
            batches_per_epoch,
            accumulation = config.gradient_accumulation_steps,
            trainable = model.trainable_parameter_count(),
            start_step = start.step + 1,
            "starting training"
        );

        let mut progress = Progress {
            global_step: start.step,
            epoch: start.epoch,
            batch_in_epoch: start.skip_batches,
            last_loss: None,
            step_losses: Vec::new(),
        };
        let prefetcher = BatchPrefetcher::new(data, config.per_step_batch_size, config.prefetch_depth);
        let mut epochs_completed = start.epoch;
        let mut interrupted = false;

        let already_done = config.max_steps.is_some_and(|max| start.step >= max);
        if !already_done {
            for epoch in start.epoch..config.epochs {
                let skip = if epoch == start.epoch { start.skip_batches } else { 0 };
                progress.epoch = epoch;
                progress.batch_in_epoch = skip;
                self.last_epoch = epoch;

                let order = epoch_order(data.len(), config.shuffle_seed, epoch);
                let pb = self.progress_bar(batches_per_epoch, skip, epoch);
                let end = prefetcher.epoch(&order, skip, |batches| {
                    self.train_epoch(ctx, &model, &mut optimizer, &schedule, &manager, &mut progress, batches, &pb)
                })?;
                pb.finish_and_clear();

                match end {
                    EpochEnd::Finished => {
                        epochs_completed = epoch + 1;
                        let key = CheckpointKey::epoch(ctx.run_id(), epoch);
                        self.save_checkpoint(&manager, &key, &progress, &model, &optimizer)?;
                        tracing::info!(
                            epoch = epoch + 1,
                            epochs = config.epochs,
                            step = progress.global_step,
                            loss = ?progress.last_loss,
                            "epoch complete"
                        );
                    }
                    EpochEnd::MaxSteps => {
                        tracing::info!(max_steps = ?config.max_steps, "reached max_steps, stopping");
                        break;
                    }
                    EpochEnd::Interrupted => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        let adapter_dir = ctx.output_dir().to_path_buf();
        model.to_saved().save_dir(&adapter_dir).at(Stage::Finalizing)?;
        tracing::info!(path = %adapter_dir.display(), step = progress.global_step, "wrote final adapter");

        Ok(TrainingReport {
            run_id: ctx.run_id().to_string(),
            engine: Self::NAME.to_string(),
            global_step: progress.global_step,
            start_step: start.step + 1,
            resumed_from: start.resumed_from,
            epochs_completed,
            final_loss: progress.last_loss,
            step_losses: progress.step_losses,
            interrupted,
            trainable_parameters: model.trainable_parameter_count(),
            adapter_dir,
        })
    }

    /// Restore adapter and optimizer state according to `self.resume`
    fn resolve_start(
        &self,
        ctx: &RunContext,
        manager: &CheckpointManager,
        model: &AdaptedModel,
        optimizer: &mut AdamW,
        batches_per_epoch: usize,
    ) -> lorafold_core::Result<StartPoint> {
        let key = match &self.resume {
            ResumeFrom::Fresh => return Ok(StartPoint::fresh()),
            ResumeFrom::Key(key) => key.clone(),
            ResumeFrom::Latest => manager
                .latest(ctx.run_id())?
                .map(|meta| meta.key)
                .ok_or_else(|| {
                    FinetuneError::checkpoint(format!("no checkpoint to resume run '{}' from", ctx.run_id()))
                })?,
            ResumeFrom::LatestOrFresh => match manager.latest(ctx.run_id())? {
                Some(meta) => meta.key,
                None => {
                    tracing::info!(run_id = ctx.run_id(), "no checkpoint found, starting fresh");
                    return Ok(StartPoint::fresh());
                }
            },
        };

        let checkpoint = manager.restore(&key, &self.adapter_config, ctx.device())?;
        model.load_saved(&checkpoint.adapter)?;
        if let Some(state) = &checkpoint.optimizer {
            optimizer
                .import_state(state, ctx.device())
                .map_err(|e| FinetuneError::checkpoint(format!("optimizer state of {key}: {e}")))?;
        }

        let position = &checkpoint.meta.position;
        let (epoch, skip_batches) = if position.batch_in_epoch >= batches_per_epoch {
            (position.epoch + 1, 0)
        } else {
            (position.epoch, position.batch_in_epoch)
        };
        tracing::info!(
            checkpoint = %key,
            resume_step = position.step + 1,
            epoch,
            skip_batches,
            "resuming from checkpoint"
        );

        Ok(StartPoint {
            step: position.step,
            epoch,
            skip_batches,
            resumed_from: Some(position.step),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn train_epoch(
        &mut self,
        ctx: &RunContext,
        model: &AdaptedModel,
        optimizer: &mut AdamW,
        schedule: &LrSchedule,
        manager: &CheckpointManager,
        progress: &mut Progress,
        batches: &mut dyn Iterator<Item = HostBatch>,
        pb: &ProgressBar,
    ) -> Result<EpochEnd, StageError> {
        let accumulation = self.run_config.gradient_accumulation_steps;
        let device = if self.workarounds.place_batches_on_model_device {
            model.device().clone()
        } else {
            ctx.device().clone()
        };

        let mut grads: HashMap<String, Tensor> = HashMap::new();
        let mut window = 0usize;
        let mut window_loss = 0f32;

        for host in batches {
            if window == 0 && ctx.is_interrupted() {
                return self.stop_interrupted(ctx, manager, progress, model, optimizer);
            }

            let loss_value = self
                .micro_batch(model, &host, &device, accumulation, &mut grads)
                .at(Stage::Training)?;
            window += 1;
            window_loss += loss_value;
            progress.batch_in_epoch = host.index + 1;
            pb.inc(1);

            if window == accumulation {
                self.optimizer_step(model, optimizer, schedule, &mut grads, window, progress, window_loss / window as f32)
                    .at(Stage::Training)?;
                window = 0;
                window_loss = 0.0;
                pb.set_message(format!("loss: {:.4} | step: {}", progress.last_loss.unwrap_or_default(), progress.global_step));

                if let Some(end) = self.after_step(ctx, manager, progress, model, optimizer)? {
                    return Ok(end);
                }
            }
        }

        // Partial accumulation window at epoch end
        if window > 0 {
            self.optimizer_step(model, optimizer, schedule, &mut grads, window, progress, window_loss / window as f32)
                .at(Stage::Training)?;
            if self.run_config.max_steps.is_some_and(|max| progress.global_step >= max) {
                let key = CheckpointKey::step(ctx.run_id(), progress.global_step);
                self.save_checkpoint(manager, &key, progress, model, optimizer)?;
                return Ok(EpochEnd::MaxSteps);
            }
        }

        Ok(EpochEnd::Finished)
    }

    /// Forward + backward of one micro-batch; gradients are added into `grads`
    fn micro_batch(
        &self,
        model: &AdaptedModel,
        host: &HostBatch,
        device: &Device,
        accumulation: usize,
        grads: &mut HashMap<String, Tensor>,
    ) -> lorafold_core::Result<f32> {
        let batch = host.to_device(device, self.workarounds.contiguous_inputs)?;
        let logits = model.forward(&batch.input_ids, Some(&batch.attention_mask), true)?;
        let loss = compute_loss(&logits, &batch)?;
        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            return Err(FinetuneError::device(format!("non-finite loss {loss_value}")));
        }

        let scaled = (loss / accumulation as f64)?;
        let step_grads = scaled.backward()?;
        for (name, var) in model.params().iter() {
            let Some(grad) = step_grads.get(var.as_tensor()) else {
                continue;
            };
            let summed = match grads.remove(name) {
                Some(previous) => previous.add(grad)?,
                None => grad.clone(),
            };
            grads.insert(name.clone(), summed.detach());
        }
        Ok(loss_value)
    }

    #[allow(clippy::too_many_arguments)]
    fn optimizer_step(
        &mut self,
        model: &AdaptedModel,
        optimizer: &mut AdamW,
        schedule: &LrSchedule,
        grads: &mut HashMap<String, Tensor>,
        window: usize,
        progress: &mut Progress,
        loss: f32,
    ) -> lorafold_core::Result<()> {
        let accumulation = self.run_config.gradient_accumulation_steps;
        if window < accumulation {
            // Partial window: rescale so the step sees the window's mean
            let scale = accumulation as f64 / window as f64;
            for grad in grads.values_mut() {
                *grad = (&*grad * scale)?;
            }
        }

        progress.global_step += 1;
        optimizer.set_lr(schedule.lr_at(progress.global_step));
        optimizer.step(model.params().iter(), grads)?;
        grads.clear();

        self.last_step = progress.global_step;
        progress.last_loss = Some(loss);
        progress.step_losses.push(loss);

        if progress.global_step % self.run_config.log_interval == 0 || progress.global_step == 1 {
            tracing::info!(
                step = progress.global_step,
                epoch = progress.epoch + 1,
                loss,
                lr = optimizer.lr(),
                grad_norm = ?optimizer.last_grad_norm(),
                "train step"
            );
        }
        Ok(())
    }

    /// Periodic save, max_steps and interrupt checks at a step boundary
    fn after_step(
        &self,
        ctx: &RunContext,
        manager: &CheckpointManager,
        progress: &Progress,
        model: &AdaptedModel,
        optimizer: &AdamW,
    ) -> Result<Option<EpochEnd>, StageError> {
        let step = progress.global_step;
        let key = CheckpointKey::step(ctx.run_id(), step);

        if self.run_config.max_steps.is_some_and(|max| step >= max) {
            self.save_checkpoint(manager, &key, progress, model, optimizer)?;
            return Ok(Some(EpochEnd::MaxSteps));
        }
        if ctx.is_interrupted() {
            return self
                .stop_interrupted(ctx, manager, progress, model, optimizer)
                .map(Some);
        }
        if self.run_config.save_interval.is_some_and(|every| step % every == 0) {
            self.save_checkpoint(manager, &key, progress, model, optimizer)?;
        }
        Ok(None)
    }

    fn stop_interrupted(
        &self,
        ctx: &RunContext,
        manager: &CheckpointManager,
        progress: &Progress,
        model: &AdaptedModel,
        optimizer: &AdamW,
    ) -> Result<EpochEnd, StageError> {
        let key = CheckpointKey::step(ctx.run_id(), progress.global_step);
        self.save_checkpoint(manager, &key, progress, model, optimizer)?;
        tracing::warn!(
            step = progress.global_step,
            epoch = progress.epoch + 1,
            checkpoint = %key,
            "training interrupted, checkpoint saved"
        );
        Ok(EpochEnd::Interrupted)
    }

    fn save_checkpoint(
        &self,
        manager: &CheckpointManager,
        key: &CheckpointKey,
        progress: &Progress,
        model: &AdaptedModel,
        optimizer: &AdamW,
    ) -> Result<(), StageError> {
        let state = optimizer.export_state().at(Stage::Checkpointing)?;
        let position = TrainingPosition {
            epoch: progress.epoch,
            step: progress.global_step,
            batch_in_epoch: progress.batch_in_epoch,
            loss: progress.last_loss,
        };
        manager
            .save(key, position, Self::NAME, &model.to_saved(), Some(&state))
            .at(Stage::Checkpointing)?;
        Ok(())
    }

    fn progress_bar(&self, batches: usize, skip: usize, epoch: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(batches as u64);
        let style = ProgressStyle::default_bar()
            .template("  {bar:30.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_position(skip as u64);
        pb.set_message(format!("epoch {}", epoch + 1));
        pb
    }
}

impl TrainingEngine for LibraryBackedEngine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&mut self, ctx: &RunContext, data: &TokenizedDataset) -> Outcome {
        self.state = EngineState::Loading;
        self.last_step = 0;
        self.last_epoch = 0;

        match self.execute(ctx, data) {
            Ok(report) => {
                self.state = EngineState::Completed;
                tracing::info!(
                    run_id = %report.run_id,
                    steps = report.global_step,
                    loss = ?report.final_loss,
                    interrupted = report.interrupted,
                    "training finished"
                );
                Outcome::Success(report)
            }
            Err(StageError { stage, error }) => {
                self.state = EngineState::Failed;
                let failure = TrainingFailure {
                    stage,
                    run_id: ctx.run_id().to_string(),
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
