//! Train subcommand - CSV to trained adapter
//!
//! Supports:
//! - Local or Hub tokenizers
//! - `--run-config` JSON with per-flag overrides
//! - Explicit resume (`--resume latest|latest-or-fresh|step-N|epoch-N`)
//! - Checkpoint on SIGINT/SIGTERM, then clean stop
//! - One fallback run with the manual loop if the primary engine fails

use anyhow::{Context, Result};
use clap::Args;
use lorafold_core::{AdapterConfig, BiasMode};
use lorafold_training::{
    run_with_fallback, CheckpointKey, CheckpointMarker, DatasetBuilder, DeviceToggles, EngineWorkarounds,
    LabelPadding, LibraryBackedEngine, ManualLoopEngine, ModelSource, Outcome, PromptTemplate, ResumeFrom,
    RunContext, TokenizeOptions, TokenizerAdapter, TrainingRunConfig, TruncationPolicy,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::tokenizer;

const REPORT_FILENAME: &str = "training_report.json";

#[derive(Args)]
pub struct TrainArgs {
    /// CSV file with `prompt` and `response` columns
    #[arg(long)]
    dataset: PathBuf,

    /// Base model directory (config.json + model.safetensors)
    #[arg(long)]
    base: PathBuf,

    /// Local tokenizer.json or Hugging Face model name
    #[arg(long)]
    tokenizer: String,

    /// Directory for the final adapter
    #[arg(long, default_value = "adapter")]
    output: PathBuf,

    /// Checkpoint root
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value = "lorafold-run")]
    run_id: String,

    /// Prompt template: bare (`prompt\n\nresponse`), plain, role_delimited
    #[arg(long, default_value = "bare")]
    template: String,

    #[arg(long, default_value = "128")]
    max_length: usize,

    /// Padding token (default: tokenizer padding, else EOS, else id 0)
    #[arg(long)]
    pad_token: Option<String>,

    /// Fail on over-long examples instead of truncating
    #[arg(long)]
    reject_long: bool,

    /// Keep pad tokens as labels instead of ignoring them in the loss
    #[arg(long)]
    copy_pad_labels: bool,

    #[arg(long, default_value = "4")]
    rank: usize,

    #[arg(long, default_value = "16")]
    alpha: f64,

    #[arg(long, default_value = "0.05")]
    dropout: f64,

    /// Comma separated module suffixes
    #[arg(long, default_value = "q_proj,v_proj", value_delimiter = ',')]
    target_modules: Vec<String>,

    /// Bias training: none, all, lora_only
    #[arg(long, default_value = "none")]
    bias: String,

    #[arg(long, default_value = "0")]
    init_seed: u64,

    /// JSON file with a TrainingRunConfig; flags below override it
    #[arg(long)]
    run_config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    grad_accum: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    max_steps: Option<usize>,

    #[arg(long)]
    save_every: Option<usize>,

    #[arg(long)]
    keep_checkpoints: Option<usize>,

    #[arg(long)]
    shuffle_seed: Option<u64>,

    /// latest, latest-or-fresh, or a checkpoint directory name (step-00000012)
    #[arg(long)]
    resume: Option<String>,

    /// Run the manual loop only if the primary engine fails
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fallback: bool,

    /// Synchronous kernel launches (HIP/CUDA_LAUNCH_BLOCKING=1)
    #[arg(long, env = "LORAFOLD_LAUNCH_BLOCKING")]
    launch_blocking: bool,

    /// Copy without the SDMA engine (HSA_ENABLE_SDMA=0)
    #[arg(long, env = "LORAFOLD_DISABLE_SDMA")]
    disable_sdma: bool,

    /// Build batches on the context device instead of the model device
    #[arg(long)]
    no_batch_placement: bool,

    #[arg(long)]
    contiguous_inputs: bool,

    #[arg(long)]
    no_progress: bool,

    #[arg(long)]
    cpu: bool,
}

impl TrainArgs {
    fn run_config(&self) -> Result<TrainingRunConfig> {
        let mut config = match &self.run_config {
            Some(path) => TrainingRunConfig::from_json_file(path)
                .with_context(|| format!("failed to read run config {}", path.display()))?,
            None => TrainingRunConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.per_step_batch_size = batch_size;
        }
        if let Some(grad_accum) = self.grad_accum {
            config.gradient_accumulation_steps = grad_accum;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        if self.max_steps.is_some() {
            config.max_steps = self.max_steps;
        }
        if let Some(save_every) = self.save_every {
            config.save_interval = (save_every > 0).then_some(save_every);
        }
        if let Some(keep) = self.keep_checkpoints {
            config.checkpoint_retention_limit = keep;
        }
        if self.shuffle_seed.is_some() {
            config.shuffle_seed = self.shuffle_seed;
        }
        Ok(config.validated()?)
    }

    fn adapter_config(&self) -> Result<AdapterConfig> {
        let bias: BiasMode = self.bias.parse()?;
        let config = AdapterConfig::new(self.rank, self.alpha, self.dropout, self.target_modules.iter().cloned(), bias)?
            .with_init_seed(self.init_seed);
        Ok(config)
    }

    fn resume_from(&self) -> Result<ResumeFrom> {
        let Some(resume) = self.resume.as_deref() else {
            return Ok(ResumeFrom::Fresh);
        };
        match resume {
            "latest" => Ok(ResumeFrom::Latest),
            "latest-or-fresh" => Ok(ResumeFrom::LatestOrFresh),
            name => {
                let marker = CheckpointMarker::parse(name).with_context(|| {
                    format!("invalid --resume '{name}'. Use: latest, latest-or-fresh, step-N, epoch-N")
                })?;
                Ok(ResumeFrom::Key(CheckpointKey {
                    run_id: self.run_id.clone(),
                    marker,
                }))
            }
        }
    }
}

pub fn run(args: TrainArgs) -> Result<()> {
    let start = Instant::now();
    println!("\n=== lorafold train ===\n");

    let run_config = args.run_config()?;
    let adapter_config = args.adapter_config()?;
    let resume = args.resume_from()?;
    let template: PromptTemplate = args.template.parse()?;

    // 1. Dataset
    let examples = DatasetBuilder::new(template)
        .from_path(&args.dataset)
        .with_context(|| format!("failed to load dataset {}", args.dataset.display()))?;
    println!("  Dataset: {} ({} examples)", args.dataset.display(), examples.len());

    // 2. Tokenize
    let tok = tokenizer::load_tokenizer(&args.tokenizer)?;
    let options = TokenizeOptions {
        max_length: args.max_length,
        pad_id: tokenizer::pad_id(&tok, args.pad_token.as_deref())?,
        truncation: if args.reject_long {
            TruncationPolicy::Reject
        } else {
            TruncationPolicy::Truncate
        },
        label_padding: if args.copy_pad_labels {
            LabelPadding::Copy
        } else {
            LabelPadding::Ignore
        },
        ..Default::default()
    };
    let data = TokenizerAdapter::new(tok, options)?
        .tokenize_all(&examples)
        .context("tokenization failed")?;
    println!("  Records: {} x {} tokens", data.len(), data.max_length());

    // 3. Run context; toggles go into the environment before the device exists
    let toggles = DeviceToggles {
        launch_blocking: args.launch_blocking,
        disable_sdma: args.disable_sdma,
    };
    toggles.apply();
    let device = crate::select_device(args.cpu)?;
    let ctx = RunContext::new(args.run_id.as_str(), device, &args.checkpoint_dir, &args.output)?.with_toggles(toggles);
    ctx.prepare().context("failed to prepare run context")?;

    let interrupt = ctx.interrupt_flag();
    ctrlc::set_handler(move || {
        eprintln!("\n  SIGTERM/SIGINT received, checkpointing at the next step boundary...");
        interrupt.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    println!(
        "  Adapter: rank {}, alpha {}, targets {:?}",
        adapter_config.rank(),
        adapter_config.alpha(),
        adapter_config.target_modules()
    );
    println!(
        "  Steps: {} ({} epochs, batch {}, accumulation {})\n",
        run_config.total_optimizer_steps(data.len()),
        run_config.epochs,
        run_config.per_step_batch_size,
        run_config.gradient_accumulation_steps
    );

    // 4. Train
    let source = ModelSource::Directory(args.base.clone());
    let workarounds = EngineWorkarounds {
        place_batches_on_model_device: !args.no_batch_placement,
        contiguous_inputs: args.contiguous_inputs,
    };
    let primary = LibraryBackedEngine::new(source.clone(), adapter_config.clone(), run_config.clone())?
        .with_resume(resume)
        .with_workarounds(workarounds)
        .with_progress(!args.no_progress);

    let outcome = if args.fallback {
        let fallback = ManualLoopEngine::new(source, adapter_config, run_config)?;
        let result = run_with_fallback(primary, fallback, &ctx, &data);
        if let Some(failure) = &result.primary_failure {
            println!("  Primary engine failed: {failure}");
        }
        result.outcome
    } else {
        let mut primary = primary;
        lorafold_training::TrainingEngine::run(&mut primary, &ctx, &data)
    };

    let report = match outcome {
        Outcome::Success(report) => report,
        Outcome::Failure(failure) => return Err(failure).context("training failed"),
    };

    let report_path = args.output.join(REPORT_FILENAME);
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&report_path, json).with_context(|| format!("failed to write {}", report_path.display()))?;

    println!("\n=== Training {} ===", if report.interrupted { "interrupted" } else { "complete" });
    println!("  Engine: {}", report.engine);
    println!("  Steps: {} -> {}", report.start_step, report.global_step);
    if let Some(loss) = report.final_loss {
        println!("  Final loss: {loss:.4}");
    }
    println!("  Adapter: {}", report.adapter_dir.display());
    println!("  Time: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
