//! merge subcommand - W' = W + (alpha/r)·B·A, written as a dense model

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use lorafold_core::{merge_adapter, BaseModel, SavedAdapter};
use std::path::PathBuf;

#[derive(Args)]
pub struct MergeArgs {
    /// Base model directory
    #[arg(long)]
    base: PathBuf,

    /// Adapter directory (adapter_model.safetensors + adapter_config.json)
    #[arg(long)]
    adapter: PathBuf,

    /// Output directory for the merged model
    #[arg(long)]
    output: PathBuf,
}

pub fn run(args: MergeArgs) -> Result<()> {
    let device = Device::Cpu;
    let base = BaseModel::load(&args.base, &device)
        .with_context(|| format!("failed to load base model from {}", args.base.display()))?;
    let adapter = SavedAdapter::load_dir(&args.adapter, &device)
        .with_context(|| format!("failed to load adapter from {}", args.adapter.display()))?;

    println!("\n=== lorafold merge ===\n");
    println!(
        "  Adapter: rank {}, alpha {}, targets {:?}",
        adapter.config().rank(),
        adapter.config().alpha(),
        adapter.config().target_modules()
    );

    let merged = merge_adapter(&base, &adapter).context("merge failed")?;
    merged
        .save(&args.output)
        .with_context(|| format!("failed to write merged model to {}", args.output.display()))?;

    println!("  Merged model saved: {}", args.output.display());
    Ok(())
}
