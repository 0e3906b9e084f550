//! init-base subcommand - seeded random base model for experiments

use anyhow::{Context, Result};
use clap::Args;
use lorafold_core::{BaseModel, ModelConfig};
use std::path::PathBuf;

use crate::tokenizer;

#[derive(Args)]
pub struct InitArgs {
    /// Model size preset: tiny, small, medium
    #[arg(long, default_value = "tiny")]
    size: String,

    /// Tokenizer whose vocabulary size the model adopts
    #[arg(long, conflicts_with = "vocab_size")]
    tokenizer: Option<String>,

    /// Explicit vocabulary size
    #[arg(long)]
    vocab_size: Option<usize>,

    /// Give every linear projection a bias vector
    #[arg(long)]
    linear_bias: bool,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Output directory (config.json + model.safetensors)
    #[arg(long)]
    output: PathBuf,
}

pub fn run(args: InitArgs) -> Result<()> {
    let vocab_size = match (&args.tokenizer, args.vocab_size) {
        (Some(name), _) => tokenizer::load_tokenizer(name)?.get_vocab_size(true),
        (None, Some(size)) => size,
        (None, None) => anyhow::bail!("either --tokenizer or --vocab-size is required"),
    };

    let config = ModelConfig::preset(&args.size)?
        .with_vocab_size(vocab_size)
        .with_linear_bias(args.linear_bias);
    println!("\n=== lorafold init-base ===\n");
    println!("  Size: {} ({} params)", args.size, config.total_params());
    println!("  Vocab size: {vocab_size}");

    let base = BaseModel::random(config, args.seed, &candle_core::Device::Cpu)
        .context("failed to initialise base model")?;
    base.save(&args.output)
        .with_context(|| format!("failed to write base model to {}", args.output.display()))?;

    println!("  Saved: {}", args.output.display());
    Ok(())
}
