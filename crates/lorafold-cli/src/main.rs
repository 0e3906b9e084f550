//! lorafold CLI - LoRA fine-tuning of causal language models
//!
//! Usage:
//!   lorafold init-base --size tiny --tokenizer tokenizer.json --output base/
//!   lorafold train --dataset data.csv --base base/ --tokenizer tokenizer.json --output adapter/
//!   lorafold train --dataset data.csv --base base/ --tokenizer gpt2 --resume latest
//!   lorafold merge --base base/ --adapter adapter/ --output merged/
//!   lorafold inspect --checkpoints checkpoints --run-id my-run

mod init;
mod inspect;
mod merge;
mod tokenizer;
mod train;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lorafold",
    about = "lorafold - Train, checkpoint and merge LoRA adapters",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a LoRA adapter on a prompt/response CSV
    Train(train::TrainArgs),

    /// Fold a trained adapter into the base weights
    Merge(merge::MergeArgs),

    /// Write a randomly initialised base model
    InitBase(init::InitArgs),

    /// Show an adapter artifact or the checkpoints of a run
    Inspect(inspect::InspectArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train::run(args),
        Commands::Merge(args) => merge::run(args),
        Commands::InitBase(args) => init::run(args),
        Commands::Inspect(args) => inspect::run(args),
    }
}

/// CUDA when compiled in and present, CPU otherwise
pub(crate) fn select_device(force_cpu: bool) -> anyhow::Result<candle_core::Device> {
    if !force_cpu && candle_core::utils::cuda_is_available() {
        println!("  CUDA available, using GPU");
        Ok(candle_core::Device::new_cuda(0)?)
    } else {
        println!("  Using CPU");
        Ok(candle_core::Device::Cpu)
    }
}
