//! inspect subcommand - adapter summary or checkpoint listing

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Args;
use lorafold_core::SavedAdapter;
use lorafold_training::CheckpointManager;
use std::path::PathBuf;

#[derive(Args)]
pub struct InspectArgs {
    /// Adapter directory to summarise
    #[arg(long, conflicts_with = "checkpoints")]
    adapter: Option<PathBuf>,

    /// Checkpoint root to list
    #[arg(long, requires = "run_id")]
    checkpoints: Option<PathBuf>,

    #[arg(long)]
    run_id: Option<String>,
}

pub fn run(args: InspectArgs) -> Result<()> {
    if let Some(dir) = &args.adapter {
        let adapter = SavedAdapter::load_dir(dir, &Device::Cpu)
            .with_context(|| format!("failed to load adapter from {}", dir.display()))?;
        let config = adapter.config();
        println!("Adapter: {}", dir.display());
        println!("  rank: {}", config.rank());
        println!("  alpha: {} (scaling {:.4})", config.alpha(), config.scaling());
        println!("  dropout: {}", config.dropout());
        println!("  bias: {:?}", config.bias_mode());
        println!("  targets: {:?}", config.target_modules());
        println!("  parameters: {}", adapter.num_elements());

        let mut names: Vec<_> = adapter.tensors().iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        for (name, tensor) in names {
            println!("    {name} {:?}", tensor.dims());
        }
        return Ok(());
    }

    let (Some(root), Some(run_id)) = (&args.checkpoints, &args.run_id) else {
        anyhow::bail!("pass --adapter <dir> or --checkpoints <root> --run-id <id>");
    };
    let manager = CheckpointManager::new(root, usize::MAX).context("failed to open checkpoint root")?;
    let metas = manager
        .list(run_id)
        .with_context(|| format!("failed to list checkpoints of {run_id}"))?;
    if metas.is_empty() {
        println!("No checkpoints for run {run_id} under {}", root.display());
        return Ok(());
    }

    println!("Checkpoints of {run_id} (oldest first):");
    for meta in metas {
        let loss = meta.position.loss.map_or("-".to_string(), |l| format!("{l:.4}"));
        println!(
            "  {:<16} epoch {:>3}  step {:>7}  loss {:>8}  {}  {}{}",
            meta.key.marker.dir_name(),
            meta.position.epoch,
            meta.position.step,
            loss,
            meta.engine,
            meta.created_at.format("%Y-%m-%d %H:%M:%S"),
            if meta.has_optimizer_state { "  +optimizer" } else { "" }
        );
    }
    Ok(())
}
