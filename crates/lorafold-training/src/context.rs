//! Per-run context: device, toggles, output locations and lifecycle hooks

use candle_core::Device;
use lorafold_core::{FinetuneError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Low-level device flags, forwarded to the driver as environment variables.
/// Drivers read them when the device is created, so apply them first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToggles {
    /// `HIP_LAUNCH_BLOCKING=1` and `CUDA_LAUNCH_BLOCKING=1`
    pub launch_blocking: bool,
    /// `HSA_ENABLE_SDMA=0`, host/device copies without the SDMA engine
    pub disable_sdma: bool,
}

impl DeviceToggles {
    pub fn env_vars(&self) -> Vec<(&'static str, &'static str)> {
        let mut vars = Vec::new();
        if self.launch_blocking {
            vars.push(("HIP_LAUNCH_BLOCKING", "1"));
            vars.push(("CUDA_LAUNCH_BLOCKING", "1"));
        }
        if self.disable_sdma {
            vars.push(("HSA_ENABLE_SDMA", "0"));
        }
        vars
    }

    /// Set the variables in this process
    pub fn apply(&self) {
        for (name, value) in self.env_vars() {
            std::env::set_var(name, value);
            tracing::debug!(name, value, "set device toggle");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    device: Device,
    toggles: DeviceToggles,
    checkpoint_root: PathBuf,
    output_dir: PathBuf,
    interrupt: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        device: Device,
        checkpoint_root: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let run_id = run_id.into();
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(FinetuneError::config(format!("invalid run id '{run_id}'")));
        }
        Ok(Self {
            run_id,
            device,
            toggles: DeviceToggles::default(),
            checkpoint_root: checkpoint_root.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_toggles(mut self, toggles: DeviceToggles) -> Self {
        self.toggles = toggles;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn toggles(&self) -> DeviceToggles {
        self.toggles
    }

    pub fn checkpoint_root(&self) -> &Path {
        &self.checkpoint_root
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Shared flag; setting it stops training at the next step boundary
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Apply toggles and create output locations. Called before an engine
    /// allocates anything. The context's device already exists here, so
    /// callers that create a GPU device apply the toggles before that too.
    pub fn prepare(&self) -> Result<()> {
        self.toggles.apply();
        for dir in [&self.checkpoint_root, &self.output_dir] {
            std::fs::create_dir_all(dir).map_err(|e| FinetuneError::io(dir, e))?;
        }
        tracing::info!(run_id = %self.run_id, device = ?self.device, "run context prepared");
        Ok(())
    }

    /// Wait for outstanding device work so a failed engine's memory can be
    /// reclaimed before the next one allocates.
    pub fn teardown(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| FinetuneError::device(format!("device synchronize failed: {e}")))?;
        tracing::info!(run_id = %self.run_id, "run context torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_env_vars() {
        let toggles = DeviceToggles {
            launch_blocking: true,
            disable_sdma: false,
        };
        assert_eq!(
            toggles.env_vars(),
            vec![("HIP_LAUNCH_BLOCKING", "1"), ("CUDA_LAUNCH_BLOCKING", "1")]
        );
        let toggles = DeviceToggles {
            launch_blocking: false,
            disable_sdma: true,
        };
        assert_eq!(toggles.env_vars(), vec![("HSA_ENABLE_SDMA", "0")]);
        assert!(DeviceToggles::default().env_vars().is_empty());
    }

    #[test]
    fn test_toggles_applied_to_process_env() {
        DeviceToggles {
            launch_blocking: false,
            disable_sdma: true,
        }
        .apply();
        assert_eq!(std::env::var("HSA_ENABLE_SDMA").ok().as_deref(), Some("0"));
    }

    #[test]
    fn test_invalid_run_id() {
        assert!(RunContext::new("a/b", Device::Cpu, "ckpt", "out").is_err());
        assert!(RunContext::new("", Device::Cpu, "ckpt", "out").is_err());
    }

    #[test]
    fn test_prepare_creates_dirs_and_interrupt_is_shared() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| FinetuneError::io("tempdir", e))?;
        let ctx = RunContext::new("run", Device::Cpu, dir.path().join("ckpt"), dir.path().join("out"))?;
        ctx.prepare()?;
        assert!(ctx.checkpoint_root().is_dir());
        assert!(ctx.output_dir().is_dir());

        let flag = ctx.interrupt_flag();
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_interrupted());
        ctx.teardown()
    }
}
