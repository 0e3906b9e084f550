//! Adapter-only checkpoints with retention
//!
//! Layout: `<root>/<run_id>/step-00000012/` or `<root>/<run_id>/epoch-0003/`,
//! each holding the adapter artifact, `checkpoint.json` and, when the engine
//! has one, `optimizer.safetensors`. Base weights are never written.

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use lorafold_core::adapter::check_compatible;
use lorafold_core::artifact::{ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
use lorafold_core::{AdapterConfig, FinetuneError, Result, SavedAdapter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_FILENAME: &str = "checkpoint.json";
pub const OPTIMIZER_FILENAME: &str = "optimizer.safetensors";
const LOCK_FILENAME: &str = ".lock";
const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum CheckpointMarker {
    /// Global optimizer step
    Step(usize),
    /// 0-based index of the completed epoch
    Epoch(usize),
}

impl CheckpointMarker {
    pub fn dir_name(&self) -> String {
        match self {
            CheckpointMarker::Step(step) => format!("step-{step:08}"),
            CheckpointMarker::Epoch(epoch) => format!("epoch-{epoch:04}"),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        if let Some(step) = name.strip_prefix("step-") {
            return step.parse().ok().map(CheckpointMarker::Step);
        }
        name.strip_prefix("epoch-")
            .and_then(|epoch| epoch.parse().ok())
            .map(CheckpointMarker::Epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub run_id: String,
    pub marker: CheckpointMarker,
}

impl CheckpointKey {
    pub fn step(run_id: impl Into<String>, step: usize) -> Self {
        Self {
            run_id: run_id.into(),
            marker: CheckpointMarker::Step(step),
        }
    }

    pub fn epoch(run_id: impl Into<String>, epoch: usize) -> Self {
        Self {
            run_id: run_id.into(),
            marker: CheckpointMarker::Epoch(epoch),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.marker.dir_name())
    }
}

/// Training position captured by a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPosition {
    /// 0-based epoch the checkpoint was taken in
    pub epoch: usize,
    /// Last completed optimizer step
    pub step: usize,
    /// Micro-batches of `epoch` already consumed
    pub batch_in_epoch: usize,
    pub loss: Option<f32>,
}

/// Contents of `checkpoint.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub key: CheckpointKey,
    #[serde(flatten)]
    pub position: TrainingPosition,
    pub engine: String,
    pub created_at: DateTime<Utc>,
    /// Save order within the run, used for retention
    pub sequence: u64,
    pub has_optimizer_state: bool,
}

pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub adapter: SavedAdapter,
    pub optimizer: Option<HashMap<String, Tensor>>,
}

/// Marker file held for the lifetime of a run
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to release run lock: {e}");
        }
    }
}

pub struct CheckpointManager {
    root: PathBuf,
    retention_limit: usize,
}

impl CheckpointManager {
    pub fn new(root: impl AsRef<Path>, retention_limit: usize) -> Result<Self> {
        if retention_limit == 0 {
            return Err(FinetuneError::config("checkpoint_retention_limit must be > 0"));
        }
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            retention_limit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.run_dir(&key.run_id).join(key.marker.dir_name())
    }

    /// Claim the run directory. Fails if another run holds it.
    pub fn acquire(&self, run_id: &str) -> Result<RunLock> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).map_err(|e| checkpoint_io(&dir, e))?;

        let path = dir.join(LOCK_FILENAME);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(RunLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FinetuneError::checkpoint(format!(
                    "checkpoint directory {} is in use by another run (remove {} if stale)",
                    dir.display(),
                    path.display()
                )))
            }
            Err(e) => Err(checkpoint_io(&path, e)),
        }
    }

    /// Write a snapshot, then drop the oldest ones beyond the retention limit
    pub fn save(
        &self,
        key: &CheckpointKey,
        position: TrainingPosition,
        engine: &str,
        adapter: &SavedAdapter,
        optimizer: Option<&HashMap<String, Tensor>>,
    ) -> Result<CheckpointMeta> {
        let run_dir = self.run_dir(&key.run_id);
        fs::create_dir_all(&run_dir).map_err(|e| checkpoint_io(&run_dir, e))?;

        let sequence = self
            .list(&key.run_id)?
            .iter()
            .map(|m| m.sequence)
            .max()
            .map_or(0, |s| s + 1);
        let meta = CheckpointMeta {
            key: key.clone(),
            position,
            engine: engine.to_string(),
            created_at: Utc::now(),
            sequence,
            has_optimizer_state: optimizer.is_some(),
        };

        let final_dir = self.path_for(key);
        let tmp_dir = run_dir.join(format!("{TMP_PREFIX}{}", key.marker.dir_name()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(|e| checkpoint_io(&tmp_dir, e))?;
        }

        adapter
            .save_dir(&tmp_dir)
            .map_err(|e| FinetuneError::checkpoint(format!("writing {key}: {e}")))?;
        if let Some(state) = optimizer {
            candle_core::safetensors::save(state, tmp_dir.join(OPTIMIZER_FILENAME))
                .map_err(|e| FinetuneError::checkpoint(format!("writing optimizer state of {key}: {e}")))?;
        }
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| FinetuneError::checkpoint(format!("serializing {key}: {e}")))?;
        let meta_path = tmp_dir.join(METADATA_FILENAME);
        fs::write(&meta_path, json).map_err(|e| checkpoint_io(&meta_path, e))?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(|e| checkpoint_io(&final_dir, e))?;
        }
        fs::rename(&tmp_dir, &final_dir).map_err(|e| checkpoint_io(&final_dir, e))?;

        tracing::info!(checkpoint = %key, step = meta.position.step, "saved checkpoint");
        self.enforce_retention(&key.run_id)?;
        Ok(meta)
    }

    /// Valid checkpoints of a run, oldest first
    pub fn list(&self, run_id: &str) -> Result<Vec<CheckpointMeta>> {
        let scan = self.scan(run_id)?;
        for (path, error) in &scan.unreadable {
            tracing::warn!(path = %path.display(), "unreadable checkpoint: {error}");
        }
        Ok(scan.valid)
    }

    /// Newest checkpoint of a run. Fails while any checkpoint directory of
    /// the run is unreadable, since it may be the newest one.
    pub fn latest(&self, run_id: &str) -> Result<Option<CheckpointMeta>> {
        let mut scan = self.scan(run_id)?;
        if let Some((path, error)) = scan.unreadable.first() {
            return Err(FinetuneError::checkpoint(format!(
                "cannot determine the latest checkpoint of '{run_id}': {} is unreadable ({error})",
                path.display()
            )));
        }
        Ok(scan.valid.pop())
    }

    fn scan(&self, run_id: &str) -> Result<Scan> {
        let run_dir = self.run_dir(run_id);
        let mut scan = Scan::default();
        if !run_dir.exists() {
            return Ok(scan);
        }

        for entry in fs::read_dir(&run_dir).map_err(|e| checkpoint_io(&run_dir, e))? {
            let entry = entry.map_err(|e| checkpoint_io(&run_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if CheckpointMarker::parse(&name).is_none() || !entry.path().is_dir() {
                continue;
            }
            match read_meta(&entry.path()) {
                Ok(meta) => scan.valid.push(meta),
                Err(e) => scan.unreadable.push((entry.path(), e)),
            }
        }
        scan.valid.sort_by_key(|m| m.sequence);
        scan.unreadable.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(scan)
    }

    /// Load a checkpoint after checking it was produced with a compatible
    /// adapter configuration
    pub fn restore(&self, key: &CheckpointKey, expected: &AdapterConfig, device: &Device) -> Result<Checkpoint> {
        let dir = self.path_for(key);
        if !dir.is_dir() {
            return Err(FinetuneError::checkpoint(format!("checkpoint {key} does not exist")));
        }
        for required in [METADATA_FILENAME, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME] {
            if !dir.join(required).is_file() {
                return Err(FinetuneError::checkpoint(format!("checkpoint {key} is missing {required}")));
            }
        }

        let meta = read_meta(&dir)?;
        let adapter = SavedAdapter::load_dir(&dir, device)?;
        check_compatible(expected, adapter.config())?;

        let optimizer = if meta.has_optimizer_state {
            let path = dir.join(OPTIMIZER_FILENAME);
            let state = candle_core::safetensors::load(&path, device).map_err(|e| {
                FinetuneError::checkpoint(format!("corrupt optimizer state in {key}: {e}"))
            })?;
            Some(state)
        } else {
            None
        };

        tracing::debug!(checkpoint = %key, step = meta.position.step, "restored checkpoint");
        Ok(Checkpoint {
            meta,
            adapter,
            optimizer,
        })
    }

    /// Unreadable directories count toward the limit and go first
    fn enforce_retention(&self, run_id: &str) -> Result<()> {
        let scan = self.scan(run_id)?;
        let mut excess = (scan.valid.len() + scan.unreadable.len()).saturating_sub(self.retention_limit);

        for (dir, error) in scan.unreadable.iter().take(excess) {
            fs::remove_dir_all(dir).map_err(|e| checkpoint_io(dir, e))?;
            tracing::warn!(path = %dir.display(), "removed unreadable checkpoint: {error}");
        }
        excess = excess.saturating_sub(scan.unreadable.len());

        for meta in scan.valid.iter().take(excess) {
            let dir = self.path_for(&meta.key);
            fs::remove_dir_all(&dir).map_err(|e| checkpoint_io(&dir, e))?;
            tracing::debug!(checkpoint = %meta.key, "removed checkpoint beyond retention limit");
        }
        Ok(())
    }
}

/// Checkpoint directories of one run, split by whether their metadata parses
#[derive(Default)]
struct Scan {
    valid: Vec<CheckpointMeta>,
    unreadable: Vec<(PathBuf, FinetuneError)>,
}

fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = dir.join(METADATA_FILENAME);
    let raw = fs::read_to_string(&path).map_err(|e| checkpoint_io(&path, e))?;
    serde_json::from_str(&raw)
        .map_err(|e| FinetuneError::checkpoint(format!("corrupt {}: {e}", path.display())))
}

fn checkpoint_io(path: &Path, err: std::io::Error) -> FinetuneError {
    FinetuneError::checkpoint(format!("{}: {err}", path.display()))
}
