//! Checkpoint and weight persistence.
//!
//! Layout under the work directory:
//! - `checkpoints/checkpoint-{epoch}-fwbz{forward_batch_size}-{global_step}.json`
//! - `weights/weights-{epoch}.json`
//!
//! `epoch` is the number of completed epochs (1-based).

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::network::model::Model;
use crate::network::state_dict::{StateDict, WeightLoadReport};
use crate::optim::optimizer::{Optimizer, OptimizerState};
use crate::optim::scheduler::LrScheduler;

/// Resumable optimizer and scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub optimizer_states: OptimizerState,
    pub lr_scheduler_states: LrScheduler,
    #[serde(default)]
    pub global_step: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    work_dir: PathBuf,
    forward_batch_size: usize,
}

impl CheckpointManager {
    pub fn new(work_dir: impl Into<PathBuf>, forward_batch_size: usize) -> CheckpointManager {
        CheckpointManager { work_dir: work_dir.into(), forward_batch_size }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.work_dir.join("checkpoints")
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.work_dir.join("weights")
    }

    pub fn checkpoint_path(&self, epoch: usize, global_step: u64) -> PathBuf {
        self.checkpoint_dir()
            .join(format!("checkpoint-{epoch}-fwbz{}-{global_step}.json", self.forward_batch_size))
    }

    pub fn weights_path(&self, epoch: usize) -> PathBuf {
        self.weights_dir().join(format!("weights-{epoch}.json"))
    }

    pub fn save_checkpoint(
        &self,
        epoch: usize,
        global_step: u64,
        optimizer: &dyn Optimizer,
        scheduler: &LrScheduler,
    ) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            epoch,
            optimizer_states: optimizer.state(),
            lr_scheduler_states: scheduler.clone(),
            global_step: Some(global_step),
        };
        let path = self.checkpoint_path(epoch, global_step);
        write_json(&path, &checkpoint)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Overwrites any earlier weights for the same epoch.
    pub fn save_weights(&self, epoch: usize, model: &dyn Model) -> Result<PathBuf> {
        let path = self.weights_path(epoch);
        write_json(&path, &model.state_dict())?;
        tracing::info!(path = %path.display(), "saved weights");
        Ok(path)
    }
}

/// Reads a checkpoint file.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    read_json(path)
}

/// Restores optimizer and scheduler state from `path`.
///
/// Nothing is partially applied: a scheduler of another kind, an optimizer
/// of another kind or buffers that do not match `shapes` all fail the call.
pub fn restore_optimizer_and_scheduler(
    path: &Path,
    optimizer: &mut dyn Optimizer,
    scheduler: &mut LrScheduler,
    shapes: &[(usize, usize)],
) -> Result<Checkpoint> {
    let checkpoint = load_checkpoint(path)?;
    let found = checkpoint.lr_scheduler_states.kind();
    if found != scheduler.kind() {
        return Err(TrainError::SchedulerMismatch {
            expected: scheduler.kind().to_string(),
            found: found.to_string(),
        });
    }
    optimizer.load_state(checkpoint.optimizer_states.clone(), shapes)?;
    *scheduler = checkpoint.lr_scheduler_states.clone();

    tracing::info!(path = %path.display(), "loaded optimizer and scheduler states");
    tracing::info!("Starting LR: {}", optimizer.lr());
    tracing::info!("Starting last epoch: {}", scheduler.last_epoch());
    Ok(checkpoint)
}

/// Loads a weights snapshot into `model`.
///
/// Keys listed in `ignore` are dropped from the snapshot first. A strict load
/// is tried; when names or shapes differ, the compatible subset is applied
/// and every skipped name is logged. Entries whose data does not fill their
/// declared shape are skipped as well. Only unreadable files are errors.
pub fn restore_weights(path: &Path, model: &mut dyn Model, ignore: &[String]) -> Result<WeightLoadReport> {
    tracing::info!("Loading weights from {}", path.display());
    let mut snapshot: StateDict = read_json(path)?;
    snapshot = snapshot.normalized();

    for name in ignore {
        if snapshot.remove(name).is_some() {
            tracing::info!("Successfully removed weight: {name}");
        } else {
            tracing::info!("Cannot remove weight: {name}");
        }
    }

    let malformed: Vec<String> = snapshot.iter()
        .filter(|(_, tensor)| !tensor.is_well_formed())
        .map(|(name, _)| name.to_string())
        .collect();
    for name in &malformed {
        tracing::warn!("Skipping malformed weight: {name}");
        snapshot.remove(name);
    }

    match model.load_state_dict_strict(&snapshot) {
        Ok(report) => Ok(report),
        Err(diff) => {
            tracing::warn!(
                missing = diff.missing.len(),
                unexpected = diff.unexpected.len(),
                mismatched = diff.mismatched.len(),
                "weights do not match the model exactly"
            );
            if !diff.missing.is_empty() {
                tracing::warn!("Cannot find these weights:");
                for name in &diff.missing {
                    tracing::warn!("  {name}");
                }
            }
            for name in &diff.unexpected {
                tracing::warn!("  unexpected weight {name}");
            }
            for m in &diff.mismatched {
                tracing::warn!(
                    "  shape mismatch {}: model {:?}, snapshot {:?}",
                    m.name, m.expected, m.found
                );
            }
            let report = model.load_state_dict_compatible(&snapshot);
            tracing::warn!(
                applied = report.applied.len(),
                "Weights loaded partially. Some layers were ignored due to shape mismatch."
            );
            Ok(report)
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, value)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let restore_err = |reason: String| TrainError::CheckpointRestore { path: path.to_path_buf(), reason };
    let file = File::open(path).map_err(|e| restore_err(e.to_string()))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| restore_err(e.to_string()))
}
