use serde::{Serialize, Deserialize};

/// Per-epoch statistics emitted by `TrainingController`.
///
/// When a progress channel is attached with `TrainingController::with_progress`,
/// the controller sends one `EpochStats` value at the end of every completed
/// epoch. A dropped receiver does not stop training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Mean (unscaled) training loss over all micro-batches in this epoch.
    pub train_loss: f64,
    /// Fused validation loss, if the epoch was evaluated.
    pub val_loss: Option<f64>,
    /// Training accuracy as a fraction in [0, 1].
    pub train_accuracy: f64,
    /// Fused top-1 validation accuracy, if the epoch was evaluated.
    pub val_accuracy: Option<f64>,
    /// Learning rate after the epoch's schedule step.
    pub learning_rate: f64,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}
