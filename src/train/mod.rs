pub mod checkpoint;
pub mod controller;
pub mod epoch_stats;
pub mod evaluator;
pub mod progress;
pub mod trainer;

pub use checkpoint::{load_checkpoint, restore_optimizer_and_scheduler, restore_weights, Checkpoint, CheckpointManager};
pub use controller::{Datasets, RunState, Stage, TerminationReason, TrainingController, TrainingSummary};
pub use epoch_stats::EpochStats;
pub use evaluator::{fuse_view_scores, EvalOutputs, EvalReport, EvalView, MultiViewEvaluator};
pub use trainer::{GradientAccumulationTrainer, TrainContext, TrainingReport};
