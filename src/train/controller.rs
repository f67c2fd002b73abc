use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{Phase, RunConfig};
use crate::error::{Result, TrainError};
use crate::feeder::csv::CsvFeeder;
use crate::feeder::feeder::Feeder;
use crate::feeder::loader::{Augment, DataLoader};
use crate::feeder::normalize::Normalization;
use crate::feeder::tta::{TtaView, ViewFeeder};
use crate::metrics::sink::MetricsChannels;
use crate::network::model::Model;
use crate::network::spec::build_model;
use crate::optim::grad_scaler::GradScaler;
use crate::optim::optimizer::{build_optimizer, Optimizer};
use crate::optim::scheduler::LrScheduler;
use crate::train::checkpoint::{restore_optimizer_and_scheduler, restore_weights, CheckpointManager};
use crate::train::epoch_stats::EpochStats;
use crate::train::evaluator::{EvalOutputs, EvalReport, EvalView, MultiViewEvaluator};
use crate::train::trainer::{GradientAccumulationTrainer, TrainContext};

/// Where the controller is in the epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Initializing,
    TrainingEpoch,
    Evaluating,
    CheckpointDecision,
    NextEpoch,
    Terminated,
}

/// Mutable run progress, changed only at epoch boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// 0-based index of the epoch being (or last) run.
    pub current_epoch: usize,
    pub global_step: u64,
    pub learning_rate: f64,
    pub best_accuracy: f64,
    /// 1-based epoch that produced `best_accuracy`; 0 before any evaluation.
    pub best_accuracy_epoch: usize,
    pub best_validation_loss: Option<f64>,
    pub early_stop_counter: usize,
}

impl RunState {
    pub fn new(start_epoch: usize, global_step: u64, learning_rate: f64) -> RunState {
        RunState {
            current_epoch: start_epoch,
            global_step,
            learning_rate,
            best_accuracy: 0.0,
            best_accuracy_epoch: 0,
            best_validation_loss: None,
            early_stop_counter: 0,
        }
    }

    /// Applies the early-stopping rule to one validation loss.
    ///
    /// The first loss becomes the best. Afterwards a higher loss increments
    /// the counter; anything else resets it and becomes the new best.
    pub fn observe_validation_loss(&mut self, loss: f64) {
        match self.best_validation_loss {
            Some(best) if loss > best => self.early_stop_counter += 1,
            _ => {
                self.early_stop_counter = 0;
                self.best_validation_loss = Some(loss);
            }
        }
    }

    /// Returns true when `accuracy` is a new best.
    pub fn observe_accuracy(&mut self, accuracy: f64, epoch: usize) -> bool {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            self.best_accuracy_epoch = epoch + 1;
            true
        } else {
            false
        }
    }

    /// A zero threshold disables early stopping.
    pub fn should_stop_early(&self, threshold: usize) -> bool {
        threshold > 0 && self.early_stop_counter >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    MaxEpochs,
    EarlyStopping,
    EvaluateOnly,
}

/// Terminal report of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub reason: TerminationReason,
    pub state: RunState,
    pub epochs_run: usize,
    pub last_eval: Option<EvalReport>,
    pub num_params: usize,
    pub work_dir: PathBuf,
    pub weight_decay: f64,
    pub base_lr: f64,
    pub batch_size: usize,
    pub forward_batch_size: usize,
    pub test_batch_size: usize,
}

impl TrainingSummary {
    pub fn log(&self) {
        tracing::info!("Best accuracy: {}", self.state.best_accuracy);
        tracing::info!("Epoch number: {}", self.state.best_accuracy_epoch);
        tracing::info!("Model name: {}", self.work_dir.display());
        tracing::info!("Model total number of params: {}", self.num_params);
        tracing::info!("Weight decay: {}", self.weight_decay);
        tracing::info!("Base LR: {}", self.base_lr);
        tracing::info!("Batch Size: {}", self.batch_size);
        tracing::info!("Forward Batch Size: {}", self.forward_batch_size);
        tracing::info!("Test Batch Size: {}", self.test_batch_size);
    }
}

/// Input data for a run. `normalization` is applied to every feeder.
pub struct Datasets {
    pub train: Option<Arc<dyn Feeder>>,
    pub test: Arc<dyn Feeder>,
    pub normalization: Option<Normalization>,
}

/// Drives the epoch state machine:
/// `Initializing → TrainingEpoch → Evaluating → CheckpointDecision → NextEpoch | Terminated`.
pub struct TrainingController {
    config: RunConfig,
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    scheduler: LrScheduler,
    scaler: Option<GradScaler>,
    train_loader: Option<DataLoader>,
    views: Vec<EvalView>,
    trainer: GradientAccumulationTrainer,
    evaluator: MultiViewEvaluator,
    checkpoints: CheckpointManager,
    metrics: MetricsChannels,
    state: RunState,
    stage: Stage,
    progress_tx: Option<mpsc::Sender<EpochStats>>,
}

impl TrainingController {
    /// Loads the CSV feeders named in `config`, builds the registered model
    /// and hands everything to [`TrainingController::new`].
    pub fn from_config(config: RunConfig, metrics: MetricsChannels) -> Result<TrainingController> {
        config.validate()?;

        let test: Arc<dyn Feeder> = Arc::new(CsvFeeder::load(&config.test_feeder_args)?);
        let train: Option<Arc<dyn Feeder>> = match config.phase {
            Phase::Train => Some(Arc::new(CsvFeeder::load(&config.train_feeder_args)?)),
            Phase::Test => None,
        };
        check_labels(test.as_ref(), config.num_classes)?;
        if let Some(train) = &train {
            check_labels(train.as_ref(), config.num_classes)?;
            if train.feature_dim() != test.feature_dim() {
                return Err(TrainError::Dataset(format!(
                    "training samples have {} features, evaluation samples have {}",
                    train.feature_dim(),
                    test.feature_dim()
                )));
            }
        }

        let normalization = match (&config.use_train_normalization, &train) {
            (Some(dir), Some(train)) => {
                let norm = Normalization::compute(train.as_ref());
                norm.save(dir)?;
                tracing::info!(dir = %dir.display(), "saved training normalization");
                Some(norm)
            }
            (Some(dir), None) => {
                tracing::info!(dir = %dir.display(), "reading training normalization");
                Some(Normalization::load(dir)?)
            }
            (None, _) => None,
        };
        if let Some(norm) = &normalization {
            norm.check_dim(test.feature_dim())?;
        }

        let mut model_args = config.model_args.clone();
        model_args.in_features.get_or_insert(test.feature_dim());
        let model = build_model(&config.model, &model_args, config.seed)?;

        TrainingController::new(config, model, Datasets { train, test, normalization }, metrics)
    }

    /// Builds optimizer, schedule and loaders, restores weights and
    /// checkpoint state when configured.
    ///
    /// # Errors
    /// Every configuration problem and every optimizer or scheduler restore
    /// failure is returned here, before any epoch runs.
    pub fn new(
        config: RunConfig,
        mut model: Box<dyn Model>,
        data: Datasets,
        metrics: MetricsChannels,
    ) -> Result<TrainingController> {
        config.validate()?;

        let trainer = GradientAccumulationTrainer::new(config.batch_size, config.forward_batch_size)?
            .epoch_warn(config.epoch_warn)
            .log_interval(config.log_interval)
            .show_progress(config.show_progress);
        let evaluator = MultiViewEvaluator::new(config.show_topk.clone())
            .eval_start(config.eval_start)
            .save_scores_to(config.save_score.then(|| config.work_dir.clone()))
            .show_progress(config.show_progress);
        let checkpoints = CheckpointManager::new(&config.work_dir, config.forward_batch_size);

        tracing::info!("Model total number of params: {}", model.num_params());
        if let Some(path) = &config.weights {
            restore_weights(path, model.as_mut(), &config.ignore_weights)?;
        }

        let mut optimizer = build_optimizer(
            config.optimizer,
            config.base_lr,
            config.momentum,
            config.nesterov,
            config.weight_decay,
        );
        let mut scheduler = config.build_scheduler();
        tracing::info!("Loading lr scheduler: {}", scheduler.kind());
        let scaler = config.half.then(GradScaler::new);
        if scaler.is_some() {
            tracing::info!("Using dynamic loss scaling");
        }

        let in_channels = config.model_args.in_channels;
        let train_loader = data.train.map(|train| {
            let train: Arc<dyn Feeder> = match &data.normalization {
                Some(norm) => Arc::new(
                    ViewFeeder::new(train, TtaView::default(), in_channels).with_normalization(Some(norm.clone())),
                ),
                None => train,
            };
            DataLoader::new(train, config.batch_size)
                .shuffle(true)
                .drop_last(true)
                .num_worker(config.num_worker)
                .seed(config.seed)
                .augment(Augment { random_flip: config.random_flip, in_channels })
        });

        tracing::info!("USE TTA: {}", config.tta.len());
        let views: Vec<EvalView> = config.tta.iter().enumerate()
            .map(|(idx, &view)| {
                let name = RunConfig::view_name(idx);
                tracing::info!("tta {idx}: {name} > {view:?}");
                let feeder = ViewFeeder::new(Arc::clone(&data.test), view, in_channels)
                    .with_normalization(data.normalization.clone());
                let loader = DataLoader::new(Arc::new(feeder), config.test_batch_size)
                    .num_worker(config.num_worker)
                    .seed(config.seed);
                EvalView::new(name, loader)
            })
            .collect();

        let batches_per_epoch = train_loader.as_ref().map(DataLoader::len).unwrap_or(0) as u64;
        let (start_epoch, global_step) = match &config.checkpoint {
            Some(path) => {
                let shapes: Vec<(usize, usize)> = model.named_parameters().iter().map(|(_, p)| p.shape()).collect();
                let ckpt = restore_optimizer_and_scheduler(path, optimizer.as_mut(), &mut scheduler, &shapes)?;
                let step = ckpt.global_step.unwrap_or(ckpt.epoch as u64 * batches_per_epoch);
                (ckpt.epoch, step)
            }
            None => (config.start_epoch, config.start_epoch as u64 * batches_per_epoch),
        };
        let state = RunState::new(start_epoch, global_step, optimizer.lr());

        Ok(TrainingController {
            config,
            model,
            optimizer,
            scheduler,
            scaler,
            train_loader,
            views,
            trainer,
            evaluator,
            checkpoints,
            metrics,
            state,
            stage: Stage::Initializing,
            progress_tx: None,
        })
    }

    /// Sends one `EpochStats` per completed epoch to `tx`.
    pub fn with_progress(mut self, tx: mpsc::Sender<EpochStats>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Runs the configured phase to completion.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let summary = match self.config.phase {
            Phase::Train => self.train()?,
            Phase::Test => self.evaluate_only()?,
        };
        self.metrics.flush()?;
        summary.log();
        Ok(summary)
    }

    /// The epoch loop.
    pub fn train(&mut self) -> Result<TrainingSummary> {
        let mut loader = self.train_loader.take()
            .ok_or_else(|| TrainError::Config("no training data loaded".into()))?;
        let num_epoch = self.config.num_epoch;
        let mut reason = TerminationReason::MaxEpochs;
        let mut epochs_run = 0;
        let mut last_eval = None;

        for epoch in self.state.current_epoch..num_epoch {
            let started = Instant::now();
            self.state.current_epoch = epoch;
            self.stage = Stage::TrainingEpoch;
            let report = self.trainer.train(epoch, &mut loader, TrainContext {
                model: self.model.as_mut(),
                optimizer: self.optimizer.as_mut(),
                scheduler: &mut self.scheduler,
                scaler: self.scaler.as_mut(),
                sink: self.metrics.train.as_mut(),
                global_step: &mut self.state.global_step,
            })?;
            epochs_run += 1;

            self.stage = Stage::Evaluating;
            let due = (epoch + 1) % self.config.eval_interval == 0 || epoch + 1 == num_epoch;
            let eval = if due {
                self.evaluator.evaluate(
                    epoch,
                    self.model.as_mut(),
                    &mut self.views,
                    self.metrics.val.as_mut(),
                    self.state.global_step,
                    EvalOutputs::default(),
                )?
            } else {
                None
            };
            if let Some(eval) = &eval {
                self.apply_evaluation(epoch, eval);
            }
            self.state.learning_rate = self.optimizer.lr();

            self.stage = Stage::CheckpointDecision;
            if (epoch + 1) % self.config.save_interval == 0 || epoch + 1 == num_epoch {
                self.checkpoints.save_weights(epoch + 1, self.model.as_ref())?;
                self.checkpoints.save_checkpoint(
                    epoch + 1,
                    self.state.global_step,
                    self.optimizer.as_ref(),
                    &self.scheduler,
                )?;
            }

            if let Some(tx) = &self.progress_tx {
                let stats = EpochStats {
                    epoch: epoch + 1,
                    total_epochs: num_epoch,
                    train_loss: report.mean_batch_loss,
                    val_loss: eval.as_ref().map(|e| e.mean_loss),
                    train_accuracy: report.mean_accuracy,
                    val_accuracy: eval.as_ref().map(|e| e.fused_accuracy),
                    learning_rate: self.state.learning_rate,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                // A dropped receiver does not stop training.
                let _ = tx.send(stats);
            }
            if eval.is_some() {
                last_eval = eval;
            }

            if self.config.early_stopping > 0 && self.state.early_stop_counter > 0 {
                tracing::info!("Counter_early_stopping: {}", self.state.early_stop_counter);
            }
            if self.state.should_stop_early(self.config.early_stopping) {
                tracing::info!("Early stopping limit reached, stopping training");
                reason = TerminationReason::EarlyStopping;
                break;
            }
            self.stage = Stage::NextEpoch;
        }

        self.stage = Stage::Terminated;
        self.train_loader = Some(loader);
        Ok(self.summary(reason, epochs_run, last_eval))
    }

    /// One evaluation pass over the loaded weights.
    ///
    /// Writes `wrong-samples.txt` and `right-samples.txt` into the work
    /// directory unless the evaluation feeder runs in debug mode.
    pub fn evaluate_only(&mut self) -> Result<TrainingSummary> {
        let weights = self.config.weights.as_ref().ok_or(TrainError::MissingWeights)?;
        tracing::info!("Model:   {}", self.config.model);
        tracing::info!("Weights: {}", weights.display());

        self.stage = Stage::Evaluating;
        let mut writers = if self.config.test_feeder_args.debug {
            None
        } else {
            std::fs::create_dir_all(&self.config.work_dir)?;
            let wrong = BufWriter::new(File::create(self.config.work_dir.join("wrong-samples.txt"))?);
            let right = BufWriter::new(File::create(self.config.work_dir.join("right-samples.txt"))?);
            Some((wrong, right))
        };
        let outputs = match writers.as_mut() {
            Some((wrong, right)) => EvalOutputs {
                wrong: Some(wrong as &mut dyn Write),
                result: Some(right as &mut dyn Write),
            },
            None => EvalOutputs::default(),
        };

        let evaluator = self.evaluator.clone().eval_start(0);
        let report = evaluator
            .evaluate(
                0,
                self.model.as_mut(),
                &mut self.views,
                self.metrics.val.as_mut(),
                self.state.global_step,
                outputs,
            )?
            .ok_or_else(|| TrainError::Config("evaluation was skipped".into()))?;

        if let Some((mut wrong, mut right)) = writers {
            wrong.flush()?;
            right.flush()?;
        }
        self.state.observe_accuracy(report.fused_accuracy, 0);
        self.state.observe_validation_loss(report.mean_loss);
        tracing::info!("Done.");

        self.stage = Stage::Terminated;
        Ok(self.summary(TerminationReason::EvaluateOnly, 0, Some(report)))
    }

    /// Best-metric bookkeeping and the plateau schedule step.
    fn apply_evaluation(&mut self, epoch: usize, eval: &EvalReport) {
        if self.state.observe_accuracy(eval.fused_accuracy, epoch) {
            tracing::info!(epoch = epoch + 1, accuracy = eval.fused_accuracy, "new best accuracy");
        }
        tracing::info!(
            "Best loss val: {:?}, actual loss val: {}",
            self.state.best_validation_loss,
            eval.mean_loss
        );
        self.state.observe_validation_loss(eval.mean_loss);
        tracing::info!("Accuracy: {} model: {}", eval.fused_accuracy, self.config.work_dir.display());

        if self.scheduler.is_plateau() {
            self.scheduler.step_metric(eval.mean_loss, self.optimizer.as_mut());
        }
    }

    fn summary(&self, reason: TerminationReason, epochs_run: usize, last_eval: Option<EvalReport>) -> TrainingSummary {
        TrainingSummary {
            reason,
            state: self.state.clone(),
            epochs_run,
            last_eval,
            num_params: self.model.num_params(),
            work_dir: self.config.work_dir.clone(),
            weight_decay: self.config.weight_decay,
            base_lr: self.config.base_lr,
            batch_size: self.config.batch_size,
            forward_batch_size: self.config.forward_batch_size,
            test_batch_size: self.config.test_batch_size,
        }
    }
}

/// Every label must index a class of the classification head.
fn check_labels(feeder: &dyn Feeder, num_classes: usize) -> Result<()> {
    let labels = feeder.labels();
    match labels.iter().position(|&label| label >= num_classes) {
        Some(row) => Err(TrainError::Dataset(format!(
            "sample {} ({}) has label {} but num_classes is {}",
            row,
            feeder.sample_name(row),
            labels[row],
            num_classes
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_loss_rule_matches_sequence() {
        let mut state = RunState::new(0, 0, 0.1);
        let mut counters = Vec::new();
        for loss in [1.0, 1.2, 1.3, 1.1, 0.9] {
            state.observe_validation_loss(loss);
            counters.push(state.early_stop_counter);
        }
        assert_eq!(counters, vec![0, 1, 2, 3, 0]);
        assert_eq!(state.best_validation_loss, Some(0.9));
    }

    #[test]
    fn equal_loss_counts_as_improvement() {
        let mut state = RunState::new(0, 0, 0.1);
        state.observe_validation_loss(1.0);
        state.observe_validation_loss(1.0);
        assert_eq!(state.early_stop_counter, 0);
    }

    #[test]
    fn best_accuracy_never_decreases() {
        let mut state = RunState::new(0, 0, 0.1);
        assert!(state.observe_accuracy(0.4, 0));
        assert!(!state.observe_accuracy(0.3, 1));
        assert!(state.observe_accuracy(0.5, 2));
        assert_eq!(state.best_accuracy, 0.5);
        assert_eq!(state.best_accuracy_epoch, 3);
    }

    #[test]
    fn zero_threshold_never_stops() {
        let mut state = RunState::new(0, 0, 0.1);
        state.early_stop_counter = 10;
        assert!(!state.should_stop_early(0));
        assert!(state.should_stop_early(10));
        assert!(!state.should_stop_early(11));
    }
}
