use crate::error::{Result, TrainError};
use crate::feeder::feeder::argmax;
use crate::feeder::loader::DataLoader;
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::math::matrix::Matrix;
use crate::metrics::accumulator::{MetricAccumulator, TimerBucket, TimingBreakdown};
use crate::metrics::sink::MetricsSink;
use crate::network::model::Model;
use crate::optim::grad_scaler::GradScaler;
use crate::optim::optimizer::Optimizer;
use crate::optim::scheduler::LrScheduler;
use crate::train::progress::batch_bar;

/// Everything one training epoch mutates.
pub struct TrainContext<'a> {
    pub model: &'a mut dyn Model,
    pub optimizer: &'a mut dyn Optimizer,
    pub scheduler: &'a mut LrScheduler,
    pub scaler: Option<&'a mut GradScaler>,
    pub sink: &'a mut dyn MetricsSink,
    /// Advanced by one per macro-batch.
    pub global_step: &'a mut u64,
}

/// Summary of one training epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Mean of the per-micro-batch losses, each already scaled by `1/splits`.
    pub mean_loss: f64,
    /// Mean loss at macro-batch scale (`mean_loss * splits`).
    pub mean_batch_loss: f64,
    pub mean_accuracy: f64,
    pub mean_aux: f64,
    pub macro_batches: usize,
    pub optimizer_steps: usize,
    pub timing: TimingBreakdown,
}

/// Runs training epochs with gradient accumulation.
///
/// Each macro-batch from the loader is cut into `batch_size / forward_batch_size`
/// contiguous micro-batches. Gradients of all micro-batches accumulate into the
/// same buffers, each micro-batch loss scaled by `1/splits`, and the optimizer
/// steps once per macro-batch. The resulting update equals a single pass over
/// the full macro-batch.
#[derive(Debug, Clone)]
pub struct GradientAccumulationTrainer {
    batch_size: usize,
    forward_batch_size: usize,
    epoch_warn: usize,
    log_interval: u64,
    show_progress: bool,
}

impl GradientAccumulationTrainer {
    /// Fails with `BatchSizeMismatch` unless `batch_size` is a positive multiple
    /// of `forward_batch_size`.
    pub fn new(batch_size: usize, forward_batch_size: usize) -> Result<GradientAccumulationTrainer> {
        if forward_batch_size == 0 || batch_size == 0 || batch_size % forward_batch_size != 0 {
            return Err(TrainError::BatchSizeMismatch { batch_size, forward_batch_size });
        }
        Ok(GradientAccumulationTrainer {
            batch_size,
            forward_batch_size,
            epoch_warn: 0,
            log_interval: 100,
            show_progress: true,
        })
    }

    /// Epoch-driven schedules only step once `epoch >= epoch_warn`.
    pub fn epoch_warn(mut self, epoch_warn: usize) -> Self {
        self.epoch_warn = epoch_warn;
        self
    }

    pub fn log_interval(mut self, log_interval: u64) -> Self {
        self.log_interval = log_interval.max(1);
        self
    }

    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn splits(&self) -> usize {
        self.batch_size / self.forward_batch_size
    }

    /// Trains for one epoch (0-based `epoch`) over `loader`.
    pub fn train(&self, epoch: usize, loader: &mut DataLoader, ctx: TrainContext<'_>) -> Result<TrainingReport> {
        let TrainContext { model, optimizer, scheduler, mut scaler, sink, global_step } = ctx;
        let fwbz = self.forward_batch_size;

        model.set_training(true);
        sink.add_scalar("epoch", (epoch + 1) as f64, *global_step);
        tracing::info!(epoch = epoch + 1, lr = optimizer.lr(), "training epoch");

        let mut stats = MetricAccumulator::new();
        let mut macro_batches = 0;
        let mut optimizer_steps = 0;
        let bar = batch_bar(loader.len(), &format!("train {}", epoch + 1), self.show_progress);

        stats.timer.tick();
        for batch in loader.iter() {
            let batch = batch?;
            if batch.is_empty() || batch.len() % fwbz != 0 {
                return Err(TrainError::BatchSizeMismatch {
                    batch_size: batch.len(),
                    forward_batch_size: fwbz,
                });
            }
            *global_step += 1;
            macro_batches += 1;
            stats.timer.split(TimerBucket::Dataloader);

            model.zero_grad();
            let splits = batch.len() / fwbz;
            let inv_splits = 1.0 / splits as f64;

            for s in 0..splits {
                let micro = batch.slice(s * fwbz, (s + 1) * fwbz);

                let output = model.forward(&micro.features);
                let aux = output.aux_mean();
                let scores = output.into_scores();

                let loss = CrossEntropyLoss::loss(&scores, &micro.labels) * inv_splits;
                let mut grad = CrossEntropyLoss::derivative(&scores, &micro.labels).scale(inv_splits);
                if let Some(scaler) = scaler.as_deref() {
                    grad = scaler.scale_grad(&grad);
                }
                model.backward(&grad);
                stats.record_loss(loss);
                stats.timer.split(TimerBucket::Model);

                let acc = accuracy(&scores, &micro.labels);
                stats.record_accuracy(acc);
                stats.record_aux(aux);
                sink.add_scalar("acc", acc, *global_step);
                sink.add_scalar("loss", loss * splits as f64, *global_step);
                sink.add_scalar("loss_l1", aux, *global_step);

                if *global_step % self.log_interval == 0 {
                    bar.set_message(format!("(BS {fwbz}) loss: {loss:.4}"));
                }
            }

            let stepped = {
                let mut params = model.parameters_mut();
                match scaler.as_deref_mut() {
                    Some(scaler) => scaler.step(optimizer, &mut params),
                    None => {
                        optimizer.step(&mut params);
                        true
                    }
                }
            };
            if stepped {
                optimizer_steps += 1;
            }
            model.release_cache();

            sink.add_scalar("lr", optimizer.lr(), *global_step);
            stats.timer.split(TimerBucket::Statistics);
            bar.inc(1);
        }
        bar.finish_and_clear();

        let splits = self.splits() as f64;
        let report = TrainingReport {
            mean_loss: stats.mean_loss(),
            mean_batch_loss: stats.mean_loss() * splits,
            mean_accuracy: stats.mean_accuracy(),
            mean_aux: stats.mean_aux(),
            macro_batches,
            optimizer_steps,
            timing: stats.timer.breakdown(),
        };
        tracing::info!(
            "\tMean training loss: {:.4} (BS {}: {:.4}).",
            report.mean_loss, self.batch_size, report.mean_batch_loss
        );
        tracing::info!("\tMean training acc: {:.4}", report.mean_accuracy);
        tracing::info!("\tTime consumption: {}", report.timing);

        if !scheduler.is_plateau() && epoch >= self.epoch_warn {
            scheduler.step(optimizer);
        }
        Ok(report)
    }
}

/// Fraction of rows whose arg-max matches the label.
pub fn accuracy(scores: &Matrix, labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = scores.data.iter().zip(labels)
        .filter(|(row, &label)| argmax(row) == label)
        .count();
    correct as f64 / labels.len() as f64
}
