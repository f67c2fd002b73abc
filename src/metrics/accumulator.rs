use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Every bucket starts at one millisecond so proportions are defined even
/// for an empty pass.
const BUCKET_SEED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerBucket {
    Dataloader,
    Model,
    Statistics,
}

/// Splits wall-clock time of a pass into data loading, model work and
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct Timer {
    last: Instant,
    dataloader: Duration,
    model: Duration,
    statistics: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Timer {
            last: Instant::now(),
            dataloader: BUCKET_SEED,
            model: BUCKET_SEED,
            statistics: BUCKET_SEED,
        }
    }
}

impl Timer {
    pub fn new() -> Timer {
        Timer::default()
    }

    /// Restarts the split clock without charging any bucket.
    pub fn tick(&mut self) {
        self.last = Instant::now();
    }

    /// Charges the time since the last tick or split to `bucket`.
    pub fn split(&mut self, bucket: TimerBucket) {
        let now = Instant::now();
        self.add(bucket, now - self.last);
        self.last = now;
    }

    pub fn add(&mut self, bucket: TimerBucket, elapsed: Duration) {
        match bucket {
            TimerBucket::Dataloader => self.dataloader += elapsed,
            TimerBucket::Model => self.model += elapsed,
            TimerBucket::Statistics => self.statistics += elapsed,
        }
    }

    pub fn breakdown(&self) -> TimingBreakdown {
        let total = (self.dataloader + self.model + self.statistics).as_secs_f64();
        let pct = |d: Duration| (d.as_secs_f64() * 100.0 / total).round() as u32;
        TimingBreakdown {
            dataloader: pct(self.dataloader),
            model: pct(self.model),
            statistics: pct(self.statistics),
        }
    }
}

/// Rounded percentage of a pass spent in each timer bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub dataloader: u32,
    pub model: u32,
    pub statistics: u32,
}

impl fmt::Display for TimingBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Data]{}%, [Network]{}%, [Stats]{}%",
            self.dataloader, self.model, self.statistics
        )
    }
}

/// Running statistics for one pass over a loader.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    losses: Vec<f64>,
    accuracies: Vec<f64>,
    aux: Vec<f64>,
    pub timer: Timer,
}

impl MetricAccumulator {
    pub fn new() -> MetricAccumulator {
        MetricAccumulator::default()
    }

    pub fn record_loss(&mut self, loss: f64) {
        self.losses.push(loss);
    }

    pub fn record_accuracy(&mut self, accuracy: f64) {
        self.accuracies.push(accuracy);
    }

    pub fn record_aux(&mut self, value: f64) {
        self.aux.push(value);
    }

    pub fn mean_loss(&self) -> f64 {
        mean(&self.losses)
    }

    pub fn mean_accuracy(&self) -> f64 {
        mean(&self.accuracies)
    }

    pub fn mean_aux(&self) -> f64 {
        mean(&self.aux)
    }

    pub fn count(&self) -> usize {
        self.losses.len()
    }
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
