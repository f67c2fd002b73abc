use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::feeder::feeder::Feeder;

pub const NORMALIZATION_FILE: &str = "train_normalization.json";

/// Smallest standard deviation used as a divisor.
const MIN_STD: f64 = 1e-8;

/// Per-feature mean and standard deviation of the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Normalization {
    pub fn compute(feeder: &dyn Feeder) -> Normalization {
        let dim = feeder.feature_dim();
        let n = feeder.len();
        let mut mean = vec![0.0; dim];
        let mut sq = vec![0.0; dim];
        for i in 0..n {
            let sample = feeder.sample(i);
            for (j, x) in sample.features.iter().enumerate() {
                mean[j] += x;
                sq[j] += x * x;
            }
        }
        let count = n.max(1) as f64;
        let std = mean.iter_mut().zip(sq.iter())
            .map(|(m, s)| {
                *m /= count;
                (s / count - *m * *m).max(0.0).sqrt()
            })
            .collect();
        Normalization { mean, std }
    }

    pub fn apply(&self, features: &mut [f64]) {
        for ((x, m), s) in features.iter_mut().zip(&self.mean).zip(&self.std) {
            *x = (*x - m) / s.max(MIN_STD);
        }
    }

    /// Fails unless there is one mean and one deviation per feature.
    pub fn check_dim(&self, feature_dim: usize) -> Result<()> {
        if self.mean.len() != feature_dim || self.std.len() != feature_dim {
            return Err(TrainError::Dataset(format!(
                "normalization has {} means and {} deviations, samples have {} features",
                self.mean.len(),
                self.std.len(),
                feature_dim
            )));
        }
        Ok(())
    }

    /// Writes `train_normalization.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(NORMALIZATION_FILE), json)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Normalization> {
        let json = fs::read_to_string(dir.join(NORMALIZATION_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }
}
