#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use skeleton_trainer::activation::activation::ActivationFunction;
use skeleton_trainer::config::RunConfig;
use skeleton_trainer::feeder::feeder::Feeder;
use skeleton_trainer::feeder::memory::InMemoryFeeder;
use skeleton_trainer::layers::parameter::Parameter;
use skeleton_trainer::math::matrix::Matrix;
use skeleton_trainer::network::model::{Model, ModelOutput};
use skeleton_trainer::network::network::Network;
use skeleton_trainer::train::controller::Datasets;

/// Two-class model whose evaluation loss follows a fixed script.
///
/// Evaluation pass `n` (counted by `set_training(false)`) scores every sample
/// as `[0, ln(e^L - 1)]`, which gives a cross-entropy of exactly `L` for
/// label 0. Training passes return zero logits.
pub struct ScriptedModel {
    losses: Vec<f64>,
    evaluations: usize,
    training: bool,
    weight: Parameter,
}

impl ScriptedModel {
    pub fn new(losses: Vec<f64>) -> ScriptedModel {
        ScriptedModel {
            losses,
            evaluations: 0,
            training: true,
            weight: Parameter::new(Matrix::zeros(1, 1)),
        }
    }
}

impl Model for ScriptedModel {
    fn forward(&mut self, input: &Matrix) -> ModelOutput {
        if self.training {
            return ModelOutput::Prediction(Matrix::zeros(input.rows, 2));
        }
        let idx = self.evaluations.saturating_sub(1).min(self.losses.len() - 1);
        let logit = (self.losses[idx].exp() - 1.0).ln();
        ModelOutput::Prediction(Matrix::from_data(vec![vec![0.0, logit]; input.rows]))
    }

    fn backward(&mut self, _scores_grad: &Matrix) {
        self.weight.accumulate(&Matrix::zeros(1, 1));
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        vec![("weight".to_string(), &self.weight)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        vec![("weight".to_string(), &mut self.weight)]
    }

    fn set_training(&mut self, training: bool) {
        if !training {
            self.evaluations += 1;
        }
        self.training = training;
    }
}

pub fn feeder(n: usize, label_of: impl Fn(usize) -> usize) -> Arc<dyn Feeder> {
    let features = (0..n).map(|i| vec![(i % 4) as f64 - 1.5, (i % 3) as f64 * 0.5, 1.0]).collect();
    let labels = (0..n).map(label_of).collect();
    Arc::new(InMemoryFeeder::new(features, labels))
}

/// 8 training samples, 6 evaluation samples, all labelled 0.
pub fn zero_label_data() -> Datasets {
    Datasets { train: Some(feeder(8, |_| 0)), test: feeder(6, |_| 0), normalization: None }
}

pub fn alternating_data() -> Datasets {
    Datasets { train: Some(feeder(8, |i| i % 2)), test: feeder(6, |i| i % 2), normalization: None }
}

pub fn network(seed: u64) -> Box<dyn Model> {
    Box::new(Network::new(3, &[4], ActivationFunction::Tanh, 2, &mut StdRng::seed_from_u64(seed)))
}

/// Small run: 2 macro-batches of 4 per epoch, accumulated in pairs.
pub fn config(work_dir: &Path, num_epoch: usize) -> RunConfig {
    RunConfig {
        work_dir: work_dir.to_path_buf(),
        num_classes: 2,
        num_epoch,
        batch_size: 4,
        forward_batch_size: 2,
        test_batch_size: 4,
        show_progress: false,
        random_flip: false,
        print_log: false,
        step: vec![100],
        ..RunConfig::default()
    }
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().into_owned()).collect())
        .unwrap_or_default();
    names.sort();
    names
}
