use std::collections::BTreeMap;

use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::network::state_dict::{normalize_name, StateDict, StateDiff, WeightLoadReport};

/// What a forward pass returns.
///
/// The auxiliary value is a per-sample regularization metric. Trainers average
/// and log it; it never enters the backward loss.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Prediction(Matrix),
    PredictionWithAux(Matrix, Vec<f64>),
}

impl ModelOutput {
    pub fn scores(&self) -> &Matrix {
        match self {
            ModelOutput::Prediction(scores) => scores,
            ModelOutput::PredictionWithAux(scores, _) => scores,
        }
    }

    /// Mean of the auxiliary metric, 0 when the model reports none.
    pub fn aux_mean(&self) -> f64 {
        match self {
            ModelOutput::Prediction(_) => 0.0,
            ModelOutput::PredictionWithAux(_, aux) if aux.is_empty() => 0.0,
            ModelOutput::PredictionWithAux(_, aux) => aux.iter().sum::<f64>() / aux.len() as f64,
        }
    }

    pub fn into_scores(self) -> Matrix {
        match self {
            ModelOutput::Prediction(scores) => scores,
            ModelOutput::PredictionWithAux(scores, _) => scores,
        }
    }
}

/// A differentiable classifier the trainer and evaluator drive.
///
/// `backward` adds into the parameter gradient buffers; nothing but
/// `zero_grad` clears them.
pub trait Model {
    /// Scores for a batch (one sample per row). In training mode the model
    /// keeps whatever it needs for the following `backward`.
    fn forward(&mut self, input: &Matrix) -> ModelOutput;

    /// Backpropagates ∂L/∂scores of the most recent forward pass.
    fn backward(&mut self, scores_grad: &Matrix);

    fn named_parameters(&self) -> Vec<(String, &Parameter)>;

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)>;

    fn set_training(&mut self, training: bool);

    /// Drops cached activations from the last pass.
    fn release_cache(&mut self) {}

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.named_parameters_mut().into_iter().map(|(_, p)| p).collect()
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn num_params(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.value.len()).sum()
    }

    fn parameter_shapes(&self) -> BTreeMap<String, (usize, usize)> {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (normalize_name(&name).to_string(), p.shape()))
            .collect()
    }

    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        for (name, p) in self.named_parameters() {
            dict.insert(&name, p.value.clone());
        }
        dict
    }

    /// Copies every snapshot entry, or nothing if the key sets or shapes differ.
    fn load_state_dict_strict(&mut self, snapshot: &StateDict) -> Result<WeightLoadReport, StateDiff> {
        let diff = StateDiff::compute(&self.parameter_shapes(), snapshot);
        if !diff.is_exact() {
            return Err(diff);
        }
        Ok(self.load_state_dict_compatible(snapshot))
    }

    /// Copies the entries present in both with equal shapes; leaves the rest untouched.
    fn load_state_dict_compatible(&mut self, snapshot: &StateDict) -> WeightLoadReport {
        let diff = StateDiff::compute(&self.parameter_shapes(), snapshot);
        let mut applied = Vec::new();
        for (name, p) in self.named_parameters_mut() {
            if let Some(tensor) = snapshot.get(&name) {
                if tensor.shape() == p.shape() {
                    p.value = tensor.clone();
                    applied.push(normalize_name(&name).to_string());
                }
            }
        }
        WeightLoadReport { applied, diff }
    }
}
