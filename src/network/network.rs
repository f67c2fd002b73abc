use rand::Rng;

use crate::{activation::activation::ActivationFunction, layers::dense::Layer};
use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::network::model::{Model, ModelOutput};

/// Multi-layer perceptron classifier: hidden layers `layers.{i}` and a
/// linear classification head `fc` that emits logits.
#[derive(Debug)]
pub struct Network {
    pub layers: Vec<Layer>,
    pub fc: Layer,
    report_activation_l1: bool,
    training: bool,
}

impl Network {
    /// Builds `in_features → hidden[0] → … → num_class`.
    pub fn new<R: Rng>(
        in_features: usize,
        hidden: &[usize],
        activation: ActivationFunction,
        num_class: usize,
        rng: &mut R,
    ) -> Network {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut input_size = in_features;
        for &size in hidden {
            layers.push(Layer::new(size, input_size, activation.clone(), rng));
            input_size = size;
        }
        let fc = Layer::new(num_class, input_size, ActivationFunction::Identity, rng);
        Network { layers, fc, report_activation_l1: false, training: true }
    }

    /// Makes `forward` also return the mean absolute hidden activation per sample.
    pub fn with_activation_l1(mut self) -> Network {
        self.report_activation_l1 = true;
        self
    }

    pub fn num_class(&self) -> usize {
        self.fc.size
    }
}

impl Model for Network {
    fn forward(&mut self, input: &Matrix) -> ModelOutput {
        let cache = self.training;
        let mut current = input.clone();
        let mut l1 = vec![0.0; input.rows];
        let mut hidden_units = 0usize;
        for layer in &mut self.layers {
            current = layer.feed_from(&current, cache);
            if self.report_activation_l1 {
                for (acc, row) in l1.iter_mut().zip(current.data.iter()) {
                    *acc += row.iter().map(|x| x.abs()).sum::<f64>();
                }
                hidden_units += layer.size;
            }
        }
        let scores = self.fc.feed_from(&current, cache);

        if self.report_activation_l1 {
            let denom = hidden_units.max(1) as f64;
            ModelOutput::PredictionWithAux(scores, l1.into_iter().map(|x| x / denom).collect())
        } else {
            ModelOutput::Prediction(scores)
        }
    }

    fn backward(&mut self, scores_grad: &Matrix) {
        let mut grad = self.fc.backward(scores_grad);
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut out = Vec::with_capacity(2 * self.layers.len() + 2);
        for (i, layer) in self.layers.iter().enumerate() {
            out.push((format!("layers.{i}.weight"), &layer.weights));
            out.push((format!("layers.{i}.bias"), &layer.biases));
        }
        out.push(("fc.weight".to_string(), &self.fc.weights));
        out.push(("fc.bias".to_string(), &self.fc.biases));
        out
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut out = Vec::with_capacity(2 * self.layers.len() + 2);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            out.push((format!("layers.{i}.weight"), &mut layer.weights));
            out.push((format!("layers.{i}.bias"), &mut layer.biases));
        }
        out.push(("fc.weight".to_string(), &mut self.fc.weights));
        out.push(("fc.bias".to_string(), &mut self.fc.biases));
        out
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.release_cache();
        }
    }

    fn release_cache(&mut self) {
        for layer in &mut self.layers {
            layer.clear_cache();
        }
        self.fc.clear_cache();
    }
}
