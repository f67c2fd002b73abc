use rand::Rng;

use crate::{math::matrix::Matrix, activation::activation::ActivationFunction};
use crate::layers::parameter::Parameter;

/// Fully connected layer operating on a batch (one sample per row).
///
/// Weights are stored as (input_size, size) so the forward pass is `X·W + b`.
#[derive(Debug)]
pub struct Layer{
    pub size: usize,
    pub weights: Parameter,
    pub biases: Parameter,
    pub activator: ActivationFunction,
    input: Option<Matrix>,
    pre_neurons: Option<Matrix>,  // z = XW + b, needed for the activation derivative
}

impl Layer {
    pub fn new<R: Rng>(size: usize, input_size: usize, activation: ActivationFunction, rng: &mut R) -> Layer {
        let weights = if activation.prefers_he_init() {
            Matrix::he(input_size, size, rng)
        } else {
            Matrix::xavier(input_size, size, rng)
        };

        Layer {
            size,
            weights: Parameter::new(weights),
            biases: Parameter::new(Matrix::zeros(1, size)),
            activator: activation,
            input: None,
            pre_neurons: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.value.rows
    }

    /// Forward pass over a batch. Caches what `backward` needs when `cache` is set.
    pub fn feed_from(&mut self, input: &Matrix, cache: bool) -> Matrix {
        let mut z = input * &self.weights.value;
        for row in &mut z.data {
            for (x, b) in row.iter_mut().zip(self.biases.value.data[0].iter()) {
                *x += b;
            }
        }
        let a = z.map(|x| self.activator.function(x));
        if cache {
            self.input = Some(input.clone());
            self.pre_neurons = Some(z);
        }
        a
    }

    /// Backward pass. `output_grad` is ∂L/∂a for this layer's activations.
    ///
    /// Adds ∂L/∂W and ∂L/∂b into the parameter gradient buffers and returns
    /// ∂L/∂X for the layer below.
    ///
    /// # Panics
    /// Panics if called without a preceding cached forward pass.
    pub fn backward(&mut self, output_grad: &Matrix) -> Matrix {
        let input = self.input.as_ref().expect("backward called before a training forward pass");
        let z = self.pre_neurons.as_ref().expect("backward called before a training forward pass");

        let act_derivative = z.map(|x| self.activator.derivative(x));
        // δ = error ⊙ σ'(z)
        let delta = output_grad.hadamard(&act_derivative);

        let weights_grad = &input.transpose() * &delta;
        self.weights.accumulate(&weights_grad);
        self.biases.accumulate(&delta.column_sums());

        &delta * &self.weights.value.transpose()
    }

    /// Drops cached activations.
    pub fn clear_cache(&mut self) {
        self.input = None;
        self.pre_neurons = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sum_output(layer: &mut Layer, x: &Matrix) -> f64 {
        layer.feed_from(x, false).data.iter().flatten().sum()
    }

    #[test]
    fn weight_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Layer::new(2, 3, ActivationFunction::Tanh, &mut rng);
        let x = Matrix::from_data(vec![vec![0.5, -0.2, 0.1], vec![0.3, 0.8, -0.4]]);

        let out = layer.feed_from(&x, true);
        let ones = out.map(|_| 1.0);
        layer.backward(&ones);

        let eps = 1e-6;
        let analytic = layer.weights.grad.data[1][0];
        layer.weights.value.data[1][0] += eps;
        let plus = sum_output(&mut layer, &x);
        layer.weights.value.data[1][0] -= 2.0 * eps;
        let minus = sum_output(&mut layer, &x);
        let numeric = (plus - minus) / (2.0 * eps);

        assert!((analytic - numeric).abs() < 1e-6, "{analytic} vs {numeric}");
    }

    #[test]
    fn backward_accumulates_across_calls() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = Layer::new(1, 2, ActivationFunction::Identity, &mut rng);
        let x = Matrix::from_data(vec![vec![1.0, 2.0]]);
        let g = Matrix::from_data(vec![vec![1.0]]);

        layer.feed_from(&x, true);
        layer.backward(&g);
        layer.feed_from(&x, true);
        layer.backward(&g);

        assert_eq!(layer.weights.grad.data, vec![vec![2.0], vec![4.0]]);
        assert_eq!(layer.biases.grad.data, vec![vec![2.0]]);
    }
}
