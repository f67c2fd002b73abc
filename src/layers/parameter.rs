use crate::math::matrix::Matrix;

/// A trainable tensor and the gradient buffer that backward passes add into.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: Matrix,
    pub grad: Matrix,
}

impl Parameter {
    pub fn new(value: Matrix) -> Parameter {
        let grad = Matrix::zeros(value.rows, value.cols);
        Parameter { value, grad }
    }

    pub fn zero_grad(&mut self) {
        for row in &mut self.grad.data {
            row.iter_mut().for_each(|g| *g = 0.0);
        }
    }

    /// Adds `grad` into the gradient buffer.
    pub fn accumulate(&mut self, grad: &Matrix) {
        self.grad += grad;
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }
}
