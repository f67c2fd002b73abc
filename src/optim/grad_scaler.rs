use serde::{Deserialize, Serialize};

use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::optim::optimizer::Optimizer;

const INIT_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;

/// Dynamic loss scaling around backward and the optimizer step.
///
/// The loss gradient is multiplied by `scale` before backward; gradients are
/// divided by it again before the step. A step whose gradients contain a
/// non-finite value is skipped and the scale backs off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScaler {
    scale: f64,
    growth_tracker: u32,
    skipped_steps: u64,
}

impl Default for GradScaler {
    fn default() -> Self {
        GradScaler { scale: INIT_SCALE, growth_tracker: 0, skipped_steps: 0 }
    }
}

impl GradScaler {
    pub fn new() -> GradScaler {
        GradScaler::default()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn scale_grad(&self, grad: &Matrix) -> Matrix {
        grad.scale(self.scale)
    }

    /// Unscales gradients and steps the optimizer. Returns false when the
    /// step was skipped because of overflow.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut [&mut Parameter]) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for p in params.iter_mut() {
            p.grad = p.grad.scale(inv);
            finite &= p.grad.all_finite();
        }

        if finite {
            optimizer.step(params);
            self.growth_tracker += 1;
            if self.growth_tracker >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        } else {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
            self.skipped_steps += 1;
            tracing::warn!(scale = self.scale, "non-finite gradients, skipping optimizer step");
        }
        finite
    }
}
