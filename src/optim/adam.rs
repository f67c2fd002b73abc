use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::optim::optimizer::{check_buffers, kind_mismatch, Optimizer, OptimizerKind, OptimizerState};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub step_count: u64,
    pub exp_avg: Vec<Option<Matrix>>,
    pub exp_avg_sq: Vec<Option<Matrix>>,
}

/// Adam with bias correction and L2 weight decay folded into the gradient.
pub struct Adam {
    state: AdamState,
}

impl Adam {
    pub fn new(learning_rate: f64, weight_decay: f64) -> Adam {
        Adam {
            state: AdamState {
                lr: learning_rate,
                betas: (BETA1, BETA2),
                eps: EPS,
                weight_decay,
                step_count: 0,
                exp_avg: Vec::new(),
                exp_avg_sq: Vec::new(),
            },
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        let s = &mut self.state;
        if s.exp_avg.len() != params.len() {
            s.exp_avg = vec![None; params.len()];
            s.exp_avg_sq = vec![None; params.len()];
        }
        s.step_count += 1;

        let (b1, b2) = s.betas;
        let t = s.step_count as i32;
        let bias1 = 1.0 - b1.powi(t);
        let bias2_sqrt = (1.0 - b2.powi(t)).sqrt();
        let step_size = s.lr / bias1;
        let (eps, wd) = (s.eps, s.weight_decay);

        for (i, param) in params.iter_mut().enumerate() {
            let grad = if wd != 0.0 {
                param.grad.zip_with(&param.value, |g, p| g + wd * p)
            } else {
                param.grad.clone()
            };

            let zeros = || Matrix::zeros(grad.rows, grad.cols);
            let m = s.exp_avg[i].take().unwrap_or_else(zeros)
                .zip_with(&grad, |m, g| b1 * m + (1.0 - b1) * g);
            let v = s.exp_avg_sq[i].take().unwrap_or_else(zeros)
                .zip_with(&grad, |v, g| b2 * v + (1.0 - b2) * g * g);

            let update = m.zip_with(&v, |m, v| step_size * m / (v.sqrt() / bias2_sqrt + eps));
            param.value = param.value.zip_with(&update, |p, u| p - u);

            s.exp_avg[i] = Some(m);
            s.exp_avg_sq[i] = Some(v);
        }
    }

    fn lr(&self) -> f64 {
        self.state.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.state.lr = lr;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn step_count(&self) -> u64 {
        self.state.step_count
    }

    fn state(&self) -> OptimizerState {
        OptimizerState::Adam(self.state.clone())
    }

    fn load_state(&mut self, state: OptimizerState, shapes: &[(usize, usize)]) -> Result<()> {
        match state {
            OptimizerState::Adam(s) => {
                check_buffers("exp_avg", &s.exp_avg, shapes)?;
                check_buffers("exp_avg_sq", &s.exp_avg_sq, shapes)?;
                self.state = s;
                Ok(())
            }
            other => Err(kind_mismatch(OptimizerKind::Adam, other.kind())),
        }
    }
}
