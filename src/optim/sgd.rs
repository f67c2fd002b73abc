use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::optim::optimizer::{check_buffers, kind_mismatch, Optimizer, OptimizerKind, OptimizerState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdState {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
    pub step_count: u64,
    pub momentum_buffers: Vec<Option<Matrix>>,
}

/// SGD with heavy-ball or Nesterov momentum and L2 weight decay.
///
/// Per parameter:
///   g ← ∇ + wd·θ
///   v ← g (first step) or μ·v + g
///   θ ← θ − lr·(g + μ·v)  with Nesterov, θ − lr·v otherwise
pub struct Sgd {
    state: SgdState,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64, nesterov: bool, weight_decay: f64) -> Sgd {
        Sgd {
            state: SgdState {
                lr: learning_rate,
                momentum,
                nesterov,
                weight_decay,
                step_count: 0,
                momentum_buffers: Vec::new(),
            },
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        let s = &mut self.state;
        if s.momentum_buffers.len() != params.len() {
            s.momentum_buffers = vec![None; params.len()];
        }

        for (param, slot) in params.iter_mut().zip(s.momentum_buffers.iter_mut()) {
            let wd = s.weight_decay;
            let mut grad = if wd != 0.0 {
                param.grad.zip_with(&param.value, |g, p| g + wd * p)
            } else {
                param.grad.clone()
            };

            if s.momentum != 0.0 {
                let mu = s.momentum;
                let buf = match slot.take() {
                    None => grad.clone(),
                    Some(prev) => prev.zip_with(&grad, |v, g| mu * v + g),
                };
                grad = if s.nesterov {
                    grad.zip_with(&buf, |g, v| g + mu * v)
                } else {
                    buf.clone()
                };
                *slot = Some(buf);
            }

            let lr = s.lr;
            param.value = param.value.zip_with(&grad, |p, g| p - lr * g);
        }
        s.step_count += 1;
    }

    fn lr(&self) -> f64 {
        self.state.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.state.lr = lr;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn step_count(&self) -> u64 {
        self.state.step_count
    }

    fn state(&self) -> OptimizerState {
        OptimizerState::Sgd(self.state.clone())
    }

    fn load_state(&mut self, state: OptimizerState, shapes: &[(usize, usize)]) -> Result<()> {
        match state {
            OptimizerState::Sgd(s) => {
                check_buffers("momentum_buffers", &s.momentum_buffers, shapes)?;
                self.state = s;
                Ok(())
            }
            other => Err(kind_mismatch(OptimizerKind::Sgd, other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(value: f64, grad: f64) -> Parameter {
        let mut p = Parameter::new(Matrix::from_data(vec![vec![value]]));
        p.grad = Matrix::from_data(vec![vec![grad]]);
        p
    }

    #[test]
    fn momentum_follows_heavy_ball_update() {
        let mut opt = Sgd::new(0.1, 0.9, false, 0.0);
        let mut p = param(1.0, 1.0);
        opt.step(&mut [&mut p]);
        // v = 1, θ = 1 - 0.1
        assert!((p.value.data[0][0] - 0.9).abs() < 1e-12);
        opt.step(&mut [&mut p]);
        // v = 0.9 + 1 = 1.9, θ = 0.9 - 0.19
        assert!((p.value.data[0][0] - 0.71).abs() < 1e-12);
        assert_eq!(opt.step_count(), 2);
    }

    #[test]
    fn nesterov_and_weight_decay() {
        let mut opt = Sgd::new(0.1, 0.5, true, 0.1);
        let mut p = param(2.0, 1.0);
        opt.step(&mut [&mut p]);
        // g = 1 + 0.2 = 1.2, v = 1.2, step = 1.2 + 0.6 = 1.8
        assert!((p.value.data[0][0] - (2.0 - 0.18)).abs() < 1e-12);
    }

    #[test]
    fn state_restores_verbatim() {
        let mut a = Sgd::new(0.1, 0.9, false, 0.0);
        let mut p = param(1.0, 1.0);
        a.step(&mut [&mut p]);

        let mut b = Sgd::new(0.5, 0.0, true, 0.3);
        b.load_state(a.state(), &[(1, 1)]).unwrap();
        assert_eq!(b.state(), a.state());

        let mut pa = p.clone();
        let mut pb = p.clone();
        a.step(&mut [&mut pa]);
        b.step(&mut [&mut pb]);
        assert_eq!(pa.value, pb.value);
    }

    #[test]
    fn buffer_shape_mismatch_is_rejected() {
        let mut a = Sgd::new(0.1, 0.9, false, 0.0);
        let mut p = param(1.0, 1.0);
        a.step(&mut [&mut p]);

        let mut b = Sgd::new(0.1, 0.9, false, 0.0);
        assert!(b.load_state(a.state(), &[(2, 1)]).is_err());
        assert!(b.load_state(a.state(), &[(1, 1), (1, 1)]).is_err());
    }
}
