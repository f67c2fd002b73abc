//! Learning rate schedules.
//!
//! - `MultiStep`       - multiply by `gamma` at each milestone epoch
//! - `ReduceOnPlateau` - multiply by `factor` when the monitored loss stalls
//! - `CosineAnnealing` - cosine curve from the base rate down to `eta_min`
//!
//! The whole scheduler value is its serialized state, so a restored
//! scheduler continues exactly where the saved one stopped.

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::optim::optimizer::Optimizer;

/// Scheduler selectable from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    MultiStepLR,
    ReduceLROnPlateau,
    CosineAnnealingLR,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerKind::MultiStepLR => "MultiStepLR",
            SchedulerKind::ReduceLROnPlateau => "ReduceLROnPlateau",
            SchedulerKind::CosineAnnealingLR => "CosineAnnealingLR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    pub base_lr: f64,
    pub milestones: Vec<usize>,
    pub gamma: f64,
    pub last_epoch: usize,
}

impl MultiStepLr {
    fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealingLr {
    pub base_lr: f64,
    pub t_max: usize,
    pub eta_min: f64,
    pub last_epoch: usize,
}

impl CosineAnnealingLr {
    fn lr_at(&self, epoch: usize) -> f64 {
        let progress = epoch as f64 / self.t_max.max(1) as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

/// Minimizing plateau detector with a relative improvement threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub cooldown: usize,
    pub min_lr: f64,
    pub eps: f64,
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
    pub cooldown_counter: usize,
    pub last_epoch: usize,
}

impl ReduceLrOnPlateau {
    /// Records one metric value; returns the new learning rate when it drops.
    fn observe(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        self.last_epoch += 1;

        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        };
        if improved {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
            let new_lr = (current_lr * self.factor).max(self.min_lr);
            if current_lr - new_lr > self.eps {
                return Some(new_lr);
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LrScheduler {
    MultiStep(MultiStepLr),
    ReduceOnPlateau(ReduceLrOnPlateau),
    CosineAnnealing(CosineAnnealingLr),
}

impl LrScheduler {
    pub fn multi_step(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> LrScheduler {
        let mut milestones = milestones;
        milestones.sort_unstable();
        LrScheduler::MultiStep(MultiStepLr { base_lr, milestones, gamma, last_epoch: 0 })
    }

    pub fn reduce_on_plateau(factor: f64, patience: usize, cooldown: usize) -> LrScheduler {
        LrScheduler::ReduceOnPlateau(ReduceLrOnPlateau {
            factor,
            patience,
            threshold: 1e-4,
            cooldown,
            min_lr: 1e-6,
            eps: 1e-8,
            best: None,
            num_bad_epochs: 0,
            cooldown_counter: 0,
            last_epoch: 0,
        })
    }

    pub fn cosine_annealing(base_lr: f64, t_max: usize, eta_min: f64) -> LrScheduler {
        LrScheduler::CosineAnnealing(CosineAnnealingLr { base_lr, t_max, eta_min, last_epoch: 0 })
    }

    pub fn kind(&self) -> SchedulerKind {
        match self {
            LrScheduler::MultiStep(_) => SchedulerKind::MultiStepLR,
            LrScheduler::ReduceOnPlateau(_) => SchedulerKind::ReduceLROnPlateau,
            LrScheduler::CosineAnnealing(_) => SchedulerKind::CosineAnnealingLR,
        }
    }

    /// Plateau schedules step from validation loss, not at epoch end.
    pub fn is_plateau(&self) -> bool {
        matches!(self, LrScheduler::ReduceOnPlateau(_))
    }

    pub fn last_epoch(&self) -> usize {
        match self {
            LrScheduler::MultiStep(s) => s.last_epoch,
            LrScheduler::ReduceOnPlateau(s) => s.last_epoch,
            LrScheduler::CosineAnnealing(s) => s.last_epoch,
        }
    }

    /// Epoch-end step. No-op for plateau schedules.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        match self {
            LrScheduler::MultiStep(s) => {
                s.last_epoch += 1;
                optimizer.set_lr(s.lr_at(s.last_epoch));
            }
            LrScheduler::CosineAnnealing(s) => {
                s.last_epoch += 1;
                optimizer.set_lr(s.lr_at(s.last_epoch));
            }
            LrScheduler::ReduceOnPlateau(_) => {}
        }
    }

    /// Validation-loss step. No-op for epoch-driven schedules.
    pub fn step_metric(&mut self, metric: f64, optimizer: &mut dyn Optimizer) {
        if let LrScheduler::ReduceOnPlateau(s) = self {
            if let Some(lr) = s.observe(metric, optimizer.lr()) {
                tracing::info!(old_lr = optimizer.lr(), new_lr = lr, "reducing learning rate on plateau");
                optimizer.set_lr(lr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::sgd::Sgd;

    #[test]
    fn multi_step_decays_at_milestones() {
        let mut opt = Sgd::new(0.1, 0.9, false, 0.0);
        let mut sched = LrScheduler::multi_step(0.1, vec![2, 4], 0.1);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            sched.step(&mut opt);
            lrs.push(opt.lr());
        }
        let expected = [0.1, 0.01, 0.01, 0.001, 0.001];
        for (got, want) in lrs.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "{lrs:?}");
        }
    }

    #[test]
    fn cosine_reaches_eta_min_at_t_max() {
        let mut opt = Sgd::new(1.0, 0.0, false, 0.0);
        let mut sched = LrScheduler::cosine_annealing(1.0, 4, 0.0);
        for _ in 0..2 {
            sched.step(&mut opt);
        }
        assert!((opt.lr() - 0.5).abs() < 1e-12);
        for _ in 0..2 {
            sched.step(&mut opt);
        }
        assert!(opt.lr().abs() < 1e-12);
    }

    #[test]
    fn plateau_reduces_after_patience_and_respects_cooldown() {
        let mut opt = Sgd::new(1.0, 0.0, false, 0.0);
        let mut sched = LrScheduler::reduce_on_plateau(0.5, 1, 1);

        sched.step_metric(1.0, &mut opt); // best
        sched.step_metric(1.0, &mut opt); // bad 1
        assert_eq!(opt.lr(), 1.0);
        sched.step_metric(1.0, &mut opt); // bad 2 > patience
        assert_eq!(opt.lr(), 0.5);
        sched.step_metric(1.0, &mut opt); // cooldown swallows this one
        sched.step_metric(1.0, &mut opt); // bad 1
        assert_eq!(opt.lr(), 0.5);
        sched.step_metric(1.0, &mut opt); // bad 2
        assert_eq!(opt.lr(), 0.25);
    }

    #[test]
    fn epoch_step_leaves_plateau_untouched() {
        let mut opt = Sgd::new(1.0, 0.0, false, 0.0);
        let mut sched = LrScheduler::reduce_on_plateau(0.5, 0, 0);
        sched.step(&mut opt);
        assert_eq!(sched.last_epoch(), 0);
        assert_eq!(opt.lr(), 1.0);
    }

    #[test]
    fn state_survives_json() {
        let mut opt = Sgd::new(1.0, 0.0, false, 0.0);
        let mut sched = LrScheduler::reduce_on_plateau(0.5, 2, 0);
        sched.step_metric(0.7, &mut opt);
        sched.step_metric(0.9, &mut opt);
        let json = serde_json::to_string(&sched).unwrap();
        let back: LrScheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sched);
    }
}
