use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::layers::parameter::Parameter;
use crate::math::matrix::Matrix;
use crate::optim::adam::{Adam, AdamState};
use crate::optim::sgd::{Sgd, SgdState};

/// Optimizer selectable from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "SGD", alias = "sgd")]
    Sgd,
    #[serde(rename = "Adam", alias = "adam")]
    Adam,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "SGD"),
            OptimizerKind::Adam => write!(f, "Adam"),
        }
    }
}

/// Serialized optimizer internals: hyperparameters, step count and buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerState {
    Sgd(SgdState),
    Adam(AdamState),
}

impl OptimizerState {
    pub fn kind(&self) -> OptimizerKind {
        match self {
            OptimizerState::Sgd(_) => OptimizerKind::Sgd,
            OptimizerState::Adam(_) => OptimizerKind::Adam,
        }
    }
}

pub trait Optimizer {
    /// Applies one update from the accumulated gradients. Does not clear them.
    fn step(&mut self, params: &mut [&mut Parameter]);

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    fn kind(&self) -> OptimizerKind;

    /// Number of `step` calls applied so far.
    fn step_count(&self) -> u64;

    fn state(&self) -> OptimizerState;

    /// Restores `state` verbatim. Fails if it was produced by another optimizer
    /// kind or its buffers do not line up with `shapes`.
    fn load_state(&mut self, state: OptimizerState, shapes: &[(usize, usize)]) -> Result<()>;
}

pub fn build_optimizer(
    kind: OptimizerKind,
    base_lr: f64,
    momentum: f64,
    nesterov: bool,
    weight_decay: f64,
) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd => Box::new(Sgd::new(base_lr, momentum, nesterov, weight_decay)),
        OptimizerKind::Adam => Box::new(Adam::new(base_lr, weight_decay)),
    }
}

/// Checks that per-parameter buffers match the live parameter shapes.
/// An empty buffer list means the optimizer never stepped.
pub(crate) fn check_buffers(
    label: &str,
    buffers: &[Option<Matrix>],
    shapes: &[(usize, usize)],
) -> Result<()> {
    if buffers.is_empty() {
        return Ok(());
    }
    if buffers.len() != shapes.len() {
        return Err(TrainError::OptimizerMismatch(format!(
            "{label}: state holds {} buffers, model has {} parameters",
            buffers.len(),
            shapes.len()
        )));
    }
    for (i, (buf, &shape)) in buffers.iter().zip(shapes.iter()).enumerate() {
        if let Some(buf) = buf {
            if buf.shape() != shape {
                return Err(TrainError::OptimizerMismatch(format!(
                    "{label}: buffer {i} has shape {:?}, parameter has {:?}",
                    buf.shape(),
                    shape
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn kind_mismatch(expected: OptimizerKind, found: OptimizerKind) -> TrainError {
    TrainError::OptimizerMismatch(format!(
        "checkpoint holds {found} state, run is configured with {expected}"
    ))
}
