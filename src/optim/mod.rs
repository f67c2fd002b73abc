pub mod adam;
pub mod grad_scaler;
pub mod optimizer;
pub mod scheduler;
pub mod sgd;

pub use adam::Adam;
pub use grad_scaler::GradScaler;
pub use optimizer::{build_optimizer, Optimizer, OptimizerKind, OptimizerState};
pub use scheduler::{LrScheduler, SchedulerKind};
pub use sgd::Sgd;
