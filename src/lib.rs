pub mod math;
pub mod activation;
pub mod layers;
pub mod network;
pub mod loss;
pub mod optim;
pub mod feeder;
pub mod metrics;
pub mod train;
pub mod config;
pub mod error;

// Convenience re-exports
pub use math::matrix::Matrix;
pub use activation::activation::ActivationFunction;
pub use config::{Phase, RunConfig};
pub use error::{Result, TrainError};
pub use network::model::Model;
pub use network::network::Network;
pub use train::controller::{TrainingController, TrainingSummary};
