pub mod model;
pub mod network;
pub mod spec;
pub mod state_dict;

pub use model::{Model, ModelOutput};
pub use network::Network;
pub use spec::{build_model, known_models, ModelArgs};
pub use state_dict::{normalize_name, StateDict, StateDiff, WeightLoadReport};
