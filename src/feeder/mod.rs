pub mod csv;
pub mod feeder;
pub mod loader;
pub mod memory;
pub mod normalize;
pub mod tta;

pub use csv::{CsvFeeder, FeederArgs};
pub use feeder::{argmax, top_k_accuracy, Feeder, Sample};
pub use loader::{Augment, Batch, BatchIter, DataLoader};
pub use memory::InMemoryFeeder;
pub use normalize::Normalization;
pub use tta::{TtaView, ViewFeeder};
