use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::{Result, TrainError};
use crate::network::model::Model;
use crate::network::network::Network;

/// Constructor arguments shared by every registered model kind.
///
/// Fields:
/// - `in_features`  : flattened input size; derived from the feeder when unset
/// - `in_channels`  : coordinates per joint, derived from the stream name
/// - `hidden`       : hidden layer widths (ignored by `linear`)
/// - `activation`   : hidden activation
/// - `num_class`    : size of the classification head
/// - `activation_l1`: report mean hidden activation as an auxiliary output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    pub in_features: Option<usize>,
    pub in_channels: usize,
    pub hidden: Vec<usize>,
    pub activation: ActivationFunction,
    pub num_class: usize,
    pub activation_l1: bool,
}

impl Default for ModelArgs {
    fn default() -> Self {
        ModelArgs {
            in_features: None,
            in_channels: 3,
            hidden: vec![128],
            activation: ActivationFunction::ReLU,
            num_class: 0,
            activation_l1: false,
        }
    }
}

type Constructor = fn(usize, &ModelArgs, &mut StdRng) -> Box<dyn Model>;

/// Model kinds selectable by tag in the run configuration.
const REGISTRY: &[(&str, Constructor)] = &[
    ("linear", build_linear),
    ("mlp", build_mlp),
];

fn build_linear(in_features: usize, args: &ModelArgs, rng: &mut StdRng) -> Box<dyn Model> {
    Box::new(Network::new(in_features, &[], ActivationFunction::Identity, args.num_class, rng))
}

fn build_mlp(in_features: usize, args: &ModelArgs, rng: &mut StdRng) -> Box<dyn Model> {
    let net = Network::new(in_features, &args.hidden, args.activation.clone(), args.num_class, rng);
    if args.activation_l1 {
        Box::new(net.with_activation_l1())
    } else {
        Box::new(net)
    }
}

pub fn known_models() -> Vec<&'static str> {
    REGISTRY.iter().map(|(tag, _)| *tag).collect()
}

/// Resolves `tag` against the registry and builds the model with seeded init.
pub fn build_model(tag: &str, args: &ModelArgs, seed: u64) -> Result<Box<dyn Model>> {
    let constructor = REGISTRY
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, ctor)| *ctor)
        .ok_or_else(|| TrainError::UnknownModel {
            tag: tag.to_string(),
            known: known_models().join(", "),
        })?;

    let in_features = args
        .in_features
        .ok_or_else(|| TrainError::Config("model_args.in_features is not set".into()))?;
    if in_features == 0 || args.num_class == 0 {
        return Err(TrainError::Config(format!(
            "model needs in_features > 0 and num_class > 0 (got {in_features} and {})",
            args.num_class
        )));
    }
    if args.hidden.contains(&0) {
        return Err(TrainError::Config("hidden layer widths must be positive".into()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    Ok(constructor(in_features, args, &mut rng))
}
