use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::feeder::feeder::{Feeder, Sample};
use crate::feeder::normalize::Normalization;

/// One test-time augmentation variant of the evaluation input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtaView {
    pub mirror: bool,
    pub scale: f64,
}

impl Default for TtaView {
    fn default() -> Self {
        TtaView { mirror: false, scale: 1.0 }
    }
}

impl TtaView {
    pub fn is_identity(&self) -> bool {
        !self.mirror && self.scale == 1.0
    }

    pub fn apply(&self, features: &mut [f64], in_channels: usize) {
        if self.mirror {
            mirror_x(features, in_channels);
        }
        if self.scale != 1.0 {
            for x in features.iter_mut() {
                *x *= self.scale;
            }
        }
    }
}

/// Negates the first coordinate of every joint.
///
/// Features are laid out joint by joint, `in_channels` values per joint.
pub fn mirror_x(features: &mut [f64], in_channels: usize) {
    for joint in features.chunks_mut(in_channels.max(1)) {
        joint[0] = -joint[0];
    }
}

/// Presents a feeder through normalization and one TTA view.
///
/// Normalization runs first, the view transform second. Sample order,
/// count, names and labels are those of the wrapped feeder.
pub struct ViewFeeder {
    inner: Arc<dyn Feeder>,
    view: TtaView,
    in_channels: usize,
    normalization: Option<Normalization>,
}

impl ViewFeeder {
    pub fn new(inner: Arc<dyn Feeder>, view: TtaView, in_channels: usize) -> ViewFeeder {
        ViewFeeder { inner, view, in_channels, normalization: None }
    }

    pub fn with_normalization(mut self, normalization: Option<Normalization>) -> ViewFeeder {
        self.normalization = normalization;
        self
    }

    pub fn view(&self) -> TtaView {
        self.view
    }
}

impl Feeder for ViewFeeder {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn feature_dim(&self) -> usize {
        self.inner.feature_dim()
    }

    fn sample(&self, index: usize) -> Sample {
        let mut sample = self.inner.sample(index);
        if let Some(norm) = &self.normalization {
            norm.apply(&mut sample.features);
        }
        self.view.apply(&mut sample.features, self.in_channels);
        sample
    }

    fn label(&self, index: usize) -> usize {
        self.inner.label(index)
    }

    fn sample_name(&self, index: usize) -> String {
        self.inner.sample_name(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::memory::InMemoryFeeder;

    #[test]
    fn mirror_negates_x_of_each_joint() {
        let mut f = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        mirror_x(&mut f, 3);
        assert_eq!(f, vec![-1.0, 2.0, 3.0, -4.0, 5.0, 6.0]);
    }

    #[test]
    fn view_feeder_keeps_order_and_labels() {
        let base: Arc<dyn Feeder> = Arc::new(InMemoryFeeder::new(
            vec![vec![1.0, 1.0], vec![2.0, 2.0]],
            vec![0, 1],
        ));
        let view = ViewFeeder::new(base, TtaView { mirror: true, scale: 2.0 }, 2);
        assert_eq!(view.len(), 2);
        assert_eq!(view.labels(), vec![0, 1]);
        assert_eq!(view.sample(1).features, vec![-4.0, 4.0]);
        assert_eq!(view.sample_name(0), "sample_0");
    }
}
