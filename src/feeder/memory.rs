use crate::feeder::feeder::{Feeder, Sample};

/// Feeder over samples already held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryFeeder {
    names: Vec<String>,
    features: Vec<Vec<f64>>,
    labels: Vec<usize>,
}

impl InMemoryFeeder {
    /// # Panics
    /// Panics if `features` and `labels` differ in length or rows differ in width.
    pub fn new(features: Vec<Vec<f64>>, labels: Vec<usize>) -> InMemoryFeeder {
        assert_eq!(features.len(), labels.len(), "features and labels must have equal length");
        if let Some(first) = features.first() {
            assert!(
                features.iter().all(|row| row.len() == first.len()),
                "all samples must have the same feature width"
            );
        }
        let names = (0..features.len()).map(|i| format!("sample_{i}")).collect();
        InMemoryFeeder { names, features, labels }
    }

    pub fn with_names(mut self, names: Vec<String>) -> InMemoryFeeder {
        assert_eq!(names.len(), self.features.len(), "one name per sample is required");
        self.names = names;
        self
    }

    /// Keeps only the first `n` samples.
    pub fn truncate(&mut self, n: usize) {
        self.names.truncate(n);
        self.features.truncate(n);
        self.labels.truncate(n);
    }
}

impl Feeder for InMemoryFeeder {
    fn len(&self) -> usize {
        self.features.len()
    }

    fn feature_dim(&self) -> usize {
        self.features.first().map(|row| row.len()).unwrap_or(0)
    }

    fn sample(&self, index: usize) -> Sample {
        Sample { features: self.features[index].clone(), label: self.labels[index] }
    }

    fn label(&self, index: usize) -> usize {
        self.labels[index]
    }

    fn sample_name(&self, index: usize) -> String {
        self.names[index].clone()
    }
}
