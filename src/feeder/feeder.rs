use crate::math::matrix::Matrix;

/// One dataset item: flattened skeleton features and its class id.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f64>,
    pub label: usize,
}

/// Indexed, restartable dataset shared with loader worker threads.
pub trait Feeder: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn feature_dim(&self) -> usize;

    fn sample(&self, index: usize) -> Sample;

    fn label(&self, index: usize) -> usize;

    fn sample_name(&self, index: usize) -> String;

    fn labels(&self) -> Vec<usize> {
        (0..self.len()).map(|i| self.label(i)).collect()
    }

    /// Top-k accuracy of `scores` (one row per sample, in index order).
    fn top_k(&self, scores: &Matrix, k: usize) -> f64 {
        top_k_accuracy(scores, &self.labels(), k)
    }
}

/// Fraction of rows whose true label is among the `k` highest scores.
///
/// Ties rank the lower class index first.
pub fn top_k_accuracy(scores: &Matrix, labels: &[usize], k: usize) -> f64 {
    assert_eq!(scores.rows, labels.len(), "one label per score row is required");
    if labels.is_empty() {
        return 0.0;
    }
    let hits = scores.data.iter().zip(labels.iter())
        .filter(|(row, &label)| {
            let target = row[label];
            // Classes ranked strictly ahead of the true one.
            let ahead = row.iter().enumerate()
                .filter(|&(i, &s)| s > target || (s == target && i < label))
                .count();
            ahead < k
        })
        .count();
    hits as f64 / labels.len() as f64
}

/// Index of the maximum element in a slice; the first one on ties.
pub fn argmax(v: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if x > v[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_counts_label_within_k_best() {
        let scores = Matrix::from_data(vec![
            vec![0.1, 0.7, 0.2],
            vec![0.5, 0.3, 0.2],
            vec![0.2, 0.3, 0.5],
        ]);
        let labels = [1, 1, 0];
        assert!((top_k_accuracy(&scores, &labels, 1) - 1.0 / 3.0).abs() < 1e-12);
        assert!((top_k_accuracy(&scores, &labels, 2) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(top_k_accuracy(&scores, &labels, 3), 1.0);
    }

    #[test]
    fn ties_favour_lower_class_index() {
        let scores = Matrix::from_data(vec![vec![1.0, 1.0]]);
        assert_eq!(top_k_accuracy(&scores, &[0], 1), 1.0);
        assert_eq!(top_k_accuracy(&scores, &[1], 1), 0.0);
        assert_eq!(argmax(&[1.0, 1.0]), 0);
    }
}
