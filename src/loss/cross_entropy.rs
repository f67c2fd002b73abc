use crate::math::matrix::Matrix;

/// Softmax cross-entropy over raw logits with integer class labels.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Mean loss over the batch:
    ///   L = -1/B · Σ_b log softmax(logits_b)[label_b]
    ///
    /// `logits`: shape [batch, n_classes]
    /// `labels`: one class index per row
    pub fn loss(logits: &Matrix, labels: &[usize]) -> f64 {
        assert_eq!(logits.rows, labels.len(), "one label per logit row is required");
        if logits.rows == 0 {
            return 0.0;
        }
        let total: f64 = logits.data.iter().zip(labels.iter())
            .map(|(row, &label)| log_sum_exp(row) - row[label])
            .sum();
        total / logits.rows as f64
    }

    /// Gradient of the mean loss w.r.t. the logits:
    ///   ∂L/∂z_bi = (softmax(z_b)_i - 1[i = label_b]) / B
    pub fn derivative(logits: &Matrix, labels: &[usize]) -> Matrix {
        assert_eq!(logits.rows, labels.len(), "one label per logit row is required");
        let batch = logits.rows.max(1) as f64;
        let data = logits.data.iter().zip(labels.iter())
            .map(|(row, &label)| {
                let mut probs = softmax(row);
                probs[label] -= 1.0;
                probs.into_iter().map(|p| p / batch).collect()
            })
            .collect();
        Matrix::from_data(data)
    }
}

/// Numerically stable log(Σ exp(x_i)).
fn log_sum_exp(row: &[f64]) -> f64 {
    let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + row.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

pub fn softmax(row: &[f64]) -> Vec<f64> {
    let lse = log_sum_exp(row);
    row.iter().map(|x| (x - lse).exp()).collect()
}
