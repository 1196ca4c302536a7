use crate::math::matrix::Matrix;

/// Categorical cross-entropy computed directly on logits (softmax folded in).
pub struct CrossEntropyLoss;

/// Numerically stable softmax of one logit row.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_sum_exp(logits: &[f64]) -> f64 {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max + logits.iter().map(|&z| (z - max).exp()).sum::<f64>().ln()
}

impl CrossEntropyLoss {
    /// `-log softmax(logits)[label]`
    pub fn loss(logits: &[f64], label: usize) -> f64 {
        log_sum_exp(logits) - logits[label]
    }

    /// ∂L/∂z = softmax(z) - onehot(label)
    pub fn derivative(logits: &[f64], label: usize) -> Vec<f64> {
        let mut grad = softmax(logits);
        grad[label] -= 1.0;
        grad
    }

    /// Mean loss over a batch of logit rows and the gradient of that mean
    /// with respect to the logits.
    pub fn batch(logits: &Matrix, labels: &[usize]) -> (f64, Matrix) {
        assert_eq!(logits.rows, labels.len(), "one label per logit row");
        let n = labels.len().max(1) as f64;

        let mut total = 0.0;
        let mut grad_rows = Vec::with_capacity(labels.len());
        for (row, &label) in logits.data.iter().zip(labels.iter()) {
            total += CrossEntropyLoss::loss(row, label);
            grad_rows.push(CrossEntropyLoss::derivative(row, label).into_iter().map(|g| g / n).collect());
        }
        let grad = Matrix {
            rows: logits.rows,
            cols: logits.cols,
            data: grad_rows,
        };
        (total / n, grad)
    }
}
