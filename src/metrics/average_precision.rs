//! Ranking metrics over a full evaluation pass.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Per-class average precision over one-vs-rest targets.
///
/// For class `c`, samples are ranked by their class-`c` score (descending,
/// earlier samples first on ties). With `tp(i)` the positives among the
/// first `i` ranks, `AP = Σ_{i positive} tp(i) / i` divided by the number of
/// positives; a class with no positives scores 0.
#[derive(Debug, Clone, Default)]
pub struct AveragePrecisionMeter {
    scores: Vec<Vec<f64>>,
    positives: Vec<Vec<bool>>,
}

impl AveragePrecisionMeter {
    pub fn new(num_classes: usize) -> Self {
        Self {
            scores: vec![Vec::new(); num_classes],
            positives: vec![Vec::new(); num_classes],
        }
    }

    /// Adds one sample: its per-class scores and its true label.
    pub fn add(&mut self, scores: &[f64], label: usize) {
        for (c, (s, p)) in self.scores.iter_mut().zip(self.positives.iter_mut()).enumerate() {
            s.push(scores.get(c).copied().unwrap_or(f64::NEG_INFINITY));
            p.push(c == label);
        }
    }

    pub fn per_class(&self) -> Vec<f64> {
        self.scores.iter()
            .zip(self.positives.iter())
            .map(|(s, p)| average_precision(s, p))
            .collect()
    }

    /// Unweighted mean over all classes.
    pub fn mean(&self) -> f64 {
        let ap = self.per_class();
        if ap.is_empty() {
            0.0
        } else {
            ap.iter().sum::<f64>() / ap.len() as f64
        }
    }
}

fn descending(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

fn average_precision(scores: &[f64], positives: &[bool]) -> f64 {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| descending(scores[a], scores[b]));

    let mut hits = 0usize;
    let mut precision_sum = 0.0;
    for (rank, &i) in order.iter().enumerate() {
        if positives[i] {
            hits += 1;
            precision_sum += hits as f64 / (rank + 1) as f64;
        }
    }
    precision_sum / hits.max(1) as f64
}

/// Top-k classification error as a fraction in `[0, 1]`: the share of
/// samples whose label is not among the `k` highest scores. `k` larger than
/// the class count is clamped.
#[derive(Debug, Clone)]
pub struct TopKErrorMeter {
    ks: Vec<usize>,
    hits: Vec<usize>,
    seen: usize,
}

impl TopKErrorMeter {
    pub fn new(ks: &[usize]) -> Self {
        let mut ks: Vec<usize> = ks.iter().copied().filter(|&k| k > 0).collect();
        ks.sort_unstable();
        ks.dedup();
        let hits = vec![0; ks.len()];
        Self { ks, hits, seen: 0 }
    }

    pub fn add(&mut self, scores: &[f64], label: usize) {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| descending(scores[a], scores[b]));
        let rank = order.iter().position(|&c| c == label);
        for (k, hit) in self.ks.iter().zip(self.hits.iter_mut()) {
            if rank.is_some_and(|r| r < *k) {
                *hit += 1;
            }
        }
        self.seen += 1;
    }

    pub fn value(&self) -> BTreeMap<usize, f64> {
        self.ks.iter()
            .zip(self.hits.iter())
            .map(|(&k, &hit)| {
                let err = if self.seen == 0 { 0.0 } else { 1.0 - hit as f64 / self.seen as f64 };
                (k, err)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ap_of_a_hand_ranked_class() {
        // class 0 ranking by score: s0(+), s2(-), s1(+), s3(-)
        let mut meter = AveragePrecisionMeter::new(2);
        meter.add(&[0.9, 0.1], 0);
        meter.add(&[0.5, 0.5], 0);
        meter.add(&[0.7, 0.3], 1);
        meter.add(&[0.2, 0.8], 1);
        let ap = meter.per_class();
        assert!((ap[0] - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        // class 1 ranking: s3(+), s1(-), s2(+), s0(-)
        assert!((ap[1] - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        assert!((meter.mean() - 5.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn class_without_positives_scores_zero() {
        let mut meter = AveragePrecisionMeter::new(3);
        meter.add(&[0.8, 0.1, 0.1], 0);
        assert_eq!(meter.per_class(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn top_k_error_fractions() {
        let mut meter = TopKErrorMeter::new(&[1, 2, 5]);
        meter.add(&[0.6, 0.3, 0.1], 0);
        meter.add(&[0.6, 0.3, 0.1], 1);
        meter.add(&[0.6, 0.3, 0.1], 2);
        meter.add(&[0.1, 0.3, 0.6], 2);
        let v = meter.value();
        assert_eq!(v[&1], 0.5);
        assert_eq!(v[&2], 0.25);
        assert_eq!(v[&5], 0.0);
    }
}
