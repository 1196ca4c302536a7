use serde::{Deserialize, Serialize};

/// Running weighted mean of a scalar, with the most recent value kept
/// alongside for progress displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningAverage {
    pub val: f64,
    pub sum: f64,
    pub count: f64,
    pub avg: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
        self.avg = if self.count > 0.0 { self.sum / self.count } else { 0.0 };
    }

    /// `sum / count`, or 0 before the first update.
    pub fn average(&self) -> f64 {
        self.avg
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
