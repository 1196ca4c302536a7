use std::fmt;

use serde::{Deserialize, Serialize};

/// Square count matrix: `counts[true][predicted]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self { counts: vec![vec![0; num_classes]; num_classes] }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Records one prediction. Out-of-range indices are ignored.
    pub fn add(&mut self, true_label: usize, predicted: usize) {
        let n = self.num_classes();
        if true_label < n && predicted < n {
            self.counts[true_label][predicted] += 1;
        }
    }

    pub fn get(&self, true_label: usize, predicted: usize) -> usize {
        self.counts[true_label][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// Samples whose true label is `class`.
    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f64 / total as f64,
        }
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.counts.iter().flatten().max().map_or(1, |m| m.to_string().len()).max(1);
        for row in &self.counts {
            let cells: Vec<String> = row.iter().map(|c| format!("{c:>width$}")).collect();
            writeln!(f, "[{}]", cells.join(" "))?;
        }
        Ok(())
    }
}
