use crate::error::{Result, Stage, TrainError};
use crate::math::matrix::Matrix;

/// One micro-batch: `inputs` is `batch × features`, one class index per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Matrix,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: Vec<Vec<f64>>, labels: Vec<usize>) -> Result<Batch> {
        if inputs.len() != labels.len() {
            return Err(TrainError::stage(
                Stage::DataLoad,
                format!("batch has {} inputs but {} labels", inputs.len(), labels.len()),
            ));
        }
        Ok(Batch { inputs: Matrix::from_data(inputs), labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A labelled, in-memory sample set.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub samples: Vec<Vec<f64>>,
    pub labels: Vec<usize>,
    pub num_classes: usize,
    /// Class names in index order; empty when the source had none.
    pub class_names: Vec<String>,
}

impl Dataset {
    /// Checks that samples and labels line up, every sample has the same
    /// width, and every label is a valid class index.
    pub fn new(samples: Vec<Vec<f64>>, labels: Vec<usize>, num_classes: usize) -> Result<Dataset> {
        if samples.len() != labels.len() {
            return Err(TrainError::stage(
                Stage::DataLoad,
                format!("{} samples but {} labels", samples.len(), labels.len()),
            ));
        }
        if let Some(width) = samples.first().map(Vec::len) {
            if let Some(i) = samples.iter().position(|s| s.len() != width) {
                return Err(TrainError::stage(
                    Stage::DataLoad,
                    format!("sample {i} has {} features, expected {width}", samples[i].len()),
                ));
            }
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(TrainError::stage(
                Stage::DataLoad,
                format!("label {bad} out of range for {num_classes} classes"),
            ));
        }
        Ok(Dataset { samples, labels, num_classes, class_names: Vec::new() })
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Dataset {
        self.class_names = names;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }
}
