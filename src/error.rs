use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The part of a training run that failed. Carried by stage-scoped errors so
/// the final message tells the operator where the run died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DataLoad,
    Forward,
    Backward,
    Synchronization,
    CheckpointIo,
    MetricsSink,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DataLoad        => "data load",
            Stage::Forward         => "forward",
            Stage::Backward        => "backward",
            Stage::Synchronization => "synchronization",
            Stage::CheckpointIo    => "checkpoint I/O",
            Stage::MetricsSink     => "metrics sink",
        };
        f.write_str(name)
    }
}

/// Differences between a checkpoint's tensor layout and the live model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    /// Keys the model has but the checkpoint does not.
    pub missing: Vec<String>,
    /// Keys the checkpoint has but the model does not.
    pub unexpected: Vec<String>,
    /// `(key, expected shape, found shape)`.
    pub shape_mismatches: Vec<(String, [usize; 2], [usize; 2])>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape_mismatches.is_empty()
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} missing, {} unexpected, {} shape mismatches",
            self.missing.len(),
            self.unexpected.len(),
            self.shape_mismatches.len()
        )?;
        if let Some(key) = self.missing.first() {
            write!(f, " (first missing: {key})")?;
        }
        if let Some((key, expected, found)) = self.shape_mismatches.first() {
            write!(f, " (first mismatch: {key} expected {expected:?}, found {found:?})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("checkpoint does not match the model: {0}")]
    SchemaMismatch(SchemaDiff),

    #[error("non-finite gradients at loss scale {loss_scale}")]
    NumericInstability { loss_scale: f64 },

    #[error("distributed synchronization failed: {0}")]
    DistributedSync(String),

    #[error("{stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    #[error("{stage} failed on {path}: {source}")]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TrainError {
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        TrainError::Stage { stage, message: message.into() }
    }

    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io { stage, path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
