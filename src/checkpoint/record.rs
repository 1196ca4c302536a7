use serde::{Deserialize, Serialize};

use crate::network::state_dict::StateDict;
use crate::optim::sgd::OptimizerState;

/// Complete training snapshot as written to disk.
///
/// A record without `optimizer_state` carries weights only: resuming from it
/// restores the model but restarts the step counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: usize,
    pub model_state: StateDict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_state: Option<OptimizerState>,
    #[serde(default)]
    pub best_accuracy: Option<f64>,
}

impl CheckpointRecord {
    pub fn has_full_state(&self) -> bool {
        self.optimizer_state.is_some()
    }
}

/// What `CheckpointManager::load` found in a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadedCheckpoint {
    Full(CheckpointRecord),
    /// A bare state dict, as written by `save_weights` or a pretrained export.
    WeightsOnly(StateDict),
}

impl LoadedCheckpoint {
    pub fn model_state(&self) -> &StateDict {
        match self {
            LoadedCheckpoint::Full(record) => &record.model_state,
            LoadedCheckpoint::WeightsOnly(state) => state,
        }
    }
}
