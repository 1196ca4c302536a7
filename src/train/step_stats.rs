use serde::{Deserialize, Serialize};

use crate::train::state::Phase;

/// Per-step training statistics emitted by `Trainer::fit`.
///
/// When a progress channel is attached, the trainer sends one `StepStats`
/// after every completed optimizer step. Receivers (a progress bar, a live
/// dashboard) use it to follow the run without touching the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    /// Optimizer steps completed so far, this one included.
    pub step: usize,
    pub total_steps: usize,
    /// Data passes completed before this step.
    pub epoch: usize,
    pub phase: Phase,
    /// Mean micro-batch loss over the window that produced this step.
    pub loss: f64,
    /// Running mean of window losses since the start of the epoch.
    pub running_loss: f64,
    pub learning_rate: f64,
    /// Gradient norm before clipping; `None` when the step was skipped.
    pub grad_norm: Option<f64>,
    pub loss_scale: f64,
    /// The update was dropped because scaled gradients overflowed.
    pub skipped: bool,
    /// Wall-clock duration of the window in milliseconds.
    pub elapsed_ms: u64,
}
