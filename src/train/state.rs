use serde::{Deserialize, Serialize};

use crate::train::scheduler::LrSchedule;

/// Where a run is in its step budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Steady,
    Terminated,
}

impl Phase {
    /// Phase implied by `global_step`: `Terminated` once the budget is
    /// spent, `Warmup` while the schedule is still ramping.
    pub fn at(global_step: usize, schedule: &LrSchedule) -> Phase {
        if global_step >= schedule.total_steps {
            Phase::Terminated
        } else if schedule.in_warmup(global_step) {
            Phase::Warmup
        } else {
            Phase::Steady
        }
    }
}

/// Counters owned by the orchestrator. Changed only when a window or an
/// epoch closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed optimizer steps (never raw micro-batches).
    pub global_step: usize,
    pub best_accuracy: Option<f64>,
    pub epoch: usize,
}

impl TrainingState {
    /// Records `accuracy` when it strictly beats the best so far. With no
    /// best yet the bar is zero, so a model that gets nothing right is never
    /// recorded.
    pub fn improve(&mut self, accuracy: f64) -> bool {
        let better = self.best_accuracy.map_or(accuracy > 0.0, |best| accuracy > best);
        if better {
            self.best_accuracy = Some(accuracy);
        }
        better
    }
}

/// Why `Trainer::fit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    StepBudgetReached,
    Interrupted,
}

/// Outcome of a run, as seen by one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    pub rank: usize,
    pub final_state: TrainingState,
    pub skipped_steps: usize,
    pub last_train_loss: Option<f64>,
    pub reason: TerminationReason,
}
