pub mod accumulator;
pub mod config;
pub mod launch;
pub mod scheduler;
pub mod state;
pub mod step_stats;
pub mod trainer;

pub use accumulator::GradientAccumulator;
pub use config::{DatasetName, TrainConfig};
pub use launch::{build_model, load_datasets, run, RunHooks};
pub use scheduler::{DecayKind, LrSchedule};
pub use state::{Phase, TerminationReason, TrainSummary, TrainingState};
pub use step_stats::StepStats;
pub use trainer::Trainer;
