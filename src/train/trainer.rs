use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::manager::{restore, CheckpointManager, Restored};
use crate::data::loader::BatchSource;
use crate::distributed::collective::Collective;
use crate::distributed::data_parallel::DataParallel;
use crate::error::{Result, Stage, TrainError};
use crate::metrics::average::RunningAverage;
use crate::metrics::evaluate::{evaluate, EvalResult};
use crate::metrics::sink::{MetricsSink, NullSink};
use crate::network::model::Model;
use crate::optim::clip::clip_grad_norm;
use crate::optim::sgd::Sgd;
use crate::precision::scaler::{scaler_for, GradScaler};
use crate::train::accumulator::GradientAccumulator;
use crate::train::config::TrainConfig;
use crate::train::scheduler::LrSchedule;
use crate::train::state::{Phase, TerminationReason, TrainSummary, TrainingState};
use crate::train::step_stats::StepStats;

/// Step-driven training orchestrator for one worker.
///
/// Owns the model (wrapped for data parallelism), the optimizer, the loss
/// scaler and all counters. Each completed accumulation window is one
/// optimizer step; `fit` runs until `total_steps` steps have been taken or a
/// stop is requested, re-iterating the training source as often as needed.
///
/// Only the primary worker evaluates, writes checkpoints and emits metrics.
///
/// # Early termination
/// Before each accumulation window starts, workers agree whether any of
/// them wants to stop: the stop flag is set, or the progress receiver was
/// dropped. If so, every worker returns `TerminationReason::Interrupted` at
/// the same step and the pending partial window is discarded.
pub struct Trainer<M: Model, C: Collective> {
    model: DataParallel<M, C>,
    optimizer: Sgd,
    scaler: Box<dyn GradScaler>,
    accumulator: GradientAccumulator,
    schedule: LrSchedule,
    state: TrainingState,
    config: TrainConfig,
    is_primary: bool,
    checkpoints: Option<CheckpointManager>,
    sink: Box<dyn MetricsSink>,
    stop_flag: Option<Arc<AtomicBool>>,
    progress_tx: Option<mpsc::Sender<StepStats>>,
    progress_closed: bool,
    losses: RunningAverage,
    skipped_steps: usize,
    last_loss: Option<f64>,
}

impl<M: Model, C: Collective> Trainer<M, C> {
    /// Validates `config`, applies `resume_checkpoint_path` if set, then
    /// wraps the model for data parallelism. Every worker of a group must
    /// call this; it blocks until all of them have.
    pub fn new(mut model: M, collective: C, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        if config.worker_rank != collective.rank() || config.world_size != collective.world_size() {
            return Err(TrainError::Config(format!(
                "config is for rank {} of {}, collective is rank {} of {}",
                config.worker_rank,
                config.world_size,
                collective.rank(),
                collective.world_size()
            )));
        }
        if model.num_classes() != config.num_classes() {
            return Err(TrainError::Config(format!(
                "model has {} outputs but {} has {} classes",
                model.num_classes(),
                config.dataset_name,
                config.num_classes()
            )));
        }

        let is_primary = collective.is_primary();
        let mut optimizer = Sgd::new(config.base_learning_rate, config.momentum, config.weight_decay);
        let mut state = TrainingState::default();
        if let Some(path) = &config.resume_checkpoint_path {
            let restored = restore(path, &mut model, &mut optimizer, &mut state, config.allow_partial_resume)?;
            if is_primary {
                match restored {
                    Restored::FullState { step } => {
                        info!(step, best_accuracy = ?state.best_accuracy, path = %path.display(), "resumed training")
                    }
                    Restored::WeightsOnly => info!(path = %path.display(), "loaded weights, starting at step 0"),
                }
            }
        }

        let schedule = LrSchedule::new(config.warmup_steps, config.total_steps, config.decay_kind);
        optimizer.set_learning_rate(config.base_learning_rate * schedule.rate(state.global_step));
        let scaler = scaler_for(
            config.reduced_precision_enabled,
            config.static_loss_scale,
            config.initial_loss_scale,
        );

        Ok(Trainer {
            model: DataParallel::new(model, collective)?,
            optimizer,
            scaler,
            accumulator: GradientAccumulator::new(config.accumulation_factor),
            schedule,
            state,
            config,
            is_primary,
            checkpoints: None,
            sink: Box::new(NullSink),
            stop_flag: None,
            progress_tx: None,
            progress_closed: false,
            losses: RunningAverage::new(),
            skipped_steps: 0,
            last_loss: None,
        })
    }

    /// Checkpoint writer; used on the primary worker only.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Metrics destination; used on the primary worker only.
    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// One `StepStats` is sent per optimizer step. Dropping the receiver
    /// stops training at the next window boundary.
    pub fn with_progress(mut self, tx: mpsc::Sender<StepStats>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn model(&self) -> &M {
        self.model.module()
    }

    pub fn into_model(self) -> M {
        self.model.into_inner()
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Trains until the step budget is spent or a stop is agreed.
    ///
    /// A partial accumulation window at the end of a data pass is not
    /// flushed: its gradients stay in the buffers and the first micro-batches
    /// of the next pass complete it. Any data, forward, backward,
    /// synchronization or checkpoint error ends the run; gradient overflow
    /// under loss scaling only skips the affected update.
    pub fn fit(&mut self, train: &dyn BatchSource, eval: &dyn BatchSource) -> Result<TrainSummary> {
        if train.batches_per_epoch() == 0 {
            return Err(TrainError::stage(Stage::DataLoad, "training set yields no batches"));
        }
        self.log_setup(train);

        if self.config.eval_at_start && self.is_primary {
            self.run_evaluation(eval, false)?;
        }
        self.model.zero_grad();

        let mut window_started = Instant::now();
        let reason = 'run: loop {
            if Phase::at(self.state.global_step, &self.schedule) == Phase::Terminated {
                break TerminationReason::StepBudgetReached;
            }
            self.losses.reset();

            let mut yielded = false;
            for batch in train.iter_epoch(self.state.epoch) {
                if self.accumulator.pending() == 0 {
                    if self.stop_requested()? {
                        break 'run TerminationReason::Interrupted;
                    }
                    window_started = Instant::now();
                }
                let batch = batch?;
                yielded = true;

                let loss_scale = self.scaler.loss_scale();
                self.accumulator.observe(&mut self.model, &batch, loss_scale)?;

                if self.accumulator.window_complete() {
                    self.complete_window(eval, window_started.elapsed())?;
                    if Phase::at(self.state.global_step, &self.schedule) == Phase::Terminated {
                        break 'run TerminationReason::StepBudgetReached;
                    }
                }
            }
            if !yielded {
                return Err(TrainError::stage(Stage::DataLoad, "training pass yielded no batches"));
            }

            self.state.epoch += 1;
            debug!(
                epoch = self.state.epoch,
                step = self.state.global_step,
                pending = self.accumulator.pending(),
                running_loss = self.losses.average(),
                "data pass complete"
            );
        };

        self.finish(reason)
    }

    /// Sync, unscale, clip, update, then advance the step and run any
    /// periodic evaluation or snapshot due at the new step.
    fn complete_window(&mut self, eval: &dyn BatchSource, elapsed: Duration) -> Result<()> {
        let window_loss = self.accumulator.finish_window();
        let step = self.state.global_step + 1;
        let lr = self.config.base_learning_rate * self.schedule.rate(step);
        let loss_scale = self.scaler.loss_scale();

        self.model.sync_gradients()?;
        let grad_norm = match self.scaler.unscale(&mut self.model) {
            Ok(()) => {
                let norm = clip_grad_norm(&mut self.model, self.config.max_grad_norm);
                self.optimizer.set_learning_rate(lr);
                self.optimizer.step(&mut self.model);
                Some(norm)
            }
            Err(TrainError::NumericInstability { loss_scale }) => {
                warn!(rank = self.model.collective().rank(), step, loss_scale, "gradient overflow, update skipped");
                self.skipped_steps += 1;
                None
            }
            Err(e) => return Err(e),
        };
        self.scaler.update(grad_norm.is_none());
        self.model.zero_grad();

        self.state.global_step = step;
        self.losses.update(window_loss, 1.0);
        self.last_loss = Some(window_loss);

        if self.is_primary {
            self.record_scalar("train/loss", window_loss, step);
            self.record_scalar("train/lr", lr, step);
            debug!(step, loss = window_loss, lr, grad_norm = ?grad_norm, loss_scale, "optimizer step");
        }
        self.report_progress(StepStats {
            step,
            total_steps: self.config.total_steps,
            epoch: self.state.epoch,
            phase: Phase::at(step, &self.schedule),
            loss: window_loss,
            running_loss: self.losses.average(),
            learning_rate: lr,
            grad_norm,
            loss_scale,
            skipped: grad_norm.is_none(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        if self.is_primary && step % self.config.eval_every == 0 {
            self.run_evaluation(eval, true)?;
        }
        if self.is_primary && self.config.save_every > 0 && step % self.config.save_every == 0 {
            if let Some(checkpoints) = &self.checkpoints {
                checkpoints.save_periodic(&self.state, self.model.module(), &self.optimizer)?;
            }
        }
        Ok(())
    }

    /// Full pass over `eval` at the current step. With `track_best`, a new
    /// best accuracy is recorded and, when checkpointing is on, snapshotted.
    fn run_evaluation(&mut self, eval: &dyn BatchSource, track_best: bool) -> Result<EvalResult> {
        let step = self.state.global_step;
        info!(step, batches = eval.batches_per_epoch(), "running validation");
        let result = evaluate(self.model.module(), eval, &self.config.top_k, self.sink.as_mut(), step)?;
        if track_best {
            let improved = match &self.checkpoints {
                Some(checkpoints) => checkpoints
                    .save_best(&mut self.state, self.model.module(), &self.optimizer, result.accuracy)?
                    .is_some(),
                None => self.state.improve(result.accuracy),
            };
            if improved {
                info!(step, accuracy = result.accuracy, "new best accuracy");
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn stop_requested(&self) -> Result<bool> {
        let local = self.progress_closed
            || self.stop_flag.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed));
        self.model.any_worker(local)
    }

    fn record_scalar(&mut self, name: &str, value: f64, step: usize) {
        if let Err(e) = self.sink.add_scalar(name, value, step) {
            warn!(error = %e, name, step, "failed to record metric");
        }
    }

    fn report_progress(&mut self, stats: StepStats) {
        if let Some(tx) = &self.progress_tx {
            if tx.send(stats).is_err() {
                debug!("progress receiver dropped, stopping at the next window");
                self.progress_closed = true;
                self.progress_tx = None;
            }
        }
    }

    fn log_setup(&self, train: &dyn BatchSource) {
        if !self.is_primary {
            return;
        }
        let micro = self.config.micro_batch_size();
        let world = self.model.collective().world_size();
        info!(
            total_steps = self.config.total_steps,
            micro_batch_size = micro,
            total_batch_size = micro * self.config.accumulation_factor * world,
            accumulation_factor = self.config.accumulation_factor,
            world_size = world,
            batches_per_epoch = train.batches_per_epoch(),
            start_step = self.state.global_step,
            "running training"
        );
        info!(
            parameters_m = self.model.parameter_count() as f64 / 1e6,
            loss_scale = self.scaler.loss_scale(),
            decay = %self.config.decay_kind,
            warmup_steps = self.config.warmup_steps,
            "model and schedule"
        );
    }

    fn finish(&mut self, reason: TerminationReason) -> Result<TrainSummary> {
        if self.is_primary {
            if let Some(checkpoints) = &self.checkpoints {
                checkpoints.save_weights(&self.config.name, self.model.module())?;
            }
            if let Err(e) = self.sink.flush() {
                warn!(error = %e, "failed to flush metrics");
            }
            info!(
                step = self.state.global_step,
                best_accuracy = ?self.state.best_accuracy,
                skipped_steps = self.skipped_steps,
                ?reason,
                "training finished"
            );
        }
        Ok(TrainSummary {
            rank: self.model.collective().rank(),
            final_state: self.state.clone(),
            skipped_steps: self.skipped_steps,
            last_train_loss: self.last_loss,
            reason,
        })
    }
}
