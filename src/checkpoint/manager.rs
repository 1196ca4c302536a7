use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::record::{CheckpointRecord, LoadedCheckpoint};
use crate::error::{Result, Stage, TrainError};
use crate::network::model::Model;
use crate::optim::sgd::Sgd;
use crate::train::state::TrainingState;

/// Writes and reads training snapshots.
///
/// Two directory roles:
/// - `every_dir` holds periodic snapshots, `step_{step}_checkpoint.json`.
///   They accumulate unless a `keep_last` cap is set.
/// - `best_dir` holds one file per new best accuracy,
///   `best_acc_step_{step}_acc_{acc}_checkpoint.json`, plus the final
///   weights-only export.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    every_dir: PathBuf,
    best_dir: PathBuf,
    keep_last: Option<usize>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TrainError::io(Stage::CheckpointIo, parent, e))?;
    }
    let file = fs::File::create(path).map_err(|e| TrainError::io(Stage::CheckpointIo, path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .map_err(|e| TrainError::stage(Stage::CheckpointIo, format!("{}: {e}", path.display())))
}

/// Step encoded in a periodic snapshot's file name.
fn periodic_step(file_name: &str) -> Option<usize> {
    file_name.strip_prefix("step_")?.strip_suffix("_checkpoint.json")?.parse().ok()
}

impl CheckpointManager {
    pub fn new(every_dir: impl Into<PathBuf>, best_dir: impl Into<PathBuf>) -> Self {
        Self { every_dir: every_dir.into(), best_dir: best_dir.into(), keep_last: None }
    }

    /// Keep at most `n` periodic snapshots, deleting the oldest first.
    /// `None` keeps all of them.
    pub fn with_keep_last(mut self, n: Option<usize>) -> Self {
        self.keep_last = n.map(|n| n.max(1));
        self
    }

    pub fn periodic_path(&self, step: usize) -> PathBuf {
        self.every_dir.join(format!("step_{step}_checkpoint.json"))
    }

    pub fn best_path(&self, step: usize, accuracy: f64) -> PathBuf {
        self.best_dir.join(format!("best_acc_step_{step}_acc_{accuracy}_checkpoint.json"))
    }

    pub fn weights_path(&self, name: &str) -> PathBuf {
        self.best_dir.join(format!("{name}_checkpoint.json"))
    }

    fn record<M: Model + ?Sized>(step: usize, model: &M, optimizer: &Sgd, best: Option<f64>) -> CheckpointRecord {
        CheckpointRecord {
            step,
            model_state: model.state_dict(),
            optimizer_state: Some(optimizer.state()),
            best_accuracy: best,
        }
    }

    /// Unconditionally snapshots the full training state at `state.global_step`.
    pub fn save_periodic<M: Model + ?Sized>(&self, state: &TrainingState, model: &M, optimizer: &Sgd) -> Result<PathBuf> {
        let path = self.periodic_path(state.global_step);
        write_json(&path, &Self::record(state.global_step, model, optimizer, state.best_accuracy))?;
        info!(step = state.global_step, path = %path.display(), "saved periodic checkpoint");
        self.prune_periodic()?;
        Ok(path)
    }

    /// Snapshots only when `accuracy` strictly beats `state.best_accuracy`,
    /// updating the best on success. Returns the written path, if any.
    pub fn save_best<M: Model + ?Sized>(
        &self,
        state: &mut TrainingState,
        model: &M,
        optimizer: &Sgd,
        accuracy: f64,
    ) -> Result<Option<PathBuf>> {
        if !state.improve(accuracy) {
            debug!(accuracy, best = ?state.best_accuracy, "no improvement, best checkpoint kept");
            return Ok(None);
        }
        let path = self.best_path(state.global_step, accuracy);
        write_json(&path, &Self::record(state.global_step, model, optimizer, Some(accuracy)))?;
        info!(step = state.global_step, accuracy, path = %path.display(), "saved best checkpoint");
        Ok(Some(path))
    }

    /// Writes the model's bare state dict to `{name}_checkpoint.json`.
    pub fn save_weights<M: Model + ?Sized>(&self, name: &str, model: &M) -> Result<PathBuf> {
        let path = self.weights_path(name);
        write_json(&path, &model.state_dict())?;
        info!(path = %path.display(), "saved model weights");
        Ok(path)
    }

    /// Periodic snapshots on disk, oldest first.
    pub fn periodic_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let entries = match fs::read_dir(&self.every_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TrainError::io(Stage::CheckpointIo, &self.every_dir, e)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TrainError::io(Stage::CheckpointIo, &self.every_dir, e))?;
            if let Some(step) = entry.file_name().to_str().and_then(periodic_step) {
                found.push((step, entry.path()));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    fn prune_periodic(&self) -> Result<()> {
        let Some(keep) = self.keep_last else {
            return Ok(());
        };
        let existing = self.periodic_checkpoints()?;
        let excess = existing.len().saturating_sub(keep);
        for (step, path) in existing.into_iter().take(excess) {
            fs::remove_file(&path).map_err(|e| TrainError::io(Stage::CheckpointIo, &path, e))?;
            debug!(step, "pruned periodic checkpoint");
        }
        Ok(())
    }

    /// Reads a full record or a bare state dict. Anything that is not valid
    /// JSON of either shape is `CheckpointCorrupt`.
    pub fn load(path: &Path) -> Result<LoadedCheckpoint> {
        let text = fs::read_to_string(path).map_err(|e| TrainError::io(Stage::CheckpointIo, path, e))?;
        serde_json::from_str(&text).map_err(|e| TrainError::CheckpointCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// How a resume went.
#[derive(Debug, Clone, PartialEq)]
pub enum Restored {
    /// Weights, optimizer state, step and best accuracy were restored.
    FullState { step: usize },
    /// Only weights were transferred; training restarts at step 0.
    WeightsOnly,
}

/// Applies the checkpoint at `path` to a freshly built model and optimizer.
///
/// Model weights are always restored. Optimizer state, `global_step` and
/// `best_accuracy` come back only from a record that carries optimizer
/// state. On a key/shape mismatch the load aborts with `SchemaMismatch`
/// unless `allow_partial`, in which case matching tensors are copied and the
/// optimizer state is discarded. Momentum buffers that do not fit the model
/// are checked the same way, before any optimizer state is applied.
pub fn restore<M: Model + ?Sized>(
    path: &Path,
    model: &mut M,
    optimizer: &mut Sgd,
    state: &mut TrainingState,
    allow_partial: bool,
) -> Result<Restored> {
    let loaded = CheckpointManager::load(path)?;
    let diff = model.load_state_dict(loaded.model_state(), !allow_partial)?;
    if !diff.is_empty() {
        warn!(path = %path.display(), %diff, "partial resume: optimizer state discarded");
        return Ok(Restored::WeightsOnly);
    }

    let record = match loaded {
        LoadedCheckpoint::Full(record) if record.has_full_state() => record,
        _ => {
            debug!(path = %path.display(), "loaded weights only, step counter restarts at 0");
            return Ok(Restored::WeightsOnly);
        }
    };
    let CheckpointRecord { step, optimizer_state, best_accuracy, .. } = record;
    if let Some(opt) = &optimizer_state {
        match optimizer.load_state(opt, &*model) {
            Ok(()) => {}
            Err(TrainError::SchemaMismatch(diff)) if allow_partial => {
                warn!(path = %path.display(), %diff, "partial resume: optimizer state discarded");
                return Ok(Restored::WeightsOnly);
            }
            Err(e) => return Err(e),
        }
    }
    state.global_step = step;
    state.best_accuracy = best_accuracy;
    debug!(step, best_accuracy = ?best_accuracy, "resumed full training state");
    Ok(Restored::FullState { step })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::activation::ActivationFunction;
    use crate::network::network::Network;
    use crate::network::state_dict::Tensor;
    use rand::{rngs::StdRng, SeedableRng};

    fn net(seed: u64) -> Network {
        Network::new(
            vec![(3, 4, ActivationFunction::Gelu), (2, 3, ActivationFunction::Identity)],
            &mut StdRng::seed_from_u64(seed),
        )
    }

    fn trained_optimizer(model: &mut Network) -> Sgd {
        let mut opt = Sgd::new(0.1, 0.9, 1e-4);
        for (_, p) in model.named_parameters_mut() {
            p.grad.fill(0.5);
        }
        opt.step(model);
        opt
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir.join("every"), dir.join("best"))
    }

    #[test]
    fn periodic_round_trip_restores_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path());
        let mut model = net(1);
        let opt = trained_optimizer(&mut model);
        let state = TrainingState { global_step: 40, best_accuracy: Some(0.5), epoch: 3 };

        let path = ckpt.save_periodic(&state, &model, &opt).unwrap();
        assert!(path.ends_with("every/step_40_checkpoint.json"));

        let mut fresh = net(2);
        let mut fresh_opt = Sgd::new(0.1, 0.9, 1e-4);
        let mut fresh_state = TrainingState::default();
        let outcome = restore(&path, &mut fresh, &mut fresh_opt, &mut fresh_state, false).unwrap();

        assert_eq!(outcome, Restored::FullState { step: 40 });
        assert_eq!(fresh.state_dict(), model.state_dict());
        assert_eq!(fresh_opt.state(), opt.state());
        assert_eq!(fresh_state.global_step, 40);
        assert_eq!(fresh_state.best_accuracy, Some(0.5));
    }

    #[test]
    fn best_round_trip_and_monotonic_saves() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path());
        let mut model = net(1);
        let opt = trained_optimizer(&mut model);
        let mut state = TrainingState::default();

        let mut written = Vec::new();
        for (i, acc) in [0.4, 0.6, 0.6, 0.5, 0.8, 0.7].into_iter().enumerate() {
            state.global_step = (i + 1) * 10;
            if let Some(path) = ckpt.save_best(&mut state, &model, &opt, acc).unwrap() {
                written.push(path);
            }
        }
        assert_eq!(written.len(), 3);
        assert_eq!(state.best_accuracy, Some(0.8));
        assert!(written[2].ends_with("best/best_acc_step_50_acc_0.8_checkpoint.json"));

        match CheckpointManager::load(&written[2]).unwrap() {
            LoadedCheckpoint::Full(record) => {
                assert_eq!(record.step, 50);
                assert_eq!(record.best_accuracy, Some(0.8));
                assert_eq!(record.model_state, model.state_dict());
                assert_eq!(record.optimizer_state, Some(opt.state()));
            }
            other => panic!("expected a full record, got {other:?}"),
        }
    }

    #[test]
    fn weights_only_resume_restarts_the_step_counter() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path());
        let model = net(1);
        let path = ckpt.save_weights("run", &model).unwrap();

        let mut fresh = net(2);
        let mut opt = Sgd::new(0.1, 0.9, 0.0);
        let mut state = TrainingState { global_step: 0, best_accuracy: None, epoch: 0 };
        let outcome = restore(&path, &mut fresh, &mut opt, &mut state, false).unwrap();

        assert_eq!(outcome, Restored::WeightsOnly);
        assert_eq!(fresh.state_dict(), model.state_dict());
        assert_eq!(state.global_step, 0);
        assert!(opt.state().momentum_buffers.is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"step\": 3, \"model_state\": [").unwrap();
        let err = CheckpointManager::load(&path).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointCorrupt { .. }));

        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(CheckpointManager::load(&path), Err(TrainError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn schema_mismatch_aborts_unless_partial_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path());
        let mut model = net(1);
        let opt = trained_optimizer(&mut model);
        let state = TrainingState { global_step: 7, ..TrainingState::default() };
        let path = ckpt.save_periodic(&state, &model, &opt).unwrap();

        let mut other = Network::new(
            vec![(5, 4, ActivationFunction::Gelu), (2, 5, ActivationFunction::Identity)],
            &mut StdRng::seed_from_u64(3),
        );
        let mut other_opt = Sgd::new(0.1, 0.9, 0.0);
        let mut other_state = TrainingState::default();
        let err = restore(&path, &mut other, &mut other_opt, &mut other_state, false).unwrap_err();
        assert!(matches!(err, TrainError::SchemaMismatch(_)));

        let outcome = restore(&path, &mut other, &mut other_opt, &mut other_state, true).unwrap();
        assert_eq!(outcome, Restored::WeightsOnly);
        assert_eq!(other_state.global_step, 0);
    }

    #[test]
    fn mismatched_momentum_buffers_are_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path());
        let mut model = net(1);
        let opt = trained_optimizer(&mut model);
        let state = TrainingState { global_step: 1, ..TrainingState::default() };
        let path = ckpt.save_periodic(&state, &model, &opt).unwrap();

        let mut record = match CheckpointManager::load(&path).unwrap() {
            LoadedCheckpoint::Full(record) => record,
            other => panic!("expected a full record, got {other:?}"),
        };
        let buffers = &mut record.optimizer_state.as_mut().unwrap().momentum_buffers;
        buffers.insert("layers.0.weight".into(), Tensor { shape: [1, 1], data: vec![0.0] });
        write_json(&path, &record).unwrap();

        let mut fresh = net(2);
        let mut fresh_opt = Sgd::new(0.1, 0.9, 1e-4);
        let mut fresh_state = TrainingState::default();
        let err = restore(&path, &mut fresh, &mut fresh_opt, &mut fresh_state, false).unwrap_err();
        match err {
            TrainError::SchemaMismatch(diff) => {
                assert_eq!(diff.shape_mismatches.len(), 1);
                assert_eq!(diff.shape_mismatches[0].0, "layers.0.weight");
            }
            other => panic!("expected a schema mismatch, got {other:?}"),
        }
        assert!(fresh_opt.state().momentum_buffers.is_empty());
        assert_eq!(fresh_state.global_step, 0);

        let outcome = restore(&path, &mut fresh, &mut fresh_opt, &mut fresh_state, true).unwrap();
        assert_eq!(outcome, Restored::WeightsOnly);
        assert_eq!(fresh_state.global_step, 0);
        assert_eq!(fresh.state_dict(), model.state_dict());

        let buffers = &mut record.optimizer_state.as_mut().unwrap().momentum_buffers;
        let misplaced = buffers.remove("layers.0.weight").unwrap();
        buffers.insert("layers.9.weight".into(), misplaced);
        write_json(&path, &record).unwrap();
        let mut other_opt = Sgd::new(0.1, 0.9, 1e-4);
        let err = restore(&path, &mut fresh, &mut other_opt, &mut TrainingState::default(), false).unwrap_err();
        assert!(matches!(err, TrainError::SchemaMismatch(ref d) if d.unexpected == ["layers.9.weight"]));
    }

    #[test]
    fn keep_last_prunes_oldest_periodic_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = manager(dir.path()).with_keep_last(Some(2));
        let mut model = net(1);
        let opt = trained_optimizer(&mut model);
        for step in [10, 20, 30] {
            let state = TrainingState { global_step: step, ..TrainingState::default() };
            ckpt.save_periodic(&state, &model, &opt).unwrap();
        }
        let steps: Vec<usize> = ckpt.periodic_checkpoints().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![20, 30]);

        let unbounded = manager(dir.path());
        let state = TrainingState { global_step: 40, ..TrainingState::default() };
        unbounded.save_periodic(&state, &model, &opt).unwrap();
        assert_eq!(unbounded.periodic_checkpoints().unwrap().len(), 3);
    }
}
