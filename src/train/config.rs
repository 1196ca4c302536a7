use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Stage, TrainError};
use crate::network::spec::ModelVariant;
use crate::train::scheduler::DecayKind;

/// Downstream task; selects the class count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetName {
    Cifar10,
    Cifar100,
    Stanford40,
}

impl DatasetName {
    pub const NAMES: [&'static str; 3] = ["cifar10", "cifar100", "stanford40"];

    pub fn num_classes(&self) -> usize {
        match self {
            DatasetName::Cifar10 => 10,
            DatasetName::Stanford40 => 40,
            DatasetName::Cifar100 => 100,
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetName::Cifar10 => "cifar10",
            DatasetName::Cifar100 => "cifar100",
            DatasetName::Stanford40 => "stanford40",
        };
        f.write_str(name)
    }
}

impl FromStr for DatasetName {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cifar10" => Ok(DatasetName::Cifar10),
            "cifar100" => Ok(DatasetName::Cifar100),
            "stanford40" => Ok(DatasetName::Stanford40),
            other => Err(TrainError::Config(format!(
                "unknown dataset '{other}', expected one of {}",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

/// Everything a training run is parameterized by.
///
/// `train_batch_size` is the total batch per optimizer step on one worker;
/// each micro-batch holds `train_batch_size / accumulation_factor` samples.
/// Directories are created on demand by the primary worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Run name: prefixes the final weight export and the metrics directory.
    pub name: String,
    pub model_variant: ModelVariant,
    pub dataset_name: DatasetName,
    /// Image-folder root with `train/` and `test/` class subfolders.
    pub data_dir: PathBuf,
    pub pretrained_weights_path: Option<PathBuf>,
    /// Best-accuracy snapshots and the final weight export.
    pub output_dir: PathBuf,
    /// Periodic snapshots.
    pub every_checkpoint_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub image_resolution: u32,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    /// Evaluate every this many optimizer steps.
    pub eval_every: usize,
    /// Periodic snapshot interval in optimizer steps; 0 disables them.
    pub save_every: usize,
    pub keep_last_periodic: Option<usize>,
    pub base_learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub total_steps: usize,
    pub decay_kind: DecayKind,
    pub warmup_steps: usize,
    pub max_grad_norm: f64,
    pub worker_rank: usize,
    pub world_size: usize,
    pub random_seed: u64,
    pub accumulation_factor: usize,
    pub reduced_precision_enabled: bool,
    pub initial_loss_scale: f64,
    /// Pins the loss scale when set; otherwise the scale is dynamic.
    pub static_loss_scale: Option<f64>,
    pub resume_checkpoint_path: Option<PathBuf>,
    pub allow_partial_resume: bool,
    pub eval_at_start: bool,
    pub top_k: Vec<usize>,
    pub sync_timeout_secs: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            name: "run".to_string(),
            model_variant: ModelVariant::DenseSmall,
            dataset_name: DatasetName::Cifar10,
            data_dir: PathBuf::from("data"),
            pretrained_weights_path: None,
            output_dir: PathBuf::from("output/best"),
            every_checkpoint_dir: PathBuf::from("output/every"),
            logs_dir: PathBuf::from("logs"),
            image_resolution: 32,
            train_batch_size: 512,
            eval_batch_size: 64,
            eval_every: 100,
            save_every: 0,
            keep_last_periodic: None,
            base_learning_rate: 3e-2,
            momentum: 0.9,
            weight_decay: 0.0,
            total_steps: 10_000,
            decay_kind: DecayKind::Cosine,
            warmup_steps: 500,
            max_grad_norm: 1.0,
            worker_rank: 0,
            world_size: 1,
            random_seed: 42,
            accumulation_factor: 1,
            reduced_precision_enabled: false,
            initial_loss_scale: 1_048_576.0,
            static_loss_scale: None,
            resume_checkpoint_path: None,
            allow_partial_resume: false,
            eval_at_start: false,
            top_k: vec![1, 5],
            sync_timeout_secs: 3600,
        }
    }
}

impl TrainConfig {
    /// Reads a JSON config; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| TrainError::io(Stage::DataLoad, path, e))?;
        serde_json::from_str(&text).map_err(|e| TrainError::Config(format!("{}: {e}", path.display())))
    }

    pub fn num_classes(&self) -> usize {
        self.dataset_name.num_classes()
    }

    pub fn micro_batch_size(&self) -> usize {
        self.train_batch_size / self.accumulation_factor.max(1)
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.logs_dir.join(&self.name)
    }

    /// Copy of this config for worker `rank`.
    pub fn for_rank(&self, rank: usize) -> Self {
        TrainConfig { worker_rank: rank, ..self.clone() }
    }

    /// Rejects option combinations no run could start from.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TrainError::Config(msg));
        if self.name.trim().is_empty() {
            return fail("name must not be empty".into());
        }
        if self.total_steps == 0 {
            return fail("total_steps must be positive".into());
        }
        if self.warmup_steps > self.total_steps {
            return fail(format!(
                "warmup_steps ({}) exceeds total_steps ({})",
                self.warmup_steps, self.total_steps
            ));
        }
        if self.eval_every == 0 {
            return fail("eval_every must be positive".into());
        }
        if self.accumulation_factor == 0 {
            return fail("accumulation_factor must be at least 1".into());
        }
        if self.train_batch_size < self.accumulation_factor {
            return fail(format!(
                "train_batch_size ({}) is smaller than accumulation_factor ({})",
                self.train_batch_size, self.accumulation_factor
            ));
        }
        if self.eval_batch_size == 0 {
            return fail("eval_batch_size must be positive".into());
        }
        if self.image_resolution == 0 {
            return fail("image_resolution must be positive".into());
        }
        if !(self.base_learning_rate >= 0.0 && self.base_learning_rate.is_finite()) {
            return fail(format!("base_learning_rate must be a non-negative number, got {}", self.base_learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return fail(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if self.weight_decay < 0.0 {
            return fail(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if !(self.max_grad_norm > 0.0) {
            return fail(format!("max_grad_norm must be positive, got {}", self.max_grad_norm));
        }
        if self.world_size == 0 {
            return fail("world_size must be at least 1".into());
        }
        if self.worker_rank >= self.world_size {
            return fail(format!(
                "worker_rank {} outside a world of {}",
                self.worker_rank, self.world_size
            ));
        }
        if self.initial_loss_scale < 1.0 {
            return fail(format!("initial_loss_scale must be at least 1, got {}", self.initial_loss_scale));
        }
        if matches!(self.static_loss_scale, Some(s) if !(s > 0.0)) {
            return fail("static_loss_scale must be positive".into());
        }
        if self.keep_last_periodic == Some(0) {
            return fail("keep_last_periodic must be at least 1 when set".into());
        }
        if self.top_k.iter().any(|&k| k == 0) {
            return fail("top_k entries must be positive".into());
        }
        if self.sync_timeout_secs == 0 {
            return fail("sync_timeout_secs must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_classes(), 10);
        assert_eq!(config.micro_batch_size(), 512);
    }

    #[test]
    fn dataset_names_select_class_counts() {
        assert_eq!("stanford40".parse::<DatasetName>().unwrap().num_classes(), 40);
        assert_eq!("cifar100".parse::<DatasetName>().unwrap().num_classes(), 100);
        assert!(matches!("imagenet".parse::<DatasetName>(), Err(TrainError::Config(_))));
    }

    #[test]
    fn micro_batch_divides_total_batch() {
        let config = TrainConfig { train_batch_size: 512, accumulation_factor: 4, ..TrainConfig::default() };
        assert_eq!(config.micro_batch_size(), 128);
    }

    #[test]
    fn invalid_options_are_config_errors() {
        let bad = [
            TrainConfig { total_steps: 0, ..TrainConfig::default() },
            TrainConfig { eval_every: 0, ..TrainConfig::default() },
            TrainConfig { accumulation_factor: 0, ..TrainConfig::default() },
            TrainConfig { train_batch_size: 2, accumulation_factor: 4, ..TrainConfig::default() },
            TrainConfig { warmup_steps: 20_000, ..TrainConfig::default() },
            TrainConfig { max_grad_norm: 0.0, ..TrainConfig::default() },
            TrainConfig { worker_rank: 2, world_size: 2, ..TrainConfig::default() },
            TrainConfig { base_learning_rate: -1.0, ..TrainConfig::default() },
            TrainConfig { static_loss_scale: Some(0.0), ..TrainConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(TrainError::Config(_))), "{config:?}");
        }
    }

    #[test]
    fn json_overlay_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"name": "vit", "dataset_name": "stanford40", "decay_kind": "linear"}"#).unwrap();
        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.name, "vit");
        assert_eq!(config.num_classes(), 40);
        assert_eq!(config.decay_kind, DecayKind::Linear);
        assert_eq!(config.total_steps, 10_000);
    }
}
