use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferrite_train::network::spec::ModelVariant;
use ferrite_train::train::{load_datasets, run, DatasetName, DecayKind, RunHooks, TrainConfig};

/// Fine-tune an image classifier for a fixed number of optimizer steps.
///
/// Options given on the command line override the `--config` file, which in
/// turn overrides the built-in defaults.
#[derive(Parser, Debug)]
#[command(name = "ferrite-train", version)]
struct Args {
    /// JSON file with any subset of the training options.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Name of this run; prefixes the weight export and the metrics directory.
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    model_variant: Option<ModelVariant>,
    #[arg(long = "dataset")]
    dataset_name: Option<DatasetName>,
    /// Image-folder root with `train/` and `test/` class subfolders.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    pretrained_weights: Option<PathBuf>,
    /// Where best-accuracy checkpoints are written.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Where periodic checkpoints are written.
    #[arg(long)]
    every_checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    #[arg(long = "img-size")]
    image_resolution: Option<u32>,
    /// Total batch per optimizer step (split across accumulation steps).
    #[arg(long)]
    train_batch_size: Option<usize>,
    #[arg(long)]
    eval_batch_size: Option<usize>,
    /// Run validation every so many optimizer steps.
    #[arg(long)]
    eval_every: Option<usize>,
    /// Write a periodic checkpoint every so many optimizer steps (0 = never).
    #[arg(long)]
    save_every: Option<usize>,
    #[arg(long)]
    keep_last_periodic: Option<usize>,
    #[arg(long = "learning-rate")]
    base_learning_rate: Option<f64>,
    #[arg(long)]
    momentum: Option<f64>,
    #[arg(long)]
    weight_decay: Option<f64>,
    #[arg(long = "num-steps")]
    total_steps: Option<usize>,
    #[arg(long = "decay-type")]
    decay_kind: Option<DecayKind>,
    #[arg(long)]
    warmup_steps: Option<usize>,
    #[arg(long)]
    max_grad_norm: Option<f64>,
    /// Number of data-parallel workers to run.
    #[arg(long)]
    world_size: Option<usize>,
    #[arg(long = "seed")]
    random_seed: Option<u64>,
    #[arg(long = "gradient-accumulation-steps")]
    accumulation_factor: Option<usize>,
    /// Train with loss scaling in the half-precision range.
    #[arg(long = "fp16")]
    reduced_precision: bool,
    /// Fixed loss scale; dynamic scaling when omitted.
    #[arg(long = "loss-scale")]
    static_loss_scale: Option<f64>,
    /// Resume from a full checkpoint or load a bare state dict.
    #[arg(long = "resume")]
    resume_checkpoint_path: Option<PathBuf>,
    /// On a parameter layout mismatch, load what matches instead of aborting.
    #[arg(long)]
    allow_partial_resume: bool,
    #[arg(long)]
    eval_at_start: bool,
    #[arg(long, value_delimiter = ',')]
    top_k: Option<Vec<usize>>,
    #[arg(long)]
    sync_timeout_secs: Option<u64>,
}

macro_rules! overlay {
    ($config:ident, $args:ident, $($field:ident),+ $(,)?) => {
        $(if let Some(v) = $args.$field { $config.$field = v; })+
    };
}

impl Args {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => TrainConfig::default(),
        };
        let args = self;
        overlay!(
            config, args,
            name, model_variant, dataset_name, data_dir, output_dir, every_checkpoint_dir, logs_dir,
            image_resolution, train_batch_size, eval_batch_size, eval_every, save_every,
            base_learning_rate, momentum, weight_decay, total_steps, decay_kind, warmup_steps,
            max_grad_norm, world_size, random_seed, accumulation_factor, top_k, sync_timeout_secs,
        );
        if args.pretrained_weights.is_some() {
            config.pretrained_weights_path = args.pretrained_weights;
        }
        if args.keep_last_periodic.is_some() {
            config.keep_last_periodic = args.keep_last_periodic;
        }
        if args.static_loss_scale.is_some() {
            config.static_loss_scale = args.static_loss_scale;
        }
        if args.resume_checkpoint_path.is_some() {
            config.resume_checkpoint_path = args.resume_checkpoint_path;
        }
        config.reduced_precision_enabled |= args.reduced_precision;
        config.allow_partial_resume |= args.allow_partial_resume;
        config.eval_at_start |= args.eval_at_start;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config()?;
    config.validate().context("invalid training options")?;
    info!(?config, "training parameters");

    let (train, test) = load_datasets(&config).context("loading datasets")?;
    let summary = run(&config, train, test, RunHooks::default()).context("training failed")?;

    info!(
        step = summary.final_state.global_step,
        best_accuracy = ?summary.final_state.best_accuracy,
        reason = ?summary.reason,
        "end training"
    );
    Ok(())
}
