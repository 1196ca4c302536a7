use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::checkpoint::manager::CheckpointManager;
use crate::data::dataset::Dataset;
use crate::data::image_folder::load_image_folder;
use crate::data::loader::DataLoader;
use crate::distributed::collective::{Collective, LocalGroup, SingleProcess};
use crate::error::{Result, Stage, TrainError};
use crate::metrics::sink::JsonlSink;
use crate::network::model::Model;
use crate::network::network::Network;
use crate::train::config::TrainConfig;
use crate::train::state::TrainSummary;
use crate::train::step_stats::StepStats;
use crate::train::trainer::Trainer;

/// Loads `<data_dir>/train` and `<data_dir>/test` and checks both against
/// the configured class count.
pub fn load_datasets(config: &TrainConfig) -> Result<(Arc<Dataset>, Arc<Dataset>)> {
    let train = load_image_folder(&config.data_dir.join("train"), config.image_resolution)?;
    let test = load_image_folder(&config.data_dir.join("test"), config.image_resolution)?;
    for (split, data) in [("train", &train), ("test", &test)] {
        if data.num_classes != config.num_classes() {
            return Err(TrainError::Config(format!(
                "{split} split has {} class folders but {} expects {}",
                data.num_classes,
                config.dataset_name,
                config.num_classes()
            )));
        }
    }
    Ok((Arc::new(train), Arc::new(test)))
}

/// Builds the configured variant with seeded initialization and, when a
/// pretrained state dict is configured, bootstraps from it with a zeroed
/// head.
pub fn build_model(config: &TrainConfig, input_size: usize) -> Result<Network> {
    let spec = config.model_variant.spec(input_size, config.num_classes());
    let mut network = Network::from_spec(&spec, &mut StdRng::seed_from_u64(config.random_seed));
    if let Some(path) = &config.pretrained_weights_path {
        let pretrained = CheckpointManager::load(path)?;
        let copied = network.load_pretrained(pretrained.model_state());
        if config.worker_rank == 0 {
            info!(path = %path.display(), tensors = copied, "bootstrapped from pretrained weights");
        }
    }
    Ok(network)
}

/// Options for `run` that do not belong in a config file.
#[derive(Default)]
pub struct RunHooks {
    pub stop_flag: Option<Arc<AtomicBool>>,
    /// Receives the primary worker's per-step statistics.
    pub progress: Option<mpsc::Sender<StepStats>>,
}

fn run_worker<C: Collective>(
    config: TrainConfig,
    collective: C,
    train: Arc<Dataset>,
    test: Arc<Dataset>,
    hooks: &RunHooks,
) -> Result<TrainSummary> {
    let rank = collective.rank();
    let world = collective.world_size();
    let model = build_model(&config, train.feature_count())?;
    let mut trainer = Trainer::new(model, collective, config.clone())?;

    if let Some(flag) = &hooks.stop_flag {
        trainer = trainer.with_stop_flag(flag.clone());
    }
    if trainer.is_primary() {
        let spec = config.model_variant.spec(train.feature_count(), config.num_classes());
        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| TrainError::io(Stage::CheckpointIo, &config.output_dir, e))?;
        spec.save_json(&config.output_dir.join(format!("{}_spec.json", config.name)))?;
        info!(
            variant = %config.model_variant,
            dataset = %config.dataset_name,
            parameters = trainer.model().parameter_count(),
            "model ready"
        );

        trainer = trainer
            .with_checkpoints(
                CheckpointManager::new(&config.every_checkpoint_dir, &config.output_dir)
                    .with_keep_last(config.keep_last_periodic),
            )
            .with_sink(Box::new(JsonlSink::create(&config.metrics_dir())?));
        if let Some(tx) = &hooks.progress {
            trainer = trainer.with_progress(tx.clone());
        }
    }

    let train_loader = DataLoader::new(train, config.micro_batch_size())
        .shuffled(config.random_seed)
        .sharded(rank, world);
    let eval_loader = DataLoader::new(test, config.eval_batch_size);
    trainer.fit(&train_loader, &eval_loader)
}

fn is_sync_failure(err: &TrainError) -> bool {
    matches!(
        err,
        TrainError::DistributedSync(_) | TrainError::Stage { stage: Stage::Synchronization, .. }
    )
}

/// Runs `config.world_size` data-parallel workers (threads when more than
/// one) and returns the primary worker's summary.
///
/// When workers fail, the first error that is not a knock-on
/// synchronization failure is reported.
pub fn run(config: &TrainConfig, train: Arc<Dataset>, test: Arc<Dataset>, hooks: RunHooks) -> Result<TrainSummary> {
    config.validate()?;
    if config.world_size == 1 {
        return run_worker(config.for_rank(0), SingleProcess, train, test, &hooks);
    }

    let group = LocalGroup::new(config.world_size, Duration::from_secs(config.sync_timeout_secs));
    let hooks = &hooks;
    let results: Vec<Result<TrainSummary>> = thread::scope(|s| {
        let handles: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, collective)| {
                let worker_config = config.for_rank(rank);
                let (train, test) = (train.clone(), test.clone());
                thread::Builder::new()
                    .name(format!("worker-{rank}"))
                    .spawn_scoped(s, move || run_worker(worker_config, collective, train, test, hooks))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(h) => h.join().unwrap_or_else(|_| {
                    Err(TrainError::DistributedSync(format!("worker {rank} panicked")))
                }),
                Err(e) => Err(TrainError::stage(Stage::Synchronization, format!("spawning worker {rank}: {e}"))),
            })
            .collect()
    });

    let mut primary = None;
    let mut errors = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(summary) if rank == 0 => primary = Some(summary),
            Ok(_) => {}
            Err(e) => {
                warn!(rank, error = %e, "worker failed");
                errors.push(e);
            }
        }
    }
    if !errors.is_empty() {
        let root = errors.iter().position(|e| !is_sync_failure(e)).unwrap_or(0);
        return Err(errors.swap_remove(root));
    }
    primary.ok_or_else(|| TrainError::DistributedSync("primary worker produced no summary".into()))
}
