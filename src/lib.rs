pub mod math;
pub mod activation;
pub mod layers;
pub mod network;
pub mod loss;
pub mod optim;
pub mod error;
pub mod data;
pub mod precision;
pub mod distributed;
pub mod metrics;
pub mod checkpoint;
pub mod train;

// Convenience re-exports
pub use math::matrix::Matrix;
pub use activation::activation::ActivationFunction;
pub use layers::dense::Layer;
pub use network::model::Model;
pub use network::network::Network;
pub use optim::sgd::Sgd;
pub use error::{Result, Stage, TrainError};
pub use data::{BatchSource, DataLoader, Dataset};
pub use checkpoint::CheckpointManager;
pub use metrics::{evaluate, EvalResult, MetricsSink};
pub use train::{TrainConfig, TrainSummary, Trainer};
