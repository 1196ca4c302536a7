pub mod model;
pub mod network;
pub mod spec;
pub mod state_dict;

pub use model::{argmax, Model};
pub use network::Network;
pub use spec::{LayerSpec, ModelVariant, NetworkSpec};
pub use state_dict::{StateDict, Tensor};
