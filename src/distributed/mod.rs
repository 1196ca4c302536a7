pub mod collective;
pub mod data_parallel;

pub use collective::{Collective, LocalCollective, LocalGroup, SingleProcess};
pub use data_parallel::DataParallel;
