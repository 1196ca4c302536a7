pub mod manager;
pub mod record;

pub use manager::{restore, CheckpointManager, Restored};
pub use record::{CheckpointRecord, LoadedCheckpoint};
