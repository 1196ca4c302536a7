pub mod dataset;
pub mod image_folder;
pub mod loader;

pub use dataset::{Batch, Dataset};
pub use image_folder::load_image_folder;
pub use loader::{BatchSource, DataLoader};
