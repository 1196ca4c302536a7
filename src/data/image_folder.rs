use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::data::dataset::Dataset;
use crate::error::{Result, Stage, TrainError};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// Decodes image bytes, resizes to `resolution × resolution`, and flattens
/// as R, G, B, ... normalized with mean 0.5 / std 0.5 into [-1, 1].
pub fn image_bytes_to_rgb_input(bytes: &[u8], resolution: u32) -> std::result::Result<Vec<f64>, String> {
    let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let resized = img.resize_exact(resolution, resolution, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();
    Ok(rgb.pixels()
        .flat_map(|p| p.0.iter().map(|&c| (c as f64 / 255.0 - 0.5) / 0.5))
        .collect())
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let read = std::fs::read_dir(dir).map_err(|e| TrainError::io(Stage::DataLoad, dir, e))?;
    let mut paths = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| TrainError::io(Stage::DataLoad, dir, e))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Loads a `root/<class>/<image>` tree. Class indices follow the sorted
/// folder names; files without an image extension are ignored.
pub fn load_image_folder(root: &Path, resolution: u32) -> Result<Dataset> {
    let class_dirs: Vec<PathBuf> = sorted_entries(root)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();
    if class_dirs.is_empty() {
        return Err(TrainError::stage(
            Stage::DataLoad,
            format!("{} contains no class folders", root.display()),
        ));
    }

    let mut samples = Vec::new();
    let mut labels = Vec::new();
    let mut class_names = Vec::with_capacity(class_dirs.len());

    for (class_idx, dir) in class_dirs.iter().enumerate() {
        class_names.push(dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
        let mut count = 0usize;
        for path in sorted_entries(dir)?.into_iter().filter(|p| is_image(p)) {
            let bytes = std::fs::read(&path).map_err(|e| TrainError::io(Stage::DataLoad, &path, e))?;
            let input = image_bytes_to_rgb_input(&bytes, resolution).map_err(|e| {
                TrainError::stage(Stage::DataLoad, format!("{}: {e}", path.display()))
            })?;
            samples.push(input);
            labels.push(class_idx);
            count += 1;
        }
        debug!(class = %class_names[class_idx], images = count, "loaded class folder");
    }

    info!(
        root = %root.display(),
        classes = class_names.len(),
        images = samples.len(),
        resolution,
        "loaded image folder"
    );
    Ok(Dataset::new(samples, labels, class_dirs.len())?.with_class_names(class_names))
}
