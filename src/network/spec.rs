use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::{Result, Stage, TrainError};

/// Describes one layer of a network architecture.
///
/// Fields:
/// - `size`       — number of neurons in this layer
/// - `input_size` — output size of the previous layer, or the flattened
///                  image size for the first layer
/// - `activation` — activation function applied after the linear transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub size: usize,
    pub input_size: usize,
    pub activation: ActivationFunction,
}

/// A serializable description of a classifier architecture, written next to
/// the checkpoints so a run's weights can be rebuilt later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Variant the layers were derived from.
    pub variant: ModelVariant,
    /// Ordered list of layer descriptions (input → logits).
    pub layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    /// Serializes the spec to a pretty-printed JSON file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| TrainError::io(Stage::CheckpointIo, path, e))?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| TrainError::stage(Stage::CheckpointIo, format!("{}: {e}", path.display())))
    }
}

/// Preset classifier sizes. Hidden layers use GELU; the head emits logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "dense-tiny")]
    DenseTiny,
    #[serde(rename = "dense-small")]
    DenseSmall,
    #[serde(rename = "dense-base")]
    DenseBase,
}

impl ModelVariant {
    pub const NAMES: [&'static str; 3] = ["dense-tiny", "dense-small", "dense-base"];

    pub fn hidden_sizes(&self) -> &'static [usize] {
        match self {
            ModelVariant::DenseTiny => &[128],
            ModelVariant::DenseSmall => &[512, 256],
            ModelVariant::DenseBase => &[1024, 512, 256],
        }
    }

    pub fn spec(&self, input_size: usize, num_classes: usize) -> NetworkSpec {
        let mut layers = Vec::new();
        let mut fan_in = input_size;
        for &size in self.hidden_sizes() {
            layers.push(LayerSpec { size, input_size: fan_in, activation: ActivationFunction::Gelu });
            fan_in = size;
        }
        layers.push(LayerSpec { size: num_classes, input_size: fan_in, activation: ActivationFunction::Identity });
        NetworkSpec { variant: *self, layers }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelVariant::DenseTiny => Self::NAMES[0],
            ModelVariant::DenseSmall => Self::NAMES[1],
            ModelVariant::DenseBase => Self::NAMES[2],
        };
        f.write_str(name)
    }
}

impl FromStr for ModelVariant {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense-tiny" => Ok(ModelVariant::DenseTiny),
            "dense-small" => Ok(ModelVariant::DenseSmall),
            "dense-base" => Ok(ModelVariant::DenseBase),
            other => Err(TrainError::Config(format!(
                "unknown model variant '{other}' (expected one of {:?})",
                Self::NAMES
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_spec_chains_layer_widths() {
        let spec = ModelVariant::DenseSmall.spec(48, 10);
        let widths: Vec<(usize, usize)> = spec.layers.iter().map(|l| (l.input_size, l.size)).collect();
        assert_eq!(widths, vec![(48, 512), (512, 256), (256, 10)]);
        assert_eq!(spec.layers.last().unwrap().activation, ActivationFunction::Identity);
    }

    #[test]
    fn variant_names_parse() {
        for name in ModelVariant::NAMES {
            assert_eq!(name.parse::<ModelVariant>().unwrap().to_string(), name);
        }
        assert!("ViT-B_16".parse::<ModelVariant>().is_err());
    }
}
