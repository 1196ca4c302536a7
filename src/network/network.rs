use rand::Rng;
use tracing::debug;

use crate::activation::activation::ActivationFunction;
use crate::data::dataset::Batch;
use crate::error::{Result, Stage, TrainError};
use crate::layers::dense::{Layer, Parameter};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::math::matrix::Matrix;
use crate::network::model::Model;
use crate::network::spec::NetworkSpec;
use crate::network::state_dict::StateDict;

/// Stack of dense layers ending in a logit head.
#[derive(Debug, Clone)]
pub struct Network {
    pub layers: Vec<Layer>,
}

impl Network {
    /// Builds a network from (size, input_size, activation) tuples.
    pub fn new<R: Rng + ?Sized>(layer_specs: Vec<(usize, usize, ActivationFunction)>, rng: &mut R) -> Network {
        let layers = layer_specs.into_iter()
            .map(|(size, input_size, activation)| Layer::new(size, input_size, activation, rng))
            .collect();
        Network { layers }
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &NetworkSpec, rng: &mut R) -> Network {
        Network::new(
            spec.layers.iter().map(|l| (l.size, l.input_size, l.activation)).collect(),
            rng,
        )
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_size)
    }

    fn head_prefix(&self) -> String {
        format!("layers.{}.", self.layers.len().saturating_sub(1))
    }

    /// Bootstraps from pretrained weights. Every tensor whose name and shape
    /// match is copied except the classification head, which is zeroed so
    /// fine-tuning starts from a neutral classifier. Returns how many
    /// tensors were copied.
    pub fn load_pretrained(&mut self, state: &StateDict) -> usize {
        let head = self.head_prefix();
        let mut copied = 0;
        for (name, param) in self.named_parameters_mut() {
            if name.starts_with(&head) {
                param.value.fill(0.0);
                continue;
            }
            if let Some(tensor) = state.get(&name) {
                if tensor.shape == param.value.shape() && tensor.data.len() == param.value.len() {
                    param.value.copy_from_flat(&tensor.data);
                    copied += 1;
                }
            }
        }
        debug!(copied, total = self.layers.len() * 2, "loaded pretrained weights (zero head)");
        copied
    }

    fn check_input(&self, inputs: &Matrix) -> Result<()> {
        if inputs.rows > 0 && inputs.cols != self.input_size() {
            return Err(TrainError::stage(
                Stage::Forward,
                format!("input has {} features, network expects {}", inputs.cols, self.input_size()),
            ));
        }
        Ok(())
    }
}

impl Model for Network {
    fn forward(&self, inputs: &Matrix) -> Result<Matrix> {
        self.check_input(inputs)?;
        let mut current = inputs.clone();
        for layer in &self.layers {
            current = layer.feed_from(&current);
        }
        Ok(current)
    }

    fn accumulate_gradients(&mut self, batch: &Batch, grad_scale: f64) -> Result<f64> {
        self.check_input(&batch.inputs)?;
        if batch.is_empty() {
            return Err(TrainError::stage(Stage::Forward, "empty batch"));
        }
        let classes = self.num_classes();
        if let Some(&bad) = batch.labels.iter().find(|&&l| l >= classes) {
            return Err(TrainError::stage(
                Stage::Forward,
                format!("label {bad} out of range for {classes} classes"),
            ));
        }

        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = batch.inputs.clone();
        for layer in &self.layers {
            let (a, cache) = layer.feed_with_cache(current);
            caches.push(cache);
            current = a;
        }

        let (loss, mut grad) = CrossEntropyLoss::batch(&current, &batch.labels);
        if !loss.is_finite() {
            return Err(TrainError::stage(Stage::Forward, format!("loss is {loss}")));
        }
        grad.scale(grad_scale);

        for i in (0..self.layers.len()).rev() {
            match self.layers[i].accumulate_gradients(&caches[i], &grad, i > 0) {
                Some(next) => grad = next,
                None => break,
            }
        }
        Ok(loss)
    }

    fn num_classes(&self) -> usize {
        self.layers.last().map_or(0, |l| l.size)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers.iter().enumerate()
            .flat_map(|(i, layer)| [
                (format!("layers.{i}.weight"), &layer.weights),
                (format!("layers.{i}.bias"), &layer.biases),
            ])
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.layers.iter_mut().enumerate()
            .flat_map(|(i, layer)| [
                (format!("layers.{i}.weight"), &mut layer.weights),
                (format!("layers.{i}.bias"), &mut layer.biases),
            ])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::spec::ModelVariant;
    use rand::{rngs::StdRng, SeedableRng};

    fn tiny(seed: u64) -> Network {
        Network::new(
            vec![(5, 3, ActivationFunction::Tanh), (2, 5, ActivationFunction::Identity)],
            &mut StdRng::seed_from_u64(seed),
        )
    }

    fn batch() -> Batch {
        Batch::new(vec![vec![0.3, -0.2, 0.9], vec![-0.7, 0.1, 0.4]], vec![1, 0]).unwrap()
    }

    #[test]
    fn backprop_matches_finite_differences() {
        let mut net = tiny(3);
        let b = batch();
        net.accumulate_gradients(&b, 1.0).unwrap();
        let analytic = net.layers[0].weights.grad.data[1][2];

        let h = 1e-6;
        let loss_at = |delta: f64| {
            let mut probe = net.clone();
            probe.layers[0].weights.value.data[1][2] += delta;
            let logits = probe.forward(&b.inputs).unwrap();
            CrossEntropyLoss::batch(&logits, &b.labels).0
        };
        let numeric = (loss_at(h) - loss_at(-h)) / (2.0 * h);
        assert!((numeric - analytic).abs() < 1e-6, "{numeric} vs {analytic}");
    }

    #[test]
    fn grad_scale_multiplies_gradients() {
        let mut plain = tiny(4);
        let mut scaled = tiny(4);
        let l1 = plain.accumulate_gradients(&batch(), 1.0).unwrap();
        let l2 = scaled.accumulate_gradients(&batch(), 8.0).unwrap();
        assert_eq!(l1, l2);
        let g1 = plain.layers[1].biases.grad.data[0][0];
        let g2 = scaled.layers[1].biases.grad.data[0][0];
        assert!((g2 - 8.0 * g1).abs() < 1e-12);
    }

    #[test]
    fn wrong_input_width_is_a_forward_error() {
        let net = tiny(5);
        let err = net.forward(&Matrix::zeros(1, 4)).unwrap_err();
        assert!(err.to_string().starts_with("forward failed"));
    }

    #[test]
    fn strict_load_rejects_foreign_layout() {
        let mut net = tiny(6);
        let other = Network::from_spec(&ModelVariant::DenseTiny.spec(3, 2), &mut StdRng::seed_from_u64(0));
        let err = net.load_state_dict(&other.state_dict(), true).unwrap_err();
        assert!(matches!(err, TrainError::SchemaMismatch(_)));

        let diff = net.load_state_dict(&other.state_dict(), false).unwrap();
        assert_eq!(diff.shape_mismatches.len(), 3);
        assert!(diff.missing.is_empty());
    }

    #[test]
    fn pretrained_bootstrap_zeroes_head() {
        let source = tiny(7);
        let mut net = tiny(8);
        assert_eq!(net.load_pretrained(&source.state_dict()), 2);
        assert_eq!(net.layers[0].weights.value, source.layers[0].weights.value);
        assert_eq!(net.layers[1].weights.value.sum_of_squares(), 0.0);
        assert_eq!(net.layers[1].biases.value.sum_of_squares(), 0.0);
    }
}
