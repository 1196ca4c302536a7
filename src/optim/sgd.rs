use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaDiff, Stage, TrainError};
use crate::math::matrix::Matrix;
use crate::network::model::Model;
use crate::network::state_dict::Tensor;

/// Serializable optimizer state: hyperparameters plus momentum buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub momentum_buffers: BTreeMap<String, Tensor>,
}

/// SGD with momentum and L2 weight decay:
///
/// ```text
/// d   = g + weight_decay * p
/// buf = momentum * buf + d        (buf = d on the first update)
/// p  -= lr * buf
/// ```
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    buffers: BTreeMap<String, Matrix>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64, weight_decay: f64) -> Sgd {
        Sgd { learning_rate, momentum, weight_decay, buffers: BTreeMap::new() }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Applies one update to every parameter from its accumulated gradient.
    pub fn step<M: Model + ?Sized>(&mut self, model: &mut M) {
        let lr = self.learning_rate;
        for (name, param) in model.named_parameters_mut() {
            let mut d = param.grad.clone();
            if self.weight_decay != 0.0 {
                d.add_scaled(&param.value, self.weight_decay);
            }
            let update = if self.momentum != 0.0 {
                match self.buffers.get_mut(&name) {
                    Some(buf) => {
                        buf.scale(self.momentum);
                        buf.add_scaled(&d, 1.0);
                        buf.clone()
                    }
                    None => {
                        self.buffers.insert(name, d.clone());
                        d
                    }
                }
            } else {
                d
            };
            param.value.add_scaled(&update, -lr);
        }
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            momentum_buffers: self.buffers.iter()
                .map(|(name, buf)| (name.clone(), Tensor::from_matrix(buf)))
                .collect(),
        }
    }

    /// Restores momentum buffers for `model`'s parameters. The configured
    /// momentum and weight decay stay in force; the learning rate is
    /// recomputed by the schedule.
    ///
    /// Every buffer must name a parameter of `model` and match its shape,
    /// otherwise nothing is loaded and `SchemaMismatch` is returned. A
    /// parameter without a buffer starts a fresh one on its next update.
    pub fn load_state<M: Model + ?Sized>(&mut self, state: &OptimizerState, model: &M) -> Result<()> {
        let shapes: BTreeMap<String, [usize; 2]> = model
            .named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.value.shape()))
            .collect();

        let mut diff = SchemaDiff::default();
        let mut buffers = BTreeMap::new();
        for (name, tensor) in &state.momentum_buffers {
            let buf = tensor.to_matrix().ok_or_else(|| {
                TrainError::stage(Stage::CheckpointIo, format!("momentum buffer '{name}' does not fill its shape"))
            })?;
            match shapes.get(name) {
                None => diff.unexpected.push(name.clone()),
                Some(&expected) if expected != buf.shape() => {
                    diff.shape_mismatches.push((name.clone(), expected, buf.shape()));
                }
                Some(_) => {
                    buffers.insert(name.clone(), buf);
                }
            }
        }
        if !diff.is_empty() {
            return Err(TrainError::SchemaMismatch(diff));
        }
        self.buffers = buffers;
        self.learning_rate = state.learning_rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::activation::ActivationFunction;
    use crate::network::network::Network;
    use rand::{rngs::StdRng, SeedableRng};

    fn one_weight() -> Network {
        let mut net = Network::new(vec![(1, 1, ActivationFunction::Identity)], &mut StdRng::seed_from_u64(0));
        net.layers[0].weights.value.data[0][0] = 1.0;
        net
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let mut net = one_weight();
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);

        net.layers[0].weights.grad.data[0][0] = 1.0;
        sgd.step(&mut net);
        assert!((net.layers[0].weights.value.data[0][0] - 0.9).abs() < 1e-12);

        // buf = 0.9 * 1 + 1 = 1.9
        sgd.step(&mut net);
        assert!((net.layers[0].weights.value.data[0][0] - (0.9 - 0.19)).abs() < 1e-12);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut net = one_weight();
        let mut sgd = Sgd::new(0.5, 0.0, 0.1);
        sgd.step(&mut net);
        assert!((net.layers[0].weights.value.data[0][0] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn restored_buffers_continue_the_trajectory() {
        let mut a = one_weight();
        let mut sgd_a = Sgd::new(0.1, 0.9, 0.0);
        a.layers[0].weights.grad.data[0][0] = 1.0;
        sgd_a.step(&mut a);

        let mut b = a.clone();
        let mut sgd_b = Sgd::new(0.1, 0.9, 0.0);
        sgd_b.load_state(&sgd_a.state(), &b).unwrap();

        sgd_a.step(&mut a);
        sgd_b.step(&mut b);
        assert_eq!(a.layers[0].weights.value, b.layers[0].weights.value);
    }
}
