use rand::Rng;

use crate::{math::matrix::Matrix, activation::activation::ActivationFunction};

/// A trainable tensor and its accumulated gradient (same shape).
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Matrix,
    pub grad: Matrix,
}

impl Parameter {
    pub fn new(value: Matrix) -> Parameter {
        let grad = Matrix::zeros(value.rows, value.cols);
        Parameter { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// Fully connected layer: `a = act(x · W + b)` over a batch of rows.
#[derive(Debug, Clone)]
pub struct Layer {
    pub size: usize,
    pub weights: Parameter,
    pub biases: Parameter,
    pub activator: ActivationFunction,
}

/// Values kept from a training forward pass for the backward pass.
pub struct LayerCache {
    pub input: Matrix,
    pub pre_activation: Matrix,
}

impl Layer {
    pub fn new<R: Rng + ?Sized>(
        size: usize,
        input_size: usize,
        activation: ActivationFunction,
        rng: &mut R,
    ) -> Layer {
        let weights = match activation {
            ActivationFunction::ReLU | ActivationFunction::Gelu => Matrix::he(input_size, size, rng),
            ActivationFunction::Identity | ActivationFunction::Tanh => Matrix::xavier(input_size, size, rng),
        };

        Layer {
            size,
            weights: Parameter::new(weights),
            biases: Parameter::new(Matrix::zeros(1, size)),
            activator: activation,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.value.rows
    }

    /// Inference forward pass; leaves the layer untouched.
    pub fn feed_from(&self, input: &Matrix) -> Matrix {
        let z = input.matmul(&self.weights.value).add_row(&self.biases.value);
        z.map(|x| self.activator.function(x))
    }

    /// Training forward pass; returns activations plus what backprop needs.
    pub fn feed_with_cache(&self, input: Matrix) -> (Matrix, LayerCache) {
        let z = input.matmul(&self.weights.value).add_row(&self.biases.value);
        let a = z.map(|x| self.activator.function(x));
        (a, LayerCache { input, pre_activation: z })
    }

    /// Adds this layer's gradients for `grad_output` (∂L/∂a) into the
    /// parameter buffers and returns ∂L/∂input when `propagate` is set.
    pub fn accumulate_gradients(
        &mut self,
        cache: &LayerCache,
        grad_output: &Matrix,
        propagate: bool,
    ) -> Option<Matrix> {
        let act_derivative = cache.pre_activation.map(|x| self.activator.derivative(x));
        // δ = error ⊙ σ'(z)
        let delta = grad_output.hadamard(&act_derivative);

        let weights_grad = cache.input.transpose().matmul(&delta);
        self.weights.grad.add_scaled(&weights_grad, 1.0);
        self.biases.grad.add_scaled(&delta.sum_rows(), 1.0);

        if propagate {
            Some(delta.matmul(&self.weights.value.transpose()))
        } else {
            None
        }
    }

    pub fn zero_grad(&mut self) {
        self.weights.zero_grad();
        self.biases.zero_grad();
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.value.len() + self.biases.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn gradients_accumulate_across_calls() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Layer::new(2, 3, ActivationFunction::Identity, &mut rng);
        let input = Matrix::from_data(vec![vec![1.0, 2.0, 3.0]]);
        let (_, cache) = layer.feed_with_cache(input.clone());
        let grad_out = Matrix::from_data(vec![vec![1.0, -1.0]]);

        layer.accumulate_gradients(&cache, &grad_out, false);
        let once = layer.weights.grad.clone();
        layer.accumulate_gradients(&cache, &grad_out, false);

        assert_eq!(once.data[2], vec![3.0, -3.0]);
        assert_eq!(layer.weights.grad.data[2], vec![6.0, -6.0]);
        assert_eq!(layer.biases.grad.data[0], vec![2.0, -2.0]);

        layer.zero_grad();
        assert_eq!(layer.weights.grad.sum_of_squares(), 0.0);
    }

    #[test]
    fn inference_matches_training_forward() {
        let mut rng = StdRng::seed_from_u64(2);
        let layer = Layer::new(4, 3, ActivationFunction::Gelu, &mut rng);
        let input = Matrix::from_data(vec![vec![0.5, -0.5, 1.0], vec![0.0, 0.2, -1.0]]);
        let (a, _) = layer.feed_with_cache(input.clone());
        assert_eq!(a, layer.feed_from(&input));
    }
}
