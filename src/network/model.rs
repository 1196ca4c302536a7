use crate::data::dataset::Batch;
use crate::error::{Result, SchemaDiff, TrainError};
use crate::layers::dense::Parameter;
use crate::math::matrix::Matrix;
use crate::network::state_dict::{StateDict, Tensor};

/// What the training loop needs from a classifier.
///
/// `forward` takes `&self`: evaluation runs against a frozen view of the
/// parameters and cannot disturb gradient state. Training goes through
/// `accumulate_gradients`, which adds into the parameter gradient buffers
/// and never clears them; clearing is `zero_grad`'s job.
pub trait Model {
    /// Logits, one row per input row.
    fn forward(&self, inputs: &Matrix) -> Result<Matrix>;

    /// Forward + backward for one micro-batch. Gradients of
    /// `grad_scale * mean_loss` are added into the parameter buffers.
    /// Returns the unscaled mean loss.
    fn accumulate_gradients(&mut self, batch: &Batch, grad_scale: f64) -> Result<f64>;

    fn num_classes(&self) -> usize;

    fn named_parameters(&self) -> Vec<(String, &Parameter)>;

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)>;

    fn zero_grad(&mut self) {
        for (_, p) in self.named_parameters_mut() {
            p.zero_grad();
        }
    }

    fn parameter_count(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.value.len()).sum()
    }

    fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, Tensor::from_matrix(&p.value)))
            .collect()
    }

    /// Copies tensors from `state` into the model.
    ///
    /// With `strict`, any missing key, unexpected key or shape mismatch fails
    /// with `SchemaMismatch` and nothing is loaded. Otherwise every tensor
    /// whose name and shape match is copied and the differences are returned.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<SchemaDiff> {
        let diff = schema_diff(&self.state_dict(), state);
        if strict && !diff.is_empty() {
            return Err(TrainError::SchemaMismatch(diff));
        }
        for (name, param) in self.named_parameters_mut() {
            if let Some(tensor) = state.get(&name) {
                if tensor.shape == param.value.shape() && tensor.data.len() == param.value.len() {
                    param.value.copy_from_flat(&tensor.data);
                }
            }
        }
        Ok(diff)
    }
}

/// Compares the key layout of `ours` against `theirs`.
pub fn schema_diff(ours: &StateDict, theirs: &StateDict) -> SchemaDiff {
    let mut diff = SchemaDiff::default();
    for (name, tensor) in ours {
        match theirs.get(name) {
            None => diff.missing.push(name.clone()),
            Some(other) if other.shape != tensor.shape || other.data.len() != tensor.data.len() => {
                diff.shape_mismatches.push((name.clone(), tensor.shape, other.shape));
            }
            Some(_) => {}
        }
    }
    diff.unexpected = theirs.keys().filter(|k| !ours.contains_key(*k)).cloned().collect();
    diff
}

/// Index of the maximum element in a slice; first index wins ties.
pub fn argmax(v: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if x > v[best] {
            best = i;
        }
    }
    best
}
