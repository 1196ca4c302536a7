use tracing::debug;

use crate::data::dataset::Batch;
use crate::distributed::collective::Collective;
use crate::error::{Result, TrainError};
use crate::layers::dense::Parameter;
use crate::math::matrix::Matrix;
use crate::network::model::Model;

/// Wraps a model for data-parallel training. Construction broadcasts the
/// primary worker's parameters so every replica starts identical;
/// `sync_gradients` averages gradient buffers across the group.
pub struct DataParallel<M, C> {
    module: M,
    collective: C,
}

fn flatten<'a>(params: impl Iterator<Item = &'a Matrix>) -> Vec<f64> {
    params.flat_map(|m| m.data.iter().flatten().copied()).collect()
}

fn scatter<'a>(flat: &[f64], targets: impl Iterator<Item = &'a mut Matrix>) {
    let mut offset = 0;
    for m in targets {
        let n = m.len();
        m.copy_from_flat(&flat[offset..offset + n]);
        offset += n;
    }
}

impl<M: Model, C: Collective> DataParallel<M, C> {
    pub fn new(mut module: M, collective: C) -> Result<Self> {
        if collective.world_size() > 1 {
            let mut flat = flatten(module.named_parameters().into_iter().map(|(_, p)| &p.value));
            collective.broadcast(&mut flat, 0).map_err(|e| sync_context(e, "parameter broadcast"))?;
            scatter(&flat, module.named_parameters_mut().into_iter().map(|(_, p)| &mut p.value));
            debug!(rank = collective.rank(), values = flat.len(), "replica parameters synchronized");
        }
        Ok(Self { module, collective })
    }

    /// Averages every gradient buffer across workers. Blocks until all
    /// workers arrive.
    pub fn sync_gradients(&mut self) -> Result<()> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }
        let mut flat = flatten(self.module.named_parameters().into_iter().map(|(_, p)| &p.grad));
        self.collective.all_reduce_mean(&mut flat).map_err(|e| sync_context(e, "gradient all-reduce"))?;
        scatter(&flat, self.module.named_parameters_mut().into_iter().map(|(_, p)| &mut p.grad));
        Ok(())
    }

    /// True on every worker when `local` is true on at least one of them.
    /// Lets workers agree to stop at the same window boundary.
    pub fn any_worker(&self, local: bool) -> Result<bool> {
        if self.collective.world_size() == 1 {
            return Ok(local);
        }
        let mut flag = [if local { 1.0 } else { 0.0 }];
        self.collective.all_reduce_mean(&mut flag).map_err(|e| sync_context(e, "stop agreement"))?;
        Ok(flag[0] > 0.0)
    }

    pub fn collective(&self) -> &C {
        &self.collective
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }
}

fn sync_context(err: TrainError, what: &str) -> TrainError {
    match err {
        TrainError::DistributedSync(reason) => TrainError::DistributedSync(format!("{what}: {reason}")),
        other => other,
    }
}

impl<M: Model, C: Collective> Model for DataParallel<M, C> {
    fn forward(&self, inputs: &Matrix) -> Result<Matrix> {
        self.module.forward(inputs)
    }

    fn accumulate_gradients(&mut self, batch: &Batch, grad_scale: f64) -> Result<f64> {
        self.module.accumulate_gradients(batch, grad_scale)
    }

    fn num_classes(&self) -> usize {
        self.module.num_classes()
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.module.named_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.module.named_parameters_mut()
    }
}
