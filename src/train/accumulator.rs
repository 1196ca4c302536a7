use crate::data::dataset::Batch;
use crate::error::Result;
use crate::network::model::Model;

/// Decouples "micro-batch processed" from "optimizer step taken".
///
/// Each `observe` runs forward + backward with the loss scaled by
/// `1 / accumulation_factor`, so a full window's gradients equal the
/// gradient of the mean loss over the window. The window is never flushed
/// early: a partial window left at the end of a data pass is completed by
/// the first micro-batches of the next pass.
#[derive(Debug, Clone)]
pub struct GradientAccumulator {
    accumulation_factor: usize,
    batches_seen_in_window: usize,
    window_loss_sum: f64,
}

impl GradientAccumulator {
    pub fn new(accumulation_factor: usize) -> Self {
        Self {
            accumulation_factor: accumulation_factor.max(1),
            batches_seen_in_window: 0,
            window_loss_sum: 0.0,
        }
    }

    pub fn accumulation_factor(&self) -> usize {
        self.accumulation_factor
    }

    /// Micro-batches observed since the last completed window.
    pub fn pending(&self) -> usize {
        self.batches_seen_in_window
    }

    /// Runs forward + backward for one micro-batch. `loss_scale` comes from
    /// the precision scaler (1.0 when reduced precision is off). Returns the
    /// unscaled micro-batch loss.
    pub fn observe<M: Model + ?Sized>(&mut self, model: &mut M, batch: &Batch, loss_scale: f64) -> Result<f64> {
        let loss = model.accumulate_gradients(batch, loss_scale / self.accumulation_factor as f64)?;
        self.batches_seen_in_window += 1;
        self.window_loss_sum += loss;
        Ok(loss)
    }

    pub fn window_complete(&self) -> bool {
        self.batches_seen_in_window == self.accumulation_factor
    }

    /// Closes a completed window and returns its mean micro-batch loss.
    pub fn finish_window(&mut self) -> f64 {
        let mean = self.window_loss_sum / self.batches_seen_in_window.max(1) as f64;
        self.batches_seen_in_window = 0;
        self.window_loss_sum = 0.0;
        mean
    }
}
