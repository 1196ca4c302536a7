//! Loss scaling for reduced-precision training.
//!
//! Gradients are computed for `loss_scale * loss` so small values survive a
//! narrow float format, then divided back before clipping. Overflow in the
//! scaled gradients means the step must be skipped.

use tracing::warn;

use crate::error::{Result, TrainError};
use crate::network::model::Model;

/// Largest finite value of IEEE half precision.
pub const HALF_MAX: f64 = 65504.0;

pub trait GradScaler: Send {
    /// Factor the loss is multiplied by before backward.
    fn loss_scale(&self) -> f64;

    /// Divides every gradient by the current scale. Fails with
    /// `NumericInstability` (gradients untouched) when any scaled gradient
    /// is non-finite or outside the reduced-precision range.
    fn unscale(&mut self, model: &mut dyn Model) -> Result<()>;

    /// Adapts the scale after a window, given whether it overflowed.
    fn update(&mut self, found_overflow: bool);
}

fn overflowed(model: &dyn Model, limit: f64) -> bool {
    model.named_parameters()
        .iter()
        .any(|(_, p)| !p.grad.all_finite() || p.grad.max_abs() > limit)
}

fn divide_grads(model: &mut dyn Model, scale: f64) {
    let inv = 1.0 / scale;
    for (_, p) in model.named_parameters_mut() {
        p.grad.scale(inv);
    }
}

/// Full-precision path: scale 1, no range checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScaler;

impl GradScaler for NoScaler {
    fn loss_scale(&self) -> f64 {
        1.0
    }

    fn unscale(&mut self, _model: &mut dyn Model) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _found_overflow: bool) {}
}

/// Fixed scale; overflowing steps are still skipped.
#[derive(Debug, Clone, Copy)]
pub struct StaticLossScaler {
    scale: f64,
}

impl StaticLossScaler {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }
}

impl GradScaler for StaticLossScaler {
    fn loss_scale(&self) -> f64 {
        self.scale
    }

    fn unscale(&mut self, model: &mut dyn Model) -> Result<()> {
        if overflowed(model, HALF_MAX) {
            return Err(TrainError::NumericInstability { loss_scale: self.scale });
        }
        divide_grads(model, self.scale);
        Ok(())
    }

    fn update(&mut self, _found_overflow: bool) {}
}

/// Dynamic scaling: halve on overflow (floor 1), double after
/// `growth_interval` consecutive clean windows.
#[derive(Debug, Clone)]
pub struct DynamicLossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_windows: usize,
}

impl DynamicLossScaler {
    pub const DEFAULT_GROWTH_INTERVAL: usize = 2000;

    pub fn new(initial_scale: f64) -> Self {
        Self {
            scale: initial_scale.max(1.0),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: Self::DEFAULT_GROWTH_INTERVAL,
            clean_windows: 0,
        }
    }

    pub fn with_growth_interval(mut self, windows: usize) -> Self {
        self.growth_interval = windows.max(1);
        self
    }
}

impl GradScaler for DynamicLossScaler {
    fn loss_scale(&self) -> f64 {
        self.scale
    }

    fn unscale(&mut self, model: &mut dyn Model) -> Result<()> {
        if overflowed(model, HALF_MAX) {
            return Err(TrainError::NumericInstability { loss_scale: self.scale });
        }
        divide_grads(model, self.scale);
        Ok(())
    }

    fn update(&mut self, found_overflow: bool) {
        if found_overflow {
            let next = (self.scale * self.backoff_factor).max(1.0);
            warn!(from = self.scale, to = next, "gradient overflow, reducing loss scale");
            self.scale = next;
            self.clean_windows = 0;
            return;
        }
        self.clean_windows += 1;
        if self.clean_windows >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_windows = 0;
        }
    }
}

/// Picks the scaler for a run: none at full precision, a static scale when
/// one is pinned, dynamic otherwise.
pub fn scaler_for(reduced_precision: bool, static_scale: Option<f64>, initial_scale: f64) -> Box<dyn GradScaler> {
    match (reduced_precision, static_scale) {
        (false, _) => Box::new(NoScaler),
        (true, Some(scale)) if scale > 0.0 => Box::new(StaticLossScaler::new(scale)),
        (true, _) => Box::new(DynamicLossScaler::new(initial_scale)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::activation::ActivationFunction;
    use crate::network::network::Network;
    use rand::{rngs::StdRng, SeedableRng};

    fn with_grad(g: f64) -> Network {
        let mut net = Network::new(vec![(1, 1, ActivationFunction::Identity)], &mut StdRng::seed_from_u64(0));
        net.layers[0].weights.grad.data[0][0] = g;
        net
    }

    #[test]
    fn unscale_divides_by_the_scale() {
        let mut net = with_grad(1024.0);
        let mut scaler = DynamicLossScaler::new(256.0);
        scaler.unscale(&mut net).unwrap();
        assert_eq!(net.layers[0].weights.grad.data[0][0], 4.0);
    }

    #[test]
    fn overflow_is_reported_and_scale_backs_off() {
        let mut net = with_grad(1.0e6);
        let mut scaler = DynamicLossScaler::new(1024.0);
        let err = scaler.unscale(&mut net).unwrap_err();
        assert!(matches!(err, TrainError::NumericInstability { loss_scale } if loss_scale == 1024.0));
        assert_eq!(net.layers[0].weights.grad.data[0][0], 1.0e6);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 512.0);
    }

    #[test]
    fn nan_counts_as_overflow() {
        let mut net = with_grad(f64::NAN);
        assert!(StaticLossScaler::new(8.0).unscale(&mut net).is_err());
    }

    #[test]
    fn scale_grows_after_clean_interval_and_never_drops_below_one() {
        let mut scaler = DynamicLossScaler::new(2.0).with_growth_interval(3);
        for _ in 0..3 {
            scaler.update(false);
        }
        assert_eq!(scaler.loss_scale(), 4.0);
        for _ in 0..5 {
            scaler.update(true);
        }
        assert_eq!(scaler.loss_scale(), 1.0);
    }

    #[test]
    fn disabled_precision_uses_unit_scale() {
        assert_eq!(scaler_for(false, None, 65536.0).loss_scale(), 1.0);
        assert_eq!(scaler_for(true, Some(128.0), 65536.0).loss_scale(), 128.0);
        assert_eq!(scaler_for(true, None, 65536.0).loss_scale(), 65536.0);
    }
}
