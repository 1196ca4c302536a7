//! Learning-rate multiplier schedule: linear warmup, then linear or cosine
//! decay to zero at `total_steps`.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Decay mode after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayKind {
    Linear,
    Cosine,
}

impl fmt::Display for DecayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecayKind::Linear => "linear",
            DecayKind::Cosine => "cosine",
        })
    }
}

impl FromStr for DecayKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(DecayKind::Linear),
            "cosine" => Ok(DecayKind::Cosine),
            other => Err(TrainError::Config(format!("unknown decay kind '{other}'"))),
        }
    }
}

/// Immutable schedule description. `rate(step)` is a multiplier in [0, 1]
/// applied to the base learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub decay: DecayKind,
}

impl LrSchedule {
    pub fn new(warmup_steps: usize, total_steps: usize, decay: DecayKind) -> Self {
        Self { warmup_steps, total_steps, decay }
    }

    /// Multiplier for `step`. Steps past `total_steps` clamp to the end of
    /// the decay instead of failing.
    pub fn rate(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).clamp(0.0, 1.0);

        match self.decay {
            DecayKind::Linear => 1.0 - progress,
            DecayKind::Cosine => 0.5 * (1.0 + (PI * progress).cos()),
        }
    }

    pub fn in_warmup(&self, step: usize) -> bool {
        step < self.warmup_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn cosine_reference_points() {
        let s = LrSchedule::new(500, 10_000, DecayKind::Cosine);
        assert!(close(s.rate(0), 0.0));
        assert!(close(s.rate(250), 0.5));
        assert!(close(s.rate(500), 1.0));
        assert!(close(s.rate(10_000), 0.0));
        assert!(close(s.rate(50_000), 0.0));
    }

    #[test]
    fn continuous_at_warmup_boundary() {
        for decay in [DecayKind::Linear, DecayKind::Cosine] {
            let s = LrSchedule::new(100, 1000, decay);
            assert!((s.rate(99) - s.rate(100)).abs() <= 0.01 + 1e-12);
            assert!((s.rate(100) - s.rate(101)).abs() < 0.01);
        }
    }

    #[test]
    fn post_warmup_is_monotone_non_increasing() {
        for decay in [DecayKind::Linear, DecayKind::Cosine] {
            let s = LrSchedule::new(10, 200, decay);
            for step in 10..250 {
                assert!(s.rate(step + 1) <= s.rate(step) + 1e-15, "{decay} at {step}");
            }
        }
    }

    #[test]
    fn linear_midpoint_and_no_warmup() {
        let s = LrSchedule::new(0, 100, DecayKind::Linear);
        assert!(close(s.rate(0), 1.0));
        assert!(close(s.rate(50), 0.5));
        assert!(close(s.rate(100), 0.0));
    }

    #[test]
    fn warmup_spanning_whole_run_does_not_divide_by_zero() {
        let s = LrSchedule::new(10, 10, DecayKind::Cosine);
        assert!(close(s.rate(5), 0.5));
        assert!(close(s.rate(10), 1.0));
        assert!(close(s.rate(11), 0.5 * (1.0 + PI.cos())));
    }
}
