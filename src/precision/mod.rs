pub mod scaler;

pub use scaler::{scaler_for, DynamicLossScaler, GradScaler, NoScaler, StaticLossScaler, HALF_MAX};
