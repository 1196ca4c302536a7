pub mod average;
pub mod average_precision;
pub mod confusion;
pub mod evaluate;
pub mod sink;

pub use average::RunningAverage;
pub use average_precision::{AveragePrecisionMeter, TopKErrorMeter};
pub use confusion::ConfusionMatrix;
pub use evaluate::{evaluate, EvalResult};
pub use sink::{ChannelSink, JsonlSink, MemorySink, MetricsSink, NullSink, ScalarEvent};
