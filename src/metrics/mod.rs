pub mod accumulator;
pub mod sink;

pub use accumulator::{mean, MetricAccumulator, Timer, TimerBucket, TimingBreakdown};
pub use sink::{JsonlSink, MemorySink, MetricsChannels, MetricsSink, NullSink, ScalarEvent};
