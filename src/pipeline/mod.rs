// src/pipeline/mod.rs

pub mod counters;
pub mod driver;
pub mod metrics;

pub use counters::LaneCounters;
pub use driver::{run_timers, AnalyticsPipeline};
pub use metrics::PipelineMetrics;
