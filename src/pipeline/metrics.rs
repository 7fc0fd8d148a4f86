// src/pipeline/metrics.rs
//
// Production observability. Tracks counts and timing for every
// subsystem; exported through periodic log summaries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub frames_with_vehicles: Arc<AtomicU64>,
    pub incidents_started: Arc<AtomicU64>,
    pub incidents_ended: Arc<AtomicU64>,
    pub queue_snapshots: Arc<AtomicU64>,
    pub stats_windows: Arc<AtomicU64>,
    pub crossings_recorded: Arc<AtomicU64>,
    pub publish_successes: Arc<AtomicU64>,
    pub publish_failures: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            frames_with_vehicles: Arc::new(AtomicU64::new(0)),
            incidents_started: Arc::new(AtomicU64::new(0)),
            incidents_ended: Arc::new(AtomicU64::new(0)),
            queue_snapshots: Arc::new(AtomicU64::new(0)),
            stats_windows: Arc::new(AtomicU64::new(0)),
            crossings_recorded: Arc::new(AtomicU64::new(0)),
            publish_successes: Arc::new(AtomicU64::new(0)),
            publish_failures: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            incidents_started: self.incidents_started.load(Ordering::Relaxed),
            incidents_ended: self.incidents_ended.load(Ordering::Relaxed),
            queue_snapshots: self.queue_snapshots.load(Ordering::Relaxed),
            stats_windows: self.stats_windows.load(Ordering::Relaxed),
            crossings_recorded: self.crossings_recorded.load(Ordering::Relaxed),
            publish_successes: self.publish_successes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            avg_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub incidents_started: u64,
    pub incidents_ended: u64,
    pub queue_snapshots: u64,
    pub stats_windows: u64,
    pub crossings_recorded: u64,
    pub publish_successes: u64,
    pub publish_failures: u64,
    pub avg_frame_us: u64,
    pub elapsed_secs: f64,
}
