// src/pipeline/driver.rs
//
// Frame-processing context plus the aligned-interval timer context.
// The frame path never touches external I/O except at incident and
// window boundaries; the timer context owns queue sampling, periodic
// maintenance, and interval-window closes.

use crate::incidents::IncidentEngine;
use crate::pipeline::counters::LaneCounters;
use crate::pipeline::metrics::PipelineMetrics;
use crate::services::{EventPublisher, FrameSource, HistoricalStore};
use crate::types::{FrameBatch, IncidentConfig, WindowConfig};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{info, warn};

pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct AnalyticsPipeline {
    engine: Arc<IncidentEngine>,
    counters: Arc<Mutex<LaneCounters>>,
    publisher: Arc<EventPublisher>,
    store: Arc<dyn HistoricalStore>,
    metrics: PipelineMetrics,
}

impl AnalyticsPipeline {
    pub fn new(
        engine: Arc<IncidentEngine>,
        counters: Arc<Mutex<LaneCounters>>,
        publisher: Arc<EventPublisher>,
        store: Arc<dyn HistoricalStore>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            engine,
            counters,
            publisher,
            store,
            metrics,
        }
    }

    pub fn process_batch(&self, batch: &FrameBatch) {
        let started = Instant::now();
        let outcome = self.engine.process_frame(batch);

        self.metrics.inc(&self.metrics.total_frames);
        if !outcome.lane_counts.is_empty() {
            self.metrics.inc(&self.metrics.frames_with_vehicles);
        }
        self.counters.lock().unwrap().fold_frame(outcome.lane_counts);

        self.publisher
            .publish_incident_events(&outcome.events, Some(batch.frame_handle));

        for row in &outcome.crossings {
            self.metrics.inc(&self.metrics.crossings_recorded);
            if let Err(e) = self.store.append(row) {
                warn!("historical append dropped for object {}: {}", row.object_id, e);
            }
        }

        self.metrics
            .set_timing(&self.metrics.frame_time_us, started.elapsed().as_micros() as u64);
    }

    /// Ingest until the source drains or shutdown is requested.
    pub async fn run(
        &self,
        mut source: Box<dyn FrameSource>,
        shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, frame loop exits");
                break;
            }
            match source.next_detections() {
                Some(batch) => {
                    self.process_batch(&batch);
                    tokio::task::yield_now().await;
                }
                None => {
                    info!("frame source drained");
                    break;
                }
            }
        }
    }
}

/// Timer context. Sleeps one queue-sample quantum at a time so shutdown
/// is bounded by that quantum, never by a full window period.
pub async fn run_timers(
    engine: Arc<IncidentEngine>,
    counters: Arc<Mutex<LaneCounters>>,
    publisher: Arc<EventPublisher>,
    windows: WindowConfig,
    incidents: IncidentConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let sample_period = Duration::from_secs_f64(windows.queue_sample_secs.max(0.1));
    let now = epoch_seconds();
    let mut next_maintenance = now + incidents.maintenance_tick_secs;
    // A rejected window config never arms the interval close.
    let mut next_interval = {
        let mut c = counters.lock().unwrap();
        if c.stats_enabled() {
            c.stats.start_interval(now);
            c.stats.next_interval_boundary(now)
        } else {
            f64::INFINITY
        }
    };
    if next_interval.is_finite() {
        info!(
            "timer context up: first interval close at {:.0}, maintenance every {:.0}s",
            next_interval, incidents.maintenance_tick_secs
        );
    } else {
        info!(
            "timer context up: interval closes disabled, maintenance every {:.0}s",
            incidents.maintenance_tick_secs
        );
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(sample_period) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown requested, timer context exits");
                    break;
                }
            }
        }

        let now = epoch_seconds();
        counters.lock().unwrap().sample_queue();

        if now >= next_maintenance {
            let events = engine.maintenance_tick(now);
            publisher.publish_incident_events(&events, None);
            next_maintenance = now + incidents.maintenance_tick_secs;
        }

        if now >= next_interval {
            close_interval_at(&counters, &publisher, next_interval);
            next_interval = counters.lock().unwrap().stats.next_interval_boundary(now);
        }
    }
}

/// Closes the interval window stamped at the aligned boundary, not the
/// instant the timer happened to wake.
fn close_interval_at(counters: &Mutex<LaneCounters>, publisher: &EventPublisher, boundary: f64) {
    let payload = counters.lock().unwrap().stats.close_interval(boundary);
    if let Some(payload) = payload {
        publisher.publish_stats_window(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::regions::RegionSet;
    use crate::services::{LogPublishSink, MemoryHistoricalStore, NullImageService};
    use crate::signal::SignalPhaseTracker;
    use crate::stats_window::StatsAggregator;
    use crate::types::{BoundingBox, Detection, RegionConfig, ReverseConfig};
    use std::collections::BTreeMap;

    fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Vec<[f64; 2]> {
        vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
    }

    fn make_pipeline(store: Arc<MemoryHistoricalStore>) -> AnalyticsPipeline {
        let mut lanes = BTreeMap::new();
        lanes.insert(1, rect(0.0, 200.0, 100.0, 600.0));
        let regions = RegionSet::from_config(&RegionConfig {
            lanes,
            stop_line: vec![[0.0, 200.0], [100.0, 200.0]],
            turn_left: vec![],
            turn_right: vec![],
            straight: rect(0.0, 0.0, 100.0, 200.0),
            u_turn: vec![],
            intersection: rect(0.0, 0.0, 100.0, 300.0),
            no_walk_zones: vec![],
            waiting_areas: vec![],
            lane_boundary_points: vec![[0.0, 200.0], [100.0, 200.0]],
        })
        .unwrap();

        let cfg = IncidentConfig {
            stop_speed_kmh: 5.0,
            stop_duration_secs: 10.0,
            tailgate_fallback_secs: 30.0,
            accident_fallback_secs: 300.0,
            idle_timeout_secs: 60.0,
            max_incident_age_secs: 3600.0,
            maintenance_tick_secs: 10.0,
            reverse: ReverseConfig {
                near_stop_line_px: 60.0,
                min_speed_kmh: 3.0,
                start_threshold_px: 10.0,
                min_duration_secs: 2.0,
                min_distance_px: 20.0,
            },
        };

        let metrics = PipelineMetrics::new();
        let engine = Arc::new(IncidentEngine::new(
            cfg,
            Arc::new(regions),
            Arc::new(Calibration::uncalibrated(150.0)),
            Arc::new(Mutex::new(SignalPhaseTracker::new())),
        ));
        let window_cfg = WindowConfig {
            interval_minutes: 5,
            queue_sample_secs: 1.0,
        };
        let counters = Arc::new(Mutex::new(LaneCounters::new(StatsAggregator::new(
            &window_cfg,
            BTreeMap::new(),
            150.0,
        ))));
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(LogPublishSink),
            Arc::new(NullImageService),
            metrics.clone(),
        ));
        AnalyticsPipeline::new(engine, counters, publisher, store, metrics)
    }

    fn batch(ts: f64, y: f64) -> FrameBatch {
        FrameBatch {
            frame_handle: 1,
            timestamp: ts,
            detections: vec![Detection {
                object_id: 8,
                class_id: 1,
                bbox: BoundingBox {
                    x1: 40.0,
                    y1: y - 30.0,
                    x2: 60.0,
                    y2: y,
                },
            }],
        }
    }

    #[test]
    fn test_crossing_rows_reach_the_store() {
        let store = Arc::new(MemoryHistoricalStore::new());
        let pipeline = make_pipeline(store.clone());

        pipeline.process_batch(&batch(0.0, 300.0));
        pipeline.process_batch(&batch(1.0, 150.0)); // crosses stop line
        pipeline.process_batch(&batch(2.0, 100.0));

        assert_eq!(store.row_count(), 1);
        assert_eq!(
            pipeline
                .metrics
                .total_frames
                .load(std::sync::atomic::Ordering::Relaxed),
            3
        );
        assert_eq!(
            pipeline
                .metrics
                .crossings_recorded
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    struct RecordingSink {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl crate::services::PublishSink for RecordingSink {
        fn publish(
            &self,
            channel: &str,
            payload: &serde_json::Value,
        ) -> crate::error::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_interval_close_is_stamped_at_the_boundary() {
        let window_cfg = WindowConfig {
            interval_minutes: 5,
            queue_sample_secs: 1.0,
        };
        let counters = Mutex::new(LaneCounters::new(StatsAggregator::new(
            &window_cfg,
            BTreeMap::new(),
            150.0,
        )));
        {
            let mut c = counters.lock().unwrap();
            c.stats.start_interval(0.0);
            c.fold_frame([(1, 2)].into_iter().collect());
        }
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(
            sink.clone(),
            Arc::new(NullImageService),
            PipelineMetrics::new(),
        );

        // The timer woke late, but the window still ends at the boundary.
        close_interval_at(&counters, &publisher, 300.0);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "stats");
        assert_eq!(sent[0].1["window_end"], 300.0);
    }
}
