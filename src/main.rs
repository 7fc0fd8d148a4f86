// src/main.rs

mod calibration;
mod config;
mod dispatch;
mod error;
mod geometry;
mod incidents;
mod pipeline;
mod queue_window;
mod regions;
mod services;
mod signal;
mod stats_window;
mod tracks;
mod types;

use anyhow::Result;
use calibration::Calibration;
use dispatch::{EventDispatcher, SignalEvent};
use incidents::IncidentEngine;
use pipeline::{run_timers, AnalyticsPipeline, LaneCounters, PipelineMetrics};
use regions::RegionSet;
use services::{
    EventPublisher, FrameSource, JsonlFrameSource, LogPublishSink, MemoryHistoricalStore,
    NullImageService, NullSignalSource,
};
use signal::SignalPhaseTracker;
use stats_window::StatsAggregator;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use types::{Config, IncidentConfig};

/// Which features survived startup validation. A disabled feature never
/// takes the whole process down with it.
struct FeatureStatus {
    speed_estimation: bool,
    incidents: bool,
    queue_windows: bool,
    stats_windows: bool,
}

impl FeatureStatus {
    fn log(&self) {
        for (name, enabled) in [
            ("speed estimation", self.speed_estimation),
            ("incident detection", self.incidents),
            ("queue windows", self.queue_windows),
            ("statistics windows", self.stats_windows),
        ] {
            if enabled {
                info!("✓ {} enabled", name);
            } else {
                warn!("⚪ {} disabled", name);
            }
        }
    }
}

/// Incident thresholds that can never fire: tracking and lane counting
/// keep running, the detectors stay dark.
fn disabled_incident_config(base: &IncidentConfig) -> IncidentConfig {
    let mut cfg = base.clone();
    cfg.stop_speed_kmh = -1.0;
    cfg.reverse.min_speed_kmh = f64::INFINITY;
    cfg
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        "🚦 Intersection Analytics starting (camera {})",
        config.camera.camera_id
    );

    let mut features = FeatureStatus {
        speed_estimation: true,
        incidents: true,
        queue_windows: true,
        stats_windows: true,
    };
    if let Err(e) = config.validate_calibration() {
        warn!("calibration config rejected: {}", e);
        features.speed_estimation = false;
    }
    if let Err(e) = config.validate_incidents() {
        warn!("incident config rejected: {}", e);
        features.incidents = false;
    }
    if let Err(e) = config.validate_windows() {
        warn!("window config rejected: {}", e);
        features.queue_windows = false;
        features.stats_windows = false;
    }
    features.log();

    // Every feature classifies against the region store; without it there
    // is nothing left to run.
    let regions = match RegionSet::from_config(&config.regions) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("region store failed to load, nothing to analyze: {}", e);
            return Ok(());
        }
    };
    info!("✓ Region store ready: {} lane(s)", config.regions.lanes.len());

    let calibration = if features.speed_estimation {
        Arc::new(Calibration::from_config(
            &config.calibration,
            (config.camera.frame_width, config.camera.frame_height),
        ))
    } else {
        Arc::new(Calibration::uncalibrated(
            config.calibration.default_lane_length_m.max(1.0),
        ))
    };
    if calibration.is_calibrated() {
        info!("✓ Calibration ready");
    } else {
        warn!("⚪ running uncalibrated, speeds unavailable and lane lengths defaulted");
    }

    let lane_lengths: BTreeMap<u32, f64> = regions
        .lane_ids()
        .filter_map(|id| {
            regions
                .lane_polygon(id)
                .map(|poly| (id, calibration.lane_length_m(poly)))
        })
        .collect();
    for (lane, length) in &lane_lengths {
        info!("  lane {}: {:.1} m", lane, length);
    }

    let incident_cfg = if features.incidents {
        config.incidents.clone()
    } else {
        disabled_incident_config(&config.incidents)
    };

    let metrics = PipelineMetrics::new();
    let tracker = Arc::new(Mutex::new(SignalPhaseTracker::new()));
    let engine = Arc::new(IncidentEngine::new(
        incident_cfg.clone(),
        regions,
        calibration,
        tracker.clone(),
    ));
    info!("✓ Incident engine ready");

    let mut lane_counters = LaneCounters::new(StatsAggregator::new(
        &config.windows,
        lane_lengths,
        config.calibration.default_lane_length_m,
    ));
    lane_counters.set_window_features(features.queue_windows, features.stats_windows);
    let counters = Arc::new(Mutex::new(lane_counters));
    let publisher = Arc::new(EventPublisher::new(
        Arc::new(LogPublishSink),
        Arc::new(NullImageService),
        metrics.clone(),
    ));
    let store = Arc::new(MemoryHistoricalStore::new());
    info!("✓ Publisher and historical store wired");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = mpsc::channel::<SignalEvent>(64);

    // In deployment the signal transport clones this sender; keep it alive
    // until the frame loop finishes so the dispatcher stays up.
    let dispatcher = Arc::new(EventDispatcher::new(
        engine.clone(),
        tracker,
        counters.clone(),
        Arc::new(NullSignalSource),
        publisher.clone(),
    ));
    let dispatcher_handle = dispatcher.spawn(signal_rx);
    info!("✓ Signal dispatcher up");

    let timer_handle = tokio::spawn(run_timers(
        engine.clone(),
        counters.clone(),
        publisher.clone(),
        config.windows.clone(),
        incident_cfg,
        shutdown_rx.clone(),
    ));

    let source: Box<dyn FrameSource> = match &config.camera.detections_path {
        Some(path) => {
            info!("reading detections from {}", path);
            Box::new(JsonlFrameSource::new(std::io::BufReader::new(
                std::fs::File::open(path)?,
            )))
        }
        None => {
            info!("reading detections from stdin");
            Box::new(JsonlFrameSource::new(std::io::BufReader::new(
                std::io::stdin(),
            )))
        }
    };

    let frame_pipeline = AnalyticsPipeline::new(
        engine.clone(),
        counters,
        publisher,
        store.clone(),
        metrics.clone(),
    );
    info!("✓ Frame pipeline up, ingesting");

    tokio::select! {
        _ = frame_pipeline.run(source, shutdown_rx) => {
            info!("ingestion finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    drop(signal_tx);
    let _ = timer_handle.await;
    let _ = dispatcher_handle.await;

    let summary = metrics.summary();
    info!("📊 Final report:");
    info!(
        "  Frames: {} ({:.1} FPS)",
        summary.total_frames, summary.fps
    );
    info!(
        "  Incidents: {} started / {} ended",
        summary.incidents_started, summary.incidents_ended
    );
    if engine.active_incident_count() > 0 {
        warn!(
            "  Still open at shutdown: {} incident(s)",
            engine.active_incident_count()
        );
    }
    info!("  Queue snapshots: {}", summary.queue_snapshots);
    info!("  Stats windows: {}", summary.stats_windows);
    info!(
        "  Crossings recorded: {} ({} rows stored)",
        summary.crossings_recorded,
        store.row_count()
    );
    if summary.publish_failures > 0 {
        warn!("  ⚠️  Publish failures: {}", summary.publish_failures);
    }

    Ok(())
}
