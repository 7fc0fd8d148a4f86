// src/services.rs
//
// Boundary traits for everything the analytics core consumes but does
// not own: the detection source, image cropping/saving, the pub/sub
// sink, the historical store, and the external signal source. Injected
// at construction so tests substitute them freely.
//
// Publish posture is fire-and-log: a failed publish drops that one
// artifact and never blocks or retries on the hot path.

use crate::error::Result;
use crate::incidents::IncidentEvent;
use crate::pipeline::PipelineMetrics;
use crate::types::{
    BoundingBox, FrameBatch, IncidentEndPayload, IncidentStartPayload, QueueSnapshotPayload,
    StatsWindowPayload, VehicleRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub trait FrameSource: Send {
    /// Next frame worth of detections; `None` ends the stream.
    fn next_detections(&mut self) -> Option<FrameBatch>;
}

pub trait ImageService: Send + Sync {
    fn crop(&self, frame_handle: u64, bbox: &BoundingBox) -> Result<Vec<u8>>;
    fn full_frame(&self, frame_handle: u64) -> Result<Vec<u8>>;
    fn save(&self, image: &[u8], dir: &str, filename: &str) -> Result<String>;
}

pub trait PublishSink: Send + Sync {
    fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<()>;
}

pub trait HistoricalStore: Send + Sync {
    fn append(&self, row: &VehicleRecord) -> Result<()>;
    /// Average crossing speed for a lane since the given epoch instant.
    fn avg_speed_since(&self, lane: u32, since: f64) -> Result<Option<f64>>;
}

pub trait SignalSource: Send + Sync {
    /// Residual per-lane vehicle counts read at green onset.
    fn residual_counts_by_lane(&self) -> BTreeMap<u32, u32>;
}

// ---------------------------------------------------------------------------
// Default implementations for running without real infrastructure
// ---------------------------------------------------------------------------

/// Publishes by logging the payload. Stands in for the real transport.
pub struct LogPublishSink;

impl PublishSink for LogPublishSink {
    fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<()> {
        debug!("publish [{}]: {}", channel, payload);
        Ok(())
    }
}

/// No camera attached: every image request yields an empty image.
pub struct NullImageService;

impl ImageService for NullImageService {
    fn crop(&self, _frame_handle: u64, _bbox: &BoundingBox) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn full_frame(&self, _frame_handle: u64) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn save(&self, _image: &[u8], dir: &str, filename: &str) -> Result<String> {
        Ok(format!("{}/{}", dir, filename))
    }
}

/// In-memory row store; doubles as the test store.
#[derive(Default)]
pub struct MemoryHistoricalStore {
    rows: Mutex<Vec<VehicleRecord>>,
}

impl MemoryHistoricalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

impl HistoricalStore for MemoryHistoricalStore {
    fn append(&self, row: &VehicleRecord) -> Result<()> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }

    fn avg_speed_since(&self, lane: u32, since: f64) -> Result<Option<f64>> {
        let rows = self.rows.lock().unwrap();
        let speeds: Vec<f64> = rows
            .iter()
            .filter(|r| r.lane == lane && r.crossed_at >= since && r.speed_kmh >= 0.0)
            .map(|r| r.speed_kmh)
            .collect();
        if speeds.is_empty() {
            return Ok(None);
        }
        Ok(Some(speeds.iter().sum::<f64>() / speeds.len() as f64))
    }
}

/// Detection stream decoded from JSON lines, one `FrameBatch` per line.
/// Malformed lines are logged and skipped, never fatal mid-stream.
pub struct JsonlFrameSource<R: std::io::BufRead> {
    reader: R,
    line: String,
}

impl<R: std::io::BufRead> JsonlFrameSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: std::io::BufRead + Send> FrameSource for JsonlFrameSource<R> {
    fn next_detections(&mut self) -> Option<FrameBatch> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = self.line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<FrameBatch>(trimmed) {
                        Ok(batch) => return Some(batch),
                        Err(e) => {
                            warn!("skipping malformed detection line: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("detection stream read failed: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Signal source with no residual-count capability.
pub struct NullSignalSource;

impl SignalSource for NullSignalSource {
    fn residual_counts_by_lane(&self) -> BTreeMap<u32, u32> {
        BTreeMap::new()
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

const CHANNEL_INCIDENT: &str = "incident";
const CHANNEL_QUEUE: &str = "queue";
const CHANNEL_STATS: &str = "stats";
const IMAGE_DIR: &str = "captures";

/// Channel-routing layer shared by the frame path and the dispatcher.
/// Owns the fire-and-log policy and the evidence-image capture.
pub struct EventPublisher {
    sink: Arc<dyn PublishSink>,
    images: Arc<dyn ImageService>,
    metrics: PipelineMetrics,
}

impl EventPublisher {
    pub fn new(
        sink: Arc<dyn PublishSink>,
        images: Arc<dyn ImageService>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            sink,
            images,
            metrics,
        }
    }

    pub fn publish_incident_events(&self, events: &[IncidentEvent], frame_handle: Option<u64>) {
        for event in events {
            match event {
                IncidentEvent::Started(record) => {
                    self.metrics.inc(&self.metrics.incidents_started);
                    let (image_path, image_file) = self.capture(frame_handle, record);
                    self.send(
                        CHANNEL_INCIDENT,
                        &IncidentStartPayload {
                            subject_id: record.subject_id,
                            event_type_code: record.kind.code(),
                            occur_time: record.start_time,
                            image_path,
                            image_file,
                        },
                    );
                }
                IncidentEvent::Ended { record, end_time } => {
                    self.metrics.inc(&self.metrics.incidents_ended);
                    self.send(
                        CHANNEL_INCIDENT,
                        &IncidentEndPayload {
                            start: IncidentStartPayload {
                                subject_id: record.subject_id,
                                event_type_code: record.kind.code(),
                                occur_time: record.start_time,
                                image_path: None,
                                image_file: None,
                            },
                            end_time: *end_time,
                            process_time: end_time - record.start_time,
                        },
                    );
                }
            }
        }
    }

    pub fn publish_queue_snapshot(&self, snapshot: &QueueSnapshotPayload) {
        self.metrics.inc(&self.metrics.queue_snapshots);
        self.send(CHANNEL_QUEUE, snapshot);
    }

    pub fn publish_stats_window(&self, payload: &StatsWindowPayload) {
        self.metrics.inc(&self.metrics.stats_windows);
        self.send(CHANNEL_STATS, payload);
    }

    /// Evidence image at a transition boundary: a crop of the subject when
    /// its box is known, the full frame otherwise. Any failure degrades to
    /// "no image", never to a dropped event.
    fn capture(
        &self,
        frame_handle: Option<u64>,
        record: &crate::incidents::IncidentRecord,
    ) -> (Option<String>, Option<String>) {
        let handle = match frame_handle {
            Some(h) => h,
            None => return (None, None),
        };
        let image = match &record.subject_bbox {
            Some(bbox) => self.images.crop(handle, bbox),
            None => self.images.full_frame(handle),
        };
        let image = match image {
            Ok(image) => image,
            Err(e) => {
                warn!("image capture failed for incident {}: {}", record.id, e);
                return (None, None);
            }
        };
        let filename = format!("incident_{}.jpg", record.id);
        match self.images.save(&image, IMAGE_DIR, &filename) {
            Ok(path) => (Some(path), Some(filename)),
            Err(e) => {
                warn!("image save failed for incident {}: {}", record.id, e);
                (None, None)
            }
        }
    }

    fn send<T: Serialize>(&self, channel: &str, payload: &T) {
        let value = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("payload serialization failed on [{}]: {}", channel, e);
                self.metrics.inc(&self.metrics.publish_failures);
                return;
            }
        };
        match self.sink.publish(channel, &value) {
            Ok(()) => self.metrics.inc(&self.metrics.publish_successes),
            Err(e) => {
                self.metrics.inc(&self.metrics.publish_failures);
                warn!("publish failed on [{}], dropping artifact: {}", channel, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidents::{IncidentRecord, IncidentType};

    struct RecordingSink {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl PublishSink for RecordingSink {
        fn publish(&self, channel: &str, payload: &serde_json::Value) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.clone()));
            Ok(())
        }
    }

    struct FailingSink;

    impl PublishSink for FailingSink {
        fn publish(&self, _channel: &str, _payload: &serde_json::Value) -> Result<()> {
            Err(crate::error::AnalyticsError::DependencyUnavailable(
                "broker down".into(),
            ))
        }
    }

    fn start_event() -> IncidentEvent {
        IncidentEvent::Started(IncidentRecord {
            id: 3,
            kind: IncidentType::Jaywalk,
            subject_id: 9,
            start_time: 100.0,
            subject_bbox: None,
        })
    }

    #[test]
    fn test_incident_start_routes_to_incident_channel() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(
            sink.clone(),
            Arc::new(NullImageService),
            PipelineMetrics::new(),
        );

        publisher.publish_incident_events(&[start_event()], Some(1));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "incident");
        assert_eq!(sent[0].1["event_type_code"], 3);
        assert_eq!(sent[0].1["subject_id"], 9);
    }

    struct RecordingImages {
        crops: Mutex<Vec<BoundingBox>>,
        full_frames: Mutex<u32>,
    }

    impl ImageService for RecordingImages {
        fn crop(&self, _frame_handle: u64, bbox: &BoundingBox) -> Result<Vec<u8>> {
            self.crops.lock().unwrap().push(*bbox);
            Ok(vec![1])
        }

        fn full_frame(&self, _frame_handle: u64) -> Result<Vec<u8>> {
            *self.full_frames.lock().unwrap() += 1;
            Ok(vec![2])
        }

        fn save(&self, _image: &[u8], dir: &str, filename: &str) -> Result<String> {
            Ok(format!("{}/{}", dir, filename))
        }
    }

    #[test]
    fn test_capture_crops_the_subject_when_box_is_known() {
        let images = Arc::new(RecordingImages {
            crops: Mutex::new(Vec::new()),
            full_frames: Mutex::new(0),
        });
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(sink.clone(), images.clone(), PipelineMetrics::new());

        let event = IncidentEvent::Started(IncidentRecord {
            id: 7,
            kind: IncidentType::StoppedVehicle,
            subject_id: 4,
            start_time: 50.0,
            subject_bbox: Some(BoundingBox {
                x1: 10.0,
                y1: 20.0,
                x2: 30.0,
                y2: 60.0,
            }),
        });
        publisher.publish_incident_events(&[event], Some(1));

        let crops = images.crops.lock().unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].x1, 10.0);
        assert_eq!(*images.full_frames.lock().unwrap(), 0);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].1["image_file"], "incident_7.jpg");
    }

    #[test]
    fn test_publish_failure_is_absorbed() {
        let metrics = PipelineMetrics::new();
        let publisher = EventPublisher::new(
            Arc::new(FailingSink),
            Arc::new(NullImageService),
            metrics.clone(),
        );

        publisher.publish_incident_events(&[start_event()], None);
        assert_eq!(
            metrics
                .publish_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_jsonl_source_skips_malformed_lines() {
        let data = concat!(
            "\n",
            "{\"frame_handle\":1,\"timestamp\":1.5,\"detections\":[]}\n",
            "not json\n",
            "{\"frame_handle\":2,\"timestamp\":2.0,\"detections\":[]}\n",
        );
        let mut src = JsonlFrameSource::new(std::io::Cursor::new(data));
        assert_eq!(src.next_detections().unwrap().frame_handle, 1);
        assert_eq!(src.next_detections().unwrap().frame_handle, 2);
        assert!(src.next_detections().is_none());
    }

    #[test]
    fn test_memory_store_average_speed() {
        let store = MemoryHistoricalStore::new();
        for (speed, at) in [(30.0, 10.0), (50.0, 20.0), (70.0, 5.0)] {
            store
                .append(&VehicleRecord {
                    object_id: 1,
                    lane: 2,
                    turn_code: 11,
                    speed_kmh: speed,
                    crossed_at: at,
                })
                .unwrap();
        }

        let avg = store.avg_speed_since(2, 10.0).unwrap().unwrap();
        assert!((avg - 40.0).abs() < 1e-9);
        assert!(store.avg_speed_since(3, 0.0).unwrap().is_none());
    }
}
