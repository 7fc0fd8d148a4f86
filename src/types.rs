// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Configuration (loaded once from YAML at startup, immutable afterwards)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub calibration: CalibrationConfig,
    pub regions: RegionConfig,
    pub incidents: IncidentConfig,
    pub windows: WindowConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    pub frame_width: f64,
    pub frame_height: f64,
    pub image_dir: String,
    /// JSONL detection stream; stdin when absent.
    #[serde(default)]
    pub detections_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Four reference image points, ordered
    /// [near-left, far-left, far-right, near-right].
    pub reference_points: Vec<[f64; 2]>,
    /// Known real-world distances in meters:
    /// [0] near-left → far-left (longitudinal), [1] near-left → near-right
    /// (lateral).
    pub reference_distances_m: [f64; 2],
    /// Used for lane length when calibration is degenerate or absent.
    pub default_lane_length_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Lane id → polygon, 1-based ids, id order is classification order.
    pub lanes: BTreeMap<u32, Vec<[f64; 2]>>,
    /// Exactly two points.
    pub stop_line: Vec<[f64; 2]>,
    /// Two polygons per side: [0] inner, [1] outer.
    #[serde(default)]
    pub turn_left: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    pub turn_right: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    pub straight: Vec<[f64; 2]>,
    #[serde(default)]
    pub u_turn: Vec<[f64; 2]>,
    pub intersection: Vec<[f64; 2]>,
    #[serde(default)]
    pub no_walk_zones: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    pub waiting_areas: Vec<Vec<[f64; 2]>>,
    /// Ordered lane-boundary points along the stop line, used by the
    /// crossing-based lane inference.
    #[serde(default)]
    pub lane_boundary_points: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    pub stop_speed_kmh: f64,
    pub stop_duration_secs: f64,
    pub tailgate_fallback_secs: f64,
    pub accident_fallback_secs: f64,
    pub idle_timeout_secs: f64,
    pub max_incident_age_secs: f64,
    pub maintenance_tick_secs: f64,
    pub reverse: ReverseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseConfig {
    /// Pixel distance from the stop line inside which the detector is armed.
    pub near_stop_line_px: f64,
    pub min_speed_kmh: f64,
    /// Ordinate decrease that opens the accumulating window, pixels.
    pub start_threshold_px: f64,
    pub min_duration_secs: f64,
    pub min_distance_px: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub interval_minutes: u64,
    /// Seconds between per-lane count folds while the signal is red.
    pub queue_sample_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

// ---------------------------------------------------------------------------
// Core geometry / detection types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Sentinel for "no previous position yet".
    pub const fn invalid() -> Self {
        Self { x: -1.0, y: -1.0 }
    }

    pub fn is_valid(&self) -> bool {
        self.x >= 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Anchor point used for all region classification: bottom-center,
    /// the point where the object meets the road plane.
    pub fn ground_point(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Vehicle,
    Pedestrian,
    Other,
}

impl ObjectClass {
    pub fn from_class_id(class_id: u32) -> Self {
        match class_id {
            0 => ObjectClass::Pedestrian,
            1..=5 => ObjectClass::Vehicle,
            _ => ObjectClass::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub object_id: u64,
    pub class_id: u32,
    pub bbox: BoundingBox,
}

/// One frame worth of detections, timestamped in epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBatch {
    pub frame_handle: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

// ---------------------------------------------------------------------------
// Published payloads (logical shapes from the boundary contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IncidentStartPayload {
    pub subject_id: u64,
    pub event_type_code: u32,
    pub occur_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentEndPayload {
    #[serde(flatten)]
    pub start: IncidentStartPayload,
    pub end_time: f64,
    pub process_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneQueue {
    pub lane: u32,
    pub residual: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshotPayload {
    pub window_start: f64,
    pub window_end: f64,
    pub per_lane: Vec<LaneQueue>,
    pub approach_residual: u32,
    pub approach_max: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Interval,
    SignalPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: u32,
    pub total_volume: u64,
    pub avg_density: f64,
    pub min_density: f64,
    pub max_density: f64,
    pub occupancy_share: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApproachStats {
    pub total_volume: u64,
    pub avg_density: f64,
    pub min_density: f64,
    pub max_density: f64,
    pub avg_occupancy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsWindowPayload {
    pub window_type: WindowType,
    pub window_start: f64,
    pub window_end: f64,
    pub approach: ApproachStats,
    pub per_lane: Vec<LaneStats>,
}

/// Per-vehicle row appended to the historical store when a vehicle crosses
/// the stop line.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleRecord {
    pub object_id: u64,
    pub lane: u32,
    pub turn_code: i32,
    pub speed_kmh: f64,
    pub crossed_at: f64,
}
