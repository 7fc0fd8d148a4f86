// src/calibration.rs
//
// Single-camera projective calibration: four reference image points plus
// two known road distances give vanishing points, focal length, the road
// plane, and per-axis metric scales. Everything downstream (speed, lane
// length) goes through `project`.

use crate::error::AnalyticsError;
use crate::geometry::line_intersection;
use crate::types::{CalibrationConfig, Point};
use tracing::warn;

// ============================================================================
// TUNABLES
// ============================================================================
/// Fixed plane offset for numerical conditioning; the absolute value is
/// irrelevant because metric scales are derived after projection.
const PLANE_OFFSET: f64 = 10.0;
/// Horizontal pixel displacement above which bounding-box jitter at
/// near-vertical camera angles systematically underestimates speed.
const JITTER_PIXEL_THRESHOLD: f64 = 20.0;
const JITTER_CORRECTION_KMH: f64 = 5.0;

const MPS_TO_KMH: f64 = 3.6;

/// Sentinel returned instead of a speed when dt or geometry is unusable.
pub const SPEED_INVALID: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec3 {
    x: f64,
    y: f64,
    z: f64,
}

impl Vec3 {
    fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn dot(self, o: Vec3) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    fn cross(self, o: Vec3) -> Vec3 {
        Vec3::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    fn scaled(self, k: f64) -> Vec3 {
        Vec3::new(self.x * k, self.y * k, self.z * k)
    }

    fn normalized(self) -> Option<Vec3> {
        let n = self.norm();
        if n < 1e-12 {
            None
        } else {
            Some(self.scaled(1.0 / n))
        }
    }

    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

/// Immutable once computed.
#[derive(Debug, Clone)]
pub struct CalibrationProfile {
    principal: Point,
    focal: f64,
    plane_normal: Vec3,
    long_axis: Vec3,
    lat_axis: Vec3,
    /// Meters per projected road-plane unit, along each axis.
    long_scale: f64,
    lat_scale: f64,
}

impl CalibrationProfile {
    /// Build a profile from the four reference points
    /// [near-left, far-left, far-right, near-right] and the two known
    /// distances [longitudinal, lateral] in meters.
    pub fn compute(
        points: &[Point; 4],
        distances_m: [f64; 2],
        frame_size: (f64, f64),
    ) -> Result<Self, AnalyticsError> {
        let [near_left, far_left, far_right, near_right] = *points;

        let vp_long = line_intersection(near_left, far_left, near_right, far_right).ok_or_else(
            || AnalyticsError::GeometryDegenerate("longitudinal reference lines are parallel".into()),
        )?;
        let vp_lat = line_intersection(far_left, far_right, near_left, near_right).ok_or_else(
            || AnalyticsError::GeometryDegenerate("lateral reference lines are parallel".into()),
        )?;

        let principal = Point::new(frame_size.0 / 2.0, frame_size.1 / 2.0);
        let v1 = Point::new(vp_long.x - principal.x, vp_long.y - principal.y);
        let v2 = Point::new(vp_lat.x - principal.x, vp_lat.y - principal.y);

        let focal_sq = -(v1.x * v2.x + v1.y * v2.y);
        let focal = focal_sq.abs().sqrt();
        if focal < 1e-6 {
            return Err(AnalyticsError::GeometryDegenerate(
                "vanishing points collapse onto the principal point".into(),
            ));
        }

        let d1 = Vec3::new(v1.x, v1.y, focal);
        let d2 = Vec3::new(v2.x, v2.y, focal);
        let mut plane_normal = d1.cross(d2).normalized().ok_or_else(|| {
            AnalyticsError::GeometryDegenerate("coincident vanishing points".into())
        })?;

        // Orient the normal so the reference points project in front of the
        // camera (positive ray parameter).
        let probe = Self::ray(principal, focal, near_left);
        if plane_normal.dot(probe) < 0.0 {
            plane_normal = plane_normal.scaled(-1.0);
        }

        let mut profile = Self {
            principal,
            focal,
            plane_normal,
            long_axis: Vec3::new(0.0, 0.0, 0.0),
            lat_axis: Vec3::new(0.0, 0.0, 0.0),
            long_scale: 0.0,
            lat_scale: 0.0,
        };

        let a = profile.project_vec(near_left).ok_or_else(|| {
            AnalyticsError::GeometryDegenerate("reference point projects to infinity".into())
        })?;
        let b = profile.project_vec(far_left).ok_or_else(|| {
            AnalyticsError::GeometryDegenerate("reference point projects to infinity".into())
        })?;
        let c = profile.project_vec(near_right).ok_or_else(|| {
            AnalyticsError::GeometryDegenerate("reference point projects to infinity".into())
        })?;

        let long_vec = b.sub(a);
        let lat_vec = c.sub(a);
        let long_len = long_vec.norm();
        let lat_len = lat_vec.norm();
        if long_len < 1e-9 || lat_len < 1e-9 {
            return Err(AnalyticsError::GeometryDegenerate(
                "zero-length calibration segment".into(),
            ));
        }

        profile.long_axis = long_vec.scaled(1.0 / long_len);
        profile.lat_axis = lat_vec.scaled(1.0 / lat_len);
        profile.long_scale = distances_m[0] / long_len;
        profile.lat_scale = distances_m[1] / lat_len;

        Ok(profile)
    }

    fn ray(principal: Point, focal: f64, p: Point) -> Vec3 {
        Vec3::new(p.x - principal.x, p.y - principal.y, focal)
    }

    /// Intersect the viewing ray through image point `p` with the road
    /// plane. `None` when the ray is (numerically) parallel to the plane.
    fn project_vec(&self, p: Point) -> Option<Vec3> {
        let dir = Self::ray(self.principal, self.focal, p);
        let denom = self.plane_normal.dot(dir);
        if denom.abs() < 1e-9 {
            return None;
        }
        let t = PLANE_OFFSET / denom;
        if t <= 0.0 {
            return None;
        }
        Some(dir.scaled(t))
    }

    /// Metric speed between two image positions traversed in `dt_secs`.
    /// Returns [`SPEED_INVALID`] for zero/negative dt or unprojectable
    /// points instead of failing.
    pub fn speed_kmh(&self, p1: Point, p2: Point, dt_secs: f64) -> f64 {
        if dt_secs <= f64::EPSILON {
            return SPEED_INVALID;
        }
        let (r1, r2) = match (self.project_vec(p1), self.project_vec(p2)) {
            (Some(a), Some(b)) => (a, b),
            _ => return SPEED_INVALID,
        };

        let disp = r2.sub(r1);
        let u = disp.dot(self.long_axis) * self.long_scale;
        let v = disp.dot(self.lat_axis) * self.lat_scale;
        let mut speed = (u * u + v * v).sqrt() / dt_secs * MPS_TO_KMH;

        if (p2.x - p1.x).abs() > JITTER_PIXEL_THRESHOLD {
            speed += JITTER_CORRECTION_KMH;
        }
        speed
    }

    /// Metric distance between two image points, or `None` when either is
    /// unprojectable.
    pub fn distance_m(&self, p1: Point, p2: Point) -> Option<f64> {
        let r1 = self.project_vec(p1)?;
        let r2 = self.project_vec(p2)?;
        let disp = r2.sub(r1);
        let u = disp.dot(self.long_axis) * self.long_scale;
        let v = disp.dot(self.lat_axis) * self.lat_scale;
        Some((u * u + v * v).sqrt())
    }
}

/// Calibration handle shared read-only across the process. Degenerate or
/// missing calibration degrades to the configured default lane length.
#[derive(Debug, Clone)]
pub struct Calibration {
    profile: Option<CalibrationProfile>,
    default_lane_length_m: f64,
}

impl Calibration {
    pub fn from_config(cfg: &CalibrationConfig, frame_size: (f64, f64)) -> Self {
        if cfg.reference_points.len() != 4 {
            warn!(
                "calibration needs exactly 4 reference points, got {} - using fallback distances",
                cfg.reference_points.len()
            );
            return Self {
                profile: None,
                default_lane_length_m: cfg.default_lane_length_m,
            };
        }

        let pts = [
            Point::new(cfg.reference_points[0][0], cfg.reference_points[0][1]),
            Point::new(cfg.reference_points[1][0], cfg.reference_points[1][1]),
            Point::new(cfg.reference_points[2][0], cfg.reference_points[2][1]),
            Point::new(cfg.reference_points[3][0], cfg.reference_points[3][1]),
        ];

        let profile = match CalibrationProfile::compute(&pts, cfg.reference_distances_m, frame_size)
        {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("calibration degenerate ({e}) - using fallback distances");
                None
            }
        };

        Self {
            profile,
            default_lane_length_m: cfg.default_lane_length_m,
        }
    }

    /// No projective profile at all; speed reads as the invalid sentinel
    /// and lane lengths come from the configured default.
    pub fn uncalibrated(default_lane_length_m: f64) -> Self {
        Self {
            profile: None,
            default_lane_length_m,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.profile.is_some()
    }

    pub fn speed_kmh(&self, p1: Point, p2: Point, dt_secs: f64) -> f64 {
        match &self.profile {
            Some(p) => p.speed_kmh(p1, p2, dt_secs),
            None => SPEED_INVALID,
        }
    }

    /// Metric length of a lane polyline: sum of projected segment lengths.
    /// Falls back to the configured default when calibration is absent or
    /// any segment is unprojectable.
    pub fn lane_length_m(&self, polyline: &[Point]) -> f64 {
        let profile = match &self.profile {
            Some(p) => p,
            None => return self.default_lane_length_m,
        };
        if polyline.len() < 2 {
            return self.default_lane_length_m;
        }

        let mut total = 0.0;
        for pair in polyline.windows(2) {
            match profile.distance_m(pair[0], pair[1]) {
                Some(d) => total += d,
                None => return self.default_lane_length_m,
            }
        }
        if total < 1e-6 {
            return self.default_lane_length_m;
        }
        total
    }
}
