// src/regions.rs
//
// Named region store: lanes, stop line, turn regions, intersection,
// no-walk zones. Loaded once from config, immutable afterwards.

use crate::error::AnalyticsError;
use crate::geometry::{line_intersection, point_in_polygon, point_segment_distance, segments_intersect};
use crate::types::{Point, RegionConfig};
use std::collections::BTreeMap;

// Turn codes as published downstream.
pub const TURN_LEFT_INNER: i32 = 21;
pub const TURN_LEFT_OUTER: i32 = 22;
pub const TURN_RIGHT_INNER: i32 = 31;
pub const TURN_RIGHT_OUTER: i32 = 32;
pub const TURN_STRAIGHT: i32 = 11;
pub const TURN_U: i32 = 41;
pub const TURN_NONE: i32 = -1;

#[derive(Debug, Clone)]
pub struct RegionSet {
    lanes: BTreeMap<u32, Vec<Point>>,
    stop_line: [Point; 2],
    turn_left: Vec<Vec<Point>>,
    turn_right: Vec<Vec<Point>>,
    straight: Vec<Point>,
    u_turn: Vec<Point>,
    intersection: Vec<Point>,
    no_walk_zones: Vec<Vec<Point>>,
    waiting_areas: Vec<Vec<Point>>,
    lane_boundary_points: Vec<Point>,
}

fn to_points(raw: &[[f64; 2]]) -> Vec<Point> {
    raw.iter().map(|p| Point::new(p[0], p[1])).collect()
}

impl RegionSet {
    pub fn from_config(cfg: &RegionConfig) -> Result<Self, AnalyticsError> {
        if cfg.lanes.is_empty() {
            return Err(AnalyticsError::Configuration {
                feature: "regions",
                reason: "no lane polygons defined".into(),
            });
        }
        for (id, poly) in &cfg.lanes {
            if poly.len() < 3 {
                return Err(AnalyticsError::Configuration {
                    feature: "regions",
                    reason: format!("lane {id} polygon has {} points, need >= 3", poly.len()),
                });
            }
        }
        if cfg.stop_line.len() != 2 {
            return Err(AnalyticsError::Configuration {
                feature: "regions",
                reason: format!("stop line has {} points, need exactly 2", cfg.stop_line.len()),
            });
        }
        if cfg.intersection.len() < 3 {
            return Err(AnalyticsError::Configuration {
                feature: "regions",
                reason: "intersection polygon needs >= 3 points".into(),
            });
        }
        for (name, polys) in [("turn_left", &cfg.turn_left), ("turn_right", &cfg.turn_right)] {
            if polys.len() > 2 {
                return Err(AnalyticsError::Configuration {
                    feature: "regions",
                    reason: format!("{name} takes at most 2 polygons, got {}", polys.len()),
                });
            }
        }

        Ok(Self {
            lanes: cfg
                .lanes
                .iter()
                .map(|(id, poly)| (*id, to_points(poly)))
                .collect(),
            stop_line: [
                Point::new(cfg.stop_line[0][0], cfg.stop_line[0][1]),
                Point::new(cfg.stop_line[1][0], cfg.stop_line[1][1]),
            ],
            turn_left: cfg.turn_left.iter().map(|p| to_points(p)).collect(),
            turn_right: cfg.turn_right.iter().map(|p| to_points(p)).collect(),
            straight: to_points(&cfg.straight),
            u_turn: to_points(&cfg.u_turn),
            intersection: to_points(&cfg.intersection),
            no_walk_zones: cfg.no_walk_zones.iter().map(|p| to_points(p)).collect(),
            waiting_areas: cfg.waiting_areas.iter().map(|p| to_points(p)).collect(),
            lane_boundary_points: to_points(&cfg.lane_boundary_points),
        })
    }

    pub fn lane_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.lanes.keys().copied()
    }

    pub fn lane_polygon(&self, lane: u32) -> Option<&[Point]> {
        self.lanes.get(&lane).map(|p| p.as_slice())
    }

    /// First lane polygon (in id order) containing `p`, else 0.
    pub fn lane_of(&self, p: Point) -> u32 {
        for (id, poly) in &self.lanes {
            if point_in_polygon(p, poly) {
                return *id;
            }
        }
        0
    }

    /// True when the motion segment (prev → curr) crosses the stop line.
    /// An invalid `prev` (no prior sighting yet) never crosses.
    pub fn stop_line_crossed(&self, prev: Point, curr: Point) -> bool {
        if !prev.is_valid() {
            return false;
        }
        segments_intersect(prev, curr, self.stop_line[0], self.stop_line[1])
    }

    pub fn near_stop_line(&self, p: Point, within_px: f64) -> bool {
        point_segment_distance(p, self.stop_line[0], self.stop_line[1]) <= within_px
    }

    /// Turn-region code for a position past the stop line: 21/22 left,
    /// 31/32 right, 11 straight, -1 none. U-turn is a separate predicate.
    pub fn turn_region_of(&self, p: Point) -> i32 {
        for (i, poly) in self.turn_left.iter().enumerate() {
            if point_in_polygon(p, poly) {
                return if i == 0 { TURN_LEFT_INNER } else { TURN_LEFT_OUTER };
            }
        }
        for (i, poly) in self.turn_right.iter().enumerate() {
            if point_in_polygon(p, poly) {
                return if i == 0 { TURN_RIGHT_INNER } else { TURN_RIGHT_OUTER };
            }
        }
        if point_in_polygon(p, &self.straight) {
            return TURN_STRAIGHT;
        }
        TURN_NONE
    }

    pub fn is_u_turn(&self, p: Point) -> bool {
        point_in_polygon(p, &self.u_turn)
    }

    pub fn in_intersection(&self, p: Point) -> bool {
        point_in_polygon(p, &self.intersection)
    }

    pub fn in_no_walk_zone(&self, p: Point) -> bool {
        self.no_walk_zones.iter().any(|poly| point_in_polygon(p, poly))
    }

    pub fn in_waiting_area(&self, p: Point) -> bool {
        self.waiting_areas.iter().any(|poly| point_in_polygon(p, poly))
    }

    /// Lane inference from stop-line crossing geometry, for the case where
    /// polygon containment cannot be trusted (vehicle already over the
    /// line). Intersects the motion segment with the stop line, then finds
    /// the adjacent pair of ordered lane-boundary points straddling that
    /// intersection. Pair (i, i+1) delimits lane i+1.
    pub fn lane_of_4k(&self, prev: Point, curr: Point) -> u32 {
        if !prev.is_valid() || self.lane_boundary_points.len() < 2 {
            return 0;
        }
        let crossing = match line_intersection(prev, curr, self.stop_line[0], self.stop_line[1]) {
            Some(p) => p,
            None => return 0,
        };

        for (i, pair) in self.lane_boundary_points.windows(2).enumerate() {
            let (a, b) = (pair[0], pair[1]);
            let near_horizontal = (b.y - a.y).abs() < (b.x - a.x).abs();
            let straddles = if near_horizontal {
                crossing.x >= a.x.min(b.x) && crossing.x <= a.x.max(b.x)
            } else {
                crossing.y >= a.y.min(b.y) && crossing.y <= a.y.max(b.y)
            };
            if straddles {
                return (i + 1) as u32;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegionConfig;

    fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Vec<[f64; 2]> {
        vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]]
    }

    /// Two vertical lanes side by side, a horizontal stop line at y = 200,
    /// turn regions above it.
    fn make_regions() -> RegionSet {
        let mut lanes = BTreeMap::new();
        lanes.insert(1, rect(0.0, 200.0, 100.0, 600.0));
        lanes.insert(2, rect(100.0, 200.0, 200.0, 600.0));

        let cfg = RegionConfig {
            lanes,
            stop_line: vec![[0.0, 200.0], [200.0, 200.0]],
            turn_left: vec![rect(-200.0, 0.0, -100.0, 200.0), rect(-100.0, 0.0, 0.0, 200.0)],
            turn_right: vec![rect(200.0, 0.0, 300.0, 200.0), rect(300.0, 0.0, 400.0, 200.0)],
            straight: rect(0.0, 0.0, 200.0, 200.0),
            u_turn: rect(-400.0, 0.0, -300.0, 200.0),
            intersection: rect(-200.0, 0.0, 400.0, 250.0),
            no_walk_zones: vec![rect(0.0, 150.0, 200.0, 250.0)],
            waiting_areas: vec![],
            lane_boundary_points: vec![[0.0, 200.0], [100.0, 200.0], [200.0, 200.0]],
        };
        RegionSet::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_lane_of_id_order() {
        let r = make_regions();
        assert_eq!(r.lane_of(Point::new(50.0, 400.0)), 1);
        assert_eq!(r.lane_of(Point::new(150.0, 400.0)), 2);
        assert_eq!(r.lane_of(Point::new(500.0, 400.0)), 0);
    }

    #[test]
    fn test_stop_line_crossed() {
        let r = make_regions();
        assert!(r.stop_line_crossed(Point::new(50.0, 250.0), Point::new(50.0, 150.0)));
        assert!(!r.stop_line_crossed(Point::new(50.0, 250.0), Point::new(50.0, 210.0)));
    }

    #[test]
    fn test_stop_line_sentinel_prev_never_crosses() {
        let r = make_regions();
        assert!(!r.stop_line_crossed(Point::invalid(), Point::new(50.0, 150.0)));
    }

    #[test]
    fn test_turn_region_codes() {
        let r = make_regions();
        assert_eq!(r.turn_region_of(Point::new(-150.0, 100.0)), TURN_LEFT_INNER);
        assert_eq!(r.turn_region_of(Point::new(-50.0, 100.0)), TURN_LEFT_OUTER);
        assert_eq!(r.turn_region_of(Point::new(250.0, 100.0)), TURN_RIGHT_INNER);
        assert_eq!(r.turn_region_of(Point::new(350.0, 100.0)), TURN_RIGHT_OUTER);
        assert_eq!(r.turn_region_of(Point::new(100.0, 100.0)), TURN_STRAIGHT);
        assert_eq!(r.turn_region_of(Point::new(500.0, 500.0)), TURN_NONE);
    }

    #[test]
    fn test_u_turn_is_separate_predicate() {
        let r = make_regions();
        assert!(r.is_u_turn(Point::new(-350.0, 100.0)));
        assert_eq!(r.turn_region_of(Point::new(-350.0, 100.0)), TURN_NONE);
    }

    #[test]
    fn test_near_stop_line() {
        let r = make_regions();
        assert!(r.near_stop_line(Point::new(100.0, 230.0), 40.0));
        assert!(!r.near_stop_line(Point::new(100.0, 300.0), 40.0));
    }

    #[test]
    fn test_lane_of_4k_uses_crossing_geometry() {
        let r = make_regions();
        // Crossing at x = 50 lands between boundary points 0 and 1: lane 1.
        assert_eq!(r.lane_of_4k(Point::new(50.0, 250.0), Point::new(50.0, 150.0)), 1);
        // Crossing at x = 150: lane 2.
        assert_eq!(r.lane_of_4k(Point::new(150.0, 250.0), Point::new(150.0, 150.0)), 2);
        // Diagonal motion still resolves via the intersection point.
        assert_eq!(r.lane_of_4k(Point::new(120.0, 260.0), Point::new(180.0, 140.0)), 2);
    }

    #[test]
    fn test_lane_of_4k_sentinel_and_missing_boundaries() {
        let r = make_regions();
        assert_eq!(r.lane_of_4k(Point::invalid(), Point::new(50.0, 150.0)), 0);
    }

    #[test]
    fn test_no_walk_zone() {
        let r = make_regions();
        assert!(r.in_no_walk_zone(Point::new(100.0, 200.0)));
        assert!(!r.in_no_walk_zone(Point::new(100.0, 400.0)));
    }

    #[test]
    fn test_config_validation_rejects_bad_shapes() {
        let mut lanes = BTreeMap::new();
        lanes.insert(1, vec![[0.0, 0.0], [1.0, 1.0]]);
        let cfg = RegionConfig {
            lanes,
            stop_line: vec![[0.0, 0.0], [1.0, 0.0]],
            turn_left: vec![],
            turn_right: vec![],
            straight: vec![],
            u_turn: vec![],
            intersection: rect(0.0, 0.0, 10.0, 10.0),
            no_walk_zones: vec![],
            waiting_areas: vec![],
            lane_boundary_points: vec![],
        };
        assert!(RegionSet::from_config(&cfg).is_err());
    }
}
