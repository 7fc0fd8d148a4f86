// src/geometry.rs
//
// Planar primitives shared by region classification and calibration.
// Everything here is pure: no config, no logging, no state.

use crate::types::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Collinear,
    Clockwise,
    CounterClockwise,
}

fn orientation(p: Point, q: Point, r: Point) -> Orientation {
    let cross = (q.y - p.y) * (r.x - q.x) - (q.x - p.x) * (r.y - q.y);
    if cross.abs() < f64::EPSILON {
        Orientation::Collinear
    } else if cross > 0.0 {
        Orientation::Clockwise
    } else {
        Orientation::CounterClockwise
    }
}

/// For collinear p, q, r: does q lie on segment pr?
fn on_segment(p: Point, q: Point, r: Point) -> bool {
    q.x <= p.x.max(r.x) && q.x >= p.x.min(r.x) && q.y <= p.y.max(r.y) && q.y >= p.y.min(r.y)
}

/// Four-orientation segment intersection test, with the three degenerate
/// collinear sub-cases handled explicitly.
pub fn segments_intersect(a1: Point, a2: Point, b1: Point, b2: Point) -> bool {
    let o1 = orientation(a1, a2, b1);
    let o2 = orientation(a1, a2, b2);
    let o3 = orientation(b1, b2, a1);
    let o4 = orientation(b1, b2, a2);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    (o1 == Orientation::Collinear && on_segment(a1, b1, a2))
        || (o2 == Orientation::Collinear && on_segment(a1, b2, a2))
        || (o3 == Orientation::Collinear && on_segment(b1, a1, b2))
        || (o4 == Orientation::Collinear && on_segment(b1, a2, b2))
}

/// Even-odd ray cast: count crossings of a ray from `p` to (+inf, p.y)
/// against each polygon edge. Collinear points that land on an edge count
/// as a hit, so edge membership follows the parity of the remaining edges
/// rather than a dedicated tie-break.
pub fn point_in_polygon(p: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let ray_end = Point::new(f64::MAX / 2.0, p.y);
    let mut crossings = 0usize;

    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[(i + 1) % polygon.len()];

        if segments_intersect(a, b, p, ray_end) {
            // A ray through a vertex would double-count; the collinear check
            // settles it by asking whether p itself sits on the edge.
            if orientation(a, p, b) == Orientation::Collinear {
                return on_segment(a, p, b);
            }
            crossings += 1;
        }
    }

    crossings % 2 == 1
}

/// Intersection point of two infinite lines given by (a1,a2) and (b1,b2).
/// Returns `None` for parallel (or numerically parallel) lines.
pub fn line_intersection(a1: Point, a2: Point, b1: Point, b2: Point) -> Option<Point> {
    let d1x = a2.x - a1.x;
    let d1y = a2.y - a1.y;
    let d2x = b2.x - b1.x;
    let d2y = b2.y - b1.y;

    let denom = d1x * d2y - d1y * d2x;
    if denom.abs() < 1e-9 {
        return None;
    }

    let t = ((b1.x - a1.x) * d2y - (b1.y - a1.y) * d2x) / denom;
    Some(Point::new(a1.x + t * d1x, a1.y + t * d1y))
}

/// Shortest pixel distance from `p` to segment (a, b).
pub fn point_segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let abx = b.x - a.x;
    let aby = b.y - a.y;
    let len_sq = abx * abx + aby * aby;
    if len_sq < f64::EPSILON {
        return ((p.x - a.x).powi(2) + (p.y - a.y).powi(2)).sqrt();
    }
    let t = (((p.x - a.x) * abx + (p.y - a.y) * aby) / len_sq).clamp(0.0, 1.0);
    let cx = a.x + t * abx;
    let cy = a.y + t * aby;
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ]
    }

    #[test]
    fn test_point_inside_square() {
        assert!(point_in_polygon(Point::new(5.0, 5.0), &square()));
    }

    #[test]
    fn test_point_outside_square() {
        assert!(!point_in_polygon(Point::new(15.0, 5.0), &square()));
        assert!(!point_in_polygon(Point::new(-1.0, 5.0), &square()));
        assert!(!point_in_polygon(Point::new(5.0, 11.0), &square()));
    }

    #[test]
    fn test_degenerate_polygon_is_never_hit() {
        let line = vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)];
        assert!(!point_in_polygon(Point::new(5.0, 0.0), &line));
    }

    #[test]
    fn test_concave_polygon() {
        // A "U" shape: the notch between the arms is outside.
        let u = vec![
            Point::new(0.0, 0.0),
            Point::new(12.0, 0.0),
            Point::new(12.0, 10.0),
            Point::new(8.0, 10.0),
            Point::new(8.0, 4.0),
            Point::new(4.0, 4.0),
            Point::new(4.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        assert!(point_in_polygon(Point::new(2.0, 8.0), &u));
        assert!(point_in_polygon(Point::new(10.0, 8.0), &u));
        assert!(!point_in_polygon(Point::new(6.0, 8.0), &u));
    }

    #[test]
    fn test_segments_crossing() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 0.0),
        ));
    }

    #[test]
    fn test_segments_disjoint() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(5.0, 1.0),
            Point::new(9.0, 1.0),
        ));
    }

    #[test]
    fn test_segments_collinear_overlap() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(6.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(10.0, 0.0),
        ));
    }

    #[test]
    fn test_segments_collinear_disjoint() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(3.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(10.0, 0.0),
        ));
    }

    #[test]
    fn test_segment_touching_at_endpoint() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(5.0, 5.0),
            Point::new(5.0, 5.0),
            Point::new(10.0, 0.0),
        ));
    }

    #[test]
    fn test_line_intersection_basic() {
        let p = line_intersection(
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 0.0),
        )
        .unwrap();
        assert!((p.x - 5.0).abs() < 1e-9);
        assert!((p.y - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_intersection_parallel_is_none() {
        assert!(line_intersection(
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(10.0, 1.0),
        )
        .is_none());
    }

    #[test]
    fn test_point_segment_distance() {
        let d = point_segment_distance(
            Point::new(5.0, 3.0),
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
        );
        assert!((d - 3.0).abs() < 1e-9);

        // Beyond the endpoint, distance is to the endpoint.
        let d = point_segment_distance(
            Point::new(14.0, 3.0),
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
        );
        assert!((d - 5.0).abs() < 1e-9);
    }
}
