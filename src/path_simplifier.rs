//! Polyline simplification and smoothing.
//!
//! Every backend funnels its pixel chains through [`refine_chain`], which
//! simplifies with Douglas-Peucker and optionally fits cubic Béziers.

use crate::bezier_fitter::BezierFitter;
use crate::vectorizer::{PathStyle, Point, VectorPath};

/// Ramer-Douglas-Peucker simplification of an open polyline.
///
/// Endpoints are always kept and the output is a subsequence of the input.
pub fn douglas_peucker(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() <= 2 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    // Explicit stack: long chains would overflow a recursive version.
    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((first, last)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }
        let mut max_dist = 0.0;
        let mut max_idx = first;
        for i in first + 1..last {
            let d = point_to_segment_distance(&points[i], &points[first], &points[last]);
            if d > max_dist {
                max_dist = d;
                max_idx = i;
            }
        }
        if max_dist > epsilon {
            keep[max_idx] = true;
            stack.push((first, max_idx));
            stack.push((max_idx, last));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

/// Douglas-Peucker for a closed ring given without a repeated end point.
///
/// The ring is split at the vertex farthest from the first one so both
/// halves keep an anchor.
pub fn douglas_peucker_closed(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() <= 3 {
        return points.to_vec();
    }
    let anchor = points[0];
    let far = points
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| {
            anchor
                .distance(a.1)
                .partial_cmp(&anchor.distance(b.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(points.len() / 2);

    let mut first_half = douglas_peucker(&points[..=far], epsilon);
    let mut second: Vec<Point> = points[far..].to_vec();
    second.push(anchor);
    let second_half = douglas_peucker(&second, epsilon);

    first_half.pop();
    first_half.extend(second_half);
    first_half.pop();
    first_half
}

pub fn point_to_segment_distance(point: &Point, start: &Point, end: &Point) -> f64 {
    let d = *end - *start;
    let len_sq = d.dot(&d);
    if len_sq < 1e-12 {
        return point.distance(start);
    }
    let t = ((*point - *start).dot(&d) / len_sq).clamp(0.0, 1.0);
    point.distance(&start.lerp(end, t))
}

/// Unsigned shoelace area.
pub fn polygon_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 0..points.len() {
        let j = (i + 1) % points.len();
        area += points[i].x * points[j].y - points[j].x * points[i].y;
    }
    area.abs() / 2.0
}

/// 1-2-1 smoothing of a closed ring; point count is unchanged.
pub fn smooth_closed(points: &[Point], iterations: usize) -> Vec<Point> {
    if iterations == 0 || points.len() < 3 {
        return points.to_vec();
    }
    let mut current = points.to_vec();
    let n = current.len();
    for _ in 0..iterations.min(3) {
        current = (0..n)
            .map(|i| {
                let prev = current[(i + n - 1) % n];
                let next = current[(i + 1) % n];
                prev * 0.25 + current[i] * 0.5 + next * 0.25
            })
            .collect();
    }
    current
}

/// 1-2-1 smoothing of an open polyline with fixed endpoints.
pub fn smooth_open(points: &[Point], iterations: usize) -> Vec<Point> {
    if iterations == 0 || points.len() < 3 {
        return points.to_vec();
    }
    let mut current = points.to_vec();
    let n = current.len();
    for _ in 0..iterations.min(3) {
        let mut next = current.clone();
        for i in 1..n - 1 {
            next[i] = current[i - 1] * 0.25 + current[i] * 0.5 + current[i + 1] * 0.25;
        }
        current = next;
    }
    current
}

/// Turns a pixel chain into a styled path: simplify, then optionally fit curves.
///
/// Closed chains must not repeat their first point at the end. Returns `None`
/// when the chain collapses below two distinct points.
pub fn refine_chain(
    points: &[Point],
    closed: bool,
    epsilon: f64,
    bezier: bool,
    style: PathStyle,
) -> Option<VectorPath> {
    let simplified = if closed {
        douglas_peucker_closed(points, epsilon)
    } else {
        douglas_peucker(points, epsilon)
    };
    let mut simplified = simplified;
    simplified.dedup_by(|a, b| a.distance(b) < 1e-9);
    if simplified.len() < 2 || (closed && simplified.len() < 3) {
        return None;
    }

    if bezier {
        // Fit against the denser chain so curvature survives simplification.
        let fitter = BezierFitter::new(epsilon.max(0.5));
        let segments = if points.len() > simplified.len() * 4 {
            fitter.fit_path(&smooth_for_fit(points, closed), closed)
        } else {
            fitter.fit_path(&simplified, closed)
        };
        if segments.is_empty() {
            return None;
        }
        return Some(VectorPath {
            segments,
            closed,
            style,
        });
    }

    VectorPath::from_polyline(&simplified, closed, style)
}

fn smooth_for_fit(points: &[Point], closed: bool) -> Vec<Point> {
    if closed {
        smooth_closed(points, 1)
    } else {
        smooth_open(points, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectorizer::PathSegment;
    use rgb::RGBA8;

    fn style() -> PathStyle {
        PathStyle::stroked(RGBA8::new(0, 0, 0, 255), 1.0)
    }

    #[test]
    fn test_douglas_peucker_collinear() {
        let points: Vec<Point> = (0..20).map(|i| Point::new(i as f64, i as f64 * 0.5)).collect();
        let simplified = douglas_peucker(&points, 0.1);
        assert_eq!(simplified, vec![points[0], points[19]]);
    }

    #[test]
    fn test_douglas_peucker_keeps_corner() {
        let mut points: Vec<Point> = (0..=10).map(|i| Point::new(i as f64, 0.0)).collect();
        points.extend((1..=10).map(|i| Point::new(10.0, i as f64)));
        let simplified = douglas_peucker(&points, 0.5);
        assert_eq!(simplified.len(), 3);
        assert_eq!(simplified[1], Point::new(10.0, 0.0));
    }

    #[test]
    fn test_douglas_peucker_is_subsequence_within_epsilon() {
        let points: Vec<Point> = (0..100)
            .map(|i| {
                let t = i as f64 * 0.1;
                Point::new(t * 10.0, (t).sin() * 5.0)
            })
            .collect();
        let eps = 0.4;
        let simplified = douglas_peucker(&points, eps);
        let mut cursor = 0;
        for p in &simplified {
            while points[cursor] != *p {
                cursor += 1;
            }
        }
        for p in &points {
            let best = simplified
                .windows(2)
                .map(|w| point_to_segment_distance(p, &w[0], &w[1]))
                .fold(f64::INFINITY, f64::min);
            assert!(best <= eps + 1e-9);
        }
    }

    #[test]
    fn test_douglas_peucker_closed_square() {
        let mut ring = Vec::new();
        for i in 0..10 {
            ring.push(Point::new(i as f64, 0.0));
        }
        for i in 0..10 {
            ring.push(Point::new(10.0, i as f64));
        }
        for i in 0..10 {
            ring.push(Point::new(10.0 - i as f64, 10.0));
        }
        for i in 0..10 {
            ring.push(Point::new(0.0, 10.0 - i as f64));
        }
        let simplified = douglas_peucker_closed(&ring, 0.5);
        assert_eq!(simplified.len(), 4);
        assert!((polygon_area(&simplified) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_smooth_open_keeps_endpoints() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 5.0),
            Point::new(2.0, 0.0),
        ];
        let smoothed = smooth_open(&points, 2);
        assert_eq!(smoothed[0], points[0]);
        assert_eq!(smoothed[2], points[2]);
        assert!(smoothed[1].y < 5.0);
    }

    #[test]
    fn test_smooth_closed_preserves_count() {
        let ring = vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
        ];
        assert_eq!(smooth_closed(&ring, 1).len(), 4);
    }

    #[test]
    fn test_refine_chain_lines_by_default() {
        let points: Vec<Point> = (0..30).map(|i| Point::new(i as f64, 2.0)).collect();
        let path = refine_chain(&points, false, 1.0, false, style()).unwrap();
        assert_eq!(path.segments.len(), 1);
        assert!(matches!(path.segments[0], PathSegment::Line { .. }));
    }

    #[test]
    fn test_refine_chain_rejects_degenerate() {
        let points = vec![Point::new(1.0, 1.0), Point::new(1.0, 1.0)];
        assert!(refine_chain(&points, false, 1.0, false, style()).is_none());
    }

    #[test]
    fn test_refine_chain_with_bezier_produces_cubics() {
        let points: Vec<Point> = (0..=60)
            .map(|i| {
                let a = std::f64::consts::PI * i as f64 / 60.0;
                Point::new(50.0 + 40.0 * a.cos(), 50.0 - 40.0 * a.sin())
            })
            .collect();
        let path = refine_chain(&points, false, 0.5, true, style()).unwrap();
        assert!(path
            .segments
            .iter()
            .any(|s| matches!(s, PathSegment::Cubic { .. })));
        assert!(path.start().unwrap().distance(&points[0]) < 1e-9);
        assert!(path.end().unwrap().distance(&points[60]) < 1e-9);
    }
}
