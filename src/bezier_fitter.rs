//! Least-squares cubic Bézier fitting with Newton-Raphson reparameterization.
//!
//! Runs of points are split at sharp turns, fitted piecewise, and emitted as
//! [`PathSegment`]s. Pieces that are effectively straight stay `Line`s.

use crate::vectorizer::{PathSegment, Point};

/// Turn angle above which a vertex is treated as a corner.
const CORNER_TURN_DEG: f64 = 30.0;
/// Longer runs are split before fitting.
const MAX_POINTS_PER_PIECE: usize = 40;

/// Control polygon of one cubic piece.
#[derive(Debug, Clone, Copy)]
struct Cubic([Point; 4]);

impl Cubic {
    fn straight(a: Point, b: Point) -> Self {
        Cubic([a, a.lerp(&b, 1.0 / 3.0), a.lerp(&b, 2.0 / 3.0), b])
    }

    fn eval(&self, t: f64) -> Point {
        let [p0, p1, p2, p3] = self.0;
        let mt = 1.0 - t;
        p0 * (mt * mt * mt) + p1 * (3.0 * mt * mt * t) + p2 * (3.0 * mt * t * t) + p3 * (t * t * t)
    }

    fn d1(&self, t: f64) -> Point {
        let [p0, p1, p2, p3] = self.0;
        let mt = 1.0 - t;
        (p1 - p0) * (3.0 * mt * mt) + (p2 - p1) * (6.0 * mt * t) + (p3 - p2) * (3.0 * t * t)
    }

    fn d2(&self, t: f64) -> Point {
        let [p0, p1, p2, p3] = self.0;
        (p2 - p1 * 2.0 + p0) * (6.0 * (1.0 - t)) + (p3 - p2 * 2.0 + p1) * (6.0 * t)
    }

    /// Both control points lie within a pixel of the chord.
    fn is_straight(&self) -> bool {
        let [p0, p1, p2, p3] = self.0;
        let chord = p3 - p0;
        let len = chord.length();
        if len < 0.5 {
            return true;
        }
        let off = |p: Point| ((p - p0).x * chord.y - (p - p0).y * chord.x).abs() / len;
        off(p1) < 1.0 && off(p2) < 1.0
    }

    fn into_segment(self) -> PathSegment {
        let [from, ctrl1, ctrl2, to] = self.0;
        if self.is_straight() {
            PathSegment::Line { from, to }
        } else {
            PathSegment::Cubic {
                from,
                ctrl1,
                ctrl2,
                to,
            }
        }
    }
}

pub struct BezierFitter {
    tolerance: f64,
    max_iterations: usize,
}

impl BezierFitter {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            max_iterations: 12,
        }
    }

    /// Fits `points` with connected segments. A closed path gets a final
    /// segment back to its first point when the ends are apart.
    pub fn fit_path(&self, points: &[Point], closed: bool) -> Vec<PathSegment> {
        if points.len() < 2 {
            return Vec::new();
        }

        let corners = sharp_corners(points);
        let mut pieces = Vec::new();
        let mut bounds = vec![0];
        bounds.extend(corners.iter().copied().filter(|&c| c > 0 && c < points.len() - 1));
        bounds.push(points.len() - 1);
        bounds.dedup();
        for pair in bounds.windows(2) {
            if pair[1] > pair[0] {
                self.fit_run(&points[pair[0]..=pair[1]], &mut pieces);
            }
        }

        if pieces.len() > 1 && corners.is_empty() {
            smooth_joins(&mut pieces);
        }
        clamp_controls(points, &mut pieces);

        let mut segments: Vec<PathSegment> = pieces.into_iter().map(Cubic::into_segment).collect();
        if closed {
            if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
                let (start, end) = (first.start(), last.end());
                if start.distance(&end) > 0.5 {
                    segments.push(PathSegment::Line {
                        from: end,
                        to: start,
                    });
                }
            }
        }
        segments
    }

    fn fit_run(&self, points: &[Point], out: &mut Vec<Cubic>) {
        let n = points.len();
        if n < 2 {
            return;
        }
        if n == 2 || self.nearly_linear(points) {
            out.push(Cubic::straight(points[0], points[n - 1]));
            return;
        }
        if n == 3 {
            let (a, m, b) = (points[0], points[1], points[2]);
            out.push(Cubic([a, a.lerp(&m, 2.0 / 3.0), b.lerp(&m, 2.0 / 3.0), b]));
            return;
        }
        if n > MAX_POINTS_PER_PIECE {
            let split = widest_turn(points);
            self.fit_run(&points[..=split], out);
            self.fit_run(&points[split..], out);
            return;
        }

        let mut params = chord_lengths(points);
        let mut best = least_squares(points, &params);
        let (mut best_err, mut worst_idx) = max_error(&best, points);

        let mut iteration = 0;
        while best_err > self.tolerance && iteration < self.max_iterations {
            iteration += 1;
            params = reparameterize(&best, points, &params);
            let candidate = least_squares(points, &params);
            let (err, idx) = max_error(&candidate, points);
            if err >= best_err {
                break;
            }
            best = candidate;
            best_err = err;
            worst_idx = idx;
        }

        if best_err <= self.tolerance {
            out.push(best);
        } else {
            let split = worst_idx.clamp(2, n - 2);
            self.fit_run(&points[..=split], out);
            self.fit_run(&points[split..], out);
        }
    }

    /// Max deviation from the chord below half the tolerance or 1% of its length.
    fn nearly_linear(&self, points: &[Point]) -> bool {
        let start = points[0];
        let chord = points[points.len() - 1] - start;
        let len = chord.length();
        if len < 1e-6 {
            return true;
        }
        let threshold = (self.tolerance * 0.5).max(len * 0.01);
        points[1..points.len() - 1]
            .iter()
            .all(|p| ((p.y - start.y) * chord.x - (p.x - start.x) * chord.y).abs() / len <= threshold)
    }
}

fn sharp_corners(points: &[Point]) -> Vec<usize> {
    let limit = CORNER_TURN_DEG.to_radians().cos();
    (1..points.len().saturating_sub(1))
        .filter(|&i| {
            let a = points[i] - points[i - 1];
            let b = points[i + 1] - points[i];
            let (la, lb) = (a.length(), b.length());
            la > 1e-6 && lb > 1e-6 && a.dot(&b) / (la * lb) < limit
        })
        .collect()
}

/// Index with the largest direction change over a two-point stride.
fn widest_turn(points: &[Point]) -> usize {
    let n = points.len();
    let mut best_idx = n / 2;
    let mut best = 0.0;
    for i in 2..n - 2 {
        let a = points[i] - points[i - 2];
        let b = points[i + 2] - points[i];
        let denom = a.length() * b.length();
        if denom > 0.0 {
            let cross = (a.x * b.y - a.y * b.x).abs() / denom;
            if cross > best {
                best = cross;
                best_idx = i;
            }
        }
    }
    best_idx.clamp(2, n - 2)
}

fn chord_lengths(points: &[Point]) -> Vec<f64> {
    let mut t = Vec::with_capacity(points.len());
    let mut acc = 0.0;
    t.push(0.0);
    for w in points.windows(2) {
        acc += w[0].distance(&w[1]);
        t.push(acc);
    }
    if acc > 0.0 {
        t.iter_mut().for_each(|v| *v /= acc);
    }
    if let Some(last) = t.last_mut() {
        *last = 1.0;
    }
    t
}

/// Endpoints fixed; solves the 2x2 normal equations for the inner controls.
fn least_squares(points: &[Point], params: &[f64]) -> Cubic {
    let start = points[0];
    let end = points[points.len() - 1];
    let (mut a11, mut a12, mut a22) = (0.0, 0.0, 0.0);
    let (mut r1, mut r2) = (Point::default(), Point::default());

    for (p, &t) in points.iter().zip(params) {
        let mt = 1.0 - t;
        let b0 = mt * mt * mt;
        let b1 = 3.0 * mt * mt * t;
        let b2 = 3.0 * mt * t * t;
        let b3 = t * t * t;
        a11 += b1 * b1;
        a12 += b1 * b2;
        a22 += b2 * b2;
        let residual = *p - start * b0 - end * b3;
        r1 = r1 + residual * b1;
        r2 = r2 + residual * b2;
    }

    let det = a11 * a22 - a12 * a12;
    if det.abs() < 1e-12 {
        return Cubic::straight(start, end);
    }
    let c1 = (r1 * a22 - r2 * a12) * (1.0 / det);
    let c2 = (r2 * a11 - r1 * a12) * (1.0 / det);
    Cubic([start, c1, c2, end])
}

fn max_error(curve: &Cubic, points: &[Point]) -> (f64, usize) {
    let params = chord_lengths(points);
    let mut worst = (0.0, 0);
    for i in 1..points.len() - 1 {
        let err = curve.eval(params[i]).distance(&points[i]);
        if err > worst.0 {
            worst = (err, i);
        }
    }
    worst
}

/// One Newton step on |B(t) - P|² per interior point, kept strictly increasing.
fn reparameterize(curve: &Cubic, points: &[Point], params: &[f64]) -> Vec<f64> {
    let mut next = params.to_vec();
    for i in 1..points.len() - 1 {
        let t = params[i];
        let diff = curve.eval(t) - points[i];
        let d1 = curve.d1(t);
        let d2 = curve.d2(t);
        let denom = d1.dot(&d1) + diff.dot(&d2);
        if denom.abs() > 1e-12 {
            next[i] = (t - diff.dot(&d1) / denom).clamp(0.0, 1.0);
        }
    }
    for i in 1..next.len() {
        if next[i] <= next[i - 1] {
            next[i] = next[i - 1] + 1e-10;
        }
    }
    next[0] = 0.0;
    if let Some(last) = next.last_mut() {
        *last = 1.0;
    }
    next
}

/// Aligns each incoming tangent with the previous outgoing tangent.
fn smooth_joins(pieces: &mut [Cubic]) {
    for i in 1..pieces.len() {
        let [_, _, prev_c2, prev_end] = pieces[i - 1].0;
        let incoming = prev_end - prev_c2;
        let outgoing = pieces[i].0[1] - pieces[i].0[0];
        let (li, lo) = (incoming.length(), outgoing.length());
        if li > 1e-10 && lo > 1e-10 {
            pieces[i].0[1] = pieces[i].0[0] + incoming * (lo / li);
        }
    }
}

/// Keeps control points within a margin of the input's bounding box.
fn clamp_controls(points: &[Point], pieces: &mut [Cubic]) {
    let (mut lo, mut hi) = (
        Point::new(f64::INFINITY, f64::INFINITY),
        Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
    );
    for p in points {
        lo = Point::new(lo.x.min(p.x), lo.y.min(p.y));
        hi = Point::new(hi.x.max(p.x), hi.y.max(p.y));
    }
    let margin = ((hi.x - lo.x).max(hi.y - lo.y) * 0.15).max(2.0);
    for piece in pieces {
        for c in &mut piece.0[1..3] {
            c.x = c.x.clamp(lo.x - margin, hi.x + margin);
            c.y = c.y.clamp(lo.y - margin, hi.y + margin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(n: usize, radius: f64) -> Vec<Point> {
        (0..=n)
            .map(|i| {
                let t = i as f64 / n as f64 * std::f64::consts::PI;
                Point::new(t.cos() * radius + radius, t.sin() * radius)
            })
            .collect()
    }

    #[test]
    fn test_fit_path_two_points_is_line() {
        let fitter = BezierFitter::new(2.0);
        let segments = fitter.fit_path(&[Point::new(0.0, 0.0), Point::new(10.0, 10.0)], false);
        assert_eq!(
            segments,
            vec![PathSegment::Line {
                from: Point::new(0.0, 0.0),
                to: Point::new(10.0, 10.0)
            }]
        );
    }

    #[test]
    fn test_fit_path_semicircle_is_compact_and_connected() {
        let fitter = BezierFitter::new(2.0);
        let points = arc(20, 50.0);
        let segments = fitter.fit_path(&points, false);
        assert!(!segments.is_empty());
        assert!(segments.len() <= 10);
        for w in segments.windows(2) {
            assert!(w[0].end().distance(&w[1].start()) < 1e-9);
        }
        assert!(segments.iter().any(|s| matches!(s, PathSegment::Cubic { .. })));
    }

    #[test]
    fn test_fit_stays_within_tolerance_of_samples() {
        let fitter = BezierFitter::new(1.0);
        let points = arc(30, 40.0);
        let segments = fitter.fit_path(&points, false);
        for p in &points {
            let nearest = segments
                .iter()
                .flat_map(|s| (0..=50).map(move |i| s.point_at(i as f64 / 50.0)))
                .map(|q| q.distance(p))
                .fold(f64::INFINITY, f64::min);
            assert!(nearest < 1.5, "sample {p:?} is {nearest} away");
        }
    }

    #[test]
    fn test_fit_path_closed_returns_to_start() {
        let fitter = BezierFitter::new(2.0);
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        let segments = fitter.fit_path(&points, true);
        assert_eq!(segments.last().unwrap().end(), Point::new(0.0, 0.0));
    }

    #[test]
    fn test_reparameterize_monotonic() {
        let curve = Cubic([
            Point::new(0.0, 0.0),
            Point::new(5.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(15.0, 0.0),
        ]);
        let points: Vec<Point> = (0..=10).map(|i| curve.eval(i as f64 / 10.0)).collect();
        let refined = reparameterize(&curve, &points, &chord_lengths(&points));
        assert!(refined.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(refined[0], 0.0);
        assert_eq!(*refined.last().unwrap(), 1.0);
    }

    #[test]
    fn test_control_point_clamping() {
        let fitter = BezierFitter::new(2.0);
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 5.0),
            Point::new(2.0, 0.0),
            Point::new(3.0, 5.0),
            Point::new(4.0, 0.0),
        ];
        for segment in fitter.fit_path(&points, false) {
            if let PathSegment::Cubic { ctrl1, ctrl2, .. } = segment {
                for c in [ctrl1, ctrl2] {
                    assert!(c.x >= -2.0 && c.x <= 6.0);
                    assert!(c.y >= -2.0 && c.y <= 7.0);
                }
            }
        }
    }
}
