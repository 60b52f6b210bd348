//! Hand-drawn styling: tremor, variable stroke weight and tapered ends.
//!
//! Randomness is seeded per primitive index, so the same input and seed
//! always produce the same strokes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::HandDrawnStyle;
use crate::vectorizer::{PathSegment, PathStyle, Point, Primitive, VectorPath};

/// Largest vertex displacement in pixels at `tremor = 1`.
const TREMOR_PIXELS: f64 = 3.0;
/// Fraction of the stroke length over which each end tapers.
const TAPER_ZONE: f64 = 0.2;
const CURVE_SAMPLES: usize = 8;

pub fn apply_hand_drawn(primitives: Vec<Primitive>, style: &HandDrawnStyle, seed: u64) -> Vec<Primitive> {
    let mut out = Vec::with_capacity(primitives.len());
    for (index, primitive) in primitives.into_iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0xA076_1D64_78BD_642F));
        match primitive {
            Primitive::Path(path) => {
                let styled = style_path(&path, style, &mut rng);
                out.push(Primitive::Path(styled));
                if style.multi_stroke && !path.closed {
                    let retrace = offset_restroke(&path, style, &mut rng);
                    out.push(Primitive::Path(retrace));
                }
            }
            Primitive::Region(mut region) => {
                region.boundary = jitter(&region.boundary, style.tremor, &mut rng);
                out.push(Primitive::Region(region));
            }
            dot @ Primitive::Dot(_) => out.push(dot),
        }
    }
    out
}

fn style_path(path: &VectorPath, style: &HandDrawnStyle, rng: &mut StdRng) -> VectorPath {
    let mut styled = jitter(path, style.tremor, rng);
    let multiplier = 1.0 + style.weight * (rng.gen_range(0.0..=1.0) - 0.5);
    styled.style.stroke_width *= multiplier;

    if style.taper > 0.0 && !styled.closed && styled.style.stroke.is_some() {
        let phase = rng.gen_range(0.0..std::f64::consts::TAU);
        if let Some(outline) = taper_outline(&styled, style, phase) {
            return outline;
        }
    }
    styled
}

/// Displaces every vertex by at most `tremor * TREMOR_PIXELS`, keeping
/// segments connected and control points riding along with their anchors.
fn jitter(path: &VectorPath, tremor: f64, rng: &mut StdRng) -> VectorPath {
    if tremor <= 0.0 || path.segments.is_empty() {
        return path.clone();
    }
    let amplitude = tremor * TREMOR_PIXELS;
    let mut offsets: Vec<Point> = (0..=path.segments.len())
        .map(|_| {
            let angle = rng.gen_range(0.0..std::f64::consts::TAU);
            let radius = amplitude * rng.gen_range(0.0..=1.0f64).sqrt();
            Point::new(angle.cos() * radius, angle.sin() * radius)
        })
        .collect();
    let ends_meet = path
        .start()
        .zip(path.end())
        .is_some_and(|(s, e)| s.distance(&e) < 1e-9);
    if path.closed && ends_meet {
        let n = offsets.len() - 1;
        offsets[n] = offsets[0];
    }

    let segments = path
        .segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let (a, b) = (offsets[i], offsets[i + 1]);
            match *seg {
                PathSegment::Line { from, to } => PathSegment::Line {
                    from: from + a,
                    to: to + b,
                },
                PathSegment::Cubic {
                    from,
                    ctrl1,
                    ctrl2,
                    to,
                } => PathSegment::Cubic {
                    from: from + a,
                    ctrl1: ctrl1 + a,
                    ctrl2: ctrl2 + b,
                    to: to + b,
                },
            }
        })
        .collect();

    VectorPath {
        segments,
        closed: path.closed,
        style: path.style,
    }
}

/// Renders an open stroke as a filled polygon whose half-width narrows to
/// `1 - taper` of full width at both ends.
fn taper_outline(path: &VectorPath, style: &HandDrawnStyle, phase: f64) -> Option<VectorPath> {
    let color = path.style.stroke?;
    let mut spine = path.flatten(CURVE_SAMPLES);
    spine.dedup_by(|a, b| a.distance(b) < 1e-6);
    if spine.len() < 2 {
        return None;
    }

    let mut arc = Vec::with_capacity(spine.len());
    let mut total = 0.0;
    arc.push(0.0);
    for w in spine.windows(2) {
        total += w[0].distance(&w[1]);
        arc.push(total);
    }
    if total < 1e-6 {
        return None;
    }

    let half = path.style.stroke_width / 2.0;
    let zone = TAPER_ZONE * total;
    let mut left = Vec::with_capacity(spine.len());
    let mut right = Vec::with_capacity(spine.len());
    for (i, p) in spine.iter().enumerate() {
        let prev = spine[i.saturating_sub(1)];
        let next = spine[(i + 1).min(spine.len() - 1)];
        let normal = (next - prev).normalized().perpendicular();
        let s = arc[i];
        let ramp = (s.min(total - s) / zone).clamp(0.0, 1.0);
        let profile = (1.0 - style.taper) + style.taper * ramp;
        // Slow swell along the stroke for the variable-weight look.
        let swell = 1.0 + 0.25 * style.weight * (std::f64::consts::TAU * s / total * 1.5 + phase).sin();
        let w = (half * profile * swell).max(0.05);
        left.push(*p + normal * w);
        right.push(*p - normal * w);
    }

    let mut ring = left;
    ring.extend(right.into_iter().rev());
    VectorPath::from_polyline(&ring, true, PathStyle::filled(color))
}

/// A lighter second stroke nudged off the original, as if drawn twice.
fn offset_restroke(path: &VectorPath, style: &HandDrawnStyle, rng: &mut StdRng) -> VectorPath {
    let shift = Point::new(rng.gen_range(-0.8..=0.8), rng.gen_range(-0.8..=0.8));
    let mut copy = path.clone();
    copy.map_points(|p| p + shift);
    let mut retrace = jitter(&copy, style.tremor, rng);
    retrace.style.stroke_width *= 0.6;
    retrace
}
