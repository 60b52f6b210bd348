//! Repeated backend passes with varied scan order or detail, merged without duplicates.

use std::collections::HashMap;

use log::{debug, warn};

use crate::config::{BackendConfig, ConversionParameters};
use crate::error::Result;
use crate::preprocessor::PreprocessedImage;
use crate::progress::ProgressReporter;
use crate::scheduler::{CancelToken, Scheduler};
use crate::vectorizer::{self, Point, Primitive, TraceContext};

/// Endpoint and midpoint distance under which two paths count as the same stroke.
pub const MERGE_TOLERANCE: f64 = 2.0;
/// Detail added by each refine pass.
const REFINE_STEP: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassVariation {
    /// Top-left to bottom-right.
    Standard,
    /// Bottom-right to top-left.
    Reverse,
    /// Anti-diagonals, top-left first.
    Diagonal,
    /// Standard order at raised detail.
    Refine,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassPlan {
    pub variation: PassVariation,
    pub detail: f64,
}

/// Lays out every pass. Pass 0 is always a standard scan at the base detail.
pub fn plan_passes(params: &ConversionParameters) -> Vec<PassPlan> {
    let passes = params.effective_passes();
    let mut cycle = Vec::new();
    if params.reverse_pass {
        cycle.push(PassVariation::Reverse);
    }
    if params.diagonal_pass {
        cycle.push(PassVariation::Diagonal);
    }
    cycle.push(PassVariation::Refine);

    let mut plan = vec![PassPlan {
        variation: PassVariation::Standard,
        detail: params.detail,
    }];
    let mut refines = 0;
    for i in 1..passes as usize {
        let variation = cycle[(i - 1) % cycle.len()];
        let detail = if variation == PassVariation::Refine {
            refines += 1;
            (params.detail + REFINE_STEP * refines as f64).min(1.0)
        } else {
            params.detail
        };
        plan.push(PassPlan { variation, detail });
    }
    plan
}

/// Points that identify a primitive for duplicate detection.
fn signature(primitive: &Primitive) -> Option<(Point, Point, Point)> {
    let path = match primitive {
        Primitive::Path(path) => path,
        Primitive::Region(region) => &region.boundary,
        Primitive::Dot(dot) => return Some((dot.center, dot.center, dot.center)),
    };
    Some((path.start()?, path.end()?, path.midpoint()?))
}

fn same_kind(a: &Primitive, b: &Primitive) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Accumulates primitives across passes, dropping near-duplicates of
/// anything already accepted.
pub struct PassMerger {
    accepted: Vec<Primitive>,
    signatures: Vec<(Point, Point, Point)>,
    grid: HashMap<(i64, i64), Vec<usize>>,
    tolerance: f64,
    dot_tolerance: f64,
}

impl PassMerger {
    pub fn new(tolerance: f64, dot_tolerance: f64) -> Self {
        Self {
            accepted: Vec::new(),
            signatures: Vec::new(),
            grid: HashMap::new(),
            tolerance,
            dot_tolerance,
        }
    }

    fn cell_size(&self) -> f64 {
        self.tolerance.max(self.dot_tolerance).max(1e-3)
    }

    fn cell(&self, p: Point) -> (i64, i64) {
        let size = self.cell_size();
        ((p.x / size).floor() as i64, (p.y / size).floor() as i64)
    }

    /// Adds every primitive unconditionally (pass 0).
    pub fn seed(&mut self, primitives: Vec<Primitive>) {
        for primitive in primitives {
            self.insert(primitive);
        }
    }

    /// Adds the primitives that do not duplicate accepted ones. Returns how many were added.
    pub fn merge(&mut self, primitives: Vec<Primitive>) -> usize {
        let mut added = 0;
        for primitive in primitives {
            if !self.is_duplicate(&primitive) {
                self.insert(primitive);
                added += 1;
            }
        }
        added
    }

    fn insert(&mut self, primitive: Primitive) {
        let Some(sig) = signature(&primitive) else {
            return;
        };
        let index = self.accepted.len();
        let cell = self.cell(sig.2);
        self.grid.entry(cell).or_default().push(index);
        self.signatures.push(sig);
        self.accepted.push(primitive);
    }

    fn is_duplicate(&self, primitive: &Primitive) -> bool {
        let Some((start, end, mid)) = signature(primitive) else {
            // Nothing to draw.
            return true;
        };
        let tol = match primitive {
            Primitive::Dot(_) => self.dot_tolerance,
            _ => self.tolerance,
        };
        let (cx, cy) = self.cell(mid);
        for gx in cx - 1..=cx + 1 {
            for gy in cy - 1..=cy + 1 {
                let Some(indices) = self.grid.get(&(gx, gy)) else {
                    continue;
                };
                for &i in indices {
                    if !same_kind(&self.accepted[i], primitive) {
                        continue;
                    }
                    let (s, e, m) = self.signatures[i];
                    if m.distance(&mid) > tol {
                        continue;
                    }
                    let forward = s.distance(&start) <= tol && e.distance(&end) <= tol;
                    let backward = s.distance(&end) <= tol && e.distance(&start) <= tol;
                    if forward || backward {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn into_primitives(self) -> Vec<Primitive> {
        self.accepted
    }
}

/// Runs every planned pass. Returns the merged primitives and the number of passes run.
pub(crate) fn run_passes(
    image: &PreprocessedImage,
    params: &ConversionParameters,
    scheduler: &Scheduler,
    cancel: &CancelToken,
    progress: &ProgressReporter<'_>,
) -> Result<(Vec<Primitive>, u32)> {
    let plan = plan_passes(params);
    let passes = plan.len() as u32;
    let dot_tolerance = match &params.algorithm {
        BackendConfig::Dots(cfg) => cfg.min_radius,
        _ => MERGE_TOLERANCE,
    };
    let mut merger = PassMerger::new(MERGE_TOLERANCE, dot_tolerance);
    let mut last_detail = None;
    let mut run = 0;

    for (index, pass) in plan.iter().enumerate() {
        cancel.check()?;
        if pass.variation == PassVariation::Refine && last_detail == Some(pass.detail) {
            warn!(
                "Skipping pass {}: detail already at {:.2}",
                index + 1,
                pass.detail
            );
            progress.pass_done(index as u32, passes, merger.len());
            continue;
        }
        if pass.variation == PassVariation::Refine || index == 0 {
            last_detail = Some(pass.detail);
        }

        let ctx = TraceContext {
            params,
            variation: pass.variation,
            detail: pass.detail,
            pass_index: index as u32,
            passes,
            scheduler,
            cancel,
            progress,
        };
        let primitives = vectorizer::trace(image, &ctx)?;
        let produced = primitives.len();
        let added = if index == 0 {
            merger.seed(primitives);
            produced
        } else {
            merger.merge(primitives)
        };
        run += 1;
        debug!(
            "Pass {}/{} ({:?}, detail {:.2}): {} primitives, {} new",
            index + 1,
            passes,
            pass.variation,
            pass.detail,
            produced,
            added
        );
        progress.pass_done(index as u32, passes, merger.len());
    }
    Ok((merger.into_primitives(), run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DotShape;
    use crate::vectorizer::{Dot, PathStyle, VectorPath};
    use rgb::RGBA8;

    fn line(from: (f64, f64), to: (f64, f64)) -> Primitive {
        let points = [Point::new(from.0, from.1), Point::new(to.0, to.1)];
        Primitive::Path(
            VectorPath::from_polyline(&points, false, PathStyle::stroked(RGBA8::new(0, 0, 0, 255), 1.0))
                .unwrap(),
        )
    }

    fn dot(x: f64, y: f64) -> Primitive {
        Primitive::Dot(Dot {
            center: Point::new(x, y),
            radius: 1.0,
            color: RGBA8::new(0, 0, 0, 255),
            shape: DotShape::Circle,
        })
    }

    #[test]
    fn test_single_pass_plan() {
        let plan = plan_passes(&ConversionParameters::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].variation, PassVariation::Standard);
    }

    #[test]
    fn test_plan_cycles_enabled_variations() {
        let params = ConversionParameters::default()
            .with_multipass(5)
            .with_reverse_pass(true)
            .with_diagonal_pass(true);
        let variations: Vec<_> = plan_passes(&params).iter().map(|p| p.variation).collect();
        assert_eq!(
            variations,
            vec![
                PassVariation::Standard,
                PassVariation::Reverse,
                PassVariation::Diagonal,
                PassVariation::Refine,
                PassVariation::Reverse,
            ]
        );
    }

    #[test]
    fn test_refine_detail_is_clamped() {
        let params = ConversionParameters::default().with_detail(0.8).with_multipass(4);
        let details: Vec<f64> = plan_passes(&params).iter().map(|p| p.detail).collect();
        assert_eq!(details[0], 0.8);
        assert!((details[1] - 0.95).abs() < 1e-9);
        assert_eq!(details[2], 1.0);
        assert_eq!(details[3], 1.0);
    }

    #[test]
    fn test_merge_drops_duplicates_both_directions() {
        let mut merger = PassMerger::new(MERGE_TOLERANCE, 0.5);
        merger.seed(vec![line((0.0, 0.0), (20.0, 0.0))]);
        let added = merger.merge(vec![
            line((0.5, 0.5), (19.5, 0.0)),
            line((20.0, 1.0), (0.0, 1.0)),
            line((0.0, 10.0), (20.0, 10.0)),
        ]);
        assert_eq!(added, 1);
        assert_eq!(merger.len(), 2);
    }

    #[test]
    fn test_merge_keeps_pass_zero_duplicates() {
        let mut merger = PassMerger::new(MERGE_TOLERANCE, 0.5);
        merger.seed(vec![line((0.0, 0.0), (20.0, 0.0)), line((0.0, 0.0), (20.0, 0.0))]);
        assert_eq!(merger.len(), 2);
    }

    #[test]
    fn test_merge_dots_use_radius_tolerance() {
        let mut merger = PassMerger::new(MERGE_TOLERANCE, 0.5);
        merger.seed(vec![dot(10.0, 10.0)]);
        assert_eq!(merger.merge(vec![dot(10.3, 10.0), dot(11.0, 10.0)]), 1);
    }

    #[test]
    fn test_merge_distinguishes_kinds() {
        let mut merger = PassMerger::new(MERGE_TOLERANCE, 2.0);
        merger.seed(vec![dot(0.0, 0.0)]);
        assert_eq!(merger.merge(vec![line((0.0, 0.0), (0.5, 0.0))]), 1);
    }
}
