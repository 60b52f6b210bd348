//! Vector primitives produced by the backends, and the backend dispatch point.

use std::ops::{Add, Mul, Sub};
use std::time::Duration;

use rgb::RGBA8;

use crate::config::{Backend, BackendConfig, ConversionParameters, DotShape};
use crate::error::Result;
use crate::multipass::PassVariation;
use crate::preprocessor::PreprocessedImage;
use crate::progress::ProgressReporter;
use crate::scheduler::{CancelToken, Scheduler};
use crate::{centerline, edge_detector, stipple, superpixel};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn dot(&self, other: &Point) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn lerp(&self, other: &Point, t: f64) -> Point {
        Point::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }

    /// Unit vector, or zero for a degenerate input.
    pub fn normalized(&self) -> Point {
        let len = self.length();
        if len < 1e-12 {
            Point::default()
        } else {
            Point::new(self.x / len, self.y / len)
        }
    }

    /// Counter-clockwise perpendicular.
    pub fn perpendicular(&self) -> Point {
        Point::new(-self.y, self.x)
    }

    pub fn scaled(&self, factor: f64) -> Point {
        Point::new(self.x * factor, self.y * factor)
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathSegment {
    Line {
        from: Point,
        to: Point,
    },
    Cubic {
        from: Point,
        ctrl1: Point,
        ctrl2: Point,
        to: Point,
    },
}

impl PathSegment {
    pub fn start(&self) -> Point {
        match *self {
            PathSegment::Line { from, .. } | PathSegment::Cubic { from, .. } => from,
        }
    }

    pub fn end(&self) -> Point {
        match *self {
            PathSegment::Line { to, .. } | PathSegment::Cubic { to, .. } => to,
        }
    }

    pub fn point_at(&self, t: f64) -> Point {
        match *self {
            PathSegment::Line { from, to } => from.lerp(&to, t),
            PathSegment::Cubic {
                from,
                ctrl1,
                ctrl2,
                to,
            } => {
                let mt = 1.0 - t;
                from * (mt * mt * mt)
                    + ctrl1 * (3.0 * mt * mt * t)
                    + ctrl2 * (3.0 * mt * t * t)
                    + to * (t * t * t)
            }
        }
    }

    /// Chord length, or control polygon length for cubics.
    pub fn approx_length(&self) -> f64 {
        match *self {
            PathSegment::Line { from, to } => from.distance(&to),
            PathSegment::Cubic {
                from,
                ctrl1,
                ctrl2,
                to,
            } => {
                let chord = from.distance(&to);
                let polygon = from.distance(&ctrl1) + ctrl1.distance(&ctrl2) + ctrl2.distance(&to);
                (chord + polygon) / 2.0
            }
        }
    }

    pub fn map_points(&self, f: impl Fn(Point) -> Point) -> PathSegment {
        match *self {
            PathSegment::Line { from, to } => PathSegment::Line {
                from: f(from),
                to: f(to),
            },
            PathSegment::Cubic {
                from,
                ctrl1,
                ctrl2,
                to,
            } => PathSegment::Cubic {
                from: f(from),
                ctrl1: f(ctrl1),
                ctrl2: f(ctrl2),
                to: f(to),
            },
        }
    }

    /// Samples the segment at `steps` evenly spaced parameters, excluding `t = 0`.
    fn flatten_into(&self, steps: usize, out: &mut Vec<Point>) {
        match self {
            PathSegment::Line { to, .. } => out.push(*to),
            PathSegment::Cubic { .. } => {
                for i in 1..=steps {
                    out.push(self.point_at(i as f64 / steps as f64));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathStyle {
    pub stroke: Option<RGBA8>,
    pub fill: Option<RGBA8>,
    pub stroke_width: f64,
}

impl PathStyle {
    pub fn stroked(color: RGBA8, width: f64) -> Self {
        Self {
            stroke: Some(color),
            fill: None,
            stroke_width: width,
        }
    }

    pub fn filled(color: RGBA8) -> Self {
        Self {
            stroke: None,
            fill: Some(color),
            stroke_width: 0.0,
        }
    }
}

/// A connected sequence of segments; each segment starts where the previous ended.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPath {
    pub segments: Vec<PathSegment>,
    pub closed: bool,
    pub style: PathStyle,
}

impl VectorPath {
    /// Straight segments through `points`. `None` for fewer than two points.
    pub fn from_polyline(points: &[Point], closed: bool, style: PathStyle) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let segments = points
            .windows(2)
            .map(|w| PathSegment::Line {
                from: w[0],
                to: w[1],
            })
            .collect();
        Some(Self {
            segments,
            closed,
            style,
        })
    }

    pub fn start(&self) -> Option<Point> {
        self.segments.first().map(|s| s.start())
    }

    pub fn end(&self) -> Option<Point> {
        self.segments.last().map(|s| s.end())
    }

    pub fn length(&self) -> f64 {
        self.segments.iter().map(|s| s.approx_length()).sum()
    }

    /// Point at half the approximate arc length.
    pub fn midpoint(&self) -> Option<Point> {
        let total = self.length();
        let mut walked = 0.0;
        for segment in &self.segments {
            let len = segment.approx_length();
            if walked + len >= total / 2.0 && len > 0.0 {
                return Some(segment.point_at((total / 2.0 - walked) / len));
            }
            walked += len;
        }
        self.start()
    }

    /// Polyline approximation, cubics sampled `steps` times.
    pub fn flatten(&self, steps: usize) -> Vec<Point> {
        let mut out = Vec::with_capacity(self.segments.len() * steps + 1);
        if let Some(start) = self.start() {
            out.push(start);
        }
        for segment in &self.segments {
            segment.flatten_into(steps.max(1), &mut out);
        }
        out
    }

    pub fn map_points(&mut self, f: impl Fn(Point) -> Point) {
        for segment in &mut self.segments {
            *segment = segment.map_points(&f);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub boundary: VectorPath,
    pub color: RGBA8,
    /// Pixel count.
    pub area: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dot {
    pub center: Point,
    pub radius: f64,
    pub color: RGBA8,
    pub shape: DotShape,
}

impl Dot {
    /// Polygon vertices for non-circular shapes, inscribed in the circle of
    /// `radius`. `None` for circles.
    pub fn outline(&self) -> Option<Vec<Point>> {
        let (c, r) = (self.center, self.radius);
        match self.shape {
            DotShape::Circle => None,
            DotShape::Square => {
                let h = r / std::f64::consts::SQRT_2;
                Some(vec![
                    Point::new(c.x - h, c.y - h),
                    Point::new(c.x + h, c.y - h),
                    Point::new(c.x + h, c.y + h),
                    Point::new(c.x - h, c.y + h),
                ])
            }
            DotShape::Diamond => Some(vec![
                Point::new(c.x, c.y - r),
                Point::new(c.x + r, c.y),
                Point::new(c.x, c.y + r),
                Point::new(c.x - r, c.y),
            ]),
            DotShape::Triangle => {
                let (dx, dy) = (r * 3f64.sqrt() / 2.0, r / 2.0);
                Some(vec![
                    Point::new(c.x, c.y - r),
                    Point::new(c.x + dx, c.y + dy),
                    Point::new(c.x - dx, c.y + dy),
                ])
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Path(VectorPath),
    Region(Region),
    Dot(Dot),
}

impl Primitive {
    /// Moves every coordinate through `f` and scales lengths by `length_scale`.
    pub fn transform(&mut self, f: impl Fn(Point) -> Point, length_scale: f64) {
        match self {
            Primitive::Path(path) => {
                path.map_points(&f);
                path.style.stroke_width *= length_scale;
            }
            Primitive::Region(region) => {
                region.boundary.map_points(&f);
                region.boundary.style.stroke_width *= length_scale;
                region.area = (region.area as f64 * length_scale * length_scale).round() as usize;
            }
            Primitive::Dot(dot) => {
                dot.center = f(dot.center);
                dot.radius *= length_scale;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionMetadata {
    pub elapsed: Duration,
    pub primitive_count: usize,
    pub backend: Backend,
    pub passes: u32,
    pub threads_used: usize,
}

/// Output of a conversion, in source image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionResult {
    pub width: u32,
    pub height: u32,
    pub primitives: Vec<Primitive>,
    pub metadata: ConversionMetadata,
}

impl ConversionResult {
    pub fn paths(&self) -> impl Iterator<Item = &VectorPath> {
        self.primitives.iter().filter_map(|p| match p {
            Primitive::Path(path) => Some(path),
            _ => None,
        })
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.primitives.iter().filter_map(|p| match p {
            Primitive::Region(region) => Some(region),
            _ => None,
        })
    }

    pub fn dots(&self) -> impl Iterator<Item = &Dot> {
        self.primitives.iter().filter_map(|p| match p {
            Primitive::Dot(dot) => Some(dot),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

/// Inputs shared by every backend for one pass.
pub(crate) struct TraceContext<'a> {
    pub params: &'a ConversionParameters,
    pub variation: PassVariation,
    /// Detail after pass refinement.
    pub detail: f64,
    pub pass_index: u32,
    pub passes: u32,
    pub scheduler: &'a Scheduler,
    pub cancel: &'a CancelToken,
    pub progress: &'a ProgressReporter<'a>,
}

impl TraceContext<'_> {
    pub fn progress_hook(&self) -> Option<(&ProgressReporter<'_>, u32, u32)> {
        Some((self.progress, self.pass_index, self.passes))
    }

    /// Seed for this pass, so later passes do not replay pass 0.
    pub fn pass_seed(&self) -> u64 {
        self.params
            .seed
            .wrapping_add((self.pass_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

/// Runs the configured backend once. Coordinates are in preprocessed pixels.
pub(crate) fn trace(image: &PreprocessedImage, ctx: &TraceContext<'_>) -> Result<Vec<Primitive>> {
    ctx.cancel.check()?;
    match &ctx.params.algorithm {
        BackendConfig::Edge(cfg) => edge_detector::trace_edges(image, cfg, ctx),
        BackendConfig::Centerline(cfg) => centerline::trace_centerlines(image, cfg, ctx),
        BackendConfig::Superpixel(cfg) => superpixel::trace_regions(image, cfg, ctx),
        BackendConfig::Dots(cfg) => stipple::place_dots(image, cfg, ctx),
    }
}
