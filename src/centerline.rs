//! Centerline tracing: Sauvola binarization, Zhang-Suen thinning and
//! skeleton-graph walking into single-stroke paths.

use std::collections::VecDeque;

use log::debug;
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rgb::RGBA8;

use crate::config::{Backend, CenterlineConfig, DetailMapping};
use crate::error::{ConversionError, Result};
use crate::image_processor::{GrayPlane, luminance, mean_color};
use crate::path_simplifier::refine_chain;
use crate::preprocessor::PreprocessedImage;
use crate::progress::ProgressReporter;
use crate::scheduler::{CancelToken, Scheduler, split_range};
use crate::vectorizer::{PathStyle, Point, Primitive, TraceContext};

/// Below this global gray range the image has no usable ink.
const MIN_CONTRAST: u8 = 16;
/// 8-connected ink blobs smaller than this are treated as noise.
const SPECKLE_PIXELS: usize = 4;
const SAUVOLA_R: f64 = 128.0;
const MAX_PRUNE_ROUNDS: usize = 3;
/// Ink radius that maps to the unmodulated stroke width.
const NOMINAL_RADIUS: f64 = 3.0;
const MIN_WIDTH_FACTOR: f64 = 0.6;
const MAX_WIDTH_FACTOR: f64 = 1.8;

/// Sauvola adaptive threshold. Returns a 0/1 plane where 1 is ink.
pub(crate) fn sauvola_binarize(
    gray: &GrayPlane,
    window_size: u32,
    k: f64,
    scheduler: &Scheduler,
    cancel: &CancelToken,
    progress: Option<(&ProgressReporter<'_>, u32, u32)>,
) -> Result<Vec<u8>> {
    let (w, h) = (gray.width as usize, gray.height as usize);
    let stride = w + 1;
    let mut sum = vec![0u64; stride * (h + 1)];
    let mut sum_sq = vec![0f64; stride * (h + 1)];
    for y in 0..h {
        let (mut row, mut row_sq) = (0u64, 0f64);
        for x in 0..w {
            let v = gray.data[y * w + x] as u64;
            row += v;
            row_sq += (v * v) as f64;
            sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
            sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
        }
    }
    cancel.check()?;

    let half = (window_size / 2) as usize;
    let bands = split_range(h, scheduler.threads() * 4);
    let rows = scheduler.run_partitions(bands, cancel, progress, |_, band| {
        let mut out = Vec::with_capacity(band.len() * w);
        for y in band {
            let (y0, y1) = (y.saturating_sub(half), (y + half + 1).min(h));
            for x in 0..w {
                let (x0, x1) = (x.saturating_sub(half), (x + half + 1).min(w));
                let n = ((y1 - y0) * (x1 - x0)) as f64;
                let s = (sum[y1 * stride + x1] + sum[y0 * stride + x0]
                    - sum[y0 * stride + x1]
                    - sum[y1 * stride + x0]) as f64;
                let sq = sum_sq[y1 * stride + x1] + sum_sq[y0 * stride + x0]
                    - sum_sq[y0 * stride + x1]
                    - sum_sq[y1 * stride + x0];
                let mean = s / n;
                let std = (sq / n - mean * mean).max(0.0).sqrt();
                let threshold = mean * (1.0 + k * (std / SAUVOLA_R - 1.0));
                let v = gray.data[y * w + x];
                out.push(u8::from((v as f64) <= threshold && v < 250));
            }
        }
        Ok(out)
    })?;
    Ok(rows.concat())
}

/// Clears 8-connected foreground components smaller than `min_pixels`.
pub fn remove_speckles(plane: &mut [u8], width: usize, height: usize, min_pixels: usize) -> usize {
    let mut seen = vec![false; plane.len()];
    let mut removed = 0;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();
    for start in 0..plane.len() {
        if plane[start] == 0 || seen[start] {
            continue;
        }
        component.clear();
        seen[start] = true;
        queue.push_back(start);
        while let Some(i) = queue.pop_front() {
            component.push(i);
            for j in neighbors8(i, width, height) {
                if plane[j] != 0 && !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }
        if component.len() < min_pixels {
            removed += component.len();
            for &i in &component {
                plane[i] = 0;
            }
        }
    }
    removed
}

fn neighbors8(i: usize, width: usize, height: usize) -> impl Iterator<Item = usize> {
    let (x, y) = ((i % width) as isize, (i / width) as isize);
    (-1isize..=1)
        .flat_map(move |dy| (-1isize..=1).map(move |dx| (dx, dy)))
        .filter(|&(dx, dy)| dx != 0 || dy != 0)
        .filter_map(move |(dx, dy)| {
            let (nx, ny) = (x + dx, y + dy);
            (nx >= 0 && ny >= 0 && nx < width as isize && ny < height as isize)
                .then(|| ny as usize * width + nx as usize)
        })
}

/// Exact Euclidean distance from each ink pixel to the nearest background
/// pixel, by separable lower envelopes of parabolas (Felzenszwalb and
/// Huttenlocher). Background pixels are 0.
pub fn distance_transform(plane: &[u8], width: usize, height: usize) -> Vec<f32> {
    // Larger than any squared in-image distance while keeping sums exact.
    let far = (width * width + height * height) as f64 + 1.0;
    let mut sq: Vec<f64> = plane.iter().map(|&v| if v != 0 { far } else { 0.0 }).collect();
    let mut column = vec![0f64; height];
    for x in 0..width {
        for y in 0..height {
            column[y] = sq[y * width + x];
        }
        let d = squared_distance_1d(&column);
        for y in 0..height {
            sq[y * width + x] = d[y];
        }
    }
    for row in sq.chunks_mut(width.max(1)) {
        let d = squared_distance_1d(row);
        row.copy_from_slice(&d);
    }
    let cap = (width as f64).hypot(height as f64);
    sq.into_iter().map(|v| v.sqrt().min(cap) as f32).collect()
}

fn squared_distance_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    if n == 0 {
        return Vec::new();
    }
    let mut v = vec![0usize; n];
    let mut z = vec![0f64; n + 1];
    let intersect = |q: usize, p: usize| {
        ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2.0 * (q - p) as f64)
    };
    let mut k = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    for q in 1..n {
        let mut s = intersect(q, v[k]);
        while k > 0 && s <= z[k] {
            k -= 1;
            s = intersect(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }
    let mut d = vec![0f64; n];
    k = 0;
    for (q, out) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let dq = q as f64 - v[k] as f64;
        *out = dq * dq + f[v[k]];
    }
    d
}

/// Stroke width factor for a branch from the mean ink radius under it.
fn width_factor(distances: &[f32], width: usize, pixels: &[(u32, u32)]) -> f64 {
    if pixels.is_empty() {
        return 1.0;
    }
    let sum: f64 = pixels
        .iter()
        .map(|&(x, y)| distances[y as usize * width + x as usize] as f64)
        .sum();
    (sum / pixels.len() as f64 / NOMINAL_RADIUS).clamp(MIN_WIDTH_FACTOR, MAX_WIDTH_FACTOR)
}

/// Zhang-Suen thinning of a 0/1 plane, in place.
///
/// Each sub-iteration marks deletions over row bands in parallel against an
/// unchanged snapshot, then applies them, so the result does not depend on
/// the number of threads.
pub fn zhang_suen_thin(
    plane: &mut [u8],
    width: usize,
    height: usize,
    scheduler: &Scheduler,
    cancel: &CancelToken,
) -> Result<usize> {
    if width < 3 || height < 3 {
        return Ok(0);
    }
    let bands = split_range(height, scheduler.threads() * 2);
    let mut iterations = 0;
    loop {
        let mut changed = false;
        for step in 0..2 {
            let snapshot: &[u8] = plane;
            let marked = scheduler.run_partitions(bands.clone(), cancel, None, |_, band| {
                let mut out = Vec::new();
                for y in band {
                    for x in 0..width {
                        if snapshot[y * width + x] != 0 && deletable(snapshot, width, height, x, y, step) {
                            out.push(y * width + x);
                        }
                    }
                }
                Ok(out)
            })?;
            for i in marked.into_iter().flatten() {
                plane[i] = 0;
                changed = true;
            }
        }
        iterations += 1;
        if !changed {
            break;
        }
    }
    Ok(iterations)
}

fn deletable(plane: &[u8], width: usize, height: usize, x: usize, y: usize, step: usize) -> bool {
    let at = |dx: isize, dy: isize| -> u8 {
        let (nx, ny) = (x as isize + dx, y as isize + dy);
        if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
            0
        } else {
            plane[ny as usize * width + nx as usize]
        }
    };
    // P2..P9 clockwise from north.
    let p = [
        at(0, -1),
        at(1, -1),
        at(1, 0),
        at(1, 1),
        at(0, 1),
        at(-1, 1),
        at(-1, 0),
        at(-1, -1),
    ];
    let b: u8 = p.iter().sum();
    if !(2..=6).contains(&b) {
        return false;
    }
    let a = (0..8).filter(|&i| p[i] == 0 && p[(i + 1) % 8] == 1).count();
    if a != 1 {
        return false;
    }
    let (p2, p4, p6, p8) = (p[0], p[2], p[4], p[6]);
    if step == 0 {
        p2 * p4 * p6 == 0 && p4 * p6 * p8 == 0
    } else {
        p2 * p4 * p8 == 0 && p2 * p6 * p8 == 0
    }
}

/// Pixel adjacency graph of a skeleton.
pub struct SkeletonGraph {
    pub graph: UnGraph<(u32, u32), ()>,
}

impl SkeletonGraph {
    /// Links 4-neighbours always and diagonal neighbours only when no shared
    /// 4-neighbour is set, so staircase corners do not form triangles.
    pub fn build(plane: &[u8], width: usize, height: usize) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut index = vec![None; plane.len()];
        for (i, &v) in plane.iter().enumerate() {
            if v != 0 {
                index[i] = Some(graph.add_node(((i % width) as u32, (i / width) as u32)));
            }
        }
        let set = |x: usize, y: usize| plane[y * width + x] != 0;
        for y in 0..height {
            for x in 0..width {
                let Some(a) = index[y * width + x] else {
                    continue;
                };
                if x + 1 < width {
                    if let Some(b) = index[y * width + x + 1] {
                        graph.add_edge(a, b, ());
                    }
                }
                if y + 1 < height {
                    if let Some(b) = index[(y + 1) * width + x] {
                        graph.add_edge(a, b, ());
                    }
                    if x + 1 < width && !set(x + 1, y) && !set(x, y + 1) {
                        if let Some(b) = index[(y + 1) * width + x + 1] {
                            graph.add_edge(a, b, ());
                        }
                    }
                    if x > 0 && !set(x - 1, y) && !set(x, y + 1) {
                        if let Some(b) = index[(y + 1) * width + x - 1] {
                            graph.add_edge(a, b, ());
                        }
                    }
                }
            }
        }
        Self { graph }
    }

    fn degree(&self, node: NodeIndex) -> usize {
        self.graph.edges(node).count()
    }

    /// Splits the skeleton into branches between nodes of degree other than 2,
    /// followed by any remaining cycles.
    pub fn branches(&self) -> Vec<Branch> {
        let mut used = vec![false; self.graph.edge_count()];
        let mut out = Vec::new();

        for node in self.graph.node_indices() {
            let degree = self.degree(node);
            if degree == 2 {
                continue;
            }
            if degree == 0 {
                out.push(Branch {
                    pixels: vec![self.graph[node]],
                    closed: false,
                    start_degree: 0,
                    end_degree: 0,
                });
                continue;
            }
            let edges: Vec<(EdgeIndex, NodeIndex)> = self
                .graph
                .edges(node)
                .map(|e| (e.id(), other_end(&e, node)))
                .collect();
            for (edge, next) in edges {
                if used[edge.index()] {
                    continue;
                }
                used[edge.index()] = true;
                let (pixels, end) = self.walk(node, next, &mut used);
                out.push(Branch {
                    pixels,
                    closed: false,
                    start_degree: degree,
                    end_degree: self.degree(end),
                });
            }
        }

        // Whatever is left forms loops of degree-2 nodes.
        for edge in self.graph.edge_indices() {
            if used[edge.index()] {
                continue;
            }
            used[edge.index()] = true;
            let Some((a, b)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            let (mut pixels, _) = self.walk(a, b, &mut used);
            if pixels.first() == pixels.last() && pixels.len() > 1 {
                pixels.pop();
            }
            out.push(Branch {
                pixels,
                closed: true,
                start_degree: 2,
                end_degree: 2,
            });
        }
        out
    }

    fn walk(&self, from: NodeIndex, mut cur: NodeIndex, used: &mut [bool]) -> (Vec<(u32, u32)>, NodeIndex) {
        let mut pixels = vec![self.graph[from], self.graph[cur]];
        while self.degree(cur) == 2 {
            let next = self
                .graph
                .edges(cur)
                .find(|e| !used[e.id().index()])
                .map(|e| (e.id(), other_end(&e, cur)));
            let Some((edge, node)) = next else {
                break;
            };
            used[edge.index()] = true;
            pixels.push(self.graph[node]);
            cur = node;
        }
        (pixels, cur)
    }
}

fn other_end(edge: &petgraph::graph::EdgeReference<'_, ()>, node: NodeIndex) -> NodeIndex {
    if edge.source() == node {
        edge.target()
    } else {
        edge.source()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub pixels: Vec<(u32, u32)>,
    pub closed: bool,
    pub start_degree: usize,
    pub end_degree: usize,
}

impl Branch {
    pub fn length(&self) -> f64 {
        self.pixels
            .windows(2)
            .map(|w| (w[0].0 as f64 - w[1].0 as f64).hypot(w[0].1 as f64 - w[1].1 as f64))
            .sum()
    }

    /// A dangling branch hanging off a junction.
    fn is_spur(&self) -> bool {
        let (a, b) = (self.start_degree, self.end_degree);
        (a == 1 && b >= 3) || (a >= 3 && b == 1)
    }
}

/// Removes spurs shorter than `min_length`, rebuilding the graph between
/// rounds since removing a spur can turn a junction into a plain pixel.
pub fn prune_spurs(plane: &mut [u8], width: usize, height: usize, min_length: f64) -> usize {
    let mut removed = 0;
    for _ in 0..MAX_PRUNE_ROUNDS {
        let graph = SkeletonGraph::build(plane, width, height);
        let mut round = 0;
        for branch in graph.branches() {
            if !branch.is_spur() || branch.length() >= min_length {
                continue;
            }
            // Keep the junction pixel.
            let inner = if branch.start_degree >= 3 {
                &branch.pixels[1..]
            } else {
                &branch.pixels[..branch.pixels.len() - 1]
            };
            for &(x, y) in inner {
                plane[y as usize * width + x as usize] = 0;
                round += 1;
            }
        }
        removed += round;
        if round == 0 {
            break;
        }
    }
    removed
}

/// Drops open branches shorter than `min_length`, whatever their end
/// degrees, along with isolated pixels. Closed loops are always kept.
pub fn keep_long_branches(branches: Vec<Branch>, min_length: f64) -> Vec<Branch> {
    branches
        .into_iter()
        .filter(|b| b.pixels.len() >= 2)
        .filter(|b| b.closed || b.length() >= min_length)
        .collect()
}

/// Centerline backend entry point.
pub(crate) fn trace_centerlines(
    image: &PreprocessedImage,
    cfg: &CenterlineConfig,
    ctx: &TraceContext<'_>,
) -> Result<Vec<Primitive>> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let (lo, hi) = image
        .gray
        .data
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi.saturating_sub(lo) < MIN_CONTRAST {
        debug!("Centerline: gray range {} too small, nothing to trace", hi.saturating_sub(lo));
        return Ok(Vec::new());
    }

    // Light strokes on a dark background are traced as ink.
    let gray = if luminance(image.background) < 128 {
        GrayPlane {
            width: image.gray.width,
            height: image.gray.height,
            data: image.gray.data.iter().map(|v| 255 - v).collect(),
        }
    } else {
        image.gray.clone()
    };

    let mut plane = sauvola_binarize(&gray, cfg.window_size, cfg.k, ctx.scheduler, ctx.cancel, ctx.progress_hook())?;
    let speckles = remove_speckles(&mut plane, w, h, SPECKLE_PIXELS);
    let ink = plane.iter().filter(|&&v| v != 0).count();
    debug!("Centerline: {} ink pixels ({} speckle pixels removed)", ink, speckles);
    if ink == 0 {
        return Ok(Vec::new());
    }

    let distances = cfg.width_modulation.then(|| distance_transform(&plane, w, h));
    let iterations = zhang_suen_thin(&mut plane, w, h, ctx.scheduler, ctx.cancel)?;
    let skeleton = plane.iter().filter(|&&v| v != 0).count();
    if skeleton == 0 && ink >= 64 {
        return Err(ConversionError::internal(
            Backend::Centerline,
            "thinning",
            format!("{ink} ink pixels thinned to an empty skeleton"),
        ));
    }
    ctx.cancel.check()?;

    let mapping = DetailMapping::new(ctx.detail);
    let min_branch = cfg.min_branch_length.unwrap_or_else(|| mapping.min_branch_length());
    let pruned = prune_spurs(&mut plane, w, h, min_branch);
    debug!(
        "Centerline: skeleton of {} pixels after {} thinning rounds, {} spur pixels pruned",
        skeleton, iterations, pruned
    );
    ctx.cancel.check()?;

    let branches = SkeletonGraph::build(&plane, w, h).branches();
    let total = branches.len();
    let kept = keep_long_branches(branches, min_branch);
    debug!(
        "Centerline: kept {} of {} branches (min length {:.1})",
        kept.len(),
        total,
        min_branch
    );

    let epsilon = mapping.centerline_epsilon();
    let black = RGBA8::new(0, 0, 0, 255);
    let primitives: Vec<Primitive> = kept
        .into_iter()
        .filter_map(|branch| {
            let points: Vec<Point> = branch
                .pixels
                .iter()
                .map(|&(x, y)| Point::new(x as f64 + 0.5, y as f64 + 0.5))
                .collect();
            let color = if cfg.preserve_colors {
                mean_color(&image.rgba, &branch.pixels)
            } else {
                black
            };
            let stroke_width = match &distances {
                Some(d) => ctx.params.stroke_width * width_factor(d, w, &branch.pixels),
                None => ctx.params.stroke_width,
            };
            let closed = branch.closed && points.len() >= 3;
            refine_chain(
                &points,
                closed,
                epsilon,
                ctx.params.enable_bezier_fitting,
                PathStyle::stroked(color, stroke_width),
            )
        })
        .map(Primitive::Path)
        .collect();
    debug!("Centerline pass {}: {} paths", ctx.pass_index, primitives.len());
    Ok(primitives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_from(rows: &[&str]) -> (Vec<u8>, usize, usize) {
        let h = rows.len();
        let w = rows[0].len();
        let plane = rows
            .iter()
            .flat_map(|r| r.bytes().map(|b| u8::from(b == b'#')))
            .collect();
        (plane, w, h)
    }

    #[test]
    fn test_sauvola_marks_dark_line() {
        let (w, h) = (40u32, 40u32);
        let mut data = vec![255u8; (w * h) as usize];
        for x in 5..35 {
            data[(20 * w + x) as usize] = 0;
        }
        let gray = GrayPlane {
            width: w,
            height: h,
            data,
        };
        let plane =
            sauvola_binarize(&gray, 15, 0.4, &Scheduler::sequential(), &CancelToken::new(), None).unwrap();
        assert_eq!(plane.iter().filter(|&&v| v == 1).count(), 30);
        assert_eq!(plane[(20 * w + 10) as usize], 1);
        assert_eq!(plane[(10 * w + 10) as usize], 0);
    }

    #[test]
    fn test_distance_transform_measures_to_background() {
        let (plane, w, h) = plane_from(&[
            ".......",
            ".#####.",
            ".#####.",
            ".#####.",
            ".#####.",
            ".#####.",
            ".......",
        ]);
        let d = distance_transform(&plane, w, h);
        assert_eq!(d[0], 0.0);
        assert_eq!(d[w + 1], 1.0);
        assert_eq!(d[3 * w + 3], 3.0);
        assert_eq!(d[2 * w + 3], 2.0);
        // Two steps from both the left and the top border.
        assert_eq!(d[2 * w + 2], 2.0);
    }

    #[test]
    fn test_width_factor_follows_thickness() {
        let (plane, w, h) = plane_from(&[
            "..........",
            "..........",
            "..........",
            "..........",
            "##########",
            "##########",
            "##########",
            "##########",
            "##########",
            "##########",
            "##########",
            "..........",
        ]);
        let d = distance_transform(&plane, w, h);
        let middle: Vec<(u32, u32)> = (2..8).map(|x| (x, 7)).collect();
        let edge: Vec<(u32, u32)> = (2..8).map(|x| (x, 4)).collect();
        assert!(width_factor(&d, w, &middle) > width_factor(&d, w, &edge));
        assert_eq!(width_factor(&d, w, &edge), MIN_WIDTH_FACTOR);
        assert_eq!(width_factor(&d, w, &[]), 1.0);
    }

    #[test]
    fn test_remove_speckles() {
        let (mut plane, w, h) = plane_from(&[
            "#.......",
            "........",
            "...####.",
            "........",
        ]);
        let removed = remove_speckles(&mut plane, w, h, 4);
        assert_eq!(removed, 1);
        assert_eq!(plane.iter().filter(|&&v| v == 1).count(), 4);
    }

    #[test]
    fn test_thinning_thick_bar() {
        let (mut plane, w, h) = plane_from(&[
            "..............",
            ".############.",
            ".############.",
            ".############.",
            "..............",
        ]);
        zhang_suen_thin(&mut plane, w, h, &Scheduler::sequential(), &CancelToken::new()).unwrap();
        for x in 3..11 {
            let column: u8 = (0..h).map(|y| plane[y * w + x]).sum();
            assert_eq!(column, 1, "column {x}");
        }
    }

    #[test]
    fn test_thinning_keeps_one_pixel_diagonal() {
        let (mut plane, w, h) = plane_from(&[
            "#.....",
            ".#....",
            "..#...",
            "...#..",
            "....#.",
            ".....#",
        ]);
        let before = plane.clone();
        zhang_suen_thin(&mut plane, w, h, &Scheduler::sequential(), &CancelToken::new()).unwrap();
        assert_eq!(plane, before);
    }

    #[test]
    fn test_graph_skips_staircase_triangles() {
        let (plane, w, h) = plane_from(&[
            "##..",
            ".##.",
            "..##",
        ]);
        let graph = SkeletonGraph::build(&plane, w, h);
        assert_eq!(graph.graph.node_count(), 6);
        assert_eq!(graph.graph.edge_count(), 5);
        let branches = graph.branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].pixels.len(), 6);
    }

    #[test]
    fn test_branches_split_at_junction() {
        let (plane, w, h) = plane_from(&[
            "....#....",
            "....#....",
            "....#....",
            "#########",
        ]);
        let graph = SkeletonGraph::build(&plane, w, h);
        let branches = graph.branches();
        assert_eq!(branches.len(), 3);
        assert!(branches.iter().all(|b| b.start_degree == 3 || b.end_degree == 3));
    }

    #[test]
    fn test_loop_is_closed_branch() {
        let (plane, w, h) = plane_from(&[
            ".....",
            ".###.",
            ".#.#.",
            ".###.",
            ".....",
        ]);
        let branches = SkeletonGraph::build(&plane, w, h).branches();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].closed);
        assert_eq!(branches[0].pixels.len(), 8);
    }

    #[test]
    fn test_prune_short_spur() {
        let (mut plane, w, h) = plane_from(&[
            "........#.......",
            "........#.......",
            "################",
        ]);
        let removed = prune_spurs(&mut plane, w, h, 5.0);
        assert_eq!(removed, 2);
        let branches = SkeletonGraph::build(&plane, w, h).branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].pixels.len(), 16);
    }

    #[test]
    fn test_short_open_branches_are_dropped() {
        let (plane, w, h) = plane_from(&[
            "..........................",
            ".######............######.",
            "..........................",
            ".#########################",
            "..........................",
            "..........####............",
            "..........#..#............",
            "..........####............",
        ]);
        let branches = SkeletonGraph::build(&plane, w, h).branches();
        assert_eq!(branches.len(), 4);
        let kept = keep_long_branches(branches, 10.0);
        // The two short dashes go, the long stroke and the small loop stay.
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|b| b.closed));
        assert!(kept.iter().any(|b| !b.closed && b.pixels.len() == 25));
    }

    #[test]
    fn test_short_connector_between_junctions_is_dropped() {
        let (plane, w, h) = plane_from(&[
            "#..........#",
            "#..........#",
            "#..........#",
            "############",
            "#..........#",
            "#..........#",
            "#..........#",
        ]);
        let branches = SkeletonGraph::build(&plane, w, h).branches();
        assert_eq!(branches.len(), 5);
        let connector = branches
            .iter()
            .find(|b| b.start_degree == 3 && b.end_degree == 3)
            .cloned()
            .expect("junction to junction branch");
        assert_eq!(connector.length(), 11.0);
        assert!(keep_long_branches(branches, 12.0).is_empty());
        assert_eq!(keep_long_branches(vec![connector], 10.0).len(), 1);
    }

    #[test]
    fn test_prune_keeps_long_branches() {
        let (mut plane, w, h) = plane_from(&[
            "....#....",
            "....#....",
            "....#....",
            "....#....",
            "....#....",
            "....#....",
            "#########",
        ]);
        assert_eq!(prune_spurs(&mut plane, w, h, 3.0), 0);
    }
}
