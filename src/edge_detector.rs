//! Edge tracing: Canny with adaptive thresholds, optional flow-based
//! (ETF/FDoG) edges, and linking of edge pixels into stroked chains.

use std::collections::{HashMap, VecDeque};

use log::debug;
use rgb::RGBA8;

use crate::centerline::zhang_suen_thin;
use crate::config::{DetailMapping, EdgeConfig};
use crate::error::Result;
use crate::image_processor::mean_color;
use crate::multipass::PassVariation;
use crate::path_simplifier::refine_chain;
use crate::preprocessor::PreprocessedImage;
use crate::scheduler::{CancelToken, Scheduler, split_range};
use crate::vectorizer::{PathStyle, Point, Primitive, TraceContext};

/// Gradient magnitudes at or below this are treated as flat.
const NOISE_FLOOR: f32 = 1.0;
/// Lowest allowed high threshold on the Sobel scale (a full step is 1020).
const MIN_HIGH_THRESHOLD: f32 = 20.0;
const LOW_RATIO: f32 = 0.4;
/// Along-flow smoothing used by FDoG.
const FLOW_SIGMA: f64 = 2.0;
/// Intensities are scaled so a mid-contrast step crosses the tau threshold.
const FDOG_GAIN: f32 = 8.0 / 255.0;
const FDOG_RHO: f64 = 0.99;

/// Binary edge map (0 = background, 255 = edge).
#[derive(Debug, Clone)]
pub struct EdgeMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl EdgeMap {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0).count()
    }

    fn union(&mut self, other: &EdgeMap) {
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a = (*a).max(*b);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gradient {
    pub width: usize,
    pub height: usize,
    pub gx: Vec<f32>,
    pub gy: Vec<f32>,
    pub magnitude: Vec<f32>,
}

/// Separable Gaussian blur with clamped borders.
pub fn gaussian_blur(
    values: &[f32],
    width: usize,
    height: usize,
    sigma: f64,
    cancel: &CancelToken,
) -> Result<Vec<f32>> {
    if sigma <= 0.0 {
        return Ok(values.to_vec());
    }
    let kernel = gaussian_kernel(sigma);
    let r = (kernel.len() / 2) as isize;

    let mut horizontal = vec![0f32; values.len()];
    for y in 0..height {
        cancel.check()?;
        let row = &values[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - r).clamp(0, width as isize - 1) as usize;
                acc += row[sx] * weight;
            }
            horizontal[y * width + x] = acc;
        }
    }

    let mut out = vec![0f32; values.len()];
    for y in 0..height {
        cancel.check()?;
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - r).clamp(0, height as isize - 1) as usize;
                acc += horizontal[sy * width + x] * weight;
            }
            out[y * width + x] = acc;
        }
    }
    Ok(out)
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// 3x3 Sobel gradient with clamped borders.
pub fn sobel(values: &[f32], width: usize, height: usize) -> Gradient {
    let at = |x: isize, y: isize| -> f32 {
        let cx = x.clamp(0, width as isize - 1) as usize;
        let cy = y.clamp(0, height as isize - 1) as usize;
        values[cy * width + cx]
    };
    let n = width * height;
    let (mut gx, mut gy, mut magnitude) = (vec![0f32; n], vec![0f32; n], vec![0f32; n]);
    for y in 0..height as isize {
        for x in 0..width as isize {
            let dx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let dy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            let i = y as usize * width + x as usize;
            gx[i] = dx;
            gy[i] = dy;
            magnitude[i] = dx.hypot(dy);
        }
    }
    Gradient {
        width,
        height,
        gx,
        gy,
        magnitude,
    }
}

/// Keeps pixels that are ridge maxima across the gradient direction.
pub fn non_maximum_suppression(grad: &Gradient) -> Vec<f32> {
    let (w, h) = (grad.width, grad.height);
    let mut out = vec![0f32; w * h];
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let m = grad.magnitude[i];
            if m <= NOISE_FLOOR {
                continue;
            }
            let angle = grad.gy[i].atan2(grad.gx[i]).to_degrees();
            let angle = if angle < 0.0 { angle + 180.0 } else { angle };
            let (ox, oy): (isize, isize) = if !(22.5..157.5).contains(&angle) {
                (1, 0)
            } else if angle < 67.5 {
                (1, 1)
            } else if angle < 112.5 {
                (0, 1)
            } else {
                (-1, 1)
            };
            let ahead = grad.magnitude[((y as isize + oy) as usize) * w + (x as isize + ox) as usize];
            let behind = grad.magnitude[((y as isize - oy) as usize) * w + (x as isize - ox) as usize];
            // Asymmetric comparison keeps exactly one pixel of a two-pixel plateau.
            if m > ahead && m >= behind {
                out[i] = m;
            }
        }
    }
    out
}

/// High threshold at `percentile` of the non-flat suppressed magnitudes.
pub fn adaptive_thresholds(nms: &[f32], percentile: f64) -> Option<(f32, f32)> {
    let mut values: Vec<f32> = nms.iter().copied().filter(|&v| v > NOISE_FLOOR).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let idx = ((values.len() - 1) as f64 * percentile.clamp(0.0, 1.0)).round() as usize;
    let high = values[idx].max(MIN_HIGH_THRESHOLD);
    Some((high * LOW_RATIO, high))
}

/// Keeps weak pixels 8-connected to a strong one.
pub fn hysteresis(nms: &[f32], width: usize, height: usize, low: f32, high: f32) -> EdgeMap {
    let mut map = EdgeMap::empty(width as u32, height as u32);
    let mut queue = VecDeque::new();
    for (i, &v) in nms.iter().enumerate() {
        if v >= high {
            map.data[i] = 255;
            queue.push_back(i);
        }
    }
    while let Some(i) = queue.pop_front() {
        let (x, y) = ((i % width) as isize, (i / width) as isize);
        for (dx, dy) in NEIGHBORS {
            let (nx, ny) = (x + dx, y + dy);
            if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                continue;
            }
            let j = ny as usize * width + nx as usize;
            if map.data[j] == 0 && nms[j] >= low {
                map.data[j] = 255;
                queue.push_back(j);
            }
        }
    }
    map
}

/// Canny edge detection. Returns the edge map and the gradient of the blurred plane.
pub fn canny(
    values: &[f32],
    width: usize,
    height: usize,
    mapping: &DetailMapping,
    cancel: &CancelToken,
) -> Result<(EdgeMap, Gradient, Vec<f32>)> {
    let blurred = gaussian_blur(values, width, height, mapping.blur_sigma(), cancel)?;
    let grad = sobel(&blurred, width, height);
    cancel.check()?;
    let nms = non_maximum_suppression(&grad);
    cancel.check()?;
    let edges = match adaptive_thresholds(&nms, mapping.canny_high_percentile()) {
        Some((low, high)) => {
            debug!("Canny thresholds low={:.1} high={:.1}", low, high);
            hysteresis(&nms, width, height, low, high)
        }
        None => EdgeMap::empty(width as u32, height as u32),
    };
    Ok((edges, grad, blurred))
}

/// Edge tangent flow: unit tangents along edges, smoothed toward stronger neighbours.
#[derive(Debug, Clone)]
pub struct FlowField {
    pub width: usize,
    pub height: usize,
    pub tx: Vec<f32>,
    pub ty: Vec<f32>,
}

impl FlowField {
    pub fn tangent(&self, x: usize, y: usize) -> (f32, f32) {
        let i = y * self.width + x;
        (self.tx[i], self.ty[i])
    }
}

pub fn edge_tangent_flow(
    grad: &Gradient,
    radius: u32,
    iterations: u32,
    cancel: &CancelToken,
) -> Result<FlowField> {
    let (w, h) = (grad.width, grad.height);
    let max_mag = grad.magnitude.iter().copied().fold(0f32, f32::max).max(1e-6);
    let mag: Vec<f32> = grad.magnitude.iter().map(|m| m / max_mag).collect();
    let mut tx = vec![0f32; w * h];
    let mut ty = vec![0f32; w * h];
    for i in 0..w * h {
        let m = grad.magnitude[i];
        if m > 1e-6 {
            tx[i] = -grad.gy[i] / m;
            ty[i] = grad.gx[i] / m;
        }
    }

    let r = radius as isize;
    let offsets: Vec<(isize, isize)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
        .filter(|(dx, dy)| dx * dx + dy * dy <= r * r)
        .collect();

    for _ in 0..iterations {
        let mut nx_buf = vec![0f32; w * h];
        let mut ny_buf = vec![0f32; w * h];
        for y in 0..h {
            cancel.check()?;
            for x in 0..w {
                let i = y * w + x;
                let (cx, cy) = (tx[i], ty[i]);
                let (mut sx, mut sy) = (0f32, 0f32);
                for &(dx, dy) in &offsets {
                    let (px, py) = (x as isize + dx, y as isize + dy);
                    if px < 0 || py < 0 || px >= w as isize || py >= h as isize {
                        continue;
                    }
                    let j = py as usize * w + px as usize;
                    let wm = (1.0 + (mag[j] - mag[i]).tanh()) / 2.0;
                    let d = cx * tx[j] + cy * ty[j];
                    // Neighbours with zero tangent contribute nothing; the
                    // centre adopts the orientation of its strong neighbours.
                    let wd = if cx == 0.0 && cy == 0.0 { 1.0 } else { d };
                    sx += tx[j] * wm * wd;
                    sy += ty[j] * wm * wd;
                }
                let len = sx.hypot(sy);
                if len > 1e-6 {
                    nx_buf[i] = sx / len;
                    ny_buf[i] = sy / len;
                }
            }
        }
        tx = nx_buf;
        ty = ny_buf;
    }

    Ok(FlowField {
        width: w,
        height: h,
        tx,
        ty,
    })
}

/// Flow-based difference of Gaussians, thinned to one-pixel lines.
pub fn fdog_edges(
    blurred: &[f32],
    flow: &FlowField,
    cfg: &EdgeConfig,
    scheduler: &Scheduler,
    cancel: &CancelToken,
) -> Result<EdgeMap> {
    let (w, h) = (flow.width, flow.height);
    let sample = |x: f32, y: f32| -> f32 {
        let sx = (x.round() as isize).clamp(0, w as isize - 1) as usize;
        let sy = (y.round() as isize).clamp(0, h as isize - 1) as usize;
        blurred[sy * w + sx] * FDOG_GAIN
    };

    let gauss = |t: f64, s: f64| (-(t * t) / (2.0 * s * s)).exp() / (s * (2.0 * std::f64::consts::PI).sqrt());
    let center = cfg.fdog_sigma_s;
    let surround = cfg.fdog_sigma_c;
    let half = (surround * 3.0).ceil() as i32;
    let profile: Vec<(f32, f32)> = (-half..=half)
        .map(|t| (t as f32, (gauss(t as f64, center) - FDOG_RHO * gauss(t as f64, surround)) as f32))
        .collect();

    // Across-flow response.
    let mut across = vec![0f32; w * h];
    for y in 0..h {
        cancel.check()?;
        for x in 0..w {
            let (tx, ty) = flow.tangent(x, y);
            if tx == 0.0 && ty == 0.0 {
                continue;
            }
            let (nx, ny) = (-ty, tx);
            across[y * w + x] = profile
                .iter()
                .map(|&(t, k)| k * sample(x as f32 + nx * t, y as f32 + ny * t))
                .sum();
        }
    }

    // Along-flow accumulation.
    let steps = (FLOW_SIGMA * 2.0).ceil() as i32;
    let along: Vec<f32> = (0..=steps).map(|s| gauss(s as f64, FLOW_SIGMA) as f32).collect();
    let mut map = EdgeMap::empty(w as u32, h as u32);
    for y in 0..h {
        cancel.check()?;
        for x in 0..w {
            let i = y * w + x;
            let mut acc = across[i] * along[0];
            let mut norm = along[0];
            for dir in [1f32, -1f32] {
                let (mut px, mut py) = (x as f32, y as f32);
                for weight in &along[1..] {
                    let (cx, cy) = (px.round() as isize, py.round() as isize);
                    if cx < 0 || cy < 0 || cx >= w as isize || cy >= h as isize {
                        break;
                    }
                    let (tx, ty) = flow.tangent(cx as usize, cy as usize);
                    px += tx * dir;
                    py += ty * dir;
                    let (qx, qy) = (px.round() as isize, py.round() as isize);
                    if qx < 0 || qy < 0 || qx >= w as isize || qy >= h as isize {
                        break;
                    }
                    acc += across[qy as usize * w + qx as usize] * weight;
                    norm += weight;
                }
            }
            let response = acc / norm.max(1e-6);
            if response < 0.0 && 1.0 + (response as f64).tanh() < cfg.fdog_tau {
                map.data[i] = 255;
            }
        }
    }

    let mut binary: Vec<u8> = map.data.iter().map(|&v| u8::from(v > 0)).collect();
    zhang_suen_thin(&mut binary, w, h, scheduler, cancel)?;
    map.data = binary.into_iter().map(|v| v * 255).collect();
    Ok(map)
}

/// Neighbour order used for linking ties: E, SE, S, SW, W, NW, N, NE.
const NEIGHBORS: [(isize, isize); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// An 8-connected run of edge pixels in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeChain {
    pub pixels: Vec<(u32, u32)>,
    pub closed: bool,
}

impl EdgeChain {
    pub fn length(&self) -> f64 {
        let mut len: f64 = self
            .pixels
            .windows(2)
            .map(|w| pixel_distance(w[0], w[1]))
            .sum();
        if self.closed {
            if let (Some(&a), Some(&b)) = (self.pixels.first(), self.pixels.last()) {
                len += pixel_distance(a, b);
            }
        }
        len
    }

    pub fn points(&self) -> Vec<Point> {
        self.pixels
            .iter()
            .map(|&(x, y)| Point::new(x as f64 + 0.5, y as f64 + 0.5))
            .collect()
    }

    /// Unit direction leaving the chain at its last pixel.
    fn tail_tangent(&self) -> Point {
        let n = self.pixels.len();
        let back = self.pixels[n.saturating_sub(5)];
        let end = self.pixels[n - 1];
        Point::new(end.0 as f64 - back.0 as f64, end.1 as f64 - back.1 as f64).normalized()
    }

    /// Unit direction leaving the chain at its first pixel.
    fn head_tangent(&self) -> Point {
        let ahead = self.pixels[4.min(self.pixels.len() - 1)];
        let start = self.pixels[0];
        Point::new(start.0 as f64 - ahead.0 as f64, start.1 as f64 - ahead.1 as f64).normalized()
    }
}

fn pixel_distance(a: (u32, u32), b: (u32, u32)) -> f64 {
    (a.0 as f64 - b.0 as f64).hypot(a.1 as f64 - b.1 as f64)
}

/// An 8-connected component of the edge map with its bounding box.
#[derive(Debug, Clone)]
struct Component {
    pixels: Vec<(u32, u32)>,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

fn label_components(edges: &EdgeMap) -> Vec<Component> {
    let (w, h) = (edges.width as usize, edges.height as usize);
    let mut seen = vec![false; w * h];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();
    for start in 0..w * h {
        if edges.data[start] == 0 || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back(start);
        let mut comp = Component {
            pixels: Vec::new(),
            x0: u32::MAX,
            y0: u32::MAX,
            x1: 0,
            y1: 0,
        };
        while let Some(i) = queue.pop_front() {
            let (x, y) = ((i % w) as u32, (i / w) as u32);
            comp.pixels.push((x, y));
            comp.x0 = comp.x0.min(x);
            comp.y0 = comp.y0.min(y);
            comp.x1 = comp.x1.max(x);
            comp.y1 = comp.y1.max(y);
            for (dx, dy) in NEIGHBORS {
                let (nx, ny) = (x as isize + dx, y as isize + dy);
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if edges.data[j] > 0 && !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }
        components.push(comp);
    }
    components
}

/// Orders pixels for chain starts according to the pass variation.
fn scan_order(pixels: &mut [(u32, u32)], variation: PassVariation) {
    match variation {
        PassVariation::Standard | PassVariation::Refine => {
            pixels.sort_unstable_by_key(|&(x, y)| (y, x))
        }
        PassVariation::Reverse => pixels.sort_unstable_by_key(|&(x, y)| std::cmp::Reverse((y, x))),
        PassVariation::Diagonal => pixels.sort_unstable_by_key(|&(x, y)| (x + y, y)),
    }
}

/// Splits one component into chains. Endpoints seed chains first; whatever
/// remains (loops, junction leftovers) is traced in both directions.
fn link_component(
    comp: &Component,
    magnitude: &[f32],
    width: usize,
    variation: PassVariation,
) -> Vec<EdgeChain> {
    let bw = (comp.x1 - comp.x0 + 1) as usize;
    let bh = (comp.y1 - comp.y0 + 1) as usize;
    let local = |x: u32, y: u32| (y - comp.y0) as usize * bw + (x - comp.x0) as usize;
    let mut member = vec![false; bw * bh];
    for &(x, y) in &comp.pixels {
        member[local(x, y)] = true;
    }
    let inside = |x: isize, y: isize| -> Option<(u32, u32)> {
        if x < comp.x0 as isize || y < comp.y0 as isize || x > comp.x1 as isize || y > comp.y1 as isize {
            return None;
        }
        let (x, y) = (x as u32, y as u32);
        member[local(x, y)].then_some((x, y))
    };
    let degree = |(x, y): (u32, u32)| {
        NEIGHBORS
            .iter()
            .filter(|(dx, dy)| inside(x as isize + dx, y as isize + dy).is_some())
            .count()
    };

    let mut visited = vec![false; bw * bh];
    let mut order = comp.pixels.clone();
    scan_order(&mut order, variation);

    let walk = |start: (u32, u32), visited: &mut [bool], mut dir: Option<(isize, isize)>| {
        let mut out = Vec::new();
        let mut cur = start;
        loop {
            let mut best: Option<((u32, u32), (isize, isize), (i64, f32))> = None;
            for &(dx, dy) in &NEIGHBORS {
                let Some(next) = inside(cur.0 as isize + dx, cur.1 as isize + dy) else {
                    continue;
                };
                if visited[local(next.0, next.1)] {
                    continue;
                }
                // Smallest direction change first, then strongest gradient.
                let turn = match dir {
                    Some((px, py)) => {
                        let dot = (px * dx + py * dy) as f64
                            / (((px * px + py * py) as f64).sqrt() * ((dx * dx + dy * dy) as f64).sqrt());
                        (dot * 1000.0).round() as i64
                    }
                    None => 0,
                };
                let score = (turn, magnitude[next.1 as usize * width + next.0 as usize]);
                let better = match &best {
                    None => true,
                    Some((_, _, s)) => score.0 > s.0 || (score.0 == s.0 && score.1 > s.1),
                };
                if better {
                    best = Some((next, (dx, dy), score));
                }
            }
            let Some((next, step, _)) = best else {
                break;
            };
            visited[local(next.0, next.1)] = true;
            out.push(next);
            dir = Some(step);
            cur = next;
        }
        out
    };

    let mut chains = Vec::new();
    for &p in &order {
        if visited[local(p.0, p.1)] || degree(p) != 1 {
            continue;
        }
        visited[local(p.0, p.1)] = true;
        let mut pixels = vec![p];
        pixels.extend(walk(p, &mut visited, None));
        chains.push(EdgeChain {
            pixels,
            closed: false,
        });
    }
    for &p in &order {
        if visited[local(p.0, p.1)] {
            continue;
        }
        visited[local(p.0, p.1)] = true;
        let forward = walk(p, &mut visited, None);
        let initial = forward.first().map(|f| (p.0 as isize - f.0 as isize, p.1 as isize - f.1 as isize));
        let backward = walk(p, &mut visited, initial);
        let mut pixels: Vec<(u32, u32)> = backward.into_iter().rev().collect();
        pixels.push(p);
        pixels.extend(forward);
        let closed = pixels.len() > 8 && {
            let (a, b) = (pixels[0], pixels[pixels.len() - 1]);
            a.0.abs_diff(b.0) <= 1 && a.1.abs_diff(b.1) <= 1
        };
        chains.push(EdgeChain { pixels, closed });
    }
    chains
}

/// Joins open chains whose ends are within `max_gap` and point at each other.
pub fn bridge_gaps(chains: Vec<EdgeChain>, flow: Option<&FlowField>, max_gap: u32) -> Vec<EdgeChain> {
    if max_gap == 0 || chains.len() < 2 {
        return chains;
    }
    let gap = max_gap as f64;
    let cell = |p: (u32, u32)| ((p.0 as f64 / gap) as i64, (p.1 as f64 / gap) as i64);
    let mut chains: Vec<Option<EdgeChain>> = chains.into_iter().map(Some).collect();
    let mut grid: HashMap<(i64, i64), Vec<(usize, bool)>> = HashMap::new();
    for (i, chain) in chains.iter().enumerate() {
        if let Some(c) = chain.as_ref().filter(|c| !c.closed && c.pixels.len() >= 2) {
            grid.entry(cell(c.pixels[0])).or_default().push((i, true));
            grid.entry(cell(c.pixels[c.pixels.len() - 1])).or_default().push((i, false));
        }
    }

    let flow_agrees = |at: (u32, u32), d: Point| -> bool {
        let Some(flow) = flow else {
            return true;
        };
        let (tx, ty) = flow.tangent(at.0 as usize, at.1 as usize);
        if tx == 0.0 && ty == 0.0 {
            return true;
        }
        (tx as f64 * d.x + ty as f64 * d.y).abs() > 0.7
    };

    for i in 0..chains.len() {
        for flip in 0..2 {
            loop {
                let Some(chain) = chains[i].as_ref() else {
                    break;
                };
                if chain.closed || chain.pixels.len() < 2 {
                    break;
                }
                let tail = chain.pixels[chain.pixels.len() - 1];
                let tangent = chain.tail_tangent();
                let (cx, cy) = cell(tail);

                let mut best: Option<(usize, bool, f64)> = None;
                for gx in cx - 1..=cx + 1 {
                    for gy in cy - 1..=cy + 1 {
                        for &(j, is_head) in grid.get(&(gx, gy)).map(Vec::as_slice).unwrap_or(&[]) {
                            if j == i {
                                continue;
                            }
                            let Some(other) = chains[j].as_ref() else {
                                continue;
                            };
                            let end = if is_head {
                                other.pixels[0]
                            } else {
                                other.pixels[other.pixels.len() - 1]
                            };
                            let d = Point::new(end.0 as f64 - tail.0 as f64, end.1 as f64 - tail.1 as f64);
                            let dist = d.length();
                            if dist > gap || dist < 1.0 {
                                continue;
                            }
                            let dir = d.normalized();
                            let other_out = if is_head { other.head_tangent() } else { other.tail_tangent() };
                            // The candidate must continue our direction: its outward
                            // tangent points back at us.
                            if tangent.dot(&dir) < 0.8 || (other_out * -1.0).dot(&tangent) < 0.7 {
                                continue;
                            }
                            if !flow_agrees(tail, dir) {
                                continue;
                            }
                            if best.is_none_or(|(_, _, bd)| dist < bd) {
                                best = Some((j, is_head, dist));
                            }
                        }
                    }
                }

                let Some((j, is_head, _)) = best else {
                    break;
                };
                let Some(mut other) = chains[j].take() else {
                    break;
                };
                if !is_head {
                    other.pixels.reverse();
                }
                let new_tail = other.pixels[other.pixels.len() - 1];
                if let Some(chain) = chains[i].as_mut() {
                    chain.pixels.extend(other.pixels);
                }
                // Ends joined while reversed become the head again afterwards.
                grid.entry(cell(new_tail)).or_default().push((i, flip == 1));
            }
            // Second round extends the other end; two reversals restore order.
            if let Some(chain) = chains[i].as_mut() {
                chain.pixels.reverse();
            }
        }
    }
    chains.into_iter().flatten().collect()
}

/// Edge backend entry point.
pub(crate) fn trace_edges(
    image: &PreprocessedImage,
    cfg: &EdgeConfig,
    ctx: &TraceContext<'_>,
) -> Result<Vec<Primitive>> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mapping = DetailMapping::new(ctx.detail);
    let values = image.gray.to_f32();

    let (mut edges, grad, blurred) = canny(&values, w, h, &mapping, ctx.cancel)?;
    debug!("Canny produced {} edge pixels", edges.count());

    let flow = if cfg.enable_etf_fdog || cfg.enable_flow_tracing {
        Some(edge_tangent_flow(&grad, cfg.etf_radius, cfg.etf_iterations, ctx.cancel)?)
    } else {
        None
    };
    if cfg.enable_etf_fdog {
        if let Some(flow) = &flow {
            let fdog = fdog_edges(&blurred, flow, cfg, ctx.scheduler, ctx.cancel)?;
            debug!("FDoG added {} edge pixels", fdog.count());
            edges.union(&fdog);
        }
    }

    let components = label_components(&edges);
    let batches = split_range(components.len(), ctx.scheduler.threads() * 4);
    let magnitude = &grad.magnitude;
    let linked = ctx.scheduler.run_partitions(batches, ctx.cancel, ctx.progress_hook(), |_, range| {
        let mut out = Vec::new();
        for comp in &components[range] {
            out.extend(link_component(comp, magnitude, w, ctx.variation));
        }
        Ok(out)
    })?;
    let mut chains: Vec<EdgeChain> = linked.into_iter().flatten().collect();
    ctx.cancel.check()?;

    if cfg.enable_flow_tracing {
        let before = chains.len();
        chains = bridge_gaps(chains, flow.as_ref(), cfg.max_gap);
        debug!("Gap bridging merged {} chains", before - chains.len());
    }

    let diagonal = (w as f64).hypot(h as f64);
    let min_length = mapping.min_stroke_length(diagonal);
    let epsilon = mapping.edge_epsilon(diagonal);
    let black = RGBA8::new(0, 0, 0, 255);

    let primitives: Vec<Primitive> = chains
        .iter()
        .filter(|c| c.length() >= min_length)
        .filter_map(|c| {
            let color = if cfg.preserve_colors {
                mean_color(&image.rgba, &c.pixels)
            } else {
                black
            };
            refine_chain(
                &c.points(),
                c.closed,
                epsilon,
                ctx.params.enable_bezier_fitting,
                PathStyle::stroked(color, ctx.params.stroke_width),
            )
        })
        .map(Primitive::Path)
        .collect();
    debug!(
        "Edge pass {}: {} chains, {} paths (min length {:.1})",
        ctx.pass_index,
        chains.len(),
        primitives.len(),
        min_length
    );
    Ok(primitives)
}
