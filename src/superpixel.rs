//! SLIC superpixel segmentation and region boundary extraction.

use std::collections::VecDeque;

use log::debug;
use rgb::RGBA8;

use crate::config::{Backend, SuperpixelConfig};
use crate::error::{ConversionError, Result};
use crate::image_processor::{RasterImage, luminance};
use crate::multipass::PassVariation;
use crate::path_simplifier::{polygon_area, refine_chain, smooth_closed};
use crate::preprocessor::PreprocessedImage;
use crate::scheduler::split_range;
use crate::vectorizer::{PathStyle, Point, Primitive, Region, TraceContext};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl Lab {
    fn distance_sq(&self, other: &Lab) -> f64 {
        let (dl, da, db) = (self.l - other.l, self.a - other.a, self.b - other.b);
        dl * dl + da * da + db * db
    }
}

/// sRGB to CIELAB under D65.
pub fn rgb_to_lab(p: RGBA8) -> Lab {
    fn linear(c: u8) -> f64 {
        let c = c as f64 / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    }
    fn f(t: f64) -> f64 {
        if t > 0.008_856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    }
    let (r, g, b) = (linear(p.r), linear(p.g), linear(p.b));
    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / 0.950_47;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / 1.088_83;
    let (fx, fy, fz) = (f(x), f(y), f(z));
    Lab {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Center {
    lab: Lab,
    x: f64,
    y: f64,
}

/// Per-pixel superpixel labels, compact from 0.
#[derive(Debug, Clone)]
pub struct LabelMap {
    pub width: usize,
    pub height: usize,
    pub labels: Vec<u32>,
    pub count: usize,
}

/// Seeds centers on a regular grid with spacing `step`, offset by the pass variation,
/// then nudges each to the lowest-gradient pixel of its 3x3 neighbourhood.
fn seed_centers(lab: &[Lab], width: usize, height: usize, step: f64, variation: PassVariation) -> Vec<Center> {
    let (offset_x, offset_y) = match variation {
        PassVariation::Standard | PassVariation::Refine => (step / 2.0, step / 2.0),
        PassVariation::Reverse => (step / 4.0, step / 4.0),
        PassVariation::Diagonal => (step * 0.75, step / 2.0),
    };
    let gradient = |x: usize, y: usize| -> f64 {
        if x == 0 || y == 0 || x + 1 >= width || y + 1 >= height {
            return f64::INFINITY;
        }
        lab[y * width + x + 1].distance_sq(&lab[y * width + x - 1])
            + lab[(y + 1) * width + x].distance_sq(&lab[(y - 1) * width + x])
    };

    let mut centers = Vec::new();
    let mut row = 0;
    let mut y = offset_y;
    while y < height as f64 {
        // Diagonal passes stagger every other row.
        let stagger = if variation == PassVariation::Diagonal && row % 2 == 1 {
            -step / 2.0
        } else {
            0.0
        };
        let mut x = offset_x + stagger;
        while x < width as f64 {
            if x >= 0.0 {
                let (cx, cy) = (x as usize, y as usize);
                let mut best = (gradient(cx, cy), cx, cy);
                for ny in cy.saturating_sub(1)..=(cy + 1).min(height - 1) {
                    for nx in cx.saturating_sub(1)..=(cx + 1).min(width - 1) {
                        let g = gradient(nx, ny);
                        if g < best.0 {
                            best = (g, nx, ny);
                        }
                    }
                }
                centers.push(Center {
                    lab: lab[best.2 * width + best.1],
                    x: best.1 as f64,
                    y: best.2 as f64,
                });
            }
            x += step;
        }
        y += step;
        row += 1;
    }
    centers
}

/// SLIC clustering followed by connectivity enforcement.
pub(crate) fn slic(
    lab: &[Lab],
    width: usize,
    height: usize,
    cfg: &SuperpixelConfig,
    ctx: &TraceContext<'_>,
) -> Result<LabelMap> {
    let n = width * height;
    let k = (cfg.num_superpixels as usize).clamp(1, n);
    let step = ((n as f64 / k as f64).sqrt()).max(1.0);
    let mut centers = seed_centers(lab, width, height, step, ctx.variation);
    if centers.is_empty() {
        centers.push(Center {
            lab: lab[0],
            x: 0.0,
            y: 0.0,
        });
    }
    let spatial_weight = (cfg.compactness / step).powi(2);
    let mut labels = vec![0u32; n];

    for iteration in 0..cfg.slic_iterations {
        // Bucket centers by grid cell so each pixel only scans nearby ones.
        let cols = (width as f64 / step).ceil() as usize + 1;
        let rows = (height as f64 / step).ceil() as usize + 1;
        let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); cols * rows];
        for (i, c) in centers.iter().enumerate() {
            let bx = ((c.x / step) as usize).min(cols - 1);
            let by = ((c.y / step) as usize).min(rows - 1);
            buckets[by * cols + bx].push(i as u32);
        }

        let bands = split_range(height, ctx.scheduler.threads() * 4);
        let centers_ref = &centers;
        let buckets_ref = &buckets;
        let assigned = ctx.scheduler.run_partitions(bands, ctx.cancel, ctx.progress_hook(), |_, band| {
            let mut out = Vec::with_capacity(band.len() * width);
            for y in band {
                let by = (y as f64 / step) as usize;
                for x in 0..width {
                    let bx = (x as f64 / step) as usize;
                    let p = &lab[y * width + x];
                    let mut best = (f64::INFINITY, 0u32);
                    for gy in by.saturating_sub(2)..=(by + 2).min(rows - 1) {
                        for gx in bx.saturating_sub(2)..=(bx + 2).min(cols - 1) {
                            for &ci in &buckets_ref[gy * cols + gx] {
                                let c = &centers_ref[ci as usize];
                                let (dx, dy) = (c.x - x as f64, c.y - y as f64);
                                if dx.abs() > 2.0 * step || dy.abs() > 2.0 * step {
                                    continue;
                                }
                                let d = p.distance_sq(&c.lab) + (dx * dx + dy * dy) * spatial_weight;
                                if d < best.0 || (d == best.0 && ci < best.1) {
                                    best = (d, ci);
                                }
                            }
                        }
                    }
                    out.push(best.1);
                }
            }
            Ok(out)
        })?;
        labels = assigned.concat();

        let mut sums = vec![(0f64, 0f64, 0f64, 0f64, 0f64, 0usize); centers.len()];
        for (i, &label) in labels.iter().enumerate() {
            let s = &mut sums[label as usize];
            let p = &lab[i];
            s.0 += p.l;
            s.1 += p.a;
            s.2 += p.b;
            s.3 += (i % width) as f64;
            s.4 += (i / width) as f64;
            s.5 += 1;
        }
        let mut shift = 0.0;
        for (c, s) in centers.iter_mut().zip(&sums) {
            if s.5 == 0 {
                continue;
            }
            let count = s.5 as f64;
            let (nx, ny) = (s.3 / count, s.4 / count);
            shift += (nx - c.x).hypot(ny - c.y);
            *c = Center {
                lab: Lab {
                    l: s.0 / count,
                    a: s.1 / count,
                    b: s.2 / count,
                },
                x: nx,
                y: ny,
            };
        }
        debug!(
            "SLIC iteration {}: {} centers, mean shift {:.3}",
            iteration + 1,
            centers.len(),
            shift / centers.len() as f64
        );
        ctx.cancel.check()?;
    }

    let min_size = ((step * step) / 4.0).max(1.0) as usize;
    Ok(enforce_connectivity(&labels, width, height, min_size))
}

/// Relabels 4-connected components, merging those smaller than `min_size`
/// into the label of an adjacent earlier component.
pub fn enforce_connectivity(labels: &[u32], width: usize, height: usize, min_size: usize) -> LabelMap {
    const UNSET: u32 = u32::MAX;
    let mut out = vec![UNSET; labels.len()];
    let mut next = 0u32;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for start in 0..labels.len() {
        if out[start] != UNSET {
            continue;
        }
        let (sx, sy) = (start % width, start / width);
        // Label of an already finished neighbouring component.
        let mut adjacent = None;
        for (nx, ny) in neighbors4(sx, sy, width, height) {
            let j = ny * width + nx;
            if out[j] != UNSET {
                adjacent = Some(out[j]);
            }
        }

        component.clear();
        out[start] = next;
        queue.push_back(start);
        while let Some(i) = queue.pop_front() {
            component.push(i);
            for (nx, ny) in neighbors4(i % width, i / width, width, height) {
                let j = ny * width + nx;
                if out[j] == UNSET && labels[j] == labels[start] {
                    out[j] = next;
                    queue.push_back(j);
                }
            }
        }

        match adjacent {
            Some(label) if component.len() < min_size => {
                for &i in &component {
                    out[i] = label;
                }
            }
            _ => next += 1,
        }
    }

    LabelMap {
        width,
        height,
        labels: out,
        count: next as usize,
    }
}

fn neighbors4(x: usize, y: usize, width: usize, height: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut out = [(usize::MAX, usize::MAX); 4];
    if x > 0 {
        out[0] = (x - 1, y);
    }
    if y > 0 {
        out[1] = (x, y - 1);
    }
    if x + 1 < width {
        out[2] = (x + 1, y);
    }
    if y + 1 < height {
        out[3] = (x, y + 1);
    }
    out.into_iter().filter(|&(x, _)| x != usize::MAX)
}

/// Traces the outer boundary of a pixel mask along pixel edges, clockwise,
/// keeping the region on the right. Returns corner coordinates.
///
/// `mask` covers a `width` x `height` window.
pub fn trace_outline(mask: &[bool], width: usize, height: usize) -> Vec<Point> {
    let inside = |x: isize, y: isize| -> bool {
        x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height && mask[y as usize * width + x as usize]
    };
    let Some(first) = mask.iter().position(|&m| m) else {
        return Vec::new();
    };
    let start = ((first % width) as isize, (first / width) as isize);
    // Right, down, left, up.
    const DIRS: [(isize, isize); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

    let mut outline = Vec::new();
    let (mut vx, mut vy) = start;
    let mut dir = 0usize;
    let max_steps = 4 * mask.len() + 4;
    for _ in 0..max_steps {
        outline.push(Point::new(vx as f64, vy as f64));
        vx += DIRS[dir].0;
        vy += DIRS[dir].1;
        // Pixels ahead-left and ahead-right of the vertex for the current heading.
        let (left, right) = match dir {
            0 => ((vx, vy - 1), (vx, vy)),
            1 => ((vx, vy), (vx - 1, vy)),
            2 => ((vx - 1, vy), (vx - 1, vy - 1)),
            _ => ((vx - 1, vy - 1), (vx, vy - 1)),
        };
        dir = if inside(left.0, left.1) {
            (dir + 3) % 4
        } else if inside(right.0, right.1) {
            dir
        } else {
            (dir + 1) % 4
        };
        if (vx, vy) == start && dir == 0 {
            break;
        }
    }
    outline
}

fn region_color(source: &RasterImage, pixels: &[usize], preserve_colors: bool) -> RGBA8 {
    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for &i in pixels {
        let p = source.pixels[i];
        r += p.r as u64;
        g += p.g as u64;
        b += p.b as u64;
    }
    let n = pixels.len().max(1) as u64;
    let mean = RGBA8::new((r / n) as u8, (g / n) as u8, (b / n) as u8, 255);
    if preserve_colors {
        mean
    } else {
        let l = luminance(mean);
        RGBA8::new(l, l, l, 255)
    }
}

/// Superpixel backend entry point.
pub(crate) fn trace_regions(
    image: &PreprocessedImage,
    cfg: &SuperpixelConfig,
    ctx: &TraceContext<'_>,
) -> Result<Vec<Primitive>> {
    let source = image.quantized.as_ref().unwrap_or(&image.rgba);
    let (w, h) = (source.width as usize, source.height as usize);
    let lab: Vec<Lab> = source.pixels.iter().map(|&p| rgb_to_lab(p)).collect();
    ctx.cancel.check()?;

    let labels = slic(&lab, w, h, cfg, ctx)?;
    if labels.count == 0 {
        return Err(ConversionError::internal(
            Backend::Superpixel,
            "slic",
            "segmentation produced no regions",
        ));
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); labels.count];
    for (i, &label) in labels.labels.iter().enumerate() {
        members[label as usize].push(i);
    }
    debug!("Superpixel: {} regions after connectivity enforcement", labels.count);

    let batches = split_range(labels.count, ctx.scheduler.threads() * 4);
    let stroke_width = ctx.params.stroke_width;
    let bezier = ctx.params.enable_bezier_fitting;
    let traced = ctx.scheduler.run_partitions(batches, ctx.cancel, None, |_, range| {
        let mut out = Vec::new();
        for label in range {
            let pixels = &members[label];
            let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
            for &i in pixels {
                let (x, y) = (i % w, i / w);
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
            let (bw, bh) = (x1 - x0 + 1, y1 - y0 + 1);
            let mut mask = vec![false; bw * bh];
            for &i in pixels {
                mask[(i / w - y0) * bw + (i % w - x0)] = true;
            }
            let outline: Vec<Point> = trace_outline(&mask, bw, bh)
                .into_iter()
                .map(|p| Point::new(p.x + x0 as f64, p.y + y0 as f64))
                .collect();
            let enclosed = polygon_area(&outline);
            let smoothed = smooth_closed(&outline, 1);

            let color = region_color(source, pixels, cfg.preserve_colors);
            let style = PathStyle {
                stroke: cfg.stroke_regions.then_some(color),
                fill: cfg.fill_regions.then_some(color),
                stroke_width: if cfg.stroke_regions { stroke_width } else { 0.0 },
            };
            if let Some(boundary) = refine_chain(&smoothed, true, cfg.boundary_epsilon, bezier, style) {
                let region = Region {
                    boundary,
                    color,
                    area: pixels.len(),
                };
                out.push((enclosed, label, Primitive::Region(region)));
            }
        }
        Ok(out)
    })?;

    // A region's outer outline encloses every region nested inside it, so
    // painting by descending outline area keeps enclosed regions visible.
    let mut traced: Vec<(f64, usize, Primitive)> = traced.into_iter().flatten().collect();
    traced.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    let primitives: Vec<Primitive> = traced.into_iter().map(|(_, _, p)| p).collect();
    debug!("Superpixel pass {}: {} regions traced", ctx.pass_index, primitives.len());
    Ok(primitives)
}
