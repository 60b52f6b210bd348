//! Dot placement driven by darkness and local contrast.
//!
//! The image is cut into fixed-height row bands. Each band gets its own RNG
//! derived from the pass seed and band index, so output does not depend on
//! how many threads ran the bands.

use std::collections::HashMap;
use std::ops::Range;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rgb::RGBA8;

use crate::config::{DotShape, DotsConfig, GridPattern};
use crate::edge_detector::sobel;
use crate::error::Result;
use crate::image_processor::{MAX_COLOR_DISTANCE, color_distance_sq, luminance};
use crate::multipass::PassVariation;
use crate::preprocessor::PreprocessedImage;
use crate::vectorizer::{Dot, Point, Primitive, TraceContext};

const OVERLAP_RETRIES: usize = 8;
const POISSON_TRIES: usize = 30;
const BAND_CELL_ROWS: usize = 8;
const POISSON_BAND_HEIGHT: usize = 64;

/// Per-pixel placement weights.
pub struct ImportanceMap {
    pub width: usize,
    pub height: usize,
    pub darkness: Vec<f32>,
    /// Sobel magnitude scaled to [0, 1].
    pub gradient: Vec<f32>,
    pub importance: Vec<f32>,
    /// Pixels matching the background.
    pub skip: Vec<bool>,
}

impl ImportanceMap {
    pub fn build(image: &PreprocessedImage, cfg: &DotsConfig) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let dark_background = luminance(image.background) < 128;
        let darkness: Vec<f32> = image
            .gray
            .data
            .iter()
            .map(|&g| {
                let v = g as f32 / 255.0;
                if dark_background { v } else { 1.0 - v }
            })
            .collect();

        let grad = sobel(&image.gray.to_f32(), w, h);
        let max = grad.magnitude.iter().copied().fold(0f32, f32::max);
        let gradient: Vec<f32> = if max > 0.0 {
            grad.magnitude.iter().map(|m| m / max).collect()
        } else {
            vec![0.0; w * h]
        };

        let importance = darkness
            .iter()
            .zip(&gradient)
            .map(|(d, g)| 0.7 * d + 0.3 * g)
            .collect();

        let limit = cfg.background_tolerance * MAX_COLOR_DISTANCE;
        let limit_sq = (limit * limit) as u32;
        let skip = image
            .rgba
            .pixels
            .iter()
            .map(|&p| color_distance_sq(p, image.background) <= limit_sq)
            .collect();

        Self {
            width: w,
            height: h,
            darkness,
            gradient,
            importance,
            skip,
        }
    }
}

/// Spatial hash over placed dots enforcing the minimum center distance.
struct DotIndex {
    cell: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
    dots: Vec<Dot>,
}

impl DotIndex {
    fn new(cell: f64) -> Self {
        Self {
            cell: cell.max(0.5),
            cells: HashMap::new(),
            dots: Vec::new(),
        }
    }

    fn key(&self, p: Point) -> (i64, i64) {
        ((p.x / self.cell).floor() as i64, (p.y / self.cell).floor() as i64)
    }

    /// No placed center is closer than the smaller of the two radii.
    fn fits(&self, center: Point, radius: f64) -> bool {
        let (kx, ky) = self.key(center);
        for gx in kx - 1..=kx + 1 {
            for gy in ky - 1..=ky + 1 {
                let Some(indices) = self.cells.get(&(gx, gy)) else {
                    continue;
                };
                for &i in indices {
                    let other = &self.dots[i];
                    if other.center.distance(&center) < radius.min(other.radius) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn insert(&mut self, dot: Dot) {
        let key = self.key(dot.center);
        self.cells.entry(key).or_default().push(self.dots.len());
        self.dots.push(dot);
    }

    fn try_insert(&mut self, dot: Dot) -> bool {
        if self.fits(dot.center, dot.radius) {
            self.insert(dot);
            true
        } else {
            false
        }
    }
}

struct Placer<'a> {
    map: &'a ImportanceMap,
    image: &'a PreprocessedImage,
    cfg: &'a DotsConfig,
}

impl Placer<'_> {
    fn acceptance(&self, i: usize) -> f64 {
        (self.map.importance[i] as f64 * (0.35 + 0.65 * self.cfg.density)).min(1.0)
    }

    fn dot_at(&self, i: usize, jitter: (f64, f64)) -> Dot {
        let t = f64::from(if self.cfg.gradient_sizing {
            self.map.gradient[i]
        } else {
            self.map.darkness[i]
        });
        let radius = self.cfg.min_radius + (self.cfg.max_radius - self.cfg.min_radius) * t.clamp(0.0, 1.0);
        let color = if self.cfg.preserve_colors {
            let p = self.image.rgba.pixels[i];
            RGBA8::new(p.r, p.g, p.b, 255)
        } else {
            RGBA8::new(0, 0, 0, 255)
        };
        Dot {
            center: Point::new(
                (i % self.map.width) as f64 + jitter.0,
                (i / self.map.width) as f64 + jitter.1,
            ),
            radius,
            color,
            shape: self.cfg.shape,
        }
    }

    /// Side of a jitter cell: shrinks as density grows.
    fn cell_size(&self) -> usize {
        (2.0 * self.cfg.max_radius * (1.25 - self.cfg.density)).round().max(1.0) as usize
    }

    /// One candidate per cell, chosen with probability proportional to importance.
    fn place_grid(&self, rows: Range<usize>, variation: PassVariation, rng: &mut StdRng) -> Vec<Dot> {
        let w = self.map.width;
        let cell = self.cell_size();
        let half = cell / 2;
        // Hexagonal packing shifts every other row by half a cell, which
        // leaves a half-width cell at the left edge of shifted rows.
        let shifted = |y: usize| {
            self.cfg.grid_pattern == GridPattern::Hexagonal && half > 0 && ((y - rows.start) / cell) % 2 == 1
        };
        let cell_end = |x: usize, y: usize| {
            let end = if shifted(y) && x == 0 { half } else { x + cell };
            end.min(w)
        };
        let mut origins: Vec<(usize, usize)> = Vec::new();
        let mut y = rows.start;
        while y < rows.end {
            let mut x = 0;
            while x < w {
                origins.push((x, y));
                x = cell_end(x, y);
            }
            y += cell;
        }
        order_cells(&mut origins, variation);

        let mut index = DotIndex::new(self.cfg.max_radius);
        let mut candidates: Vec<(usize, f32)> = Vec::new();
        for (x0, y0) in origins {
            candidates.clear();
            let mut total = 0f32;
            for y in y0..(y0 + cell).min(rows.end) {
                for x in x0..cell_end(x0, y0) {
                    let i = y * w + x;
                    if !self.map.skip[i] && self.map.importance[i] > 0.0 {
                        total += self.map.importance[i];
                        candidates.push((i, total));
                    }
                }
            }
            if candidates.is_empty() {
                continue;
            }
            let pick = |rng: &mut StdRng| {
                let target = rng.gen_range(0.0..total);
                candidates
                    .iter()
                    .find(|(_, cumulative)| *cumulative > target)
                    .map(|(i, _)| *i)
                    .unwrap_or(candidates[candidates.len() - 1].0)
            };
            let first = pick(rng);
            if rng.gen_range(0.0..1.0) >= self.acceptance(first) {
                continue;
            }
            let mut chosen = first;
            for _ in 0..=OVERLAP_RETRIES {
                let dot = self.dot_at(chosen, (rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)));
                if index.try_insert(dot) {
                    break;
                }
                chosen = pick(rng);
            }
        }
        index.dots
    }

    /// Bridson sampling over the band, thinned by importance.
    fn place_poisson(&self, rows: Range<usize>, variation: PassVariation, rng: &mut StdRng) -> Vec<Dot> {
        let w = self.map.width as f64;
        let (top, bottom) = (rows.start as f64, rows.end as f64);
        let dmin = (2.0 * self.cfg.max_radius * (1.2 - self.cfg.density)).max(1.0);
        // Darker pixels pack tighter.
        let spacing = |p: Point| -> f64 {
            let i = (p.y as usize).min(self.map.height - 1) * self.map.width + (p.x as usize).min(self.map.width - 1);
            dmin * (1.0 - 0.5 * self.map.importance[i] as f64)
        };

        let mut samples = DotIndex::new(dmin);
        let seed = Point::new(rng.gen_range(0.0..w), rng.gen_range(top..bottom));
        let mut active = vec![samples.dots.len()];
        samples.insert(Dot {
            center: seed,
            radius: spacing(seed),
            color: RGBA8::default(),
            shape: DotShape::Circle,
        });
        while let Some(&current) = active.last() {
            let origin = samples.dots[current].center;
            let r = samples.dots[current].radius;
            let mut found = false;
            for _ in 0..POISSON_TRIES {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let dist = rng.gen_range(r..2.0 * r);
                let p = Point::new(origin.x + angle.cos() * dist, origin.y + angle.sin() * dist);
                if p.x < 0.0 || p.x >= w || p.y < top || p.y >= bottom {
                    continue;
                }
                let need = spacing(p);
                if poisson_clear(&samples, p, need) {
                    active.push(samples.dots.len());
                    samples.insert(Dot {
                        center: p,
                        radius: need,
                        color: RGBA8::default(),
                        shape: DotShape::Circle,
                    });
                    found = true;
                    break;
                }
            }
            if !found {
                active.pop();
            }
        }

        let mut points: Vec<Point> = samples.dots.iter().map(|d| d.center).collect();
        match variation {
            PassVariation::Reverse => points.reverse(),
            PassVariation::Diagonal => points.sort_by(|a, b| (a.x + a.y).total_cmp(&(b.x + b.y))),
            PassVariation::Standard | PassVariation::Refine => {}
        }

        let mut index = DotIndex::new(self.cfg.max_radius);
        for p in points {
            let i = p.y as usize * self.map.width + p.x as usize;
            if self.map.skip[i] || rng.gen_range(0.0..1.0) >= self.acceptance(i) {
                continue;
            }
            let mut dot = self.dot_at(i, (0.0, 0.0));
            dot.center = p;
            index.try_insert(dot);
        }
        index.dots
    }
}

/// True when no sample lies within `need` of `p` (Bridson spacing test).
fn poisson_clear(samples: &DotIndex, p: Point, need: f64) -> bool {
    let (kx, ky) = samples.key(p);
    for gx in kx - 1..=kx + 1 {
        for gy in ky - 1..=ky + 1 {
            if let Some(indices) = samples.cells.get(&(gx, gy)) {
                if indices.iter().any(|&i| samples.dots[i].center.distance(&p) < need) {
                    return false;
                }
            }
        }
    }
    true
}

fn order_cells(origins: &mut [(usize, usize)], variation: PassVariation) {
    match variation {
        PassVariation::Standard | PassVariation::Refine => {}
        PassVariation::Reverse => origins.reverse(),
        PassVariation::Diagonal => origins.sort_by_key(|&(x, y)| (x + y, y)),
    }
}

fn band_seed(seed: u64, band: usize) -> u64 {
    seed ^ (band as u64 + 1).wrapping_mul(0xD1B5_4A32_D192_ED03)
}

/// Dots backend entry point.
pub(crate) fn place_dots(
    image: &PreprocessedImage,
    cfg: &DotsConfig,
    ctx: &TraceContext<'_>,
) -> Result<Vec<Primitive>> {
    let map = ImportanceMap::build(image, cfg);
    let placer = Placer { map: &map, image, cfg };
    let h = map.height;

    let band_height = if cfg.poisson_disk {
        POISSON_BAND_HEIGHT
    } else {
        placer.cell_size() * BAND_CELL_ROWS
    };
    let bands: Vec<Range<usize>> = (0..h.div_ceil(band_height))
        .map(|b| b * band_height..((b + 1) * band_height).min(h))
        .collect();
    let seed = ctx.pass_seed();
    let variation = ctx.variation;

    let placed = ctx.scheduler.run_partitions(bands, ctx.cancel, ctx.progress_hook(), |band, rows| {
        let mut rng = StdRng::seed_from_u64(band_seed(seed, band));
        Ok(if cfg.poisson_disk {
            placer.place_poisson(rows, variation, &mut rng)
        } else {
            placer.place_grid(rows, variation, &mut rng)
        })
    })?;

    // Bands were placed independently; re-check dots near band seams.
    let mut index = DotIndex::new(cfg.max_radius);
    let mut dropped = 0;
    for dot in placed.into_iter().flatten() {
        if !index.try_insert(dot) {
            dropped += 1;
        }
    }
    debug!(
        "Dots pass {}: {} placed, {} dropped at band seams",
        ctx.pass_index,
        index.dots.len(),
        dropped
    );
    Ok(index.dots.into_iter().map(Primitive::Dot).collect())
}
