use std::collections::HashMap;

use rgb::RGBA8;

use crate::error::{ConversionError, Result};

/// Length of the RGB cube diagonal.
pub const MAX_COLOR_DISTANCE: f64 = 441.67;

/// Straight-alpha RGBA raster, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<RGBA8>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32, pixels: Vec<RGBA8>) -> Result<Self> {
        let image = Self {
            width,
            height,
            pixels,
        };
        image.validate()?;
        Ok(image)
    }

    /// Builds a raster from tightly packed RGBA bytes.
    pub fn from_rgba_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| ConversionError::invalid_image("dimensions overflow"))?;
        if bytes.len() != expected {
            return Err(ConversionError::invalid_image(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                width,
                height,
                bytes.len()
            )));
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|p| RGBA8::new(p[0], p[1], p[2], p[3]))
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn filled(width: u32, height: u32, color: RGBA8) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConversionError::invalid_image(format!(
                "zero dimension {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            return Err(ConversionError::invalid_image(format!(
                "expected {} pixels for {}x{}, got {}",
                expected,
                self.width,
                self.height,
                self.pixels.len()
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> RGBA8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    pub fn diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64)
    }

    /// True when every pixel is within `tolerance` of the first on each RGB channel.
    pub fn is_uniform(&self, tolerance: u8) -> bool {
        let Some(first) = self.pixels.first() else {
            return true;
        };
        self.pixels.iter().all(|p| {
            p.r.abs_diff(first.r) <= tolerance
                && p.g.abs_diff(first.g) <= tolerance
                && p.b.abs_diff(first.b) <= tolerance
        })
    }

    /// Composites every pixel over white and makes it opaque.
    pub fn flatten_alpha(&self) -> RasterImage {
        let pixels = self
            .pixels
            .iter()
            .map(|p| {
                if p.a == 255 {
                    return *p;
                }
                let a = p.a as u32;
                let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
                RGBA8::new(blend(p.r), blend(p.g), blend(p.b), 255)
            })
            .collect();
        RasterImage {
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    /// Area-averaging downscale so the longest side is at most `max_side`.
    ///
    /// Returns the scaled image and the per-axis factors (`<= 1`) applied to
    /// coordinates. Rounding makes the two factors differ slightly, and a lot
    /// when one side clamps to a single pixel.
    pub fn downscale_to_fit(&self, max_side: u32) -> (RasterImage, (f64, f64)) {
        let longest = self.width.max(self.height);
        if longest <= max_side || max_side == 0 {
            return (self.clone(), (1.0, 1.0));
        }
        let scale = max_side as f64 / longest as f64;
        let new_w = ((self.width as f64 * scale).round() as u32).max(1);
        let new_h = ((self.height as f64 * scale).round() as u32).max(1);
        let sx = self.width as f64 / new_w as f64;
        let sy = self.height as f64 / new_h as f64;

        let mut pixels = Vec::with_capacity(new_w as usize * new_h as usize);
        for y in 0..new_h {
            let y0 = (y as f64 * sy).floor() as u32;
            let y1 = (((y + 1) as f64 * sy).ceil() as u32).min(self.height).max(y0 + 1);
            for x in 0..new_w {
                let x0 = (x as f64 * sx).floor() as u32;
                let x1 = (((x + 1) as f64 * sx).ceil() as u32).min(self.width).max(x0 + 1);
                let (mut r, mut g, mut b, mut a, mut n) = (0u64, 0u64, 0u64, 0u64, 0u64);
                for yy in y0..y1 {
                    for xx in x0..x1 {
                        let p = self.pixel(xx, yy);
                        r += p.r as u64;
                        g += p.g as u64;
                        b += p.b as u64;
                        a += p.a as u64;
                        n += 1;
                    }
                }
                let n = n.max(1);
                pixels.push(RGBA8::new(
                    (r / n) as u8,
                    (g / n) as u8,
                    (b / n) as u8,
                    (a / n) as u8,
                ));
            }
        }
        (
            RasterImage {
                width: new_w,
                height: new_h,
                pixels,
            },
            (
                new_w as f64 / self.width as f64,
                new_h as f64 / self.height as f64,
            ),
        )
    }

    pub fn to_gray(&self) -> GrayPlane {
        GrayPlane {
            width: self.width,
            height: self.height,
            data: self.pixels.iter().map(|p| luminance(*p)).collect(),
        }
    }
}

/// Single-channel 8-bit plane.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayPlane {
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// 3x3 median with clamped borders.
    pub fn median3(&self) -> GrayPlane {
        let w = self.width as i64;
        let h = self.height as i64;
        let mut out = Vec::with_capacity(self.data.len());
        let mut window = [0u8; 9];
        for y in 0..h {
            for x in 0..w {
                let mut k = 0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let nx = (x + dx).clamp(0, w - 1);
                        let ny = (y + dy).clamp(0, h - 1);
                        window[k] = self.data[(ny * w + nx) as usize];
                        k += 1;
                    }
                }
                window.sort_unstable();
                out.push(window[4]);
            }
        }
        GrayPlane {
            width: self.width,
            height: self.height,
            data: out,
        }
    }

    /// Samples as `f32` in `[0, 255]`.
    pub fn to_f32(&self) -> Vec<f32> {
        self.data.iter().map(|&v| v as f32).collect()
    }
}

#[inline]
pub fn luminance(p: RGBA8) -> u8 {
    (0.299 * p.r as f64 + 0.587 * p.g as f64 + 0.114 * p.b as f64).round() as u8
}

/// Average opaque color of the given pixels.
pub fn mean_color(image: &RasterImage, pixels: &[(u32, u32)]) -> RGBA8 {
    let (mut r, mut g, mut b) = (0u64, 0u64, 0u64);
    for &(x, y) in pixels {
        let p = image.pixel(x, y);
        r += p.r as u64;
        g += p.g as u64;
        b += p.b as u64;
    }
    let n = pixels.len().max(1) as u64;
    RGBA8::new((r / n) as u8, (g / n) as u8, (b / n) as u8, 255)
}

/// Otsu threshold of a gray plane: the level maximizing between-class
/// variance, with classes `<= t` and `> t`.
pub fn otsu_threshold(gray: &GrayPlane) -> u8 {
    let mut histogram = [0u64; 256];
    for &v in &gray.data {
        histogram[v as usize] += 1;
    }
    let total = gray.data.len() as f64;
    let sum_all: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    let (mut weight0, mut sum0) = (0f64, 0f64);
    let (mut best, mut best_variance) = (128u8, 0f64);
    for (t, &count) in histogram.iter().enumerate().take(255) {
        weight0 += count as f64;
        sum0 += t as f64 * count as f64;
        let weight1 = total - weight0;
        if weight0 == 0.0 || weight1 == 0.0 {
            continue;
        }
        let mean0 = sum0 / weight0;
        let mean1 = (sum_all - sum0) / weight1;
        let variance = weight0 * weight1 * (mean0 - mean1) * (mean0 - mean1);
        if variance > best_variance {
            best_variance = variance;
            best = t as u8;
        }
    }
    best
}

/// Squared RGB distance.
#[inline]
pub fn color_distance_sq(a: RGBA8, b: RGBA8) -> u32 {
    let dr = a.r as i32 - b.r as i32;
    let dg = a.g as i32 - b.g as i32;
    let db = a.b as i32 - b.b as i32;
    (dr * dr + dg * dg + db * db) as u32
}

/// Most frequent color along the image border, bucketed to 5 bits per channel.
pub fn detect_background(image: &RasterImage) -> RGBA8 {
    let (w, h) = (image.width, image.height);
    let mut counts: HashMap<(u8, u8, u8), (u32, [u64; 3])> = HashMap::new();
    let mut visit = |p: RGBA8| {
        let key = (p.r >> 3, p.g >> 3, p.b >> 3);
        let entry = counts.entry(key).or_insert((0, [0; 3]));
        entry.0 += 1;
        entry.1[0] += p.r as u64;
        entry.1[1] += p.g as u64;
        entry.1[2] += p.b as u64;
    };
    for x in 0..w {
        visit(image.pixel(x, 0));
        if h > 1 {
            visit(image.pixel(x, h - 1));
        }
    }
    for y in 1..h.saturating_sub(1) {
        visit(image.pixel(0, y));
        if w > 1 {
            visit(image.pixel(w - 1, y));
        }
    }
    counts
        .into_iter()
        .max_by_key(|(key, (count, _))| (*count, std::cmp::Reverse(*key)))
        .map(|(_, (count, sums))| {
            let n = count.max(1) as u64;
            RGBA8::new(
                (sums[0] / n) as u8,
                (sums[1] / n) as u8,
                (sums[2] / n) as u8,
                255,
            )
        })
        .unwrap_or(RGBA8::new(255, 255, 255, 255))
}

/// Median-cut color quantization; alpha is preserved per pixel.
pub fn quantize_colors(image: &RasterImage, num_colors: usize) -> Result<RasterImage> {
    if num_colors == 0 {
        return Err(ConversionError::invalid_parameter(
            "num_colors",
            "must be greater than 0",
        ));
    }

    let palette = median_cut(&image.pixels, num_colors);
    let mut cache: HashMap<(u8, u8, u8), RGBA8> = HashMap::new();
    let mut pixels = Vec::with_capacity(image.pixels.len());
    for pixel in &image.pixels {
        let key = (pixel.r, pixel.g, pixel.b);
        let closest = match cache.get(&key) {
            Some(c) => *c,
            None => {
                let c = nearest_in_palette(&palette, *pixel).ok_or_else(|| {
                    ConversionError::invalid_image("quantization produced an empty palette")
                })?;
                cache.insert(key, c);
                c
            }
        };
        pixels.push(RGBA8::new(closest.r, closest.g, closest.b, pixel.a));
    }

    Ok(RasterImage {
        width: image.width,
        height: image.height,
        pixels,
    })
}

pub fn nearest_in_palette(palette: &[RGBA8], color: RGBA8) -> Option<RGBA8> {
    palette
        .iter()
        .min_by_key(|c| color_distance_sq(**c, color))
        .copied()
}

/// Recursively split the color box along its widest channel.
fn median_cut(pixels: &[RGBA8], num_colors: usize) -> Vec<RGBA8> {
    let step = (pixels.len() / 50000).max(1);
    let colors: Vec<(u8, u8, u8)> = pixels
        .iter()
        .step_by(step)
        .map(|p| (p.r, p.g, p.b))
        .collect();
    if colors.is_empty() {
        return vec![RGBA8::new(0, 0, 0, 255)];
    }

    let mut boxes: Vec<Vec<(u8, u8, u8)>> = vec![colors];
    while boxes.len() < num_colors {
        let mut best_idx = 0;
        let mut best_range = 0u16;
        for (i, b) in boxes.iter().enumerate() {
            let range = box_max_range(b);
            if range > best_range || (range == best_range && b.len() > boxes[best_idx].len()) {
                best_range = range;
                best_idx = i;
            }
        }
        if best_range == 0 || boxes[best_idx].len() < 2 {
            break;
        }
        let to_split = boxes.remove(best_idx);
        let (a, b) = split_box(to_split);
        if !a.is_empty() {
            boxes.push(a);
        }
        if !b.is_empty() {
            boxes.push(b);
        }
    }

    boxes.iter().map(|b| box_average(b)).collect()
}

fn channel_ranges(colors: &[(u8, u8, u8)]) -> (u8, u8, u8) {
    let (mut rmin, mut rmax) = (255u8, 0u8);
    let (mut gmin, mut gmax) = (255u8, 0u8);
    let (mut bmin, mut bmax) = (255u8, 0u8);
    for &(r, g, b) in colors {
        rmin = rmin.min(r);
        rmax = rmax.max(r);
        gmin = gmin.min(g);
        gmax = gmax.max(g);
        bmin = bmin.min(b);
        bmax = bmax.max(b);
    }
    (
        rmax.saturating_sub(rmin),
        gmax.saturating_sub(gmin),
        bmax.saturating_sub(bmin),
    )
}

fn box_max_range(colors: &[(u8, u8, u8)]) -> u16 {
    let (rr, gr, br) = channel_ranges(colors);
    rr.max(gr).max(br) as u16
}

fn split_box(mut colors: Vec<(u8, u8, u8)>) -> (Vec<(u8, u8, u8)>, Vec<(u8, u8, u8)>) {
    let (rr, gr, br) = channel_ranges(&colors);
    if rr >= gr && rr >= br {
        colors.sort_by_key(|c| c.0);
    } else if gr >= br {
        colors.sort_by_key(|c| c.1);
    } else {
        colors.sort_by_key(|c| c.2);
    }
    let mid = colors.len() / 2;
    let right = colors.split_off(mid);
    (colors, right)
}

fn box_average(colors: &[(u8, u8, u8)]) -> RGBA8 {
    if colors.is_empty() {
        return RGBA8::new(0, 0, 0, 255);
    }
    let (mut sr, mut sg, mut sb) = (0u64, 0u64, 0u64);
    for &(r, g, b) in colors {
        sr += r as u64;
        sg += g as u64;
        sb += b as u64;
    }
    let n = colors.len() as u64;
    RGBA8::new((sr / n) as u8, (sg / n) as u8, (sb / n) as u8, 255)
}

/// Decodes an image file into a raster. Used by the command line front end.
pub fn load_image(path: &std::path::Path) -> anyhow::Result<RasterImage> {
    let img = image::open(path)?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(RasterImage::from_rgba_bytes(width, height, rgba.as_raw())?)
}
