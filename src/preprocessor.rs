//! Image preprocessing ahead of the tracing backends.
//!
//! Flattens alpha, downscales oversized inputs, optionally denoises and
//! fades the background, then derives the grayscale and quantized planes the
//! backends read.

use log::{debug, warn};
use rgb::RGBA8;

use crate::config::{Backend, BackgroundAlgorithm, BackgroundRemoval, ConversionParameters};
use crate::error::Result;
use crate::image_processor::{
    GrayPlane, MAX_COLOR_DISTANCE, RasterImage, color_distance_sq, detect_background, luminance,
    otsu_threshold, quantize_colors,
};
use crate::scheduler::{CancelToken, Scheduler, split_range};

/// Palette bound for region colors.
const MAX_REGION_COLORS: usize = 64;
/// Background match tolerance per unit of removal strength, as a fraction of
/// the RGB cube diagonal.
const BACKGROUND_TOLERANCE_PER_STRENGTH: f64 = 0.3;
/// Mean neighbour difference above which `Auto` picks the adaptive threshold.
const BUSY_IMAGE_COMPLEXITY: f64 = 0.3;

/// Everything a backend reads. Owned by a single conversion.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// Opaque, possibly downscaled and denoised color plane.
    pub rgba: RasterImage,
    pub gray: GrayPlane,
    /// Median-cut palette image, present for region backends.
    pub quantized: Option<RasterImage>,
    /// Per-axis factors applied to source coordinates (`<= 1`).
    pub scale: (f64, f64),
    pub background: RGBA8,
}

impl PreprocessedImage {
    pub fn width(&self) -> u32 {
        self.rgba.width
    }

    pub fn height(&self) -> u32 {
        self.rgba.height
    }
}

/// Bilateral filter options.
#[derive(Debug, Clone)]
pub struct DenoiseOptions {
    pub color_sigma: f32,
    pub iterations: u32,
}

impl Default for DenoiseOptions {
    fn default() -> Self {
        Self {
            color_sigma: 30.0,
            iterations: 1,
        }
    }
}

pub fn preprocess(
    image: &RasterImage,
    params: &ConversionParameters,
    scheduler: &Scheduler,
    cancel: &CancelToken,
) -> Result<PreprocessedImage> {
    image.validate()?;

    let flattened = image.flatten_alpha();
    cancel.check()?;

    let (mut rgba, scale) = flattened.downscale_to_fit(params.max_image_size);
    if scale != (1.0, 1.0) {
        warn!(
            "Downscaling {}x{} to {}x{} (max side {})",
            image.width, image.height, rgba.width, rgba.height, params.max_image_size
        );
    }
    cancel.check()?;

    if params.noise_filtering {
        let options = DenoiseOptions::default();
        for _ in 0..options.iterations {
            rgba = bilateral_filter(&rgba, options.color_sigma, scheduler, cancel)?;
        }
        debug!("Applied bilateral filter");
    }

    if let Some(removal) = &params.background_removal {
        let before = detect_background(&rgba);
        let (faded, changed) = remove_background(&rgba, removal, before);
        debug!("Background removal faded {} pixels", changed);
        rgba = faded;
        cancel.check()?;
    }

    let mut gray = rgba.to_gray();
    if params.noise_filtering {
        gray = gray.median3();
    }
    cancel.check()?;

    let quantized = if params.backend() == Backend::Superpixel {
        Some(quantize_colors(&rgba, MAX_REGION_COLORS)?)
    } else {
        None
    };

    let background = detect_background(&rgba);
    debug!(
        "Preprocessed {}x{} (scale {:.3}x{:.3}), background #{:02x}{:02x}{:02x}",
        rgba.width, rgba.height, scale.0, scale.1, background.r, background.g, background.b
    );

    Ok(PreprocessedImage {
        rgba,
        gray,
        quantized,
        scale,
        background,
    })
}

/// Mean of the right and down neighbour differences over a sparse sample,
/// each difference averaged over RGB and scaled to `[0, 1]`.
pub fn image_complexity(image: &RasterImage) -> f64 {
    let (w, h) = (image.width, image.height);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let diff = |a: RGBA8, b: RGBA8| {
        (a.r.abs_diff(b.r) as f64 + a.g.abs_diff(b.g) as f64 + a.b.abs_diff(b.b) as f64) / 3.0
    };
    let (mut total, mut samples) = (0.0, 0u64);
    for y in (1..h - 1).step_by(4) {
        for x in (1..w - 1).step_by(4) {
            let center = image.pixel(x, y);
            let (right, down) = (image.pixel(x + 1, y), image.pixel(x, y + 1));
            total += (diff(center, right) + diff(center, down)) / 255.0;
            samples += 1;
        }
    }
    total / samples.max(1) as f64
}

/// Gray level separating background from ink for the chosen algorithm.
fn background_threshold(
    image: &RasterImage,
    gray: &GrayPlane,
    algorithm: BackgroundAlgorithm,
) -> (u8, BackgroundAlgorithm) {
    let algorithm = match algorithm {
        BackgroundAlgorithm::Auto if image_complexity(image) > BUSY_IMAGE_COMPLEXITY => {
            BackgroundAlgorithm::Adaptive
        }
        BackgroundAlgorithm::Auto => BackgroundAlgorithm::Otsu,
        other => other,
    };
    let threshold = match algorithm {
        BackgroundAlgorithm::Adaptive => {
            let n = gray.data.len().max(1) as f64;
            let mean = gray.data.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = gray.data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
            (mean - 0.7 * var.sqrt()).clamp(0.0, 255.0) as u8
        }
        _ => otsu_threshold(gray),
    };
    (threshold, algorithm)
}

/// Fades pixels that match `background` and sit on its side of the
/// threshold toward clean white, or black when the background is dark.
/// Returns the new image and the number of pixels changed.
pub fn remove_background(
    image: &RasterImage,
    removal: &BackgroundRemoval,
    background: RGBA8,
) -> (RasterImage, usize) {
    let gray = image.to_gray();
    let (threshold, algorithm) = background_threshold(image, &gray, removal.algorithm);
    let weight = match algorithm {
        BackgroundAlgorithm::Adaptive => 0.8 * removal.strength,
        _ => removal.strength,
    };
    let limit = removal.strength * BACKGROUND_TOLERANCE_PER_STRENGTH * MAX_COLOR_DISTANCE;
    let limit_sq = (limit * limit) as u32;
    let light = luminance(background) >= 128;
    let target = if light { 255.0 } else { 0.0 };
    debug!(
        "Background removal: {:?} threshold {}, weight {:.2}",
        algorithm, threshold, weight
    );

    let mut changed = 0;
    let pixels = image
        .pixels
        .iter()
        .zip(&gray.data)
        .map(|(&p, &g)| {
            let background_side = if light { g > threshold } else { g <= threshold };
            if !background_side || color_distance_sq(p, background) > limit_sq {
                return p;
            }
            let blend = |c: u8| (c as f64 * (1.0 - weight) + target * weight).round() as u8;
            let faded = RGBA8::new(blend(p.r), blend(p.g), blend(p.b), p.a);
            if faded != p {
                changed += 1;
            }
            faded
        })
        .collect();
    (
        RasterImage {
            width: image.width,
            height: image.height,
            pixels,
        },
        changed,
    )
}

/// LUT-based bilateral filter with a fixed 5x5 window, run over row bands.
pub fn bilateral_filter(
    image: &RasterImage,
    color_sigma: f32,
    scheduler: &Scheduler,
    cancel: &CancelToken,
) -> Result<RasterImage> {
    let w = image.width as usize;
    let h = image.height as usize;
    let pixels = &image.pixels;
    let r: usize = 2;

    // Squared RGB distance 0..=195075 is binned into 256 weights, 10-bit fixed point.
    let range_denom = 2.0 * (color_sigma as f64) * (color_sigma as f64);
    let lut_size: usize = 256;
    let bin_scale = 195075.0 / lut_size as f64;
    let range_lut: Vec<u32> = (0..lut_size)
        .map(|i| ((-(i as f64 * bin_scale) / range_denom).exp() * 1024.0) as u32)
        .collect();

    let bands = split_range(h, scheduler.threads() * 4);
    let rows = scheduler.run_partitions(bands, cancel, None, |_, band| {
        let mut output = Vec::with_capacity(band.len() * w);
        for y in band {
            let y_start = y.saturating_sub(r);
            let y_end = (y + r + 1).min(h);
            for x in 0..w {
                let ci = y * w + x;
                let c = pixels[ci];
                let x_start = x.saturating_sub(r);
                let x_end = (x + r + 1).min(w);

                let (mut sum_r, mut sum_g, mut sum_b, mut sum_w) = (0u64, 0u64, 0u64, 0u64);
                for ny in y_start..y_end {
                    for nx in x_start..x_end {
                        let n = pixels[ny * w + nx];
                        let dr = n.r as i32 - c.r as i32;
                        let dg = n.g as i32 - c.g as i32;
                        let db = n.b as i32 - c.b as i32;
                        let dist_sq = (dr * dr + dg * dg + db * db) as usize;
                        let bin = (dist_sq * lut_size) / 195076;
                        let weight = range_lut[bin.min(lut_size - 1)] as u64;
                        sum_r += n.r as u64 * weight;
                        sum_g += n.g as u64 * weight;
                        sum_b += n.b as u64 * weight;
                        sum_w += weight;
                    }
                }

                output.push(if sum_w > 0 {
                    RGBA8::new(
                        (sum_r / sum_w) as u8,
                        (sum_g / sum_w) as u8,
                        (sum_b / sum_w) as u8,
                        c.a,
                    )
                } else {
                    c
                });
            }
        }
        Ok(output)
    })?;

    Ok(RasterImage {
        width: image.width,
        height: image.height,
        pixels: rows.into_iter().flatten().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn checkerboard(size: u32) -> RasterImage {
        let mut pixels = Vec::new();
        for y in 0..size {
            for x in 0..size {
                let v = if (x / 4 + y / 4) % 2 == 0 { 0 } else { 255 };
                pixels.push(RGBA8::new(v, v, v, 255));
            }
        }
        RasterImage::new(size, size, pixels).unwrap()
    }

    #[test]
    fn test_bilateral_filter_preserves_alpha() {
        let image = RasterImage::new(
            3,
            1,
            vec![
                RGBA8::new(128, 128, 128, 255),
                RGBA8::new(128, 128, 128, 128),
                RGBA8::new(128, 128, 128, 0),
            ],
        )
        .unwrap();
        let result =
            bilateral_filter(&image, 30.0, &Scheduler::sequential(), &CancelToken::new()).unwrap();
        assert_eq!(result.pixels[0].a, 255);
        assert_eq!(result.pixels[1].a, 128);
        assert_eq!(result.pixels[2].a, 0);
    }

    #[test]
    fn test_bilateral_filter_keeps_hard_edges() {
        let image = checkerboard(16);
        let result =
            bilateral_filter(&image, 30.0, &Scheduler::acquire(true), &CancelToken::new())
                .unwrap();
        assert_eq!(result.pixels.len(), image.pixels.len());
        // Opposite colors differ by far more than sigma, so they barely mix.
        assert!(result.pixels[0].r < 10);
        assert!(result.pixels[4].r > 245);
    }

    #[test]
    fn test_preprocess_downscales_and_records_scale() {
        let image = checkerboard(64);
        let params = ConversionParameters::default().with_max_image_size(32);
        let pre = preprocess(&image, &params, &Scheduler::sequential(), &CancelToken::new())
            .unwrap();
        assert_eq!(pre.width(), 32);
        assert_eq!(pre.gray.data.len(), 32 * 32);
        assert!((pre.scale.0 - 0.5).abs() < 1e-9);
        assert!((pre.scale.1 - 0.5).abs() < 1e-9);
        assert!(pre.quantized.is_none());
    }

    #[test]
    fn test_preprocess_quantizes_for_superpixel() {
        let image = checkerboard(16);
        let params = ConversionParameters::new(BackendConfig::Superpixel(Default::default()));
        let pre = preprocess(&image, &params, &Scheduler::sequential(), &CancelToken::new())
            .unwrap();
        assert!(pre.quantized.is_some());
    }

    fn paper_with_ink() -> RasterImage {
        let mut pixels = Vec::new();
        for y in 0..32u32 {
            for x in 0..32u32 {
                let pixel = if (14..18).contains(&y) && (4..28).contains(&x) {
                    RGBA8::new(10, 10, 10, 255)
                } else {
                    // Mottled paper.
                    let v = 205 + ((x * 7 + y * 13) % 20) as u8;
                    RGBA8::new(v, v, v - 10, 255)
                };
                pixels.push(pixel);
            }
        }
        RasterImage::new(32, 32, pixels).unwrap()
    }

    #[test]
    fn test_background_removal_whitens_paper_and_keeps_ink() {
        let image = paper_with_ink();
        let background = detect_background(&image);
        for algorithm in [
            BackgroundAlgorithm::Otsu,
            BackgroundAlgorithm::Adaptive,
            BackgroundAlgorithm::Auto,
        ] {
            let removal = BackgroundRemoval {
                algorithm,
                strength: 0.8,
            };
            let (faded, changed) = remove_background(&image, &removal, background);
            assert!(changed > 500, "{algorithm:?} changed {changed}");
            assert_eq!(faded.pixel(10, 15), image.pixel(10, 15), "{algorithm:?} touched ink");
            assert!(faded.pixel(0, 0).r > image.pixel(0, 0).r);
            assert!(faded.pixel(0, 0).b > image.pixel(0, 0).b);
        }
    }

    #[test]
    fn test_background_removal_zero_strength_is_identity() {
        let image = paper_with_ink();
        let removal = BackgroundRemoval {
            algorithm: BackgroundAlgorithm::Otsu,
            strength: 0.0,
        };
        let (faded, changed) = remove_background(&image, &removal, detect_background(&image));
        assert_eq!(changed, 0);
        assert_eq!(faded, image);
    }

    #[test]
    fn test_preprocess_applies_background_removal() {
        let image = paper_with_ink();
        let scheduler = Scheduler::sequential();
        let plain =
            preprocess(&image, &ConversionParameters::default(), &scheduler, &CancelToken::new()).unwrap();
        let params =
            ConversionParameters::default().with_background_removal(BackgroundAlgorithm::Otsu, 1.0);
        let cleaned = preprocess(&image, &params, &scheduler, &CancelToken::new()).unwrap();
        let paper = |p: &PreprocessedImage| p.gray.data[0] as u32;
        assert!(paper(&cleaned) > paper(&plain));
        assert_eq!(cleaned.gray.get(10, 15), plain.gray.get(10, 15));
        assert!(luminance(cleaned.background) >= luminance(plain.background));
    }

    #[test]
    fn test_complexity_separates_flat_and_busy() {
        let flat = RasterImage::filled(20, 20, RGBA8::new(200, 200, 200, 255));
        assert_eq!(image_complexity(&flat), 0.0);
        let mut busy = Vec::new();
        for y in 0..20u32 {
            for x in 0..20u32 {
                let v = if (x + y) % 2 == 0 { 0 } else { 255 };
                busy.push(RGBA8::new(v, v, v, 255));
            }
        }
        let busy = RasterImage::new(20, 20, busy).unwrap();
        assert!(image_complexity(&busy) > BUSY_IMAGE_COMPLEXITY);
    }

    #[test]
    fn test_preprocess_honours_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let params = ConversionParameters::default().with_noise_filtering(true);
        let err = preprocess(&checkerboard(16), &params, &Scheduler::sequential(), &token)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
