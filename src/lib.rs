//! trace2svg - raster to SVG tracing engine
//!
//! Converts RGBA images into vector primitives with one of four backends:
//!
//! - **Edge**: Canny edges (optionally ETF/FDoG) linked into stroked paths
//! - **Centerline**: Sauvola binarization and Zhang-Suen skeletons for line art
//! - **Superpixel**: SLIC regions as filled and/or stroked polygons
//! - **Dots**: darkness-driven stippling, grid jitter or Poisson-disk
//!
//! ## Example
//!
//! ```rust,no_run
//! use trace2svg::{convert_to_svg_string, load_image, Backend, ConversionParameters};
//!
//! let image = load_image(std::path::Path::new("input.png"))?;
//! let params = ConversionParameters::for_backend(Backend::Centerline).with_detail(0.7);
//! let svg = convert_to_svg_string(&image, &params)?;
//! std::fs::write("output.svg", svg)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bezier_fitter;
pub mod centerline;
pub mod config;
pub mod edge_detector;
pub mod error;
pub mod hand_drawn;
pub mod image_processor;
pub mod multipass;
pub mod path_simplifier;
pub mod preprocessor;
pub mod progress;
pub mod scheduler;
pub mod stipple;
pub mod superpixel;
pub mod svg_generator;
pub mod vectorizer;

use std::time::{Duration, Instant};

use log::{debug, info};

pub use config::{
    Backend, BackendConfig, BackgroundAlgorithm, BackgroundRemoval, CenterlineConfig,
    ConversionParameters, DotShape, DotsConfig, EdgeConfig, GridPattern, HandDrawnPreset,
    HandDrawnStyle, LegacyTraceConfig, SuperpixelConfig,
};
pub use error::{CancelReason, ConversionError, PoolError, Result};
pub use image_processor::{RasterImage, load_image};
pub use progress::{ProgressEvent, Stage};
pub use scheduler::{CancelToken, PoolStatus, init_pool, pool_status};
pub use svg_generator::{generate_svg, write_svg};
pub use vectorizer::{
    ConversionMetadata, ConversionResult, Dot, PathSegment, PathStyle, Point, Primitive, Region,
    VectorPath,
};

use progress::ProgressReporter;
use scheduler::Scheduler;

/// Gray-level spread under which an image is treated as blank.
const UNIFORM_TOLERANCE: u8 = 2;

/// Traces `image` with the configured backend.
pub fn convert(image: &RasterImage, params: &ConversionParameters) -> Result<ConversionResult> {
    run_conversion(image, params, &CancelToken::new(), &ProgressReporter::silent())
}

/// Like [`convert`], aborting with [`ConversionError::Cancelled`] once `cancel` fires.
pub fn convert_with_cancel(
    image: &RasterImage,
    params: &ConversionParameters,
    cancel: &CancelToken,
) -> Result<ConversionResult> {
    run_conversion(image, params, cancel, &ProgressReporter::silent())
}

/// Like [`convert`], reporting progress to `sink`. Percentages never decrease.
pub fn convert_streaming(
    image: &RasterImage,
    params: &ConversionParameters,
    sink: &(dyn Fn(ProgressEvent) + Sync),
) -> Result<ConversionResult> {
    run_conversion(image, params, &CancelToken::new(), &ProgressReporter::new(Some(sink)))
}

/// Converts and serializes with the configured precision.
pub fn convert_to_svg_string(image: &RasterImage, params: &ConversionParameters) -> Result<String> {
    let result = convert(image, params)?;
    Ok(generate_svg(&result, params.svg_precision))
}

fn run_conversion(
    image: &RasterImage,
    params: &ConversionParameters,
    cancel: &CancelToken,
    progress: &ProgressReporter<'_>,
) -> Result<ConversionResult> {
    let started = Instant::now();
    params.validate()?;
    image.validate()?;
    let cancel = match params.max_processing_time_ms {
        Some(ms) => cancel.with_timeout(Duration::from_millis(ms)),
        None => cancel.clone(),
    };
    info!(
        "Converting {}x{} image with {} backend",
        image.width,
        image.height,
        params.backend()
    );
    progress.emit(Stage::Preprocessing, 0.0, "validated input");

    if image.is_uniform(UNIFORM_TOLERANCE) {
        info!("Image is uniform, nothing to trace");
        progress.emit(Stage::Postprocessing, 100.0, "uniform image");
        return Ok(ConversionResult {
            width: image.width,
            height: image.height,
            primitives: Vec::new(),
            metadata: ConversionMetadata {
                elapsed: started.elapsed(),
                primitive_count: 0,
                backend: params.backend(),
                passes: 0,
                threads_used: 1,
            },
        });
    }

    let scheduler = Scheduler::acquire(params.parallel);
    let prepared = preprocessor::preprocess(image, params, &scheduler, &cancel)?;
    progress.emit(Stage::Preprocessing, 10.0, "preprocessing complete");

    let (mut primitives, passes) =
        multipass::run_passes(&prepared, params, &scheduler, &cancel, progress)?;
    cancel.check()?;
    progress.emit(Stage::Postprocessing, 90.0, "styling");

    if prepared.scale != (1.0, 1.0) {
        restore_scale(&mut primitives, prepared.scale);
        debug!(
            "Scaled {} primitives by {:.3}x{:.3}",
            primitives.len(),
            1.0 / prepared.scale.0,
            1.0 / prepared.scale.1
        );
    }

    if let Some(style) = params.hand_drawn.style() {
        primitives = hand_drawn::apply_hand_drawn(primitives, &style, params.seed);
        debug!("Applied hand-drawn style {:?}", params.hand_drawn);
    }

    let result = ConversionResult {
        width: image.width,
        height: image.height,
        metadata: ConversionMetadata {
            elapsed: started.elapsed(),
            primitive_count: primitives.len(),
            backend: params.backend(),
            passes,
            threads_used: scheduler.threads(),
        },
        primitives,
    };
    progress.emit(Stage::Postprocessing, 100.0, "done");
    info!(
        "Traced {} primitives in {:?} ({} pass(es), {} thread(s))",
        result.metadata.primitive_count,
        result.metadata.elapsed,
        result.metadata.passes,
        result.metadata.threads_used
    );
    Ok(result)
}

/// Maps primitives traced on a downscaled plane back to source coordinates.
/// Lengths scale by the geometric mean of the two axis factors.
fn restore_scale(primitives: &mut [Primitive], (sx, sy): (f64, f64)) {
    let (ix, iy) = (1.0 / sx, 1.0 / sy);
    let length_scale = (ix * iy).sqrt();
    for primitive in primitives {
        primitive.transform(|p| Point::new(p.x * ix, p.y * iy), length_scale);
    }
}
