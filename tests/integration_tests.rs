// Integration tests for trace2svg
use rgb::RGBA8;
use std::path::PathBuf;
use std::sync::Mutex;
use trace2svg::{
    Backend, CancelReason, ConversionError, ConversionParameters, HandDrawnPreset, PoolStatus,
    Primitive, ProgressEvent, RasterImage, convert, convert_streaming, convert_to_svg_string,
    init_pool, load_image, pool_status, write_svg,
};

const WHITE: RGBA8 = RGBA8::new(255, 255, 255, 255);
const INK: RGBA8 = RGBA8::new(0, 0, 0, 255);

// Create a simple test image programmatically
fn create_test_image(width: u32, height: u32, pattern: &str) -> RasterImage {
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let pixel = match pattern {
                "gradient" => {
                    // White margin so the background is unambiguous.
                    if x < width / 6 {
                        WHITE
                    } else {
                        let v = (x * 255 / width.max(1)) as u8;
                        RGBA8::new(v, v, v, 255)
                    }
                }
                "checkerboard" => {
                    let size = 10;
                    if ((x / size) + (y / size)) % 2 == 0 { WHITE } else { INK }
                }
                "circle" => {
                    let (cx, cy) = (width as i64 / 2, height as i64 / 2);
                    let radius = width.min(height) as i64 / 4;
                    let (dx, dy) = (x as i64 - cx, y as i64 - cy);
                    if dx * dx + dy * dy < radius * radius {
                        RGBA8::new(255, 0, 0, 255)
                    } else {
                        WHITE
                    }
                }
                "diagonal" => {
                    let on_line = (10..=90).contains(&x) && (x as i64 - y as i64).abs() <= 1;
                    if on_line { INK } else { WHITE }
                }
                "noise" => {
                    let h = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
                    let v = (h >> 8) as u8;
                    RGBA8::new(v, v.wrapping_mul(3), v.wrapping_add(90), 255)
                }
                _ => WHITE,
            };
            pixels.push(pixel);
        }
    }
    RasterImage::new(width, height, pixels).unwrap()
}

fn create_test_png(path: &PathBuf, image: &RasterImage) {
    let bytes: Vec<u8> = image.pixels.iter().flat_map(|p| [p.r, p.g, p.b, p.a]).collect();
    let img: image::RgbaImage = image::ImageBuffer::from_raw(image.width, image.height, bytes).unwrap();
    img.save(path).expect("Failed to save test image");
}

#[test]
fn test_blank_image_produces_no_paths() {
    let image = RasterImage::filled(2, 2, WHITE);
    for backend in [Backend::Edge, Backend::Centerline, Backend::Superpixel, Backend::Dots] {
        let result = convert(&image, &ConversionParameters::for_backend(backend)).unwrap();
        assert!(result.is_empty(), "{backend} traced a blank image");
    }
    let svg = convert_to_svg_string(&image, &ConversionParameters::default()).unwrap();
    assert!(svg.contains("<svg"));
    assert!(!svg.contains("<path"));
}

#[test]
fn test_centerline_traces_single_diagonal() {
    let image = create_test_image(100, 100, "diagonal");
    let result = convert(&image, &ConversionParameters::for_backend(Backend::Centerline)).unwrap();
    let paths: Vec<_> = result.paths().collect();
    assert_eq!(paths.len(), 1, "expected one stroke, got {}", paths.len());

    let points = paths[0].flatten(8);
    let sum_sq: f64 = points
        .iter()
        .map(|p| {
            let d = (p.x - p.y) / std::f64::consts::SQRT_2;
            d * d
        })
        .sum();
    let rms = (sum_sq / points.len() as f64).sqrt();
    assert!(rms <= 1.0, "rms deviation {rms}");
    assert!(paths[0].length() > 80.0);
}

fn dash_image(length: u32) -> RasterImage {
    let mut image = RasterImage::filled(100, 100, WHITE);
    for y in 49..52u32 {
        for x in 20..20 + length {
            image.pixels[(y * 100 + x) as usize] = INK;
        }
    }
    image
}

#[test]
fn test_centerline_drops_short_isolated_dash() {
    let params = ConversionParameters::for_backend(Backend::Centerline).with_detail(0.5);
    let short = convert(&dash_image(10), &params).unwrap();
    assert_eq!(short.paths().count(), 0, "short dash survived");

    let long = convert(&dash_image(60), &params).unwrap();
    let paths: Vec<_> = long.paths().collect();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].length() > 40.0);
}

#[test]
fn test_width_modulation_follows_stroke_thickness() {
    let mut image = RasterImage::filled(120, 80, WHITE);
    for (rows, xs) in [(15..18u32, 10..110u32), (45..57, 10..110)] {
        for y in rows {
            for x in xs.clone() {
                image.pixels[(y * 120 + x) as usize] = INK;
            }
        }
    }
    let widths = |modulate: bool| {
        let mut params = ConversionParameters::for_backend(Backend::Centerline).with_stroke_width(2.0);
        if let trace2svg::BackendConfig::Centerline(cfg) = &mut params.algorithm {
            cfg.width_modulation = modulate;
        }
        let result = convert(&image, &params).unwrap();
        let mut widths: Vec<f64> = result.paths().map(|p| p.style.stroke_width).collect();
        widths.sort_by(f64::total_cmp);
        widths
    };

    let plain = widths(false);
    assert!(!plain.is_empty());
    assert!(plain.iter().all(|&w| w == 2.0));

    let modulated = widths(true);
    assert!(modulated.len() >= 2);
    let (thin, thick) = (modulated[0], modulated[modulated.len() - 1]);
    assert!(thick > 2.0 * thin, "thin {thin}, thick {thick}");
}

#[test]
fn test_dot_count_grows_with_density() {
    let image = create_test_image(160, 160, "gradient");
    let count = |density: f64| {
        let mut params = ConversionParameters::for_backend(Backend::Dots);
        if let trace2svg::BackendConfig::Dots(cfg) = &mut params.algorithm {
            cfg.density = density;
        }
        convert(&image, &params).unwrap().dots().count()
    };
    let (low, mid, high) = (count(0.1), count(0.5), count(0.9));
    assert!(low > 0);
    assert!(low <= mid && mid <= high, "{low} {mid} {high}");
    assert!(low < high);
}

#[test]
fn test_short_buffer_is_invalid_image() {
    let err = RasterImage::from_rgba_bytes(10, 10, &[0u8; 12]).unwrap_err();
    assert!(matches!(err, ConversionError::InvalidImage { .. }));

    let broken = RasterImage {
        width: 10,
        height: 10,
        pixels: vec![WHITE; 3],
    };
    let err = convert(&broken, &ConversionParameters::default()).unwrap_err();
    assert!(matches!(err, ConversionError::InvalidImage { .. }));
}

#[test]
fn test_timeout_cancels_large_image() {
    let image = create_test_image(2000, 2000, "noise");
    let params = ConversionParameters::for_backend(Backend::Superpixel).with_timeout_ms(1);
    let err = convert(&image, &params).unwrap_err();
    assert!(matches!(
        err,
        ConversionError::Cancelled {
            reason: CancelReason::Timeout
        }
    ));
}

#[test]
fn test_output_is_deterministic() {
    let image = create_test_image(80, 80, "circle");
    for backend in [Backend::Edge, Backend::Centerline, Backend::Superpixel, Backend::Dots] {
        let params = ConversionParameters::for_backend(backend);
        let first = convert_to_svg_string(&image, &params).unwrap();
        let second = convert_to_svg_string(&image, &params).unwrap();
        assert_eq!(first, second, "{backend} output differs between runs");

        let sequential = convert(&image, &params.clone().with_parallel(false)).unwrap();
        let parallel = convert(&image, &params.with_parallel(true)).unwrap();
        assert_eq!(sequential.primitives, parallel.primitives, "{backend} depends on threading");
    }
}

#[test]
fn test_svg_output_parses() {
    let image = create_test_image(60, 60, "checkerboard");
    for backend in [Backend::Edge, Backend::Superpixel, Backend::Dots] {
        let svg = convert_to_svg_string(&image, &ConversionParameters::for_backend(backend)).unwrap();
        let mut elements = 0;
        for event in svg::read(&svg).unwrap() {
            if let svg::parser::Event::Tag(name, svg::node::element::tag::Type::Empty, _) = event {
                assert!(name == "path" || name == "circle", "unexpected element {name}");
                elements += 1;
            }
        }
        assert!(elements > 0, "{backend} emitted no elements");
    }
}

#[test]
fn test_full_pipeline_from_png() {
    let dir = std::env::temp_dir();
    let input = dir.join("trace2svg_pipeline_input.png");
    let output = dir.join("trace2svg_pipeline_output.svg");
    create_test_png(&input, &create_test_image(50, 50, "circle"));

    let image = load_image(&input).unwrap();
    assert_eq!((image.width, image.height), (50, 50));
    let params = ConversionParameters::for_backend(Backend::Superpixel);
    let result = convert(&image, &params).unwrap();
    assert!(result.regions().count() > 0);
    write_svg(&result, params.svg_precision, &output).unwrap();

    let content = std::fs::read_to_string(&output).unwrap();
    assert!(content.contains(r#"viewBox="0 0 50 50""#));
    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();
}

#[test]
fn test_higher_detail_keeps_more_edges() {
    let image = create_test_image(120, 120, "noise");
    let paths = |detail: f64| {
        let params = ConversionParameters::for_backend(Backend::Edge).with_detail(detail);
        convert(&image, &params).unwrap().paths().count()
    };
    assert!(paths(0.9) >= paths(0.1));
}

#[test]
fn test_detail_extremes_trace_something() {
    let image = create_test_image(100, 100, "diagonal");
    for backend in [Backend::Edge, Backend::Centerline, Backend::Superpixel, Backend::Dots] {
        for detail in [0.0, 1.0] {
            let params = ConversionParameters::for_backend(backend).with_detail(detail);
            let result = convert(&image, &params).unwrap();
            assert!(!result.is_empty(), "{backend} at detail {detail} is empty");
        }
    }
}

#[test]
fn test_multipass_extends_single_pass() {
    let image = create_test_image(80, 80, "checkerboard");
    let single = convert(&image, &ConversionParameters::for_backend(Backend::Edge)).unwrap();
    let params = ConversionParameters::for_backend(Backend::Edge)
        .with_multipass(3)
        .with_reverse_pass(true)
        .with_diagonal_pass(true);
    let multi = convert(&image, &params).unwrap();
    assert_eq!(single.metadata.passes, 1);
    assert!(multi.metadata.passes >= 2);
    assert!(multi.primitives.len() >= single.primitives.len());

    let two = convert(&image, &ConversionParameters::for_backend(Backend::Edge).with_multipass(2)).unwrap();
    assert!(two.primitives.len() >= single.primitives.len());
}

#[test]
fn test_sketchy_preset_restrokes_open_paths() {
    let image = create_test_image(100, 100, "diagonal");
    let plain = convert(&image, &ConversionParameters::for_backend(Backend::Centerline)).unwrap();
    let params = ConversionParameters::for_backend(Backend::Centerline)
        .with_hand_drawn(HandDrawnPreset::Sketchy);
    let sketchy = convert(&image, &params).unwrap();
    assert!(sketchy.primitives.len() > plain.primitives.len());
    assert!(sketchy.primitives.iter().all(|p| matches!(p, Primitive::Path(_))));
}

#[test]
fn test_legacy_json_configuration() {
    let json = r#"{"backend": "dots", "detail": 0.7, "dot_density_threshold": 0.4, "random_seed": 7}"#;
    let params = ConversionParameters::from_legacy_json(json).unwrap();
    assert_eq!(params.backend(), Backend::Dots);
    assert_eq!(params.seed, 7);
    let result = convert(&create_test_image(64, 64, "gradient"), &params).unwrap();
    assert!(result.dots().count() > 0);

    let err = ConversionParameters::from_legacy_json(r#"{"backend": "potrace"}"#).unwrap_err();
    assert!(matches!(err, ConversionError::InvalidParameters { .. }));
}

#[test]
fn test_streaming_progress_is_monotonic() {
    let image = create_test_image(64, 64, "checkerboard");
    let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
    let sink = |event: ProgressEvent| events.lock().unwrap().push(event);
    let params = ConversionParameters::for_backend(Backend::Superpixel).with_multipass(2);
    convert_streaming(&image, &params, &sink).unwrap();

    let events = events.into_inner().unwrap();
    assert!(events.len() >= 3);
    for pair in events.windows(2) {
        assert!(pair[0].percent <= pair[1].percent);
    }
    assert_eq!(events.last().map(|e| e.percent), Some(100));
}

#[test]
fn test_pool_initialization() {
    assert_ne!(pool_status(), PoolStatus::NotSupported);
    match init_pool(2) {
        Ok(()) | Err(trace2svg::PoolError::AlreadyInitialized) => {}
        Err(e) => panic!("pool failed: {e}"),
    }
    assert_eq!(pool_status(), PoolStatus::Initialized);
    assert!(matches!(init_pool(2), Err(trace2svg::PoolError::AlreadyInitialized)));

    let image = create_test_image(40, 40, "circle");
    let result = convert(&image, &ConversionParameters::for_backend(Backend::Dots)).unwrap();
    assert!(result.metadata.threads_used >= 1);
}
