use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use trace2svg::{
    Backend, BackendConfig, BackgroundAlgorithm, ConversionParameters, DotShape, GridPattern,
    HandDrawnPreset,
};

#[derive(Parser)]
#[command(name = "trace2svg")]
#[command(about = "Trace raster images into SVG line art, regions or stipples")]
#[command(version)]
pub struct Cli {
    /// Input image file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output SVG file (defaults to the input path with an .svg extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Tracing backend: edge, centerline, superpixel or dots
    #[arg(short, long, value_parser = parse_backend)]
    pub backend: Option<Backend>,

    /// Detail level (0.0-1.0)
    #[arg(short, long)]
    pub detail: Option<f64>,

    /// Stroke width at 1080p
    #[arg(long)]
    pub stroke_width: Option<f64>,

    /// Run several passes and merge their output
    #[arg(long)]
    pub multipass: bool,

    /// Pass count when --multipass is set
    #[arg(long, default_value = "2")]
    pub passes: u32,

    /// Include a reverse scan pass
    #[arg(long)]
    pub reverse: bool,

    /// Include a diagonal scan pass
    #[arg(long)]
    pub diagonal: bool,

    /// Hand-drawn preset: none, subtle, medium, strong or sketchy
    #[arg(long, value_parser = parse_preset)]
    pub hand_drawn: Option<HandDrawnPreset>,

    /// Fit cubic Bezier curves to traced paths
    #[arg(long)]
    pub bezier: bool,

    /// Bilateral noise filtering before tracing
    #[arg(long)]
    pub denoise: bool,

    /// Fade the background before tracing: otsu, adaptive or auto
    #[arg(long, value_parser = parse_background)]
    pub remove_background: Option<BackgroundAlgorithm>,

    /// Background removal strength (0.0-1.0)
    #[arg(long, default_value = "0.5")]
    pub background_strength: f64,

    /// Centerline: scale strokes by local ink thickness
    #[arg(long)]
    pub width_modulation: bool,

    /// Dots: circle, square, diamond or triangle
    #[arg(long, value_parser = parse_shape)]
    pub dot_shape: Option<DotShape>,

    /// Dots: offset alternate grid rows into a hexagonal layout
    #[arg(long)]
    pub hex_grid: bool,

    /// Decimal places in SVG coordinates
    #[arg(long)]
    pub precision: Option<u8>,

    /// Abort after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Worker thread count (0 runs sequentially)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,

    /// Random seed for stochastic stages
    #[arg(long)]
    pub seed: Option<u64>,

    /// Flat JSON configuration file; command line flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print progress events to stderr
    #[arg(long)]
    pub progress: bool,
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    Backend::parse(s).ok_or_else(|| format!("unknown backend `{s}`"))
}

fn parse_preset(s: &str) -> Result<HandDrawnPreset, String> {
    HandDrawnPreset::parse(s).ok_or_else(|| format!("unknown hand-drawn preset `{s}`"))
}

fn parse_background(s: &str) -> Result<BackgroundAlgorithm, String> {
    BackgroundAlgorithm::parse(s).ok_or_else(|| format!("unknown background algorithm `{s}`"))
}

fn parse_shape(s: &str) -> Result<DotShape, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "circle" => Ok(DotShape::Circle),
        "square" => Ok(DotShape::Square),
        "diamond" => Ok(DotShape::Diamond),
        "triangle" => Ok(DotShape::Triangle),
        _ => Err(format!("unknown dot shape `{s}`")),
    }
}

impl Cli {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let mut path = self.input.clone();
            path.set_extension("svg");
            path
        })
    }

    /// Builds conversion parameters from the config file (if any) and flags.
    pub fn parameters(&self) -> Result<ConversionParameters> {
        let mut params = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                ConversionParameters::from_legacy_json(&json)?
            }
            None => ConversionParameters::default(),
        };

        if let Some(backend) = self.backend {
            if backend != params.backend() {
                params.algorithm = BackendConfig::default_for(backend);
            }
        }
        if let Some(detail) = self.detail {
            params.detail = detail;
        }
        if let Some(width) = self.stroke_width {
            params.stroke_width = width;
        }
        if self.multipass {
            params = params.with_multipass(self.passes);
        }
        params.reverse_pass |= self.reverse;
        params.diagonal_pass |= self.diagonal;
        if let Some(preset) = self.hand_drawn {
            params.hand_drawn = preset;
        }
        params.enable_bezier_fitting |= self.bezier;
        params.noise_filtering |= self.denoise;
        if let Some(algorithm) = self.remove_background {
            params = params.with_background_removal(algorithm, self.background_strength);
        }
        match &mut params.algorithm {
            BackendConfig::Centerline(cfg) => cfg.width_modulation |= self.width_modulation,
            BackendConfig::Dots(cfg) => {
                if let Some(shape) = self.dot_shape {
                    cfg.shape = shape;
                }
                if self.hex_grid {
                    cfg.grid_pattern = GridPattern::Hexagonal;
                }
            }
            BackendConfig::Edge(_) | BackendConfig::Superpixel(_) => {}
        }
        if let Some(precision) = self.precision {
            params.svg_precision = precision;
        }
        if let Some(ms) = self.timeout_ms {
            params.max_processing_time_ms = Some(ms);
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if self.threads == Some(0) {
            params.parallel = false;
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_output_path() {
        let cli = Cli::parse_from(["trace2svg", "-i", "photo.png"]);
        assert_eq!(cli.output_path(), PathBuf::from("photo.svg"));
        let params = cli.parameters().unwrap();
        assert_eq!(params, ConversionParameters::default());
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::parse_from([
            "trace2svg",
            "-i",
            "in.png",
            "--backend",
            "dots",
            "--detail",
            "0.8",
            "--multipass",
            "--passes",
            "3",
            "--diagonal",
            "--hand-drawn",
            "sketchy",
            "-j",
            "0",
        ]);
        let params = cli.parameters().unwrap();
        assert_eq!(params.backend(), Backend::Dots);
        assert_eq!(params.detail, 0.8);
        assert_eq!(params.effective_passes(), 3);
        assert!(params.diagonal_pass);
        assert_eq!(params.hand_drawn, HandDrawnPreset::Sketchy);
        assert!(!params.parallel);
    }

    #[test]
    fn test_style_flags() {
        let cli = Cli::parse_from([
            "trace2svg",
            "-i",
            "in.png",
            "-b",
            "dots",
            "--dot-shape",
            "triangle",
            "--hex-grid",
            "--remove-background",
            "otsu",
            "--background-strength",
            "0.7",
        ]);
        let params = cli.parameters().unwrap();
        match &params.algorithm {
            BackendConfig::Dots(cfg) => {
                assert_eq!(cfg.shape, DotShape::Triangle);
                assert_eq!(cfg.grid_pattern, GridPattern::Hexagonal);
            }
            other => panic!("unexpected config: {other:?}"),
        }
        let removal = params.background_removal.unwrap();
        assert_eq!(removal.algorithm, BackgroundAlgorithm::Otsu);
        assert_eq!(removal.strength, 0.7);

        let cli = Cli::parse_from(["trace2svg", "-i", "in.png", "-b", "centerline", "--width-modulation"]);
        assert!(matches!(
            cli.parameters().unwrap().algorithm,
            BackendConfig::Centerline(cfg) if cfg.width_modulation
        ));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["trace2svg", "-i", "a.png", "--backend", "potrace"]).is_err());
    }
}
