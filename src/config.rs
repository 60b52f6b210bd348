//! Conversion parameters, backend sub-configs and validation.
//!
//! `ConversionParameters` is the single canonical configuration. The older
//! flat configuration shape is still accepted through [`LegacyTraceConfig`]
//! and mapped by a pure function.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, Result};

/// Upper bound on the stroke width accepted by validation.
const MAX_STROKE_WIDTH: f64 = 50.0;
/// Upper bound on `pass_count`.
const MAX_PASSES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Edge,
    Centerline,
    Superpixel,
    Dots,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Edge => "edge",
            Backend::Centerline => "centerline",
            Backend::Superpixel => "superpixel",
            Backend::Dots => "dots",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "edge" => Some(Backend::Edge),
            "centerline" => Some(Backend::Centerline),
            "superpixel" => Some(Backend::Superpixel),
            "dots" | "stipple" => Some(Backend::Dots),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canny edge tracing options. ETF/FDoG and flow tracing are opt-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub enable_etf_fdog: bool,
    pub enable_flow_tracing: bool,
    pub etf_radius: u32,
    pub etf_iterations: u32,
    /// Center Gaussian of the difference-of-Gaussians across the flow.
    pub fdog_sigma_s: f64,
    /// Surround Gaussian, normally wider than the center.
    pub fdog_sigma_c: f64,
    pub fdog_tau: f64,
    /// Largest gap in pixels bridged between chain endpoints.
    pub max_gap: u32,
    /// Stroke with the mean source color along each chain instead of black.
    pub preserve_colors: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            enable_etf_fdog: false,
            enable_flow_tracing: false,
            etf_radius: 4,
            etf_iterations: 4,
            fdog_sigma_s: 0.8,
            fdog_sigma_c: 1.6,
            fdog_tau: 0.7,
            max_gap: 8,
            preserve_colors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CenterlineConfig {
    /// Sauvola window, forced odd.
    pub window_size: u32,
    pub k: f64,
    /// `None` derives the threshold from detail.
    pub min_branch_length: Option<f64>,
    pub preserve_colors: bool,
    /// Scale each stroke by the local ink thickness from a distance transform.
    pub width_modulation: bool,
}

impl Default for CenterlineConfig {
    fn default() -> Self {
        Self {
            window_size: 31,
            k: 0.4,
            min_branch_length: None,
            preserve_colors: false,
            width_modulation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperpixelConfig {
    pub num_superpixels: u32,
    pub compactness: f64,
    pub slic_iterations: u32,
    pub fill_regions: bool,
    pub stroke_regions: bool,
    pub preserve_colors: bool,
    pub boundary_epsilon: f64,
}

impl Default for SuperpixelConfig {
    fn default() -> Self {
        Self {
            num_superpixels: 150,
            compactness: 10.0,
            slic_iterations: 10,
            fill_regions: true,
            stroke_regions: true,
            preserve_colors: true,
            boundary_epsilon: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DotsConfig {
    pub density: f64,
    pub min_radius: f64,
    pub max_radius: f64,
    /// Bridson sampling instead of the jittered grid.
    pub poisson_disk: bool,
    /// Size dots by gradient magnitude rather than darkness.
    pub gradient_sizing: bool,
    pub preserve_colors: bool,
    /// Fraction of the maximum RGB distance treated as background.
    pub background_tolerance: f64,
    pub shape: DotShape,
    /// Cell layout of the jittered grid; ignored by Poisson-disk sampling.
    pub grid_pattern: GridPattern,
}

impl Default for DotsConfig {
    fn default() -> Self {
        Self {
            density: 0.1,
            min_radius: 0.5,
            max_radius: 3.0,
            poisson_disk: false,
            gradient_sizing: false,
            preserve_colors: true,
            background_tolerance: 0.1,
            shape: DotShape::Circle,
            grid_pattern: GridPattern::Grid,
        }
    }
}

/// Mark drawn for each dot. `radius` is the circumradius for polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DotShape {
    #[default]
    Circle,
    Square,
    Diamond,
    Triangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridPattern {
    #[default]
    Grid,
    /// Every other row of cells shifted by half a cell.
    Hexagonal,
}

impl DotsConfig {
    pub fn with_density(mut self, density: f64) -> Self {
        self.density = density;
        self
    }

    pub fn with_radius_range(mut self, min_radius: f64, max_radius: f64) -> Self {
        self.min_radius = min_radius;
        self.max_radius = max_radius;
        self
    }

    pub fn with_poisson_disk(mut self, enabled: bool) -> Self {
        self.poisson_disk = enabled;
        self
    }

    pub fn with_shape(mut self, shape: DotShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_grid_pattern(mut self, pattern: GridPattern) -> Self {
        self.grid_pattern = pattern;
        self
    }
}

/// The active backend together with its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Edge(EdgeConfig),
    Centerline(CenterlineConfig),
    Superpixel(SuperpixelConfig),
    Dots(DotsConfig),
}

impl BackendConfig {
    pub fn backend(&self) -> Backend {
        match self {
            BackendConfig::Edge(_) => Backend::Edge,
            BackendConfig::Centerline(_) => Backend::Centerline,
            BackendConfig::Superpixel(_) => Backend::Superpixel,
            BackendConfig::Dots(_) => Backend::Dots,
        }
    }

    pub fn default_for(backend: Backend) -> Self {
        match backend {
            Backend::Edge => BackendConfig::Edge(EdgeConfig::default()),
            Backend::Centerline => BackendConfig::Centerline(CenterlineConfig::default()),
            Backend::Superpixel => BackendConfig::Superpixel(SuperpixelConfig::default()),
            Backend::Dots => BackendConfig::Dots(DotsConfig::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Edge(cfg) => {
                if cfg.etf_radius == 0 || cfg.etf_radius > 16 {
                    return Err(ConversionError::invalid_parameter(
                        "edge.etf_radius",
                        "must be within [1, 16]",
                    ));
                }
                if cfg.etf_iterations > 16 {
                    return Err(ConversionError::invalid_parameter(
                        "edge.etf_iterations",
                        "must be at most 16",
                    ));
                }
                if !(cfg.fdog_sigma_s > 0.0) || !(cfg.fdog_sigma_c > 0.0) {
                    return Err(ConversionError::invalid_parameter(
                        "edge.fdog_sigma",
                        "sigmas must be positive",
                    ));
                }
                if !(0.0..=1.0).contains(&cfg.fdog_tau) {
                    return Err(ConversionError::invalid_parameter(
                        "edge.fdog_tau",
                        "must be within [0, 1]",
                    ));
                }
            }
            BackendConfig::Centerline(cfg) => {
                if cfg.window_size < 3 {
                    return Err(ConversionError::invalid_parameter(
                        "centerline.window_size",
                        "must be at least 3",
                    ));
                }
                if !(cfg.k > 0.0 && cfg.k <= 1.0) {
                    return Err(ConversionError::invalid_parameter(
                        "centerline.k",
                        "must be within (0, 1]",
                    ));
                }
                if let Some(len) = cfg.min_branch_length {
                    if !(len >= 0.0) {
                        return Err(ConversionError::invalid_parameter(
                            "centerline.min_branch_length",
                            "must not be negative",
                        ));
                    }
                }
            }
            BackendConfig::Superpixel(cfg) => {
                if cfg.num_superpixels == 0 {
                    return Err(ConversionError::invalid_parameter(
                        "superpixel.num_superpixels",
                        "must be greater than 0",
                    ));
                }
                if !(cfg.compactness > 0.0) {
                    return Err(ConversionError::invalid_parameter(
                        "superpixel.compactness",
                        "must be positive",
                    ));
                }
                if cfg.slic_iterations == 0 {
                    return Err(ConversionError::invalid_parameter(
                        "superpixel.slic_iterations",
                        "must be greater than 0",
                    ));
                }
                if !cfg.fill_regions && !cfg.stroke_regions {
                    return Err(ConversionError::invalid_parameter(
                        "superpixel.fill_regions",
                        "regions need a fill or a stroke",
                    ));
                }
                if !(cfg.boundary_epsilon >= 0.0) {
                    return Err(ConversionError::invalid_parameter(
                        "superpixel.boundary_epsilon",
                        "must not be negative",
                    ));
                }
            }
            BackendConfig::Dots(cfg) => {
                if !(0.0..=1.0).contains(&cfg.density) {
                    return Err(ConversionError::invalid_parameter(
                        "dots.density",
                        "must be within [0, 1]",
                    ));
                }
                if !(cfg.min_radius > 0.0) {
                    return Err(ConversionError::invalid_parameter(
                        "dots.min_radius",
                        "must be positive",
                    ));
                }
                if !(cfg.max_radius >= cfg.min_radius) || cfg.max_radius > 50.0 {
                    return Err(ConversionError::invalid_parameter(
                        "dots.max_radius",
                        "must be within [min_radius, 50]",
                    ));
                }
                if !(0.0..=1.0).contains(&cfg.background_tolerance) {
                    return Err(ConversionError::invalid_parameter(
                        "dots.background_tolerance",
                        "must be within [0, 1]",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Edge(EdgeConfig::default())
    }
}

/// Named hand-drawn styles.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandDrawnPreset {
    #[default]
    None,
    Subtle,
    Medium,
    Strong,
    Sketchy,
    Custom { tremor: f64, weight: f64, taper: f64 },
}

/// Resolved hand-drawn parameters, each within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandDrawnStyle {
    pub tremor: f64,
    pub weight: f64,
    pub taper: f64,
    /// Emit an extra offset stroke after each path.
    pub multi_stroke: bool,
}

impl HandDrawnPreset {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(HandDrawnPreset::None),
            "subtle" => Some(HandDrawnPreset::Subtle),
            "medium" => Some(HandDrawnPreset::Medium),
            "strong" => Some(HandDrawnPreset::Strong),
            "sketchy" => Some(HandDrawnPreset::Sketchy),
            _ => None,
        }
    }

    /// `None` when no styling should be applied.
    pub fn style(&self) -> Option<HandDrawnStyle> {
        let (tremor, weight, taper, multi_stroke) = match *self {
            HandDrawnPreset::None => return None,
            HandDrawnPreset::Subtle => (0.05, 0.15, 0.1, false),
            HandDrawnPreset::Medium => (0.15, 0.3, 0.3, false),
            HandDrawnPreset::Strong => (0.25, 0.6, 0.5, false),
            HandDrawnPreset::Sketchy => (0.4, 0.8, 0.7, true),
            HandDrawnPreset::Custom {
                tremor,
                weight,
                taper,
            } => (tremor, weight, taper, false),
        };
        if tremor == 0.0 && weight == 0.0 && taper == 0.0 && !multi_stroke {
            return None;
        }
        Some(HandDrawnStyle {
            tremor,
            weight,
            taper,
            multi_stroke,
        })
    }
}

/// How the background threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundAlgorithm {
    /// Global Otsu threshold on the gray histogram.
    Otsu,
    /// Mean minus 0.7 standard deviations.
    Adaptive,
    /// Adaptive for busy images, Otsu otherwise.
    #[default]
    Auto,
}

impl BackgroundAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "otsu" => Some(BackgroundAlgorithm::Otsu),
            "adaptive" => Some(BackgroundAlgorithm::Adaptive),
            "" | "auto" => Some(BackgroundAlgorithm::Auto),
            _ => None,
        }
    }
}

/// Fades pixels close to the detected background before tracing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundRemoval {
    pub algorithm: BackgroundAlgorithm,
    /// Blend weight toward the clean background, in `[0, 1]`. Also widens
    /// the color tolerance of the background match.
    pub strength: f64,
}

impl Default for BackgroundRemoval {
    fn default() -> Self {
        Self {
            algorithm: BackgroundAlgorithm::Auto,
            strength: 0.5,
        }
    }
}

/// Options for a single conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionParameters {
    pub algorithm: BackendConfig,
    /// 0 keeps only dominant structure, 1 keeps fine detail.
    pub detail: f64,
    pub stroke_width: f64,
    pub noise_filtering: bool,
    /// `None` leaves the background as decoded.
    pub background_removal: Option<BackgroundRemoval>,
    pub multipass: bool,
    pub pass_count: u32,
    pub reverse_pass: bool,
    pub diagonal_pass: bool,
    /// Decimal digits in emitted coordinates.
    pub svg_precision: u8,
    pub max_processing_time_ms: Option<u64>,
    pub hand_drawn: HandDrawnPreset,
    pub enable_bezier_fitting: bool,
    /// Longest side processed before area-averaged downscaling.
    pub max_image_size: u32,
    pub seed: u64,
    /// `false` keeps every partition on the calling thread.
    pub parallel: bool,
}

impl Default for ConversionParameters {
    fn default() -> Self {
        Self {
            algorithm: BackendConfig::default(),
            detail: 0.5,
            stroke_width: 1.2,
            noise_filtering: false,
            background_removal: None,
            multipass: false,
            pass_count: 1,
            reverse_pass: false,
            diagonal_pass: false,
            svg_precision: 2,
            max_processing_time_ms: None,
            hand_drawn: HandDrawnPreset::None,
            enable_bezier_fitting: false,
            max_image_size: 4096,
            seed: 42,
            parallel: true,
        }
    }
}

impl ConversionParameters {
    pub fn new(algorithm: BackendConfig) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn for_backend(backend: Backend) -> Self {
        Self::new(BackendConfig::default_for(backend))
    }

    pub fn backend(&self) -> Backend {
        self.algorithm.backend()
    }

    pub fn with_detail(mut self, detail: f64) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_stroke_width(mut self, stroke_width: f64) -> Self {
        self.stroke_width = stroke_width;
        self
    }

    pub fn with_noise_filtering(mut self, enabled: bool) -> Self {
        self.noise_filtering = enabled;
        self
    }

    pub fn with_background_removal(mut self, algorithm: BackgroundAlgorithm, strength: f64) -> Self {
        self.background_removal = Some(BackgroundRemoval { algorithm, strength });
        self
    }

    /// Enables multi-pass processing with `pass_count` passes.
    pub fn with_multipass(mut self, pass_count: u32) -> Self {
        self.multipass = true;
        self.pass_count = pass_count;
        self
    }

    pub fn with_reverse_pass(mut self, enabled: bool) -> Self {
        self.reverse_pass = enabled;
        self
    }

    pub fn with_diagonal_pass(mut self, enabled: bool) -> Self {
        self.diagonal_pass = enabled;
        self
    }

    pub fn with_svg_precision(mut self, precision: u8) -> Self {
        self.svg_precision = precision;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.max_processing_time_ms = Some(ms);
        self
    }

    pub fn with_hand_drawn(mut self, preset: HandDrawnPreset) -> Self {
        self.hand_drawn = preset;
        self
    }

    pub fn with_bezier_fitting(mut self, enabled: bool) -> Self {
        self.enable_bezier_fitting = enabled;
        self
    }

    pub fn with_max_image_size(mut self, max_image_size: u32) -> Self {
        self.max_image_size = max_image_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Number of passes actually run.
    pub fn effective_passes(&self) -> u32 {
        if self.multipass {
            self.pass_count.max(1)
        } else {
            1
        }
    }

    /// Checks every numeric range before any processing starts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detail) {
            return Err(ConversionError::invalid_parameter(
                "detail",
                format!("{} is outside [0, 1]", self.detail),
            ));
        }
        if !(self.stroke_width > 0.0 && self.stroke_width <= MAX_STROKE_WIDTH) {
            return Err(ConversionError::invalid_parameter(
                "stroke_width",
                format!("{} is outside (0, {}]", self.stroke_width, MAX_STROKE_WIDTH),
            ));
        }
        if self.pass_count == 0 || self.pass_count > MAX_PASSES {
            return Err(ConversionError::invalid_parameter(
                "pass_count",
                format!("{} is outside [1, {}]", self.pass_count, MAX_PASSES),
            ));
        }
        if self.svg_precision > 6 {
            return Err(ConversionError::invalid_parameter(
                "svg_precision",
                format!("{} is greater than 6", self.svg_precision),
            ));
        }
        if self.max_processing_time_ms == Some(0) {
            return Err(ConversionError::invalid_parameter(
                "max_processing_time_ms",
                "must be greater than 0",
            ));
        }
        if self.max_image_size < 16 {
            return Err(ConversionError::invalid_parameter(
                "max_image_size",
                "must be at least 16",
            ));
        }
        if let Some(removal) = &self.background_removal {
            if !(0.0..=1.0).contains(&removal.strength) {
                return Err(ConversionError::invalid_parameter(
                    "background_removal.strength",
                    format!("{} is outside [0, 1]", removal.strength),
                ));
            }
        }
        if let HandDrawnPreset::Custom {
            tremor,
            weight,
            taper,
        } = self.hand_drawn
        {
            for (field, value) in [
                ("hand_drawn.tremor", tremor),
                ("hand_drawn.weight", weight),
                ("hand_drawn.taper", taper),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConversionError::invalid_parameter(
                        field,
                        format!("{value} is outside [0, 1]"),
                    ));
                }
            }
        }
        self.algorithm.validate()
    }

    pub fn from_legacy(legacy: &LegacyTraceConfig) -> Result<Self> {
        let backend = Backend::parse(&legacy.backend).ok_or_else(|| {
            ConversionError::invalid_parameter(
                "backend",
                format!("unknown backend `{}`", legacy.backend),
            )
        })?;
        let hand_drawn = HandDrawnPreset::parse(&legacy.hand_drawn_preset).ok_or_else(|| {
            ConversionError::invalid_parameter(
                "hand_drawn_preset",
                format!("unknown preset `{}`", legacy.hand_drawn_preset),
            )
        })?;
        let background_removal = if legacy.enable_background_removal {
            let algorithm = BackgroundAlgorithm::parse(&legacy.background_removal_algorithm)
                .ok_or_else(|| {
                    ConversionError::invalid_parameter(
                        "background_removal_algorithm",
                        format!("unknown algorithm `{}`", legacy.background_removal_algorithm),
                    )
                })?;
            Some(BackgroundRemoval {
                algorithm,
                strength: legacy.background_removal_strength,
            })
        } else {
            None
        };

        let algorithm = match backend {
            Backend::Edge => BackendConfig::Edge(EdgeConfig {
                enable_etf_fdog: legacy.enable_etf_fdog,
                enable_flow_tracing: legacy.enable_flow_tracing,
                etf_radius: legacy.etf_radius,
                etf_iterations: legacy.etf_iterations,
                fdog_sigma_s: legacy.fdog_sigma_s,
                fdog_sigma_c: legacy.fdog_sigma_c,
                fdog_tau: legacy.fdog_tau,
                max_gap: legacy.max_gap_size,
                preserve_colors: legacy.line_preserve_colors,
            }),
            Backend::Centerline => BackendConfig::Centerline(CenterlineConfig {
                window_size: legacy.adaptive_threshold_window_size,
                k: legacy.adaptive_threshold_k,
                min_branch_length: legacy.min_branch_length,
                preserve_colors: legacy.line_preserve_colors,
                width_modulation: legacy.enable_width_modulation,
            }),
            Backend::Superpixel => BackendConfig::Superpixel(SuperpixelConfig {
                num_superpixels: legacy.num_superpixels,
                compactness: legacy.superpixel_compactness,
                slic_iterations: legacy.superpixel_slic_iterations,
                fill_regions: legacy.superpixel_fill_regions,
                stroke_regions: legacy.superpixel_stroke_regions,
                preserve_colors: legacy.superpixel_preserve_colors,
                boundary_epsilon: legacy.superpixel_boundary_epsilon,
            }),
            Backend::Dots => BackendConfig::Dots(DotsConfig {
                density: legacy.dot_density_threshold,
                min_radius: legacy.dot_min_radius,
                max_radius: legacy.dot_max_radius,
                poisson_disk: legacy.dot_poisson_disk_sampling,
                gradient_sizing: legacy.dot_gradient_based_sizing,
                preserve_colors: legacy.dot_preserve_colors,
                background_tolerance: legacy.dot_background_tolerance,
                shape: legacy.dot_shape,
                grid_pattern: legacy.dot_grid_pattern,
            }),
        };

        Ok(Self {
            algorithm,
            detail: legacy.detail,
            stroke_width: legacy.stroke_px_at_1080p,
            noise_filtering: legacy.noise_filtering,
            background_removal,
            multipass: legacy.enable_multipass,
            pass_count: legacy.pass_count,
            reverse_pass: legacy.enable_reverse_pass,
            diagonal_pass: legacy.enable_diagonal_pass,
            svg_precision: legacy.svg_precision,
            max_processing_time_ms: (legacy.max_processing_time_ms > 0)
                .then_some(legacy.max_processing_time_ms),
            hand_drawn,
            enable_bezier_fitting: legacy.enable_bezier_fitting,
            max_image_size: legacy.max_image_size,
            seed: legacy.random_seed,
            parallel: true,
        })
    }

    pub fn from_legacy_json(json: &str) -> Result<Self> {
        let legacy: LegacyTraceConfig = serde_json::from_str(json)
            .map_err(|e| ConversionError::invalid_parameter("config", e.to_string()))?;
        Self::from_legacy(&legacy)
    }
}

/// The older flat configuration shape, one field per option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyTraceConfig {
    pub backend: String,
    pub detail: f64,
    pub stroke_px_at_1080p: f64,
    pub enable_multipass: bool,
    pub pass_count: u32,
    pub noise_filtering: bool,
    pub enable_reverse_pass: bool,
    pub enable_diagonal_pass: bool,
    pub max_processing_time_ms: u64,
    pub enable_etf_fdog: bool,
    pub etf_radius: u32,
    pub etf_iterations: u32,
    pub fdog_sigma_s: f64,
    pub fdog_sigma_c: f64,
    pub fdog_tau: f64,
    pub enable_flow_tracing: bool,
    pub max_gap_size: u32,
    pub enable_bezier_fitting: bool,
    pub line_preserve_colors: bool,
    pub dot_density_threshold: f64,
    pub dot_min_radius: f64,
    pub dot_max_radius: f64,
    pub dot_preserve_colors: bool,
    pub dot_gradient_based_sizing: bool,
    pub dot_poisson_disk_sampling: bool,
    pub dot_background_tolerance: f64,
    pub dot_shape: DotShape,
    pub dot_grid_pattern: GridPattern,
    pub adaptive_threshold_window_size: u32,
    pub adaptive_threshold_k: f64,
    pub min_branch_length: Option<f64>,
    pub enable_width_modulation: bool,
    pub enable_background_removal: bool,
    pub background_removal_strength: f64,
    pub background_removal_algorithm: String,
    pub num_superpixels: u32,
    pub superpixel_compactness: f64,
    pub superpixel_slic_iterations: u32,
    pub superpixel_fill_regions: bool,
    pub superpixel_stroke_regions: bool,
    pub superpixel_preserve_colors: bool,
    pub superpixel_boundary_epsilon: f64,
    pub hand_drawn_preset: String,
    pub svg_precision: u8,
    pub max_image_size: u32,
    pub random_seed: u64,
}

impl Default for LegacyTraceConfig {
    fn default() -> Self {
        let edge = EdgeConfig::default();
        let centerline = CenterlineConfig::default();
        let superpixel = SuperpixelConfig::default();
        let dots = DotsConfig::default();
        let params = ConversionParameters::default();
        Self {
            backend: Backend::Edge.name().to_string(),
            detail: params.detail,
            stroke_px_at_1080p: params.stroke_width,
            enable_multipass: false,
            pass_count: 1,
            noise_filtering: false,
            enable_reverse_pass: false,
            enable_diagonal_pass: false,
            max_processing_time_ms: 0,
            enable_etf_fdog: edge.enable_etf_fdog,
            etf_radius: edge.etf_radius,
            etf_iterations: edge.etf_iterations,
            fdog_sigma_s: edge.fdog_sigma_s,
            fdog_sigma_c: edge.fdog_sigma_c,
            fdog_tau: edge.fdog_tau,
            enable_flow_tracing: edge.enable_flow_tracing,
            max_gap_size: edge.max_gap,
            enable_bezier_fitting: false,
            line_preserve_colors: false,
            dot_density_threshold: dots.density,
            dot_min_radius: dots.min_radius,
            dot_max_radius: dots.max_radius,
            dot_preserve_colors: dots.preserve_colors,
            dot_gradient_based_sizing: dots.gradient_sizing,
            dot_poisson_disk_sampling: dots.poisson_disk,
            dot_background_tolerance: dots.background_tolerance,
            dot_shape: dots.shape,
            dot_grid_pattern: dots.grid_pattern,
            adaptive_threshold_window_size: centerline.window_size,
            adaptive_threshold_k: centerline.k,
            min_branch_length: None,
            enable_width_modulation: centerline.width_modulation,
            enable_background_removal: false,
            background_removal_strength: BackgroundRemoval::default().strength,
            background_removal_algorithm: "auto".to_string(),
            num_superpixels: superpixel.num_superpixels,
            superpixel_compactness: superpixel.compactness,
            superpixel_slic_iterations: superpixel.slic_iterations,
            superpixel_fill_regions: superpixel.fill_regions,
            superpixel_stroke_regions: superpixel.stroke_regions,
            superpixel_preserve_colors: superpixel.preserve_colors,
            superpixel_boundary_epsilon: superpixel.boundary_epsilon,
            hand_drawn_preset: "none".to_string(),
            svg_precision: params.svg_precision,
            max_image_size: params.max_image_size,
            random_seed: params.seed,
        }
    }
}

/// Thresholds derived from the detail level, shared by the line backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetailMapping {
    pub detail: f64,
}

impl DetailMapping {
    pub fn new(detail: f64) -> Self {
        Self {
            detail: detail.clamp(0.0, 1.0),
        }
    }

    /// Douglas-Peucker tolerance for edge chains, relative to the image diagonal.
    pub fn edge_epsilon(&self, diagonal: f64) -> f64 {
        let eps = (0.003 + 0.012 * (1.0 - self.detail)) * diagonal;
        eps.clamp(0.3, (0.015 * diagonal).max(0.3))
    }

    /// Minimum chain length in pixels, shrunk for small images.
    pub fn min_stroke_length(&self, diagonal: f64) -> f64 {
        let base = 10.0 + 40.0 * (1.0 - self.detail);
        base.min(diagonal * 0.05).max(2.0)
    }

    /// Percentile of the non-zero gradient magnitudes used as the high threshold.
    pub fn canny_high_percentile(&self) -> f64 {
        0.55 + 0.35 * (1.0 - self.detail)
    }

    /// Gaussian blur sigma ahead of the gradient.
    pub fn blur_sigma(&self) -> f64 {
        0.8 + 1.2 * (1.0 - self.detail)
    }

    pub fn centerline_epsilon(&self) -> f64 {
        0.5 + 2.5 * (1.0 - self.detail)
    }

    pub fn min_branch_length(&self) -> f64 {
        12.0 + 36.0 * self.detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        for backend in [
            Backend::Edge,
            Backend::Centerline,
            Backend::Superpixel,
            Backend::Dots,
        ] {
            let params = ConversionParameters::for_backend(backend);
            assert!(params.validate().is_ok(), "{backend} defaults rejected");
            assert_eq!(params.backend(), backend);
        }
    }

    #[test]
    fn test_detail_out_of_range() {
        let params = ConversionParameters::default().with_detail(1.5);
        match params.validate() {
            Err(ConversionError::InvalidParameters { field, .. }) => assert_eq!(field, "detail"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_nan_stroke_width_rejected() {
        let params = ConversionParameters::default().with_stroke_width(f64::NAN);
        assert!(matches!(
            params.validate(),
            Err(ConversionError::InvalidParameters {
                field: "stroke_width",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let params = ConversionParameters::default().with_timeout_ms(0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_dots_radius_order() {
        let params = ConversionParameters::new(BackendConfig::Dots(
            DotsConfig::default().with_radius_range(3.0, 1.0),
        ));
        assert!(matches!(
            params.validate(),
            Err(ConversionError::InvalidParameters {
                field: "dots.max_radius",
                ..
            })
        ));
    }

    #[test]
    fn test_superpixel_needs_fill_or_stroke() {
        let params = ConversionParameters::new(BackendConfig::Superpixel(SuperpixelConfig {
            fill_regions: false,
            stroke_regions: false,
            ..SuperpixelConfig::default()
        }));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_custom_hand_drawn_range() {
        let params = ConversionParameters::default().with_hand_drawn(HandDrawnPreset::Custom {
            tremor: 0.2,
            weight: 1.4,
            taper: 0.0,
        });
        assert!(matches!(
            params.validate(),
            Err(ConversionError::InvalidParameters {
                field: "hand_drawn.weight",
                ..
            })
        ));
    }

    #[test]
    fn test_preset_styles() {
        assert!(HandDrawnPreset::None.style().is_none());
        let sketchy = HandDrawnPreset::Sketchy.style().unwrap();
        assert!(sketchy.multi_stroke);
        assert_eq!(sketchy.taper, 0.7);
        let medium = HandDrawnPreset::Medium.style().unwrap();
        assert_eq!((medium.tremor, medium.weight), (0.15, 0.3));
        let zero = HandDrawnPreset::Custom {
            tremor: 0.0,
            weight: 0.0,
            taper: 0.0,
        };
        assert!(zero.style().is_none());
    }

    #[test]
    fn test_effective_passes() {
        let single = ConversionParameters::default();
        assert_eq!(single.effective_passes(), 1);
        let multi = ConversionParameters::default().with_multipass(3);
        assert_eq!(multi.effective_passes(), 3);
    }

    #[test]
    fn test_legacy_mapping() {
        let json = r#"{
            "backend": "dots",
            "detail": 0.7,
            "dot_density_threshold": 0.4,
            "dot_poisson_disk_sampling": true,
            "enable_multipass": true,
            "pass_count": 2,
            "hand_drawn_preset": "subtle",
            "max_processing_time_ms": 5000
        }"#;
        let params = ConversionParameters::from_legacy_json(json).unwrap();
        assert_eq!(params.backend(), Backend::Dots);
        assert_eq!(params.detail, 0.7);
        assert_eq!(params.effective_passes(), 2);
        assert_eq!(params.hand_drawn, HandDrawnPreset::Subtle);
        assert_eq!(params.max_processing_time_ms, Some(5000));
        match params.algorithm {
            BackendConfig::Dots(dots) => {
                assert_eq!(dots.density, 0.4);
                assert!(dots.poisson_disk);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_legacy_background_removal_and_styles() {
        let json = r#"{
            "backend": "centerline",
            "enable_background_removal": true,
            "background_removal_strength": 0.8,
            "background_removal_algorithm": "otsu",
            "enable_width_modulation": true
        }"#;
        let params = ConversionParameters::from_legacy_json(json).unwrap();
        assert_eq!(
            params.background_removal,
            Some(BackgroundRemoval {
                algorithm: BackgroundAlgorithm::Otsu,
                strength: 0.8,
            })
        );
        assert!(matches!(&params.algorithm, BackendConfig::Centerline(c) if c.width_modulation));

        let dots = r#"{"backend": "dots", "dot_shape": "diamond", "dot_grid_pattern": "hexagonal"}"#;
        match ConversionParameters::from_legacy_json(dots).unwrap().algorithm {
            BackendConfig::Dots(cfg) => {
                assert_eq!(cfg.shape, DotShape::Diamond);
                assert_eq!(cfg.grid_pattern, GridPattern::Hexagonal);
            }
            other => panic!("unexpected config: {other:?}"),
        }

        let bad = r#"{"enable_background_removal": true, "background_removal_algorithm": "magic"}"#;
        assert!(matches!(
            ConversionParameters::from_legacy_json(bad),
            Err(ConversionError::InvalidParameters {
                field: "background_removal_algorithm",
                ..
            })
        ));
    }

    #[test]
    fn test_background_strength_range() {
        let params = ConversionParameters::default()
            .with_background_removal(BackgroundAlgorithm::Adaptive, 1.5);
        assert!(matches!(
            params.validate(),
            Err(ConversionError::InvalidParameters {
                field: "background_removal.strength",
                ..
            })
        ));
        let ok = ConversionParameters::default().with_background_removal(BackgroundAlgorithm::Auto, 0.5);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_legacy_defaults_match_canonical_defaults() {
        let params = ConversionParameters::from_legacy(&LegacyTraceConfig::default()).unwrap();
        assert_eq!(params, ConversionParameters::default());
    }

    #[test]
    fn test_legacy_unknown_backend() {
        let err = ConversionParameters::from_legacy_json(r#"{"backend": "potrace"}"#).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::InvalidParameters {
                field: "backend",
                ..
            }
        ));
    }

    #[test]
    fn test_legacy_malformed_json() {
        assert!(matches!(
            ConversionParameters::from_legacy_json("{not json"),
            Err(ConversionError::InvalidParameters { field: "config", .. })
        ));
    }

    #[test]
    fn test_backend_config_serde_tag() {
        let json = serde_json::to_string(&BackendConfig::Centerline(CenterlineConfig::default()))
            .unwrap();
        assert!(json.contains("\"backend\":\"centerline\""));
        let back: BackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.backend(), Backend::Centerline);
    }

    #[test]
    fn test_detail_mapping_monotonic() {
        let low = DetailMapping::new(0.0);
        let high = DetailMapping::new(1.0);
        assert!(low.edge_epsilon(1000.0) > high.edge_epsilon(1000.0));
        assert!(low.min_stroke_length(1000.0) > high.min_stroke_length(1000.0));
        assert!(low.canny_high_percentile() > high.canny_high_percentile());
        assert_eq!(high.min_branch_length(), 48.0);
    }
}
