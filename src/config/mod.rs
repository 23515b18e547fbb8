//! Pipeline Configuration
//!
//! Every calibrated threshold used by preprocessing, fusion, layout,
//! reconstruction and comparison, stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete tuning table for one pipeline instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Variant generation settings
    pub preprocess: PreprocessConfig,
    /// Cross-variant voting settings
    pub fusion: FusionConfig,
    /// Reading order settings
    pub layout: LayoutConfig,
    /// Image synthesis settings
    pub reconstruction: ReconstructionConfig,
    /// Verification scoring settings
    pub comparison: ComparisonConfig,
}

/// Preprocessing variant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Skew below this magnitude (degrees) is left uncorrected
    pub deskew_min_angle: f32,
    /// Minimum foreground pixels needed to estimate skew
    pub deskew_min_foreground: usize,
    /// Lower percentile for contrast stretching
    pub stretch_low_percentile: f32,
    /// Upper percentile for contrast stretching
    pub stretch_high_percentile: f32,
    /// Histogram clip limit for local contrast equalization
    pub clahe_clip_limit: f32,
    /// Tiles per side for local contrast equalization
    pub clahe_tiles: u32,
    /// Gaussian sigma of the unsharp mask
    pub unsharp_sigma: f32,
    /// Weight subtracted from the blurred copy (image gets 1 + amount)
    pub unsharp_amount: f32,
    /// Median kernel size used to estimate the page background
    pub background_kernel: u32,
    /// Gamma applied after background division
    pub gamma: f32,
    /// Shorter side (px) below which an upscaled variant is added
    pub upscale_min_short_side: u32,
    /// Long edge (px) the upscaled variant aims for
    pub upscale_target_long_edge: u32,
    /// Largest upscale factor allowed
    pub upscale_max_factor: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            deskew_min_angle: 0.5,
            deskew_min_foreground: 100,
            stretch_low_percentile: 2.0,
            stretch_high_percentile: 98.0,
            clahe_clip_limit: 4.0,
            clahe_tiles: 8,
            unsharp_sigma: 3.0,
            unsharp_amount: 0.5,
            background_kernel: 51,
            gamma: 1.2,
            upscale_min_short_side: 800,
            upscale_target_long_edge: 2000,
            upscale_max_factor: 4.0,
        }
    }
}

/// Detection fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Grid cell size (px) used to cluster detection centroids
    pub cell_size: f32,
    /// Per-occurrence agreement bonus in the vote score
    /// `confidence_sum / count * (1 + agreement_bonus * count)`
    pub agreement_bonus: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cell_size: 30.0,
            agreement_bonus: 0.1,
        }
    }
}

/// Reading order and text formatting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Floor for the line tolerance (px)
    pub min_line_tolerance: f32,
    /// Line tolerance as a fraction of the average detection height
    pub line_tolerance_ratio: f32,
    /// Vertical gap, in line heights, that starts a new paragraph
    pub paragraph_gap_ratio: f32,
    /// Horizontal offset (px) per indent level
    pub indent_step: f32,
    /// Text emitted per indent level
    pub indent_unit: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            min_line_tolerance: 15.0,
            line_tolerance_ratio: 0.5,
            paragraph_gap_ratio: 1.5,
            indent_step: 40.0,
            indent_unit: "  ".to_string(),
        }
    }
}

/// Size/confidence/position rules for background stamps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkRules {
    pub large_area: f32,
    pub large_min_confidence: f32,
    pub medium_area: f32,
    pub medium_min_confidence: f32,
    /// Boxes above this area need at least `sparse_min_chars` characters
    pub sparse_area: f32,
    pub sparse_min_chars: usize,
    pub centered_area: f32,
    pub centered_min_confidence: f32,
    /// Max offset from the image center, as a fraction of the half extent
    pub centered_radius: f32,
}

impl Default for WatermarkRules {
    fn default() -> Self {
        Self {
            large_area: 20_000.0,
            large_min_confidence: 0.85,
            medium_area: 10_000.0,
            medium_min_confidence: 0.70,
            sparse_area: 5_000.0,
            sparse_min_chars: 5,
            centered_area: 15_000.0,
            centered_min_confidence: 0.90,
            centered_radius: 0.30,
        }
    }
}

/// Reconstruction (image synthesis) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Canvas supersampling factor
    pub supersample: u32,
    /// Opacity of the original composited under the text (0.0 - 1.0)
    pub ghost_opacity: f32,
    /// Text similarity above which nearby detections are duplicates
    pub duplicate_text_similarity: f32,
    /// Centroid distance (px) within which similar text is a duplicate
    pub duplicate_distance: f32,
    /// IoU above which detections are duplicates regardless of text
    pub overlap_iou: f32,
    /// Fraction of one box inside another that marks containment
    pub containment_ratio: f32,
    /// Watermark heuristics
    pub watermark: WatermarkRules,
    /// Luminance below which a crop pixel counts as ink
    pub ink_luminance: u8,
    /// Ink density above which a region is rendered bold
    pub bold_density: f32,
    /// Font size as a fraction of box height
    pub font_height_ratio: f32,
    /// Font size clamp, in supersampled pixels
    pub min_font_px: f32,
    pub max_font_px: f32,
    /// Smallest size the width fitting may shrink to
    pub shrink_floor_px: f32,
    /// Fraction of the box span rendered text may occupy
    pub fit_ratio: f32,
    /// Height/width ratio above which text is rendered vertically
    pub vertical_aspect: f32,
    /// Boxes above this area with confidence below `faint_confidence` render faintly
    pub faint_area: f32,
    pub faint_confidence: f32,
    pub faint_alpha: u8,
    /// Regular font files tried in order
    pub font_paths: Vec<String>,
    /// Bold font files tried in order
    pub bold_font_paths: Vec<String>,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            supersample: 3,
            ghost_opacity: 110.0 / 255.0,
            duplicate_text_similarity: 0.90,
            duplicate_distance: 50.0,
            overlap_iou: 0.20,
            containment_ratio: 0.80,
            watermark: WatermarkRules::default(),
            ink_luminance: 180,
            bold_density: 0.35,
            font_height_ratio: 0.8,
            min_font_px: 10.0,
            max_font_px: 200.0,
            shrink_floor_px: 8.0,
            fit_ratio: 0.95,
            vertical_aspect: 1.5,
            faint_area: 15_000.0,
            faint_confidence: 0.85,
            faint_alpha: 40,
            font_paths: vec![
                "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf".to_string(),
                "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string(),
                "/usr/share/fonts/truetype/freefont/FreeSans.ttf".to_string(),
                "/System/Library/Fonts/Supplemental/Arial.ttf".to_string(),
                "C:\\Windows\\Fonts\\arial.ttf".to_string(),
            ],
            bold_font_paths: vec![
                "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf".to_string(),
                "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf".to_string(),
                "/usr/share/fonts/truetype/freefont/FreeSansBold.ttf".to_string(),
                "/System/Library/Fonts/Supplemental/Arial Bold.ttf".to_string(),
                "C:\\Windows\\Fonts\\arialbd.ttf".to_string(),
            ],
        }
    }
}

/// Comparison (verification scoring) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Side of the square SSIM window
    pub ssim_window: u32,
    /// Absolute grayscale difference above which pixels disagree
    pub pixel_diff_threshold: u8,
    /// Block size of the adaptive threshold building the text mask
    pub text_mask_block: u32,
    /// Offset below the local mean for a pixel to count as text
    pub text_mask_offset: f32,
    /// Dilation radius applied to the text mask
    pub text_mask_dilation: u8,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            ssim_window: 7,
            pixel_diff_threshold: 30,
            text_mask_block: 11,
            text_mask_offset: 2.0,
            text_mask_dilation: 4,
        }
    }
}

/// `pipeline.toml` in the platform config directory
pub fn default_config_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "scanfuse", "scanfuse")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    Ok(proj_dirs.config_dir().join("pipeline.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {:?}", path))?;
    let config: PipelineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
