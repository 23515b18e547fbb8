//! Image reconstruction from detections
//!
//! Synthesizes a page from a detection set so it can be compared against
//! the scan. Duplicates and background stamps are removed first, then each
//! surviving region is drawn on a supersampled canvas in the ink colour
//! sampled from the scan and the canvas is downsampled to page size.

use std::cmp::Ordering;
use std::time::Instant;

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use strsim::normalized_levenshtein;
use tracing::{debug, info, warn};

use super::render::{blend_mask, TextPainter};
use super::style::{estimate_style, RegionStyle};
use crate::config::{ReconstructionConfig, WatermarkRules};
use crate::vision::geometry::distance;
use crate::vision::Detection;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Case-insensitive Levenshtein ratio of two trimmed texts
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&a, &b) as f32
}

/// Whether `detection` has text and a box with area
fn is_drawable(detection: &Detection) -> bool {
    let area = detection.bounds().area();
    !detection.text.trim().is_empty() && area.is_finite() && area > 0.0
}

/// Greedy near-duplicate suppression, highest confidence first.
///
/// A candidate is rejected against an accepted detection when the texts are
/// near-identical and the boxes are close or touch, when the boxes overlap
/// beyond the IoU limit, or when either box mostly contains the other.
pub fn suppress_duplicates(detections: &[Detection], config: &ReconstructionConfig) -> Vec<Detection> {
    let mut candidates: Vec<&Detection> = detections.iter().collect();
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.source_variant.cmp(&b.source_variant))
            .then_with(|| a.text.cmp(&b.text))
            .then_with(|| a.polygon.total_cmp(&b.polygon))
    });

    let mut accepted: Vec<&Detection> = Vec::new();
    for candidate in candidates {
        let cand_box = candidate.bounds();
        let duplicate = accepted.iter().any(|kept| {
            let kept_box = kept.bounds();
            let inter = cand_box.intersection_area(&kept_box);
            let near = distance(candidate.centroid(), kept.centroid()) < config.duplicate_distance;

            (text_similarity(&candidate.text, &kept.text) > config.duplicate_text_similarity && (near || inter > 0.0))
                || cand_box.iou(&kept_box) > config.overlap_iou
                || kept_box.covered_by(&cand_box) > config.containment_ratio
                || cand_box.covered_by(&kept_box) > config.containment_ratio
        });
        if !duplicate {
            accepted.push(candidate);
        }
    }

    accepted.into_iter().cloned().collect()
}

/// Size, confidence and position rules for background stamps
pub fn is_likely_watermark(detection: &Detection, width: u32, height: u32, rules: &WatermarkRules) -> bool {
    let bounds = detection.bounds();
    let area = bounds.area();
    let conf = detection.confidence;

    if area > rules.large_area && conf < rules.large_min_confidence {
        return true;
    }
    if area > rules.medium_area && conf < rules.medium_min_confidence {
        return true;
    }
    if area > rules.sparse_area && detection.text.trim().chars().count() < rules.sparse_min_chars {
        return true;
    }

    let (half_w, half_h) = (width as f32 / 2.0, height as f32 / 2.0);
    if half_w <= 0.0 || half_h <= 0.0 {
        return false;
    }
    let (cx, cy) = detection.centroid();
    let off_x = (cx - half_w).abs() / half_w;
    let off_y = (cy - half_h).abs() / half_h;
    area > rules.centered_area
        && conf < rules.centered_min_confidence
        && off_x < rules.centered_radius
        && off_y < rules.centered_radius
}

/// Renders detection sets back into page images
#[derive(Debug)]
pub struct Reconstructor {
    config: ReconstructionConfig,
    painter: TextPainter,
}

impl Reconstructor {
    /// Create a reconstructor, loading fonts from the configured paths
    pub fn new(config: ReconstructionConfig) -> Self {
        let painter = TextPainter::load(&config.font_paths, &config.bold_font_paths);
        Self { config, painter }
    }

    /// Create a reconstructor drawing with `painter`
    pub fn with_painter(config: ReconstructionConfig, painter: TextPainter) -> Self {
        Self { config, painter }
    }

    /// Detections that will be drawn, largest first
    pub fn select(&self, detections: &[Detection], width: u32, height: u32) -> Vec<Detection> {
        let valid: Vec<Detection> = detections.iter().filter(|d| is_drawable(d)).cloned().collect();
        let mut kept = suppress_duplicates(&valid, &self.config);
        let suppressed = valid.len() - kept.len();

        kept.sort_by(drawing_order);
        let before = kept.len();
        kept.retain(|d| !is_likely_watermark(d, width, height, &self.config.watermark));

        debug!(
            "Reconstruction keeps {} of {} detections ({} duplicates, {} watermarks)",
            kept.len(),
            detections.len(),
            suppressed,
            before - kept.len()
        );
        kept
    }

    /// Synthesize a `width` x `height` page from `detections`.
    ///
    /// `original` supplies ink colours and a faded alignment ghost. With no
    /// drawable detection the result is a plain white page.
    pub fn reconstruct(&self, width: u32, height: u32, detections: &[Detection], original: Option<&RgbImage>) -> RgbImage {
        let start = Instant::now();
        if !detections.iter().any(is_drawable) {
            warn!("No drawable detections, returning blank {}x{} page", width, height);
            return RgbImage::from_pixel(width, height, WHITE);
        }
        if width == 0 || height == 0 {
            return RgbImage::new(width, height);
        }

        let scale = self.config.supersample.max(1);
        let mut canvas = self.base_canvas(width * scale, height * scale, original);
        let drawn = self.select(detections, width, height);
        for detection in &drawn {
            self.draw(&mut canvas, detection, scale as f32, original);
        }

        let result = if scale == 1 {
            canvas
        } else {
            imageops::resize(&canvas, width, height, FilterType::Lanczos3)
        };

        info!(
            "Reconstructed {}x{} page from {} detections in {:?}",
            width,
            height,
            drawn.len(),
            start.elapsed()
        );
        result
    }

    /// White canvas, with the original faded in when available
    fn base_canvas(&self, width: u32, height: u32, original: Option<&RgbImage>) -> RgbImage {
        let mut canvas = RgbImage::from_pixel(width, height, WHITE);
        let Some(original) = original.filter(|o| o.width() > 0 && o.height() > 0) else {
            return canvas;
        };

        let ghost = imageops::resize(original, width, height, FilterType::Lanczos3);
        let a = self.config.ghost_opacity.clamp(0.0, 1.0);
        for (dst, src) in canvas.pixels_mut().zip(ghost.pixels()) {
            for c in 0..3 {
                dst[c] = (255.0 * (1.0 - a) + src[c] as f32 * a).round() as u8;
            }
        }
        canvas
    }

    /// Ink style sampled from the scan under `detection`
    fn sample_style(&self, detection: &Detection, original: Option<&RgbImage>) -> RegionStyle {
        let Some(original) = original else {
            return RegionStyle::default();
        };
        let b = detection.bounds();
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(original.width());
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(original.height());
        let (x1, x2) = (clamp_x(b.min_x), clamp_x(b.max_x));
        let (y1, y2) = (clamp_y(b.min_y), clamp_y(b.max_y));
        if x2 <= x1 || y2 <= y1 {
            return RegionStyle::default();
        }

        let crop = imageops::crop_imm(original, x1, y1, x2 - x1, y2 - y1).to_image();
        estimate_style(&crop, self.config.ink_luminance, self.config.bold_density)
    }

    fn draw(&self, canvas: &mut RgbImage, detection: &Detection, scale: f32, original: Option<&RgbImage>) {
        let cfg = &self.config;
        let page_box = detection.bounds();
        let b = detection.polygon.scaled(scale).bounds();
        let (bw, bh) = (b.width(), b.height());

        let vertical = bh > bw * cfg.vertical_aspect;
        let style = self.sample_style(detection, original);
        let alpha = if page_box.area() > cfg.faint_area && detection.confidence < cfg.faint_confidence {
            cfg.faint_alpha
        } else {
            255
        };

        let span = if vertical { bh } else { bw };
        let mut size = (bh * cfg.font_height_ratio).floor().clamp(cfg.min_font_px, cfg.max_font_px);
        while self.painter.measure(&detection.text, size, style.bold) as f32 > span * cfg.fit_ratio
            && size > cfg.shrink_floor_px
        {
            size -= 1.0;
        }

        let mut mask = self.painter.render_mask(&detection.text, size, style.bold);
        if mask.width() == 0 || mask.height() == 0 {
            return;
        }

        let (x, y) = if vertical {
            mask = imageops::rotate270(&mask);
            (
                b.min_x + (bw - mask.width() as f32) / 2.0,
                b.min_y + (bh - mask.height() as f32) / 2.0,
            )
        } else {
            (b.min_x + 2.0, b.min_y + (bh - mask.height() as f32) / 2.0)
        };

        blend_mask(canvas, &mask, x.round() as i64, y.round() as i64, style.ink, alpha);
    }
}

/// Order detections for drawing: larger areas first
pub fn drawing_order(a: &Detection, b: &Detection) -> Ordering {
    b.bounds().area().total_cmp(&a.bounds().area())
}
