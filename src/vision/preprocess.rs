//! Preprocessing variants for OCR
//!
//! Renders one page several ways so the engine gets more than one chance at
//! hard text. Every enhancement falls back to the unmodified page when the
//! input is degenerate (blank or empty); preprocessing never aborts a page.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::geometry::min_area_rect;
use imageproc::morphology::open;
use imageproc::point::Point;
use thiserror::Error;
use tracing::{debug, warn};

use super::VariantKind;
use crate::config::PreprocessConfig;

/// Why an enhancement step could not run
#[derive(Debug, Error, PartialEq)]
pub enum EnhanceError {
    #[error("image has no pixels")]
    Empty,
    #[error("image has no contrast to work with")]
    Uniform,
}

/// One rendering of the page handed to the engine
#[derive(Debug, Clone)]
pub struct PreprocessVariant {
    /// Which rendering this is
    pub kind: VariantKind,
    /// Image passed to the engine
    pub image: DynamicImage,
    /// Size of this image relative to the deskewed page
    pub scale: f32,
}

/// All variants of one page
#[derive(Debug, Clone)]
pub struct VariantSet {
    /// Variants in variant-index order, deskewed copy first
    pub variants: Vec<PreprocessVariant>,
    /// Rotation applied during deskew (degrees), if any
    pub skew_angle: Option<f32>,
}

impl VariantSet {
    /// The deskewed page; coordinates of every fused detection refer to it
    pub fn base(&self) -> &DynamicImage {
        &self.variants[0].image
    }
}

/// Produces the preprocessing variants for a page
#[derive(Debug, Clone, Default)]
pub struct VariantGenerator {
    config: PreprocessConfig,
}

impl VariantGenerator {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Render the page variants.
    ///
    /// Always yields deskewed, enhanced and background-normalized variants;
    /// small pages get an extra upscaled variant.
    pub fn generate(&self, image: &DynamicImage) -> VariantSet {
        let (deskewed, skew_angle) = self.deskew(&image.to_rgb8());
        let gray = DynamicImage::ImageRgb8(deskewed.clone()).to_luma8();

        let enhanced = match self.enhance(&gray) {
            Ok(img) => DynamicImage::ImageLuma8(img),
            Err(e) => {
                warn!("Enhancement pass skipped ({}), using unmodified page", e);
                DynamicImage::ImageRgb8(deskewed.clone())
            }
        };

        let normalized = match self.normalize_background(&gray) {
            Ok(img) => DynamicImage::ImageLuma8(img),
            Err(e) => {
                warn!("Background normalization skipped ({}), using unmodified page", e);
                DynamicImage::ImageRgb8(deskewed.clone())
            }
        };

        let upscaled = self.upscale(&deskewed);

        let mut variants = vec![
            PreprocessVariant {
                kind: VariantKind::Deskewed,
                image: DynamicImage::ImageRgb8(deskewed),
                scale: 1.0,
            },
            PreprocessVariant {
                kind: VariantKind::Enhanced,
                image: enhanced,
                scale: 1.0,
            },
            PreprocessVariant {
                kind: VariantKind::BackgroundNormalized,
                image: normalized,
                scale: 1.0,
            },
        ];
        if let Some(variant) = upscaled {
            variants.push(variant);
        }

        debug!(
            "Generated {} preprocessing variants (skew correction: {:?})",
            variants.len(),
            skew_angle
        );

        VariantSet { variants, skew_angle }
    }

    /// Rotate the page upright when its skew exceeds the threshold
    fn deskew(&self, image: &RgbImage) -> (RgbImage, Option<f32>) {
        let gray = DynamicImage::ImageRgb8(image.clone()).to_luma8();
        let Some(angle) = estimate_skew(&gray, self.config.deskew_min_foreground) else {
            return (image.clone(), None);
        };

        if angle.abs() <= self.config.deskew_min_angle {
            return (image.clone(), None);
        }

        debug!("Deskewing page by {:.2} degrees", angle);
        let rotated = rotate_about_center(
            image,
            -angle.to_radians(),
            Interpolation::Bicubic,
            Rgb([255u8, 255u8, 255u8]),
        );
        (rotated, Some(angle))
    }

    /// Contrast stretch, two-stage denoise, local equalization, unsharp mask,
    /// binarization and a light morphological cleanup
    fn enhance(&self, gray: &GrayImage) -> Result<GrayImage, EnhanceError> {
        let stretched = stretch_contrast(
            gray,
            self.config.stretch_low_percentile,
            self.config.stretch_high_percentile,
        )?;

        let denoised = median_filter(&stretched, 1, 1);
        let denoised = gaussian_blur_f32(&denoised, 0.8);

        let equalized = equalize_local(&denoised, self.config.clahe_tiles, self.config.clahe_clip_limit)?;
        let sharpened = unsharp_mask(&equalized, self.config.unsharp_sigma, self.config.unsharp_amount);
        let binary = binarize(&sharpened)?;

        Ok(open(&binary, Norm::LInf, 1))
    }

    /// Divide out a large-kernel median background estimate, then gamma correct
    fn normalize_background(&self, gray: &GrayImage) -> Result<GrayImage, EnhanceError> {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Err(EnhanceError::Empty);
        }

        // The median runs on a reduced copy; the background varies slowly.
        let reduce = if width.min(height) >= 64 { 4 } else { 1 };
        let radius = (self.config.background_kernel / 2 / reduce).max(1);
        let small = imageops::resize(gray, (width / reduce).max(1), (height / reduce).max(1), FilterType::Triangle);
        let background = median_filter(&small, radius, radius);
        let background = imageops::resize(&background, width, height, FilterType::Triangle);

        let mut normalized = GrayImage::new(width, height);
        for (x, y, pixel) in normalized.enumerate_pixels_mut() {
            let value = gray.get_pixel(x, y).0[0] as f32;
            let bg = (background.get_pixel(x, y).0[0] as f32).max(1.0);
            pixel.0[0] = (value * 255.0 / bg).clamp(0.0, 255.0) as u8;
        }

        Ok(apply_gamma(&normalized, self.config.gamma))
    }

    /// High-quality upscale for small pages, smoothed and re-sharpened
    fn upscale(&self, image: &RgbImage) -> Option<PreprocessVariant> {
        let (width, height) = image.dimensions();
        let short_side = width.min(height);
        if short_side == 0 || short_side >= self.config.upscale_min_short_side {
            return None;
        }

        let long_side = width.max(height) as f32;
        let factor = (self.config.upscale_target_long_edge as f32 / long_side).min(self.config.upscale_max_factor);
        if factor <= 1.0 {
            return None;
        }

        let new_width = (width as f32 * factor).round() as u32;
        let new_height = (height as f32 * factor).round() as u32;
        let resized = imageops::resize(image, new_width, new_height, FilterType::Lanczos3);
        let smoothed = median_filter(&resized, 1, 1);
        let sharpened = apply_sharpen(&smoothed, 1.0);

        debug!(
            "Upscaled variant: {}x{} -> {}x{} (factor {:.2})",
            width, height, new_width, new_height, factor
        );

        Some(PreprocessVariant {
            kind: VariantKind::Upscaled,
            image: DynamicImage::ImageRgb8(sharpened),
            scale: new_width as f32 / width as f32,
        })
    }
}

/// Estimate page skew (degrees) from the minimum-area rectangle around the
/// dark foreground pixels. `None` when there is too little foreground.
pub fn estimate_skew(gray: &GrayImage, min_foreground: usize) -> Option<f32> {
    let (width, height) = gray.dimensions();
    if width < 2 || height < 2 {
        return None;
    }

    let (lo, hi) = gray.pixels().fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if lo == hi {
        return None;
    }

    let level = otsu_level(gray);
    let points: Vec<Point<i32>> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] <= level)
        .map(|(x, y, _)| Point::new(x as i32, y as i32))
        .collect();

    if points.len() < min_foreground.max(3) {
        return None;
    }

    let rect = min_area_rect(&points);
    let dx = (rect[1].x - rect[0].x) as f32;
    let dy = (rect[1].y - rect[0].y) as f32;
    if dx == 0.0 && dy == 0.0 {
        return None;
    }

    let mut angle = dy.atan2(dx).to_degrees();
    while angle > 45.0 {
        angle -= 90.0;
    }
    while angle <= -45.0 {
        angle += 90.0;
    }
    Some(angle)
}

/// Stretch the `low`..`high` percentile range to the full 0-255 range
fn stretch_contrast(gray: &GrayImage, low: f32, high: f32) -> Result<GrayImage, EnhanceError> {
    let total = (gray.width() as u64) * (gray.height() as u64);
    if total == 0 {
        return Err(EnhanceError::Empty);
    }

    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[p.0[0] as usize] += 1;
    }

    let lo = percentile(&histogram, total, low) as f32;
    let hi = percentile(&histogram, total, high) as f32;
    if hi <= lo {
        return Err(EnhanceError::Uniform);
    }

    let scale = 255.0 / (hi - lo);
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = ((p.0[0] as f32 - lo) * scale).clamp(0.0, 255.0) as u8;
    }
    Ok(out)
}

/// Smallest intensity whose cumulative share reaches `pct` percent
fn percentile(histogram: &[u64; 256], total: u64, pct: f32) -> u8 {
    let target = ((pct.clamp(0.0, 100.0) / 100.0) * total as f32).ceil().max(1.0) as u64;
    let mut cumulative = 0u64;
    for (value, &count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return value as u8;
        }
    }
    255
}

/// Contrast-limited adaptive histogram equalization over a `tiles` x `tiles` grid
fn equalize_local(gray: &GrayImage, tiles: u32, clip_limit: f32) -> Result<GrayImage, EnhanceError> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(EnhanceError::Empty);
    }

    let tiles_x = tiles.clamp(1, width) as usize;
    let tiles_y = tiles.clamp(1, height) as usize;
    let tile_w = (width as usize).div_ceil(tiles_x);
    let tile_h = (height as usize).div_ceil(tiles_y);

    // One lookup table per tile
    let mut luts = vec![[0u8; 256]; tiles_x * tiles_y];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = ((tx + 1) * tile_w).min(width as usize);
            let y1 = ((ty + 1) * tile_h).min(height as usize);
            if x0 >= x1 || y0 >= y1 {
                continue;
            }

            let mut histogram = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    histogram[gray.get_pixel(x as u32, y as u32).0[0] as usize] += 1;
                }
            }

            let area = ((x1 - x0) * (y1 - y0)) as u32;
            let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in histogram.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bonus = excess / 256;
            let remainder = (excess % 256) as usize;
            for (i, bin) in histogram.iter_mut().enumerate() {
                *bin += bonus + u32::from(i < remainder);
            }

            let lut = &mut luts[ty * tiles_x + tx];
            let mut cumulative = 0u32;
            for (value, &count) in histogram.iter().enumerate() {
                cumulative += count;
                lut[value] = ((cumulative as f32 * 255.0) / area as f32).round().min(255.0) as u8;
            }
        }
    }

    // Bilinear blend between the four nearest tile centers
    let mut out = GrayImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y).0[0] as usize;
        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let tx0 = fx.floor().clamp(0.0, (tiles_x - 1) as f32) as usize;
        let ty0 = fy.floor().clamp(0.0, (tiles_y - 1) as f32) as usize;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let ax = (fx - tx0 as f32).clamp(0.0, 1.0);
        let ay = (fy - ty0 as f32).clamp(0.0, 1.0);

        let v00 = luts[ty0 * tiles_x + tx0][value] as f32;
        let v10 = luts[ty0 * tiles_x + tx1][value] as f32;
        let v01 = luts[ty1 * tiles_x + tx0][value] as f32;
        let v11 = luts[ty1 * tiles_x + tx1][value] as f32;
        let top = v00 * (1.0 - ax) + v10 * ax;
        let bottom = v01 * (1.0 - ax) + v11 * ax;
        pixel.0[0] = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;
    }

    Ok(out)
}

/// `(1 + amount) * image - amount * blurred`
fn unsharp_mask(gray: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, sigma);
    let mut out = gray.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y).0[0] as f32;
        let blur = blurred.get_pixel(x, y).0[0] as f32;
        pixel.0[0] = ((1.0 + amount) * value - amount * blur).clamp(0.0, 255.0) as u8;
    }
    out
}

/// Otsu binarization; text ends up black on white
fn binarize(gray: &GrayImage) -> Result<GrayImage, EnhanceError> {
    if gray.width() == 0 || gray.height() == 0 {
        return Err(EnhanceError::Empty);
    }
    let level = otsu_level(gray);
    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > level { 255 } else { 0 };
    }
    Ok(out)
}

/// Gamma correction through a lookup table
fn apply_gamma(gray: &GrayImage, gamma: f32) -> GrayImage {
    let inv_gamma = 1.0 / gamma.max(f32::EPSILON);
    let mut table = [0u8; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        *entry = ((i as f32 / 255.0).powf(inv_gamma) * 255.0).clamp(0.0, 255.0) as u8;
    }

    let mut out = gray.clone();
    for p in out.pixels_mut() {
        *p = Luma([table[p.0[0] as usize]]);
    }
    out
}

/// 4-neighbour sharpening of RGB data.
/// Strength 0.0 = no sharpening, 1.0 = strong sharpening
fn apply_sharpen(image: &RgbImage, strength: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut result = image.clone();
    if width < 3 || height < 3 {
        return result;
    }

    let center_weight = 1.0 + 4.0 * strength;
    let neighbor_weight = -strength;

    // Edges are left untouched
    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let top = image.get_pixel(x, y - 1).0;
            let bottom = image.get_pixel(x, y + 1).0;
            let left = image.get_pixel(x - 1, y).0;
            let right = image.get_pixel(x + 1, y).0;
            let center = image.get_pixel(x, y).0;

            let out = result.get_pixel_mut(x, y);
            for c in 0..3 {
                let sharpened = center[c] as f32 * center_weight
                    + (top[c] as f32 + bottom[c] as f32 + left[c] as f32 + right[c] as f32) * neighbor_weight;
                out.0[c] = sharpened.clamp(0.0, 255.0) as u8;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn page_with_bars(width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        for row in 0..4u32 {
            let y0 = 20 + row * 40;
            for y in y0..(y0 + 12).min(height) {
                for x in 20..(width - 20) {
                    img.put_pixel(x, y, Rgb([20, 20, 20]));
                }
            }
        }
        img
    }

    #[test]
    fn test_percentile_stretch() {
        let gray = GrayImage::from_fn(10, 10, |x, _| Luma([100 + (x as u8) * 10]));
        let stretched = stretch_contrast(&gray, 2.0, 98.0).unwrap();
        assert_eq!(stretched.get_pixel(0, 0).0[0], 0);
        assert_eq!(stretched.get_pixel(9, 0).0[0], 255);
    }

    #[test]
    fn test_stretch_uniform_image_fails() {
        let gray = GrayImage::from_pixel(10, 10, Luma([255]));
        assert_eq!(stretch_contrast(&gray, 2.0, 98.0), Err(EnhanceError::Uniform));
    }

    #[test]
    fn test_blank_page_falls_back_to_unmodified() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb([255, 255, 255])));
        let set = VariantGenerator::default().generate(&white);

        assert!(set.skew_angle.is_none());
        let enhanced = &set.variants[1];
        assert_eq!(enhanced.kind, VariantKind::Enhanced);
        assert_eq!(enhanced.image.to_luma8(), white.to_luma8());
    }

    #[test]
    fn test_small_page_gets_upscaled_variant() {
        let page = DynamicImage::ImageRgb8(page_with_bars(200, 180));
        let set = VariantGenerator::default().generate(&page);

        assert_eq!(set.variants.len(), 4);
        let upscaled = &set.variants[3];
        assert_eq!(upscaled.kind, VariantKind::Upscaled);
        assert_eq!(upscaled.image.width(), 800);
        assert!((upscaled.scale - 4.0).abs() < 1e-3);
        assert_eq!(set.base().dimensions(), (200, 180));
    }

    #[test]
    fn test_large_page_has_three_variants() {
        let page = DynamicImage::ImageRgb8(page_with_bars(820, 810));
        let set = VariantGenerator::default().generate(&page);

        let kinds: Vec<_> = set.variants.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![VariantKind::Deskewed, VariantKind::Enhanced, VariantKind::BackgroundNormalized]
        );
        for variant in &set.variants {
            assert_eq!(variant.image.dimensions(), (820, 810));
        }
    }

    #[test]
    fn test_estimate_skew_of_tilted_bar() {
        let mut gray = GrayImage::from_pixel(240, 200, Luma([255]));
        let slope = 5.0f32.to_radians().tan();
        for x in 20..220u32 {
            let center = 80.0 + x as f32 * slope;
            for dy in -4..=4 {
                let y = (center + dy as f32).round() as u32;
                gray.put_pixel(x, y, Luma([0]));
            }
        }

        let angle = estimate_skew(&gray, 100).unwrap();
        assert!((angle.abs() - 5.0).abs() < 1.0, "angle was {}", angle);
    }

    #[test]
    fn test_upright_page_is_not_rotated() {
        let page = DynamicImage::ImageRgb8(page_with_bars(300, 200));
        let set = VariantGenerator::default().generate(&page);
        assert!(set.skew_angle.is_none());
        assert_eq!(set.base().to_rgb8(), page.to_rgb8());
    }

    #[test]
    fn test_skew_needs_foreground() {
        let mut gray = GrayImage::from_pixel(50, 50, Luma([255]));
        gray.put_pixel(10, 10, Luma([0]));
        assert!(estimate_skew(&gray, 100).is_none());
    }

    #[test]
    fn test_equalize_local_expands_contrast() {
        let gray = GrayImage::from_fn(128, 128, |x, _| Luma([100 + (x % 20) as u8]));
        let out = equalize_local(&gray, 8, 4.0).unwrap();
        assert_eq!(out.dimensions(), (128, 128));

        let spread = |img: &GrayImage| {
            let (lo, hi) = img.pixels().fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
            hi - lo
        };
        assert!(spread(&out) > spread(&gray));
    }

    #[test]
    fn test_gamma_keeps_endpoints() {
        let gray = GrayImage::from_fn(3, 1, |x, _| Luma([[0, 128, 255][x as usize]]));
        let out = apply_gamma(&gray, 1.2);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(2, 0).0[0], 255);
        assert!(out.get_pixel(1, 0).0[0] > 128);
    }

    #[test]
    fn test_sharpen_flat_region_unchanged() {
        let img = RgbImage::from_pixel(5, 5, Rgb([90, 120, 200]));
        assert_eq!(apply_sharpen(&img, 1.0), img);
    }

    #[test]
    fn test_background_normalization_flattens_shading() {
        // Left half darker background, same text contrast
        let gray = GrayImage::from_fn(128, 128, |x, y| {
            let bg = if x < 64 { 150 } else { 230 };
            let ink = y % 32 < 3 && x % 16 < 8;
            Luma([if ink { bg - 100 } else { bg }])
        });
        let out = VariantGenerator::default().normalize_background(&gray).unwrap();
        let left = out.get_pixel(20, 16).0[0] as i32;
        let right = out.get_pixel(100, 16).0[0] as i32;
        assert!((left - right).abs() < 30, "left {} right {}", left, right);
    }
}
