//! Statistical comparison of a scan and its reconstruction

use std::time::Instant;

use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ComparisonConfig;

/// Per-pixel structural similarity
pub type SimilarityMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Scores and artifacts of one verification
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Mean windowed structural similarity (0.0 - 1.0)
    pub ssim_score: f32,
    /// Percent of pixels whose grayscale difference is within threshold
    pub pixel_match_percent: f32,
    /// Same agreement restricted to the text mask of the original
    pub text_region_match_percent: f32,
    /// Per-pixel similarity
    pub ssim_map: SimilarityMap,
    /// False-colour difference image, blue = same, red = different
    pub diff_heatmap: RgbImage,
    /// Reconstruction at the size of the original
    pub reconstructed_image: RgbImage,
}

impl VerificationResult {
    /// Mean of the three scores on a 0-100 scale
    pub fn overall_match(&self) -> f32 {
        (self.ssim_score * 100.0 + self.pixel_match_percent + self.text_region_match_percent) / 3.0
    }

    pub fn summary(&self) -> VerificationSummary {
        VerificationSummary {
            ssim_score: round_to(self.ssim_score, 4),
            pixel_match_percent: round_to(self.pixel_match_percent, 2),
            text_region_match_percent: round_to(self.text_region_match_percent, 2),
            overall_match: round_to(self.overall_match(), 2),
        }
    }
}

/// Rounded scores for reporting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationSummary {
    pub ssim_score: f64,
    pub pixel_match_percent: f64,
    pub text_region_match_percent: f64,
    pub overall_match: f64,
}

fn round_to(value: f32, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value as f64 * factor).round() / factor
}

/// Scores a reconstruction against the original scan
#[derive(Debug, Clone, Default)]
pub struct ComparisonEngine {
    config: ComparisonConfig,
}

impl ComparisonEngine {
    pub fn new(config: ComparisonConfig) -> Self {
        Self { config }
    }

    /// Compare `original` with `reconstructed`, resizing the reconstruction
    /// when the sizes differ
    pub fn compare(&self, original: &RgbImage, reconstructed: &RgbImage) -> VerificationResult {
        let start = Instant::now();
        let (width, height) = original.dimensions();
        let reconstructed = if reconstructed.dimensions() != (width, height) {
            debug!(
                "Resizing reconstruction {:?} to {}x{}",
                reconstructed.dimensions(),
                width,
                height
            );
            imageops::resize(reconstructed, width, height, FilterType::Lanczos3)
        } else {
            reconstructed.clone()
        };

        let orig_gray = imageops::grayscale(original);
        let recon_gray = imageops::grayscale(&reconstructed);

        let (ssim_score, ssim_map) = ssim(&orig_gray, &recon_gray, self.config.ssim_window);
        let diff = abs_diff(&orig_gray, &recon_gray);
        let threshold = self.config.pixel_diff_threshold;

        let total = diff.len();
        let pixel_match_percent = if total == 0 {
            100.0
        } else {
            diff.pixels().filter(|p| p[0] <= threshold).count() as f32 / total as f32 * 100.0
        };

        let mask = text_mask(
            &orig_gray,
            self.config.text_mask_block,
            self.config.text_mask_offset,
            self.config.text_mask_dilation,
        );
        let mut text_pixels = 0usize;
        let mut text_matches = 0usize;
        for (m, d) in mask.pixels().zip(diff.pixels()) {
            if m[0] > 0 {
                text_pixels += 1;
                if d[0] <= threshold {
                    text_matches += 1;
                }
            }
        }
        let text_region_match_percent = if text_pixels == 0 {
            100.0
        } else {
            text_matches as f32 / text_pixels as f32 * 100.0
        };

        info!(
            "Verification: ssim {:.4}, pixel match {:.2}%, text match {:.2}% ({} text pixels) in {:?}",
            ssim_score,
            pixel_match_percent,
            text_region_match_percent,
            text_pixels,
            start.elapsed()
        );

        VerificationResult {
            ssim_score,
            pixel_match_percent,
            text_region_match_percent,
            ssim_map,
            diff_heatmap: heatmap(&diff),
            reconstructed_image: reconstructed,
        }
    }
}

/// Summed-area table with one row and column of zero padding
struct Integral {
    width: usize,
    sums: Vec<u64>,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let stride = width as usize + 1;
        let mut sums = vec![0u64; stride * (height as usize + 1)];
        for y in 0..height {
            let mut row = 0u64;
            for x in 0..width {
                row += gray.get_pixel(x, y)[0] as u64;
                let i = (y as usize + 1) * stride + x as usize + 1;
                sums[i] = sums[i - stride] + row;
            }
        }
        Self { width: stride, sums }
    }

    /// Sum over x0..x1, y0..y1 (exclusive ends)
    fn sum(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> u64 {
        let at = |x: u32, y: u32| self.sums[y as usize * self.width + x as usize];
        (at(x1, y1) + at(x0, y0)) - (at(x0, y1) + at(x1, y0))
    }
}

/// Raw first and second moments of two images over a set of pixels
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    a: u64,
    b: u64,
    aa: u64,
    bb: u64,
    ab: u64,
}

impl Moments {
    fn of(a: u8, b: u8) -> Self {
        let (a, b) = (a as u64, b as u64);
        Self {
            a,
            b,
            aa: a * a,
            bb: b * b,
            ab: a * b,
        }
    }

    fn plus(self, other: Self) -> Self {
        Self {
            a: self.a + other.a,
            b: self.b + other.b,
            aa: self.aa + other.aa,
            bb: self.bb + other.bb,
            ab: self.ab + other.ab,
        }
    }

    /// `other` must be a subset of the pixels summed in `self`
    fn minus(self, other: Self) -> Self {
        Self {
            a: self.a - other.a,
            b: self.b - other.b,
            aa: self.aa - other.aa,
            bb: self.bb - other.bb,
            ab: self.ab - other.ab,
        }
    }
}

/// Clipped square window of side `window` centred on (x, y)
fn window_bounds(x: u32, y: u32, width: u32, height: u32, radius: u32) -> (u32, u32, u32, u32) {
    (
        x.saturating_sub(radius),
        y.saturating_sub(radius),
        (x + radius + 1).min(width),
        (y + radius + 1).min(height),
    )
}

/// Structural similarity of two equally sized grayscale images.
///
/// Uniform `window` x `window` statistics with sample covariance. Windows
/// are clipped at the border for the map; the score averages the pixels
/// whose window fits entirely, or the whole map on images smaller than one
/// window. Returns the score clamped to [0, 1] and the per-pixel map.
pub fn ssim(a: &GrayImage, b: &GrayImage, window: u32) -> (f32, SimilarityMap) {
    let (width, height) = a.dimensions();
    let mut map = SimilarityMap::new(width, height);
    if width == 0 || height == 0 || b.dimensions() != (width, height) {
        return (if a.dimensions() == b.dimensions() { 1.0 } else { 0.0 }, map);
    }

    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

    let radius = window.max(1) / 2;
    let mut interior_sum = 0.0f64;
    let mut interior_count = 0usize;
    let mut total_sum = 0.0f64;

    // Column sums over the current band of rows, plus their running prefix
    // along the row, keep memory proportional to the image width
    let row_moments = |x: u32, y: u32| Moments::of(a.get_pixel(x, y)[0], b.get_pixel(x, y)[0]);
    let mut columns = vec![Moments::default(); width as usize];
    let mut prefix = vec![Moments::default(); width as usize + 1];
    let (mut band_top, mut band_bottom) = (0u32, 0u32);

    for y in 0..height {
        let (_, y0, _, y1) = window_bounds(0, y, width, height, radius);
        while band_bottom < y1 {
            for (x, column) in columns.iter_mut().enumerate() {
                *column = column.plus(row_moments(x as u32, band_bottom));
            }
            band_bottom += 1;
        }
        while band_top < y0 {
            for (x, column) in columns.iter_mut().enumerate() {
                *column = column.minus(row_moments(x as u32, band_top));
            }
            band_top += 1;
        }
        for (x, column) in columns.iter().enumerate() {
            prefix[x + 1] = prefix[x].plus(*column);
        }

        for x in 0..width {
            let (x0, _, x1, _) = window_bounds(x, y, width, height, radius);
            let m = prefix[x1 as usize].minus(prefix[x0 as usize]);
            let n = ((x1 - x0) * (y1 - y0)) as f64;
            let sa = m.a as f64;
            let sb = m.b as f64;
            let mu_a = sa / n;
            let mu_b = sb / n;
            let (var_a, var_b, cov) = if n > 1.0 {
                (
                    (m.aa as f64 - sa * mu_a) / (n - 1.0),
                    (m.bb as f64 - sb * mu_b) / (n - 1.0),
                    (m.ab as f64 - sa * mu_b) / (n - 1.0),
                )
            } else {
                (0.0, 0.0, 0.0)
            };

            let s = ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
                / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2));
            map.put_pixel(x, y, Luma([s as f32]));

            total_sum += s;
            let interior = x >= radius && y >= radius && x + radius < width && y + radius < height;
            if interior {
                interior_sum += s;
                interior_count += 1;
            }
        }
    }

    let mean = if interior_count > 0 {
        interior_sum / interior_count as f64
    } else {
        total_sum / (width as f64 * height as f64)
    };
    (mean.clamp(0.0, 1.0) as f32, map)
}

/// Per-pixel absolute difference
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0])])
    })
}

/// Likely text pixels of a scan: darker than the local `block` mean by
/// more than `offset`, dilated by `dilation` pixels
pub fn text_mask(gray: &GrayImage, block: u32, offset: f32, dilation: u8) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return GrayImage::new(width, height);
    }

    let integral = Integral::new(gray);
    let radius = block.max(1) / 2;
    let binary = GrayImage::from_fn(width, height, |x, y| {
        let (x0, y0, x1, y1) = window_bounds(x, y, width, height, radius);
        let n = ((x1 - x0) * (y1 - y0)) as f64;
        let mean = integral.sum(x0, y0, x1, y1) as f64 / n;
        let value = gray.get_pixel(x, y)[0] as f64;
        if value <= mean - offset as f64 {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    if dilation == 0 {
        binary
    } else {
        dilate(&binary, Norm::LInf, dilation)
    }
}

/// Min-max normalized difference through a jet colour map
pub fn heatmap(diff: &GrayImage) -> RgbImage {
    let (lo, hi) = diff
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let range = hi.saturating_sub(lo) as f32;

    RgbImage::from_fn(diff.width(), diff.height(), |x, y| {
        let v = diff.get_pixel(x, y)[0];
        let t = if range > 0.0 { (v - lo) as f32 / range } else { 0.0 };
        jet(t)
    })
}

/// Jet colour map: dark blue at 0.0 through cyan and yellow to dark red at 1.0
fn jet(t: f32) -> Rgb<u8> {
    let channel = |centre: f32| ((1.5 - (4.0 * t - centre).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_text() -> RgbImage {
        let mut img = RgbImage::from_pixel(80, 60, Rgb([255, 255, 255]));
        for y in 20..30 {
            for x in 10..70 {
                if (x / 4) % 2 == 0 {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        img
    }

    #[test]
    fn test_identical_images_match_fully() {
        let page = page_with_text();
        let result = ComparisonEngine::default().compare(&page, &page);

        assert!((result.ssim_score - 1.0).abs() < 1e-4);
        assert_eq!(result.pixel_match_percent, 100.0);
        assert_eq!(result.text_region_match_percent, 100.0);
        assert!((result.overall_match() - 100.0).abs() < 0.01);
        assert_eq!(result.ssim_map.dimensions(), (80, 60));
    }

    /// SSIM of one clipped window computed directly from its pixels
    fn window_ssim(a: &GrayImage, b: &GrayImage, x: u32, y: u32, radius: u32) -> f64 {
        let (x0, y0, x1, y1) = window_bounds(x, y, a.width(), a.height(), radius);
        let mut pairs = Vec::new();
        for wy in y0..y1 {
            for wx in x0..x1 {
                pairs.push((a.get_pixel(wx, wy)[0] as f64, b.get_pixel(wx, wy)[0] as f64));
            }
        }
        let n = pairs.len() as f64;
        let mu_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
        let mu_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
        let var_a = pairs.iter().map(|p| (p.0 - mu_a).powi(2)).sum::<f64>() / (n - 1.0);
        let var_b = pairs.iter().map(|p| (p.1 - mu_b).powi(2)).sum::<f64>() / (n - 1.0);
        let cov = pairs.iter().map(|p| (p.0 - mu_a) * (p.1 - mu_b)).sum::<f64>() / (n - 1.0);
        let c1 = (0.01f64 * 255.0).powi(2);
        let c2 = (0.03f64 * 255.0).powi(2);
        ((2.0 * mu_a * mu_b + c1) * (2.0 * cov + c2)) / ((mu_a * mu_a + mu_b * mu_b + c1) * (var_a + var_b + c2))
    }

    #[test]
    fn test_ssim_map_matches_direct_window_statistics() {
        let a = GrayImage::from_fn(23, 17, |x, y| Luma([((x * 37 + y * 91) % 256) as u8]));
        let b = GrayImage::from_fn(23, 17, |x, y| Luma([((x * 13 + y * y * 7) % 256) as u8]));
        let (_, map) = ssim(&a, &b, 7);

        for y in 0..17 {
            for x in 0..23 {
                let expected = window_ssim(&a, &b, x, y, 3);
                let actual = map.get_pixel(x, y)[0] as f64;
                assert!((actual - expected).abs() < 1e-4, "({}, {}): {} vs {}", x, y, actual, expected);
            }
        }
    }

    #[test]
    fn test_blank_original_has_empty_text_mask() {
        let white = RgbImage::from_pixel(40, 40, Rgb([255, 255, 255]));
        let gray = imageops::grayscale(&white);
        let mask = text_mask(&gray, 11, 2.0, 4);
        assert!(mask.pixels().all(|p| p[0] == 0));

        let result = ComparisonEngine::default().compare(&white, &white);
        assert_eq!(result.text_region_match_percent, 100.0);
    }

    #[test]
    fn test_missing_text_lowers_text_match_more_than_pixel_match() {
        let page = page_with_text();
        let blank = RgbImage::from_pixel(80, 60, Rgb([255, 255, 255]));
        let result = ComparisonEngine::default().compare(&page, &blank);

        assert!(result.text_region_match_percent < result.pixel_match_percent);
        assert!(result.text_region_match_percent < 80.0);
        assert!(result.ssim_score < 0.9);
    }

    #[test]
    fn test_text_mask_covers_dark_strokes() {
        let gray = imageops::grayscale(&page_with_text());
        let mask = text_mask(&gray, 11, 2.0, 0);
        assert_eq!(mask.get_pixel(10, 25)[0], 255);
        assert_eq!(mask.get_pixel(40, 50)[0], 0);

        let dilated = text_mask(&gray, 11, 2.0, 4);
        assert_eq!(dilated.get_pixel(10, 16)[0], 255);
    }

    #[test]
    fn test_reconstruction_resized_to_original() {
        let page = page_with_text();
        let half = imageops::resize(&page, 40, 30, FilterType::Nearest);
        let result = ComparisonEngine::default().compare(&page, &half);
        assert_eq!(result.reconstructed_image.dimensions(), (80, 60));
        assert_eq!(result.diff_heatmap.dimensions(), (80, 60));
    }

    #[test]
    fn test_heatmap_endpoints() {
        let mut diff = GrayImage::new(2, 1);
        diff.put_pixel(1, 0, Luma([200]));
        let map = heatmap(&diff);
        assert_eq!(map.get_pixel(0, 0), &Rgb([0, 0, 128]));
        assert_eq!(map.get_pixel(1, 0), &Rgb([128, 0, 0]));
    }

    #[test]
    fn test_summary_rounding() {
        let result = VerificationResult {
            ssim_score: 0.876_543,
            pixel_match_percent: 91.234_5,
            text_region_match_percent: 70.005,
            ssim_map: SimilarityMap::new(1, 1),
            diff_heatmap: RgbImage::new(1, 1),
            reconstructed_image: RgbImage::new(1, 1),
        };
        let summary = result.summary();
        assert_eq!(summary.ssim_score, 0.8765);
        assert_eq!(summary.pixel_match_percent, 91.23);
    }
}
