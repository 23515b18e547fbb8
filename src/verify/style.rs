//! Per-region ink style sampled from the scan
//!
//! Pure function of a crop, so it can be tested apart from canvas
//! compositing.

use image::{Rgb, RgbImage};

/// Ink colour and weight of one text region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionStyle {
    pub ink: Rgb<u8>,
    pub bold: bool,
}

impl Default for RegionStyle {
    fn default() -> Self {
        Self {
            ink: Rgb([0, 0, 0]),
            bold: false,
        }
    }
}

/// Rec. 601 luma
pub fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

/// Estimate the style of the text in `crop`.
///
/// Pixels darker than `ink_luminance` are ink. The ink colour is their mean
/// (black when there are none); the region is bold when the ink covers more
/// than `bold_density` of the crop.
pub fn estimate_style(crop: &RgbImage, ink_luminance: u8, bold_density: f32) -> RegionStyle {
    let total = crop.width() as usize * crop.height() as usize;
    if total == 0 {
        return RegionStyle::default();
    }

    let threshold = ink_luminance as f32;
    let mut sums = [0u64; 3];
    let mut dark = 0usize;
    for pixel in crop.pixels() {
        if luminance(pixel) < threshold {
            dark += 1;
            for (sum, &channel) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += channel as u64;
            }
        }
    }

    let ink = if dark > 0 {
        let mean = |sum: u64| (sum / dark as u64) as u8;
        Rgb([mean(sums[0]), mean(sums[1]), mean(sums[2])])
    } else {
        Rgb([0, 0, 0])
    };

    RegionStyle {
        ink,
        bold: dark as f32 / total as f32 > bold_density,
    }
}
