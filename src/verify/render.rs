//! Glyph rendering for reconstruction
//!
//! Text is rendered into a coverage mask first and composited with the ink
//! colour afterwards, so rotation and opacity work the same for every
//! region. Without any usable font file, glyphs become solid blocks.

use std::fmt;

use ab_glyph::{FontVec, PxScale};
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use tracing::{debug, warn};

/// Advance of a block glyph, as a fraction of the font size
const BLOCK_ADVANCE: f32 = 0.6;

/// Renders text masks from the first loadable font, or block glyphs
pub struct TextPainter {
    regular: Option<FontVec>,
    bold: Option<FontVec>,
}

impl fmt::Debug for TextPainter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextPainter")
            .field("regular", &self.regular.is_some())
            .field("bold", &self.bold.is_some())
            .finish()
    }
}

impl TextPainter {
    /// Load the first readable font from each list
    pub fn load(regular_paths: &[String], bold_paths: &[String]) -> Self {
        let regular = load_font(regular_paths);
        let bold = load_font(bold_paths);
        if regular.is_none() {
            warn!("No usable font found, reconstruction will draw block glyphs");
        }
        Self { regular, bold }
    }

    /// Painter drawing block glyphs only
    pub fn without_fonts() -> Self {
        Self {
            regular: None,
            bold: None,
        }
    }

    pub fn has_font(&self) -> bool {
        self.regular.is_some()
    }

    /// Width in pixels of `text` rendered at `size`
    pub fn measure(&self, text: &str, size: f32, bold: bool) -> u32 {
        match self.face(bold) {
            Some((font, faux)) => {
                let (w, _) = text_size(PxScale::from(size), font, text);
                if faux {
                    w + faux_offset(size)
                } else {
                    w
                }
            }
            None => block_advance(size) * text.chars().count() as u32,
        }
    }

    /// Coverage mask of `text` at `size`, trimmed to the inked pixels.
    /// Empty (0x0) when nothing is inked.
    pub fn render_mask(&self, text: &str, size: f32, bold: bool) -> GrayImage {
        let mask = match self.face(bold) {
            Some((font, faux)) => {
                let scale = PxScale::from(size);
                let (w, h) = text_size(scale, font, text);
                let pad = (size / 4.0).ceil() as u32 + 1;
                let extra = if faux { faux_offset(size) } else { 0 };
                let height = h.max((size * 1.4).ceil() as u32);
                let mut mask = GrayImage::new(w + extra + 2 * pad, height + 2 * pad);
                draw_text_mut(&mut mask, Luma([255u8]), pad as i32, pad as i32, scale, font, text);
                if faux {
                    draw_text_mut(&mut mask, Luma([255u8]), (pad + extra) as i32, pad as i32, scale, font, text);
                }
                mask
            }
            None => block_mask(text, size, bold),
        };
        trim(&mask)
    }

    /// Font to draw with and whether bold must be faked
    fn face(&self, bold: bool) -> Option<(&FontVec, bool)> {
        match (bold, self.bold.as_ref(), self.regular.as_ref()) {
            (true, Some(font), _) => Some((font, false)),
            (true, None, Some(font)) => Some((font, true)),
            (false, _, Some(font)) => Some((font, false)),
            (false, _, None) => None,
            (true, None, None) => None,
        }
    }
}

fn load_font(paths: &[String]) -> Option<FontVec> {
    for path in paths {
        let Ok(data) = std::fs::read(path) else {
            continue;
        };
        match FontVec::try_from_vec(data) {
            Ok(font) => {
                debug!("Loaded font {}", path);
                return Some(font);
            }
            Err(e) => debug!("Skipping font {}: {}", path, e),
        }
    }
    None
}

fn faux_offset(size: f32) -> u32 {
    ((size / 25.0).round() as u32).max(1)
}

fn block_advance(size: f32) -> u32 {
    ((size * BLOCK_ADVANCE).round() as u32).max(1)
}

/// One filled block per visible character
fn block_mask(text: &str, size: f32, bold: bool) -> GrayImage {
    let advance = block_advance(size);
    let height = (size.round() as u32).max(1);
    let count = text.chars().count() as u32;
    let mut mask = GrayImage::new(advance * count, height);

    let (inset_l, inset_r) = if bold { (0, advance) } else { (advance / 10, advance - advance / 10) };
    let top = (height as f32 * 0.15) as u32;
    let bottom = ((height as f32 * 0.85).ceil() as u32).clamp(top + 1, height);

    for (i, ch) in text.chars().enumerate() {
        if ch.is_whitespace() {
            continue;
        }
        let x0 = i as u32 * advance;
        for y in top..bottom {
            for x in (x0 + inset_l)..(x0 + inset_r.max(inset_l + 1)).min(x0 + advance) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    mask
}

/// Crop a mask to the bounding box of its non-zero pixels
fn trim(mask: &GrayImage) -> GrayImage {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] > 0 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x || min_y > max_y {
        return GrayImage::new(0, 0);
    }
    imageops::crop_imm(mask, min_x, min_y, max_x - min_x + 1, max_y - min_y + 1).to_image()
}

/// Composite `ink` onto `canvas` through `mask` placed at (`x`, `y`),
/// scaled by `alpha`. Pixels outside the canvas are clipped.
pub fn blend_mask(canvas: &mut RgbImage, mask: &GrayImage, x: i64, y: i64, ink: Rgb<u8>, alpha: u8) {
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    let opacity = alpha as f32 / 255.0;
    for (mx, my, coverage) in mask.enumerate_pixels() {
        if coverage[0] == 0 {
            continue;
        }
        let (px, py) = (x + mx as i64, y + my as i64);
        if px < 0 || py < 0 || px >= cw || py >= ch {
            continue;
        }
        let a = coverage[0] as f32 / 255.0 * opacity;
        let pixel = canvas.get_pixel_mut(px as u32, py as u32);
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 * (1.0 - a) + ink[c] as f32 * a).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconstructionConfig;

    #[test]
    fn test_block_glyph_width_and_spaces() {
        let painter = TextPainter::without_fonts();
        assert!(!painter.has_font());
        assert_eq!(painter.measure("abc", 20.0, false), 36);

        let mask = painter.render_mask("a b", 20.0, false);
        // Trimmed to the ink: first block starts at its inset, last ends before its inset
        assert_eq!(mask.width(), 12 * 3 - 2);
        let gap = mask.get_pixel(12, mask.height() / 2)[0];
        assert_eq!(gap, 0);
    }

    #[test]
    fn test_bold_blocks_are_wider() {
        let painter = TextPainter::without_fonts();
        let regular = painter.render_mask("ab", 20.0, false);
        let bold = painter.render_mask("ab", 20.0, true);
        let ink = |m: &GrayImage| m.pixels().filter(|p| p[0] > 0).count();
        assert!(ink(&bold) > ink(&regular));
    }

    #[test]
    fn test_whitespace_renders_nothing() {
        let mask = TextPainter::without_fonts().render_mask("   ", 20.0, false);
        assert_eq!(mask.dimensions(), (0, 0));
    }

    #[test]
    fn test_missing_font_files_fall_back() {
        let painter = TextPainter::load(&["/nonexistent/font.ttf".to_string()], &[]);
        assert!(!painter.has_font());
    }

    /// Regular face from the default search paths, if this machine has one
    fn system_font() -> Option<FontVec> {
        load_font(&ReconstructionConfig::default().font_paths)
    }

    #[test]
    fn test_font_mask_is_inked_and_fits_measured_width() {
        let Some(font) = system_font() else {
            return;
        };
        let painter = TextPainter {
            regular: Some(font),
            bold: None,
        };
        assert!(painter.has_font());

        let mask = painter.render_mask("Hello", 32.0, false);
        assert!(mask.width() > 0 && mask.height() > 0);
        assert!(mask.pixels().any(|p| p[0] > 128));
        assert!(mask.width() <= painter.measure("Hello", 32.0, false) + 1);
        assert!(mask.height() <= 32 * 2);
    }

    #[test]
    fn test_regular_face_is_double_struck_for_bold() {
        let Some(font) = system_font() else {
            return;
        };
        let painter = TextPainter {
            regular: Some(font),
            bold: None,
        };
        let regular = painter.render_mask("Hello", 32.0, false);
        let bold = painter.render_mask("Hello", 32.0, true);
        let ink = |m: &GrayImage| m.pixels().filter(|p| p[0] > 0).count();

        assert!(bold.width() > regular.width());
        assert!(ink(&bold) > ink(&regular));
        assert!(painter.measure("Hello", 32.0, true) > painter.measure("Hello", 32.0, false));
    }

    #[test]
    fn test_blend_mask_clips_and_mixes() {
        let mut canvas = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let mask = GrayImage::from_pixel(3, 3, Luma([255]));
        blend_mask(&mut canvas, &mask, 2, 2, Rgb([0, 0, 0]), 255);
        assert_eq!(canvas.get_pixel(3, 3), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(1, 1), &Rgb([255, 255, 255]));

        let mut faint = RgbImage::from_pixel(2, 2, Rgb([255, 255, 255]));
        blend_mask(&mut faint, &mask, 0, 0, Rgb([0, 0, 0]), 40);
        assert_eq!(faint.get_pixel(0, 0), &Rgb([215, 215, 215]));
    }
}
