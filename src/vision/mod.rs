//! Vision Layer
//!
//! Turns one page image into a consensus set of text detections:
//! preprocessing variants, one engine pass per variant, cross-variant
//! fusion, then reading order recovery.

pub mod engine;
pub mod fusion;
pub mod geometry;
pub mod layout;
pub mod preprocess;

pub use engine::{EngineDetection, RecordedDetector, TextDetector};
pub use fusion::{DetectionGroup, FusionEngine, FusionOutcome};
pub use geometry::{BoxRect, Quad};
pub use layout::{Line, LayoutFormatter};
pub use preprocess::{PreprocessVariant, VariantGenerator};

use serde::{Deserialize, Serialize};

/// Which preprocessing rendering a detection came from.
///
/// The declaration order is the variant index used for tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    /// Deskewed copy of the input
    Deskewed,
    /// Contrast stretch, denoise, equalize, sharpen, binarize
    Enhanced,
    /// Background divided out, gamma corrected
    BackgroundNormalized,
    /// Upscaled for small inputs
    Upscaled,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Deskewed => "deskewed",
            VariantKind::Enhanced => "enhanced",
            VariantKind::BackgroundNormalized => "background_normalized",
            VariantKind::Upscaled => "upscaled",
        }
    }
}

/// One recognized text region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Recognized text, trimmed and never empty
    pub text: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Bounding polygon, never degenerate
    pub polygon: Quad,
    /// Variant the detection was read from
    pub source_variant: VariantKind,
}

impl Detection {
    /// Build a detection, rejecting blank text and degenerate polygons
    pub fn new(text: &str, confidence: f32, polygon: Quad, source_variant: VariantKind) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || polygon.is_degenerate() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            confidence: if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 },
            polygon,
            source_variant,
        })
    }

    /// Upright rectangular detection
    pub fn from_rect(text: &str, confidence: f32, x: f32, y: f32, width: f32, height: f32) -> Option<Self> {
        Self::new(text, confidence, Quad::from_rect(x, y, width, height), VariantKind::Deskewed)
    }

    pub fn centroid(&self) -> (f32, f32) {
        self.polygon.centroid()
    }

    pub fn bounds(&self) -> BoxRect {
        self.polygon.bounds()
    }
}
