//! Transcript Verification
//!
//! Re-synthesizes a page from its detections and scores the synthesis
//! against the scan. Scores are reported as-is; pass/fail policy belongs to
//! the caller.

pub mod compare;
pub mod reconstruct;
pub mod render;
pub mod style;

pub use compare::{ComparisonEngine, VerificationResult, VerificationSummary};
pub use reconstruct::Reconstructor;
pub use render::TextPainter;
pub use style::RegionStyle;

use image::RgbImage;

use crate::config::{ComparisonConfig, ReconstructionConfig};
use crate::vision::Detection;

/// Reconstruction followed by comparison
#[derive(Debug)]
pub struct Verifier {
    reconstructor: Reconstructor,
    comparison: ComparisonEngine,
}

impl Verifier {
    pub fn new(reconstruction: &ReconstructionConfig, comparison: &ComparisonConfig) -> Self {
        Self {
            reconstructor: Reconstructor::new(reconstruction.clone()),
            comparison: ComparisonEngine::new(comparison.clone()),
        }
    }

    /// Verifier drawing with a specific painter
    pub fn with_painter(reconstruction: &ReconstructionConfig, comparison: &ComparisonConfig, painter: TextPainter) -> Self {
        Self {
            reconstructor: Reconstructor::with_painter(reconstruction.clone(), painter),
            comparison: ComparisonEngine::new(comparison.clone()),
        }
    }

    /// Reconstruct `original` from `detections` and compare the two
    pub fn verify(&self, original: &RgbImage, detections: &[Detection]) -> VerificationResult {
        let (width, height) = original.dimensions();
        let reconstructed = self.reconstructor.reconstruct(width, height, detections, Some(original));
        self.comparison.compare(original, &reconstructed)
    }
}
