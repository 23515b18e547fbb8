//! Page Orchestration
//!
//! Runs one page through variant generation, fusion, layout and optional
//! verification. Pages share no mutable state, so documents are processed
//! page-parallel.

use std::time::Instant;

use image::DynamicImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::ScanError;
use crate::verify::{TextPainter, VerificationResult, Verifier};
use crate::vision::{Detection, FusionEngine, LayoutFormatter, Line, TextDetector, VariantGenerator};

/// Text recovered from one page
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageTranscript {
    /// 1-based page number
    pub page_number: usize,
    /// Lines in reading order
    pub lines: Vec<Line>,
    /// Formatted text with indentation and paragraph breaks
    pub raw_text: String,
    /// Mean consensus confidence, 0.0 when nothing was found
    pub average_confidence: f32,
    /// Consensus detections in reading order, in deskewed page coordinates
    pub detections: Vec<Detection>,
}

impl PageTranscript {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Everything produced for one page
#[derive(Debug, Clone)]
pub struct PageResult {
    pub transcript: PageTranscript,
    /// Present when verification was requested
    pub verification: Option<VerificationResult>,
    /// Deskew rotation applied before detection (degrees)
    pub skew_angle: Option<f32>,
}

/// Results for a multi-page document
#[derive(Debug, Clone)]
pub struct DocumentTranscript {
    /// Pages in document order
    pub pages: Vec<PageResult>,
    /// Page texts separated by blank lines
    pub text: String,
    /// Mean of the page confidences
    pub average_confidence: f32,
}

impl DocumentTranscript {
    fn from_pages(pages: Vec<PageResult>) -> Self {
        let text = pages
            .iter()
            .map(|p| p.transcript.raw_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let average_confidence = if pages.is_empty() {
            0.0
        } else {
            pages.iter().map(|p| p.transcript.average_confidence).sum::<f32>() / pages.len() as f32
        };
        Self {
            pages,
            text,
            average_confidence,
        }
    }

    pub fn transcripts(&self) -> impl Iterator<Item = &PageTranscript> {
        self.pages.iter().map(|p| &p.transcript)
    }

    /// Whether the document confidence falls below the caller's threshold
    pub fn needs_review(&self, threshold: f32) -> bool {
        self.average_confidence < threshold
    }
}

/// Fuses, orders and optionally verifies page transcripts
#[derive(Debug)]
pub struct PagePipeline {
    generator: VariantGenerator,
    fusion: FusionEngine,
    layout: LayoutFormatter,
    verifier: Verifier,
}

impl PagePipeline {
    /// Build a pipeline; fonts for verification are loaded once here
    pub fn new(config: PipelineConfig) -> Self {
        let verifier = Verifier::new(&config.reconstruction, &config.comparison);
        Self::with_verifier(config, verifier)
    }

    /// Build a pipeline whose verification draws with `painter`
    pub fn with_painter(config: PipelineConfig, painter: TextPainter) -> Self {
        let verifier = Verifier::with_painter(&config.reconstruction, &config.comparison, painter);
        Self::with_verifier(config, verifier)
    }

    fn with_verifier(config: PipelineConfig, verifier: Verifier) -> Self {
        Self {
            generator: VariantGenerator::new(config.preprocess),
            fusion: FusionEngine::new(config.fusion),
            layout: LayoutFormatter::new(config.layout),
            verifier,
        }
    }

    /// Process one decoded page
    pub fn process_page(
        &self,
        detector: &dyn TextDetector,
        image: &DynamicImage,
        page_number: usize,
        verify: bool,
    ) -> Result<PageResult, ScanError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(ScanError::EmptyImage { width, height });
        }
        let start = Instant::now();

        let variant_set = self.generator.generate(image);
        let outcome = self.fusion.fuse_variants(detector, &variant_set.variants);

        let (lines, formatted) = self.layout.layout(&outcome.detections());
        let detections: Vec<Detection> = lines.iter().flat_map(|l| l.detections.iter().cloned()).collect();
        let raw_text = if formatted.trim().is_empty() {
            outcome.merged_text()
        } else {
            formatted
        };
        debug!("Page {}: {} lines, {} detections", page_number, lines.len(), detections.len());

        let verification = verify.then(|| {
            let base = variant_set.base().to_rgb8();
            self.verifier.verify(&base, &detections)
        });

        info!(
            "Page {} processed in {:?}: {} detections, confidence {:.3}{}",
            page_number,
            start.elapsed(),
            detections.len(),
            outcome.average_confidence,
            verification
                .as_ref()
                .map(|v| format!(", verification {:.2}%", v.overall_match()))
                .unwrap_or_default()
        );

        Ok(PageResult {
            transcript: PageTranscript {
                page_number,
                lines,
                raw_text,
                average_confidence: outcome.average_confidence,
                detections,
            },
            verification,
            skew_angle: variant_set.skew_angle,
        })
    }

    /// Decode image bytes and process them as one page
    pub fn process_page_bytes(
        &self,
        detector: &dyn TextDetector,
        bytes: &[u8],
        page_number: usize,
        verify: bool,
    ) -> Result<PageResult, ScanError> {
        let image = image::load_from_memory(bytes)?;
        self.process_page(detector, &image, page_number, verify)
    }

    /// Process every page concurrently; pages are numbered from 1 in order.
    /// The first fatal page error fails the document.
    pub fn process_document(
        &self,
        detector: &dyn TextDetector,
        pages: &[DynamicImage],
        verify: bool,
    ) -> Result<DocumentTranscript, ScanError> {
        let start = Instant::now();
        let results = pages
            .par_iter()
            .enumerate()
            .map(|(i, page)| self.process_page(detector, page, i + 1, verify))
            .collect::<Result<Vec<_>, _>>()?;

        let document = DocumentTranscript::from_pages(results);
        info!(
            "Processed {} pages in {:?} (confidence {:.3})",
            pages.len(),
            start.elapsed(),
            document.average_confidence
        );
        Ok(document)
    }
}
