//! Text detection/recognition engine contract
//!
//! The recognition engine is an opaque collaborator: image in, detections out.
//! Callers construct their engine once and pass it by reference into the
//! pipeline, so a fake engine can stand in during tests.

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ScanError;

/// Text detection and recognition over a whole raster image
pub trait TextDetector: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &str {
        "detector"
    }

    /// Detect and recognize every text region in `image`.
    ///
    /// Polygons are in `image` pixel coordinates.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<EngineDetection>>;
}

/// Single region reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDetection {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Bounding polygon points
    pub polygon: Vec<[f32; 2]>,
}

/// Detector replaying engine output recorded on an image of known size.
///
/// Polygons are rescaled to the size of whatever image `detect` receives,
/// so the replay lines up with upscaled variants too.
#[derive(Debug, Clone)]
pub struct RecordedDetector {
    detections: Vec<EngineDetection>,
    frame: (u32, u32),
}

impl RecordedDetector {
    /// Replay `detections` recorded on a `width` x `height` image
    pub fn new(detections: Vec<EngineDetection>, width: u32, height: u32) -> Self {
        Self {
            detections,
            frame: (width.max(1), height.max(1)),
        }
    }

    /// Parse a JSON array of detections
    pub fn from_json(json: &str, width: u32, height: u32) -> Result<Self, ScanError> {
        let detections: Vec<EngineDetection> = serde_json::from_str(json)?;
        Ok(Self::new(detections, width, height))
    }

    /// Load a JSON array of detections from disk
    pub fn from_file(path: &Path, width: u32, height: u32) -> Result<Self, ScanError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json, width, height)
    }

    /// Number of recorded detections
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

impl TextDetector for RecordedDetector {
    fn name(&self) -> &str {
        "recorded"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<EngineDetection>> {
        let sx = image.width() as f32 / self.frame.0 as f32;
        let sy = image.height() as f32 / self.frame.1 as f32;

        Ok(self
            .detections
            .iter()
            .map(|d| EngineDetection {
                text: d.text.clone(),
                confidence: d.confidence,
                polygon: d.polygon.iter().map(|p| [p[0] * sx, p[1] * sy]).collect(),
            })
            .collect())
    }
}
