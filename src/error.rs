//! Fatal errors
//!
//! Only failures that leave nothing to work with surface here. A failed
//! preprocessing step or engine call is logged and skipped instead, and
//! "no text found" is an ordinary empty result.

use thiserror::Error;

/// Errors that abort processing of a page
#[derive(Debug, Error)]
pub enum ScanError {
    /// Image bytes could not be decoded
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// Reading input or writing artifacts failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Recorded engine output is not valid JSON of the expected shape
    #[error("malformed engine output: {0}")]
    EngineOutput(#[from] serde_json::Error),

    /// Image has no pixels
    #[error("image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}
