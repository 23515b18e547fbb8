//! scanfuse - OCR result fusion and transcript verification
//!
//! Runs a text detection engine over several preprocessed renderings of a
//! page, fuses the detections into one consensus transcript with reading
//! order, and verifies the transcript by re-synthesizing the page and
//! comparing it against the scan.
//!
//! The engine itself is a caller-supplied [`TextDetector`].

pub mod config;
pub mod error;
pub mod pipeline;
pub mod verify;
pub mod vision;

pub use config::PipelineConfig;
pub use error::ScanError;
pub use pipeline::{DocumentTranscript, PagePipeline, PageResult, PageTranscript};
pub use verify::{VerificationResult, VerificationSummary, Verifier};
pub use vision::{Detection, EngineDetection, RecordedDetector, TextDetector, VariantKind};
