//! scanfuse - replay recorded OCR output through the fusion and
//! verification pipeline

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use scanfuse::config::{self, PipelineConfig};
use scanfuse::{PagePipeline, PageTranscript, RecordedDetector, VerificationSummary};

/// scanfuse - fuse and verify OCR transcripts
#[derive(Parser, Debug)]
#[command(name = "scanfuse")]
#[command(about = "Fuse recorded OCR detections into a transcript and verify it against the scan")]
struct Args {
    /// Page image to process
    image: PathBuf,

    /// Recorded engine output for the page (JSON list of text/confidence/polygon)
    #[arg(short, long)]
    detections: PathBuf,

    /// Pipeline configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reconstruct the page and score the transcript against it
    #[arg(long)]
    verify: bool,

    /// Write transcript JSON, reconstruction and heatmap here
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Confidence below which the page is flagged for review
    #[arg(long, default_value = "0.6")]
    review_threshold: f32,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct PageReport<'a> {
    transcript: &'a PageTranscript,
    skew_angle: Option<f32>,
    needs_review: bool,
    verification: Option<VerificationSummary>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_or_default_config(args.config.as_deref())?;

    let image = image::open(&args.image).with_context(|| format!("Failed to open image: {:?}", args.image))?;
    let detector = RecordedDetector::from_file(&args.detections, image.width(), image.height())
        .with_context(|| format!("Failed to load detections: {:?}", args.detections))?;
    info!("Replaying {} recorded detections on {:?}", detector.len(), args.image);

    let pipeline = PagePipeline::new(config);
    let page = pipeline.process_page(&detector, &image, 1, args.verify)?;
    let transcript = &page.transcript;
    let needs_review = transcript.average_confidence < args.review_threshold;

    println!("{}", transcript.raw_text);
    println!();
    println!(
        "confidence: {:.3}{}",
        transcript.average_confidence,
        if needs_review { " (needs review)" } else { "" }
    );
    if let Some(angle) = page.skew_angle {
        println!("deskew: {:.2} degrees", angle);
    }
    if let Some(verification) = &page.verification {
        let summary = verification.summary();
        println!(
            "ssim: {:.4}  pixel match: {:.2}%  text match: {:.2}%  overall: {:.2}%",
            summary.ssim_score, summary.pixel_match_percent, summary.text_region_match_percent, summary.overall_match
        );
    }

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {:?}", dir))?;

        let report = PageReport {
            transcript,
            skew_angle: page.skew_angle,
            needs_review,
            verification: page.verification.as_ref().map(|v| v.summary()),
        };
        let report_path = dir.join("transcript.json");
        std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {:?}", report_path))?;

        if let Some(verification) = &page.verification {
            verification.reconstructed_image.save(dir.join("reconstructed.png"))?;
            verification.diff_heatmap.save(dir.join("diff_heatmap.png"))?;
        }
        info!("Wrote results to {:?}", dir);
    }

    Ok(())
}

/// Explicit config file, else the platform config file if present, else defaults
fn load_or_default_config(explicit: Option<&Path>) -> Result<PipelineConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    match config::default_config_path() {
        Ok(path) if path.exists() => {
            let config = config::load_config(&path)?;
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        Ok(_) => {
            info!("Using default configuration");
            Ok(PipelineConfig::default())
        }
        Err(e) => {
            warn!("{}, using default configuration", e);
            Ok(PipelineConfig::default())
        }
    }
}
