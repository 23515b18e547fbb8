//! Cross-variant detection fusion
//!
//! Runs the engine once per preprocessing variant, pools every detection,
//! clusters them on a coarse centroid grid and votes on the text of each
//! cluster. Repeated passes over the same region rarely disagree by more
//! than a few pixels, so a fixed grid is enough to line them up.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::TextDetector;
use super::geometry::Quad;
use super::preprocess::PreprocessVariant;
use super::Detection;
use crate::config::FusionConfig;

/// Votes collected for one distinct text within a group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextVote {
    /// Normalized text
    pub text: String,
    /// Sum of the confidences of every occurrence
    pub confidence_sum: f32,
    /// Number of occurrences
    pub count: usize,
    /// Highest-confidence occurrence
    pub best: Detection,
}

impl TextVote {
    /// `confidence_sum / count * (1 + bonus * count)`: rewards both per-pass
    /// confidence and agreement across passes
    pub fn score(&self, agreement_bonus: f32) -> f32 {
        let count = self.count as f32;
        self.confidence_sum / count * (1.0 + agreement_bonus * count)
    }
}

/// Detections judged to be the same physical text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionGroup {
    /// Grid cell (row, column) of the member centroids
    pub cell: (i64, i64),
    /// Number of pooled detections in the group
    pub member_count: usize,
    /// Tally per distinct text, in first-seen order
    pub votes: Vec<TextVote>,
    /// Winning text with the polygon and confidence of its best occurrence
    pub representative: Detection,
}

/// Result of fusing one page
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusionOutcome {
    /// Consensus groups in (row, column) cell order
    pub groups: Vec<DetectionGroup>,
    /// Unweighted mean of the group confidences, 0.0 when nothing was found
    pub average_confidence: f32,
    /// Variants whose engine call succeeded
    pub variants_succeeded: usize,
    /// Variants whose engine call failed and were excluded
    pub variants_failed: usize,
}

impl FusionOutcome {
    /// The consensus set
    pub fn detections(&self) -> Vec<Detection> {
        self.groups.iter().map(|g| g.representative.clone()).collect()
    }

    /// Consensus texts joined with spaces, in cell order
    pub fn merged_text(&self) -> String {
        self.groups
            .iter()
            .map(|g| g.representative.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Merges the detections of several variants into one consensus set
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Run the engine on every variant and fuse the pooled detections
    pub fn fuse_variants(&self, detector: &dyn TextDetector, variants: &[PreprocessVariant]) -> FusionOutcome {
        let start = Instant::now();
        let (pooled, failed) = self.collect(detector, variants);

        let mut outcome = self.fuse(&pooled);
        outcome.variants_failed = failed;
        outcome.variants_succeeded = variants.len() - failed;

        info!(
            "Fused {} detections from {}/{} variants into {} groups (confidence {:.3}) in {:?}",
            pooled.len(),
            outcome.variants_succeeded,
            variants.len(),
            outcome.groups.len(),
            outcome.average_confidence,
            start.elapsed()
        );
        outcome
    }

    /// Run the engine once per variant and pool the results in page
    /// coordinates. Returns the pool and the number of failed variants.
    pub fn collect(&self, detector: &dyn TextDetector, variants: &[PreprocessVariant]) -> (Vec<Detection>, usize) {
        let mut pooled = Vec::new();
        let mut failed = 0;

        for variant in variants {
            let results = match detector.detect(&variant.image) {
                Ok(results) => results,
                Err(e) => {
                    warn!(
                        "{} failed on variant '{}': {:#}",
                        detector.name(),
                        variant.kind.as_str(),
                        e
                    );
                    failed += 1;
                    continue;
                }
            };

            let reported = results.len();
            let unscale = if variant.scale > 0.0 { 1.0 / variant.scale } else { 1.0 };
            let before = pooled.len();
            pooled.extend(results.into_iter().filter_map(|r| {
                let polygon = Quad::from_points(&r.polygon)?.scaled(unscale);
                Detection::new(&r.text, r.confidence, polygon, variant.kind)
            }));

            debug!(
                "Variant '{}': {} detections ({} discarded)",
                variant.kind.as_str(),
                pooled.len() - before,
                reported - (pooled.len() - before)
            );
        }

        (pooled, failed)
    }

    /// Cluster and vote. Pure: the same pool always yields the same
    /// consensus, whatever order it arrives in.
    pub fn fuse(&self, pooled: &[Detection]) -> FusionOutcome {
        let cell_size = self.config.cell_size.max(1.0);
        let mut cells: BTreeMap<(i64, i64), Vec<&Detection>> = BTreeMap::new();
        for detection in pooled {
            let (cx, cy) = detection.centroid();
            let key = ((cy / cell_size).floor() as i64, (cx / cell_size).floor() as i64);
            cells.entry(key).or_default().push(detection);
        }

        let groups: Vec<DetectionGroup> = cells
            .into_iter()
            .map(|(cell, mut members)| {
                members.sort_by(|a, b| member_order(a, b));
                self.vote(cell, &members)
            })
            .collect();

        let average_confidence = if groups.is_empty() {
            0.0
        } else {
            groups.iter().map(|g| g.representative.confidence).sum::<f32>() / groups.len() as f32
        };

        FusionOutcome {
            groups,
            average_confidence,
            variants_succeeded: 0,
            variants_failed: 0,
        }
    }

    /// Tally normalized texts within one group and pick the winner
    fn vote(&self, cell: (i64, i64), members: &[&Detection]) -> DetectionGroup {
        let mut votes: Vec<TextVote> = Vec::new();
        for &detection in members {
            let text = normalize_text(&detection.text);
            match votes.iter_mut().find(|v| v.text == text) {
                Some(vote) => {
                    vote.confidence_sum += detection.confidence;
                    vote.count += 1;
                    if detection.confidence > vote.best.confidence {
                        vote.best = detection.clone();
                    }
                }
                None => votes.push(TextVote {
                    text,
                    confidence_sum: detection.confidence,
                    count: 1,
                    best: detection.clone(),
                }),
            }
        }

        let bonus = self.config.agreement_bonus;
        let winner = votes
            .iter()
            .max_by(|a, b| {
                a.score(bonus)
                    .total_cmp(&b.score(bonus))
                    .then_with(|| b.best.source_variant.cmp(&a.best.source_variant))
                    .then_with(|| b.text.cmp(&a.text))
            })
            .map(|vote| Detection {
                text: vote.text.clone(),
                confidence: vote.best.confidence,
                polygon: vote.best.polygon,
                source_variant: vote.best.source_variant,
            });

        DetectionGroup {
            cell,
            member_count: members.len(),
            representative: winner.unwrap_or_else(|| members[0].clone()),
            votes,
        }
    }
}

/// Collapse runs of whitespace so spacing differences do not split votes
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Total order over pooled detections: variant index first, then
/// confidence (descending), text and polygon
fn member_order(a: &Detection, b: &Detection) -> Ordering {
    a.source_variant
        .cmp(&b.source_variant)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.text.cmp(&b.text))
        .then_with(|| a.polygon.total_cmp(&b.polygon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::EngineDetection;
    use crate::vision::VariantKind;
    use anyhow::{anyhow, Result};
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn det(text: &str, confidence: f32, x: f32, y: f32, variant: VariantKind) -> Detection {
        Detection::new(text, confidence, Quad::from_rect(x, y, 40.0, 12.0), variant).unwrap()
    }

    fn variant(kind: VariantKind, scale: f32) -> PreprocessVariant {
        let size = (100.0 * scale) as u32;
        PreprocessVariant {
            kind,
            image: DynamicImage::new_rgb8(size, size),
            scale,
        }
    }

    /// Replays a fixed list per call, failing on the listed call numbers
    struct ScriptedDetector {
        outputs: Vec<Vec<EngineDetection>>,
        fail_on: Vec<usize>,
        calls: AtomicUsize,
    }

    impl TextDetector for ScriptedDetector {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<EngineDetection>> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(anyhow!("engine crashed"));
            }
            Ok(self.outputs.get(call).cloned().unwrap_or_default())
        }
    }

    fn engine_det(text: &str, confidence: f32, x: f32, y: f32, w: f32, h: f32) -> EngineDetection {
        EngineDetection {
            text: text.to_string(),
            confidence,
            polygon: vec![[x, y], [x + w, y], [x + w, y + h], [x, y + h]],
        }
    }

    #[test]
    fn test_count_aware_vote_beats_naive_average() {
        // Naive averaging picks "Tota1" (0.95 > 0.85); the agreement bonus
        // lets the three-way consensus win: 0.85 * 1.3 > 0.95 * 1.1
        let pooled = vec![
            det("Tota1", 0.95, 10.0, 10.0, VariantKind::Enhanced),
            det("Total", 0.85, 11.0, 10.0, VariantKind::Deskewed),
            det("Total", 0.85, 10.0, 11.0, VariantKind::BackgroundNormalized),
            det("Total", 0.85, 12.0, 10.0, VariantKind::Upscaled),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);

        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].representative.text, "Total");
        assert_eq!(outcome.groups[0].member_count, 4);
    }

    #[test]
    fn test_fusion_is_idempotent_and_order_independent() {
        let pooled = vec![
            det("Invoice", 0.91, 10.0, 10.0, VariantKind::Deskewed),
            det("Invoice", 0.93, 12.0, 9.0, VariantKind::Enhanced),
            det("Inv0ice", 0.93, 11.0, 10.0, VariantKind::BackgroundNormalized),
            det("Date", 0.80, 200.0, 10.0, VariantKind::Deskewed),
            det("Date", 0.80, 201.0, 10.0, VariantKind::Enhanced),
            det("Amount", 0.70, 10.0, 300.0, VariantKind::Deskewed),
        ];
        let engine = FusionEngine::default();
        let first = engine.fuse(&pooled);
        let second = engine.fuse(&pooled);
        assert_eq!(first, second);

        let mut reversed = pooled.clone();
        reversed.reverse();
        assert_eq!(engine.fuse(&reversed), first);
    }

    #[test]
    fn test_equal_confidence_tie_prefers_lower_variant() {
        let pooled = vec![
            det("Total", 0.9, 14.0, 10.0, VariantKind::Enhanced),
            det("Total", 0.9, 10.0, 10.0, VariantKind::Deskewed),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);
        let rep = &outcome.groups[0].representative;
        assert_eq!(rep.source_variant, VariantKind::Deskewed);
        assert_eq!(rep.polygon, Quad::from_rect(10.0, 10.0, 40.0, 12.0));
    }

    #[test]
    fn test_winning_polygon_is_best_occurrence() {
        let pooled = vec![
            det("Name", 0.70, 10.0, 10.0, VariantKind::Deskewed),
            det("Name", 0.95, 13.0, 11.0, VariantKind::Enhanced),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);
        let rep = &outcome.groups[0].representative;
        assert_eq!(rep.polygon, Quad::from_rect(13.0, 11.0, 40.0, 12.0));
        assert!((rep.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_whitespace_variants_share_a_vote() {
        assert_eq!(normalize_text("  Net   amount "), "Net amount");
        let pooled = vec![
            det("Net amount", 0.8, 10.0, 10.0, VariantKind::Deskewed),
            det("Net  amount", 0.9, 10.0, 10.0, VariantKind::Enhanced),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);
        assert_eq!(outcome.groups[0].votes.len(), 1);
        assert_eq!(outcome.groups[0].votes[0].count, 2);
    }

    #[test]
    fn test_groups_ordered_by_row_then_column() {
        let pooled = vec![
            det("C", 0.9, 10.0, 200.0, VariantKind::Deskewed),
            det("B", 0.9, 200.0, 10.0, VariantKind::Deskewed),
            det("A", 0.9, 10.0, 10.0, VariantKind::Deskewed),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);
        assert_eq!(outcome.merged_text(), "A B C");
    }

    #[test]
    fn test_page_confidence_is_mean_of_groups() {
        let pooled = vec![
            det("A", 0.9, 10.0, 10.0, VariantKind::Deskewed),
            det("B", 0.5, 300.0, 10.0, VariantKind::Deskewed),
        ];
        let outcome = FusionEngine::default().fuse(&pooled);
        assert!((outcome.average_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_empty_pool_yields_zero_confidence() {
        let outcome = FusionEngine::default().fuse(&[]);
        assert!(outcome.is_empty());
        assert_eq!(outcome.average_confidence, 0.0);
        assert_eq!(outcome.merged_text(), "");
    }

    #[test]
    fn test_failed_variant_is_excluded() {
        let detector = ScriptedDetector {
            outputs: vec![
                vec![engine_det("Hello", 0.8, 10.0, 10.0, 40.0, 12.0)],
                vec![engine_det("Hel1o", 0.99, 10.0, 10.0, 40.0, 12.0)],
                vec![engine_det("Hello", 0.9, 11.0, 10.0, 40.0, 12.0)],
            ],
            fail_on: vec![1],
            calls: AtomicUsize::new(0),
        };
        let variants = vec![
            variant(VariantKind::Deskewed, 1.0),
            variant(VariantKind::Enhanced, 1.0),
            variant(VariantKind::BackgroundNormalized, 1.0),
        ];

        let outcome = FusionEngine::default().fuse_variants(&detector, &variants);
        assert_eq!(outcome.variants_failed, 1);
        assert_eq!(outcome.variants_succeeded, 2);
        assert_eq!(outcome.groups[0].representative.text, "Hello");
        assert_eq!(outcome.groups[0].member_count, 2);
    }

    #[test]
    fn test_upscaled_detections_map_back_to_page() {
        let detector = ScriptedDetector {
            outputs: vec![
                vec![engine_det("Hello", 0.8, 10.0, 10.0, 40.0, 12.0)],
                vec![engine_det("Hello", 0.9, 40.0, 40.0, 160.0, 48.0)],
            ],
            fail_on: vec![],
            calls: AtomicUsize::new(0),
        };
        let variants = vec![variant(VariantKind::Deskewed, 1.0), variant(VariantKind::Upscaled, 4.0)];

        let outcome = FusionEngine::default().fuse_variants(&detector, &variants);
        assert_eq!(outcome.groups.len(), 1);
        let rep = &outcome.groups[0].representative;
        assert_eq!(rep.source_variant, VariantKind::Upscaled);
        assert_eq!(rep.polygon, Quad::from_rect(10.0, 10.0, 40.0, 12.0));
    }

    #[test]
    fn test_invalid_engine_output_discarded() {
        let detector = ScriptedDetector {
            outputs: vec![vec![
                engine_det("   ", 0.9, 10.0, 10.0, 40.0, 12.0),
                engine_det("flat", 0.9, 10.0, 10.0, 40.0, 0.0),
                EngineDetection {
                    text: "short".to_string(),
                    confidence: 0.9,
                    polygon: vec![[0.0, 0.0], [1.0, 1.0]],
                },
            ]],
            fail_on: vec![],
            calls: AtomicUsize::new(0),
        };
        let (pooled, failed) = FusionEngine::default().collect(&detector, &[variant(VariantKind::Deskewed, 1.0)]);
        assert!(pooled.is_empty());
        assert_eq!(failed, 0);
    }
}
