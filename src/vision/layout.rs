//! Reading order recovery
//!
//! Sorts consensus detections into lines and paragraphs from box geometry
//! alone and renders an indented plain-text transcript. Multi-column pages
//! are flattened row by row.

use serde::Serialize;

use super::Detection;
use crate::config::LayoutConfig;

/// Detections sharing a baseline, left to right
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Line {
    pub detections: Vec<Detection>,
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
    /// Indent levels relative to the first line
    pub indent_level: usize,
    /// A blank line separates this line from the previous one
    pub paragraph_break_before: bool,
}

impl Line {
    fn from_detections(detections: Vec<Detection>) -> Self {
        let mut top = f32::INFINITY;
        let mut bottom = f32::NEG_INFINITY;
        let mut left = f32::INFINITY;
        let mut right = f32::NEG_INFINITY;
        for d in &detections {
            let b = d.bounds();
            top = top.min(b.min_y);
            bottom = bottom.max(b.max_y);
            left = left.min(b.min_x);
            right = right.max(b.max_x);
        }
        Self {
            detections,
            top,
            bottom,
            left,
            right,
            indent_level: 0,
            paragraph_break_before: false,
        }
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    /// Words joined with single spaces
    pub fn text(&self) -> String {
        self.detections
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Groups detections into lines and formats them as text
#[derive(Debug, Clone, Default)]
pub struct LayoutFormatter {
    config: LayoutConfig,
}

impl LayoutFormatter {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// Vertical tolerance for two centroids to share a line:
    /// a fraction of the average detection height, floored
    pub fn line_tolerance(&self, detections: &[Detection]) -> f32 {
        if detections.is_empty() {
            return self.config.min_line_tolerance;
        }
        let avg_height = detections.iter().map(|d| d.bounds().height()).sum::<f32>() / detections.len() as f32;
        (avg_height * self.config.line_tolerance_ratio).max(self.config.min_line_tolerance)
    }

    /// Top-to-bottom by line band, then left-to-right
    pub fn sort(&self, detections: &[Detection]) -> Vec<Detection> {
        let tolerance = self.line_tolerance(detections).max(f32::EPSILON);
        let mut sorted = detections.to_vec();
        sorted.sort_by(|a, b| {
            let (ax, ay) = a.centroid();
            let (bx, by) = b.centroid();
            let band_a = (ay / tolerance).floor() as i64;
            let band_b = (by / tolerance).floor() as i64;
            band_a.cmp(&band_b).then_with(|| ax.total_cmp(&bx))
        });
        sorted
    }

    /// Sort detections and split them into annotated lines
    pub fn lines(&self, detections: &[Detection]) -> Vec<Line> {
        if detections.is_empty() {
            return Vec::new();
        }
        let tolerance = self.line_tolerance(detections);

        let mut groups: Vec<Vec<Detection>> = Vec::new();
        let mut prev_cy: Option<f32> = None;
        for detection in self.sort(detections) {
            let (_, cy) = detection.centroid();
            let same_line = prev_cy.is_some_and(|prev| (cy - prev).abs() <= tolerance);
            match groups.last_mut() {
                Some(current) if same_line => current.push(detection),
                _ => groups.push(vec![detection]),
            }
            prev_cy = Some(cy);
        }

        let mut lines: Vec<Line> = groups
            .into_iter()
            .map(|mut group| {
                group.sort_by(|a, b| a.centroid().0.total_cmp(&b.centroid().0));
                Line::from_detections(group)
            })
            .collect();

        let base_left = lines[0].left;
        let mut prev_bottom: Option<f32> = None;
        for line in &mut lines {
            let offset = line.left - base_left;
            line.indent_level = if offset > 0.0 && self.config.indent_step > 0.0 {
                (offset / self.config.indent_step).floor() as usize
            } else {
                0
            };
            if let Some(prev) = prev_bottom {
                line.paragraph_break_before = line.top - prev > line.height() * self.config.paragraph_gap_ratio;
            }
            prev_bottom = Some(line.bottom);
        }

        lines
    }

    /// Render lines as text: one line per row, indent units for each level,
    /// a blank line before each paragraph
    pub fn format(&self, lines: &[Line]) -> String {
        let mut out: Vec<String> = Vec::with_capacity(lines.len());
        for line in lines {
            if line.paragraph_break_before {
                out.push(String::new());
            }
            out.push(format!("{}{}", self.config.indent_unit.repeat(line.indent_level), line.text()));
        }
        out.join("\n")
    }

    /// Lines and formatted text in one call
    pub fn layout(&self, detections: &[Detection]) -> (Vec<Line>, String) {
        let lines = self.lines(detections);
        let text = self.format(&lines);
        (lines, text)
    }
}
