//! Polygon and box geometry for text detections
//!
//! Detections arrive as 4-point polygons that may be rotated or vertical.
//! Most of the heuristics downstream only need the axis-aligned envelope,
//! so `Quad` carries the polygon and `BoxRect` the envelope.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Ordered 4-point polygon (top-left, top-right, bottom-right, bottom-left
/// for upright text; any winding for rotated text)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad(pub [[f32; 2]; 4]);

impl Quad {
    /// Build a quad from an engine polygon.
    ///
    /// Returns `None` unless the polygon has at least 4 finite points; extra
    /// points beyond the fourth are folded into the envelope corners.
    pub fn from_points(points: &[[f32; 2]]) -> Option<Self> {
        if points.len() < 4 || points.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return None;
        }
        if points.len() == 4 {
            return Some(Self([points[0], points[1], points[2], points[3]]));
        }
        let rect = BoxRect::enclosing(points)?;
        Some(rect.to_quad())
    }

    /// Axis-aligned rectangle quad
    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self([
            [x, y],
            [x + width, y],
            [x + width, y + height],
            [x, y + height],
        ])
    }

    /// Points as a slice
    pub fn points(&self) -> &[[f32; 2]; 4] {
        &self.0
    }

    /// Lexicographic order over the corner coordinates
    pub fn total_cmp(&self, other: &Quad) -> Ordering {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Mean of the four corners
    pub fn centroid(&self) -> (f32, f32) {
        let (sx, sy) = self.0.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
        (sx / 4.0, sy / 4.0)
    }

    /// Axis-aligned envelope
    pub fn bounds(&self) -> BoxRect {
        let mut rect = BoxRect {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        };
        for p in &self.0 {
            rect.min_x = rect.min_x.min(p[0]);
            rect.min_y = rect.min_y.min(p[1]);
            rect.max_x = rect.max_x.max(p[0]);
            rect.max_y = rect.max_y.max(p[1]);
        }
        rect
    }

    /// A quad is degenerate when its envelope has no area
    pub fn is_degenerate(&self) -> bool {
        self.bounds().area() <= 0.0
    }

    /// Multiply every coordinate by `factor`
    pub fn scaled(&self, factor: f32) -> Self {
        let mut points = self.0;
        for p in &mut points {
            p[0] *= factor;
            p[1] *= factor;
        }
        Self(points)
    }
}

/// Axis-aligned rectangle in floating point pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxRect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoxRect {
    /// Smallest rectangle enclosing all points
    pub fn enclosing(points: &[[f32; 2]]) -> Option<Self> {
        let first = points.first()?;
        let mut rect = Self {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for p in &points[1..] {
            rect.min_x = rect.min_x.min(p[0]);
            rect.min_y = rect.min_y.min(p[1]);
            rect.max_x = rect.max_x.max(p[0]);
            rect.max_y = rect.max_y.max(p[1]);
        }
        Some(rect)
    }

    pub fn width(&self) -> f32 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }

    pub fn to_quad(&self) -> Quad {
        Quad::from_rect(self.min_x, self.min_y, self.width(), self.height())
    }

    /// Area of the overlap with `other`, zero when the boxes only touch
    pub fn intersection_area(&self, other: &BoxRect) -> f32 {
        let x1 = self.min_x.max(other.min_x);
        let y1 = self.min_y.max(other.min_y);
        let x2 = self.max_x.min(other.max_x);
        let y2 = self.max_y.min(other.max_y);
        if x2 > x1 && y2 > y1 {
            (x2 - x1) * (y2 - y1)
        } else {
            0.0
        }
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoxRect) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Fraction of `self` covered by `other`
    pub fn covered_by(&self, other: &BoxRect) -> f32 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / area
    }
}

/// Euclidean distance between two points
pub fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_requires_four_points() {
        assert!(Quad::from_points(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]).is_none());
        assert!(Quad::from_points(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]).is_some());
    }

    #[test]
    fn test_quad_rejects_non_finite() {
        let points = [[0.0, 0.0], [f32::NAN, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(Quad::from_points(&points).is_none());
    }

    #[test]
    fn test_many_point_polygon_folds_to_envelope() {
        let points = [[2.0, 1.0], [8.0, 0.0], [10.0, 4.0], [6.0, 9.0], [0.0, 5.0]];
        let quad = Quad::from_points(&points).unwrap();
        let b = quad.bounds();
        assert_eq!((b.min_x, b.min_y, b.max_x, b.max_y), (0.0, 0.0, 10.0, 9.0));
    }

    #[test]
    fn test_degenerate_quad() {
        let flat = Quad::from_rect(10.0, 10.0, 50.0, 0.0);
        assert!(flat.is_degenerate());
        assert!(!Quad::from_rect(10.0, 10.0, 50.0, 2.0).is_degenerate());
    }

    #[test]
    fn test_centroid_of_rotated_quad() {
        let quad = Quad([[5.0, 0.0], [10.0, 5.0], [5.0, 10.0], [0.0, 5.0]]);
        assert_eq!(quad.centroid(), (5.0, 5.0));
    }

    #[test]
    fn test_iou_and_containment() {
        let a = BoxRect { min_x: 0.0, min_y: 0.0, max_x: 10.0, max_y: 10.0 };
        let b = BoxRect { min_x: 5.0, min_y: 0.0, max_x: 15.0, max_y: 10.0 };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);

        let inner = BoxRect { min_x: 2.0, min_y: 2.0, max_x: 4.0, max_y: 4.0 };
        assert!((inner.covered_by(&a) - 1.0).abs() < 1e-6);
        assert!(a.covered_by(&inner) < 0.1);
    }

    #[test]
    fn test_touching_boxes_do_not_intersect() {
        let a = BoxRect { min_x: 0.0, min_y: 0.0, max_x: 10.0, max_y: 10.0 };
        let b = BoxRect { min_x: 10.0, min_y: 0.0, max_x: 20.0, max_y: 10.0 };
        assert_eq!(a.intersection_area(&b), 0.0);
        assert_eq!(a.iou(&b), 0.0);
    }
}
