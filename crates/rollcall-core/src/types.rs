use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single landmark coordinate, normalized to the frame (0.0–1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Facial landmarks for one detected face in one frame (468-point face mesh).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSet {
    pub points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Landmark at `index`, or `None` if missing or non-finite.
    pub fn get(&self, index: usize) -> Option<Point> {
        self.points.get(index).copied().filter(Point::is_finite)
    }

    /// Pixel bounding box around all landmarks, expanded by a fixed margin
    /// and clamped to the frame.
    pub fn bounding_box(&self, width: u32, height: u32) -> Option<BoundingBox> {
        const MARGIN: i32 = 10;

        let mut min_x = f32::INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut max_y = f32::NEG_INFINITY;
        for p in self.points.iter().filter(|p| p.is_finite()) {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        if !min_x.is_finite() {
            return None;
        }

        let w = width as f32;
        let h = height as f32;
        let max_px_x = width.saturating_sub(1) as i32;
        let max_px_y = height.saturating_sub(1) as i32;
        Some(BoundingBox {
            x1: ((min_x * w) as i32 - MARGIN).max(0),
            y1: ((min_y * h) as i32 - MARGIN).max(0),
            x2: ((max_x * w) as i32 + MARGIN).min(max_px_x),
            y2: ((max_y * h) as i32 + MARGIN).min(max_px_y),
        })
    }
}

/// Face bounding box in frame pixels (inclusive corners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Coarse spatial key of the box center on a `grid`-pixel lattice.
    pub fn bucket(&self, grid: i32) -> BucketKey {
        let cx = (self.x1 + self.x2).div_euclid(2);
        let cy = (self.y1 + self.y2).div_euclid(2);
        BucketKey(cx.div_euclid(grid), cy.div_euclid(grid))
    }
}

/// Quantized face position used to follow "the same face" across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(pub i32, pub i32);

/// Normalized, fixed-length landmark encoding.
pub type FeatureVector = Vec<f32>;

/// Head pose under which an enrollment sample was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Angle {
    Frontal,
    Right,
    Left,
}

impl Angle {
    pub const ALL: [Angle; 3] = [Angle::Frontal, Angle::Right, Angle::Left];

    pub fn as_str(&self) -> &'static str {
        match self {
            Angle::Frontal => "frontal",
            Angle::Right => "right",
            Angle::Left => "left",
        }
    }

    /// Parse an angle tag, accepting the Spanish tags written by older stores.
    pub fn parse(tag: &str) -> Option<Angle> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "frontal" => Some(Angle::Frontal),
            "right" | "derecha" => Some(Angle::Right),
            "left" | "izquierda" => Some(Angle::Left),
            _ => None,
        }
    }
}

impl std::fmt::Display for Angle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-angle samples of one identity; an angle maps to `None` when it was
/// never captured.
pub type Samples = BTreeMap<Angle, Option<FeatureVector>>;

/// Result of attributing one feature vector to an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub label: String,
    pub confidence: f32,
    pub source: AttributionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionSource {
    /// Trained probabilistic classifier.
    Classifier,
    /// Nearest stored sample within the distance threshold.
    Fallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_margin_and_clamp() {
        let lm = LandmarkSet::new(vec![Point::new(0.0, 0.0), Point::new(0.5, 0.5)]);
        let bbox = lm.bounding_box(100, 100).unwrap();
        assert_eq!(bbox, BoundingBox { x1: 0, y1: 0, x2: 60, y2: 60 });

        let lm = LandmarkSet::new(vec![Point::new(0.5, 0.5), Point::new(1.0, 1.0)]);
        let bbox = lm.bounding_box(100, 100).unwrap();
        assert_eq!(bbox, BoundingBox { x1: 40, y1: 40, x2: 99, y2: 99 });
    }

    #[test]
    fn test_bounding_box_empty() {
        assert!(LandmarkSet::default().bounding_box(640, 480).is_none());
    }

    #[test]
    fn test_bucket_quantization() {
        let bbox = BoundingBox { x1: 100, y1: 100, x2: 140, y2: 160 };
        // center (120, 130) → (2, 2) on a 60px grid
        assert_eq!(bbox.bucket(60), BucketKey(2, 2));
    }

    #[test]
    fn test_angle_parse_legacy_tags() {
        assert_eq!(Angle::parse("derecha"), Some(Angle::Right));
        assert_eq!(Angle::parse("IZQUIERDA"), Some(Angle::Left));
        assert_eq!(Angle::parse("frontal"), Some(Angle::Frontal));
        assert_eq!(Angle::parse("up"), None);
    }

    #[test]
    fn test_landmark_get_rejects_nan() {
        let lm = LandmarkSet::new(vec![Point::new(f32::NAN, 0.1), Point::new(0.2, 0.3)]);
        assert!(lm.get(0).is_none());
        assert_eq!(lm.get(1), Some(Point::new(0.2, 0.3)));
        assert!(lm.get(5).is_none());
    }
}
