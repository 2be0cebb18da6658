//! Landmark embedding pipeline.
//!
//! A fixed subset of face-mesh indices is flattened into `[x.., y..]`,
//! centered on the eye midpoint and scaled by the inter-eye distance. The
//! subset is computed once, so every vector has the same length for the
//! lifetime of the process.

use crate::types::{FeatureVector, LandmarkSet};

/// Points produced by the face-mesh model.
pub const LANDMARK_COUNT: usize = 468;
/// Evenly spaced indices sampled over the mesh.
pub const SELECTED_COUNT: usize = 420;
/// Outer eye corners (left, right).
pub const EYE_INDICES: (usize, usize) = (33, 263);
/// Nose tip.
pub const NOSE_INDEX: usize = 1;
/// Weight of the newest sample in exponential smoothing.
pub const SMOOTH_ALPHA: f32 = 0.85;

const DIST_EPS: f32 = 1e-12;
const STD_EPS: f32 = 1e-6;

/// Evenly spaced integer indices over `0..total` plus the eye indices,
/// deduplicated and sorted.
pub fn build_selected_indices(total: usize, num: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = match num {
        0 => Vec::new(),
        1 => vec![0],
        _ => (0..num)
            .map(|i| i * (total.saturating_sub(1)) / (num - 1))
            .collect(),
    };
    indices.push(EYE_INDICES.0);
    indices.push(EYE_INDICES.1);
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Converts landmark sets into normalized feature vectors.
#[derive(Debug, Clone)]
pub struct EmbeddingPipeline {
    selected: Vec<usize>,
    /// Positions of the eye indices within `selected`, when present.
    eye_positions: Option<(usize, usize)>,
}

impl Default for EmbeddingPipeline {
    fn default() -> Self {
        Self::new(build_selected_indices(LANDMARK_COUNT, SELECTED_COUNT))
    }
}

impl EmbeddingPipeline {
    pub fn new(selected: Vec<usize>) -> Self {
        let left = selected.iter().position(|&i| i == EYE_INDICES.0);
        let right = selected.iter().position(|&i| i == EYE_INDICES.1);
        Self {
            eye_positions: left.zip(right),
            selected,
        }
    }

    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    /// Feature vector length (`2 × selected index count`).
    pub fn dim(&self) -> usize {
        self.selected.len() * 2
    }

    /// Flatten the selected landmarks into interleaved `(x, y)` pairs.
    /// Missing or non-finite points become `0.0`.
    pub fn extract(&self, landmarks: &LandmarkSet) -> Vec<f32> {
        let mut raw = Vec::with_capacity(self.dim());
        for &idx in &self.selected {
            match landmarks.get(idx) {
                Some(p) => {
                    raw.push(p.x);
                    raw.push(p.y);
                }
                None => {
                    raw.push(0.0);
                    raw.push(0.0);
                }
            }
        }
        raw
    }

    /// Center on the eye midpoint and scale by inter-eye distance.
    ///
    /// Input is interleaved; output is the x-half followed by the y-half.
    pub fn normalize(&self, raw: &[f32]) -> FeatureVector {
        let xs: Vec<f32> = raw.iter().step_by(2).copied().collect();
        let ys: Vec<f32> = raw.iter().skip(1).step_by(2).copied().collect();
        let n = xs.len().min(ys.len());
        if n == 0 {
            return Vec::new();
        }

        let (cx, cy, dist) = match self.eye_positions {
            Some((l, r)) if l < n && r < n => {
                let cx = (xs[l] + xs[r]) / 2.0;
                let cy = (ys[l] + ys[r]) / 2.0;
                let dist = ((xs[r] - xs[l]).powi(2) + (ys[r] - ys[l]).powi(2)).sqrt();
                (cx, cy, dist)
            }
            _ => {
                let cx = xs[..n].iter().sum::<f32>() / n as f32;
                let cy = ys[..n].iter().sum::<f32>() / n as f32;
                let var = xs[..n].iter().map(|x| (x - cx).powi(2)).sum::<f32>() / n as f32;
                (cx, cy, var.sqrt() + STD_EPS)
            }
        };

        let scale = if dist > 0.0 { dist + DIST_EPS } else { 1.0 };
        let mut out = Vec::with_capacity(n * 2);
        out.extend(xs[..n].iter().map(|x| (x - cx) / scale));
        out.extend(ys[..n].iter().map(|y| (y - cy) / scale));
        out
    }

    /// `extract` followed by `normalize`.
    pub fn embed(&self, landmarks: &LandmarkSet) -> FeatureVector {
        self.normalize(&self.extract(landmarks))
    }
}

/// Exponential moving average against the previous vector of the same face.
pub fn smooth(raw: &[f32], previous: Option<&[f32]>) -> Vec<f32> {
    match previous {
        Some(prev) if prev.len() == raw.len() => raw
            .iter()
            .zip(prev)
            .map(|(new, old)| SMOOTH_ALPHA * new + (1.0 - SMOOTH_ALPHA) * old)
            .collect(),
        _ => raw.to_vec(),
    }
}

/// Pad with zeros or truncate to exactly `n` elements.
pub fn fix_length(v: &[f32], n: usize) -> Vec<f32> {
    let mut out: Vec<f32> = v.iter().take(n).copied().collect();
    out.resize(n, 0.0);
    out
}

/// Rough head yaw in degrees from the nose offset relative to the eye midpoint.
///
/// Negative when the face is turned toward the subject's right. Returns `0.0`
/// when the eye or nose landmarks are unavailable.
pub fn estimate_yaw(landmarks: &LandmarkSet) -> f32 {
    let (Some(left), Some(right), Some(nose)) = (
        landmarks.get(EYE_INDICES.0),
        landmarks.get(EYE_INDICES.1),
        landmarks.get(NOSE_INDEX),
    ) else {
        return 0.0;
    };
    let mid_x = (left.x + right.x) / 2.0;
    let eye_span = (right.x - left.x).abs() + 1e-6;
    (nose.x - mid_x).atan2(eye_span).to_degrees()
}
