//! Distance-based fallback matching against stored samples.

use crate::identity::Gallery;

/// Default maximum Euclidean distance for a fallback match.
pub const FALLBACK_THRESHOLD: f32 = 0.60;

/// Result of matching a query vector against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: String,
    /// Smallest distance found.
    pub distance: f32,
    /// `1 - min(distance, 1)`.
    pub similarity: f32,
}

/// Strategy for finding the closest enrolled identity to a query vector.
pub trait Matcher {
    fn best_match(&self, query: &[f32], gallery: &Gallery) -> Option<MatchResult>;
}

/// Nearest stored per-angle sample by Euclidean distance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: FALLBACK_THRESHOLD,
        }
    }
}

/// Euclidean distance over the common prefix of `a` and `b`.
pub fn truncated_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, query: &[f32], gallery: &Gallery) -> Option<MatchResult> {
        if query.is_empty() || query.iter().any(|x| x.is_nan()) {
            return None;
        }

        let mut best: Option<(&str, f32)> = None;
        for (name, record) in gallery {
            for (_, sample) in record.available() {
                if sample.is_empty() || sample.iter().any(|x| x.is_nan()) {
                    continue;
                }
                let d = truncated_distance(query, sample);
                // Strict comparison keeps the first identity on ties.
                if best.map_or(true, |(_, b)| d < b) {
                    best = Some((name.as_str(), d));
                }
            }
        }

        let (label, distance) = best?;
        if distance > self.threshold {
            tracing::trace!(label, distance, "closest sample beyond fallback threshold");
            return None;
        }
        Some(MatchResult {
            label: label.to_string(),
            distance,
            similarity: 1.0 - distance.min(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRecord;
    use crate::types::{Angle, Samples};

    fn gallery(entries: &[(&str, Vec<Option<Vec<f32>>>)]) -> Gallery {
        entries
            .iter()
            .map(|(name, vectors)| {
                let samples: Samples = Angle::ALL.iter().copied().zip(vectors.iter().cloned()).collect();
                (name.to_string(), IdentityRecord::new("-", "-", "-", samples))
            })
            .collect()
    }

    #[test]
    fn test_exact_threshold_accepted() {
        let g = gallery(&[("Ana", vec![Some(vec![0.0])])]);
        let matcher = EuclideanMatcher { threshold: 0.5 };
        let m = matcher.best_match(&[0.5], &g).unwrap();
        assert_eq!(m.label, "Ana");
        assert_eq!(m.distance, 0.5);
        assert_eq!(m.similarity, 0.5);
    }

    #[test]
    fn test_beyond_threshold_rejected() {
        let g = gallery(&[("Ana", vec![Some(vec![0.0])])]);
        let matcher = EuclideanMatcher { threshold: 0.5 };
        assert!(matcher.best_match(&[0.5 + 1e-4], &g).is_none());
    }

    #[test]
    fn test_default_threshold_boundary() {
        let g = gallery(&[("Ana", vec![Some(vec![0.0])])]);
        let matcher = EuclideanMatcher::default();

        let m = matcher.best_match(&[FALLBACK_THRESHOLD], &g).unwrap();
        assert_eq!(m.label, "Ana");
        assert_eq!(m.distance, FALLBACK_THRESHOLD);
        assert!((m.similarity - 0.4).abs() < 1e-6);

        assert!(matcher.best_match(&[FALLBACK_THRESHOLD + 1e-4], &g).is_none());
    }

    #[test]
    fn test_global_minimum_across_angles() {
        let g = gallery(&[
            ("Ana", vec![Some(vec![1.0, 1.0]), None, Some(vec![0.3, 0.0])]),
            ("Luis", vec![Some(vec![0.1, 0.0])]),
        ]);
        let m = EuclideanMatcher::default().best_match(&[0.0, 0.0], &g).unwrap();
        assert_eq!(m.label, "Luis");
        assert!((m.similarity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_truncates_to_shorter_and_skips_bad_samples() {
        let g = gallery(&[
            ("Nan", vec![Some(vec![f32::NAN, 0.0])]),
            ("Long", vec![Some(vec![0.2, 0.0, 99.0, 99.0])]),
        ]);
        let m = EuclideanMatcher::default().best_match(&[0.0, 0.0], &g).unwrap();
        assert_eq!(m.label, "Long");
        assert!((m.distance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_empty_query_or_gallery() {
        let g = gallery(&[("Ana", vec![Some(vec![0.0])])]);
        assert!(EuclideanMatcher::default().best_match(&[], &g).is_none());
        assert!(EuclideanMatcher::default().best_match(&[0.0], &Gallery::new()).is_none());
    }
}
