//! Multi-frame identity confirmation.
//!
//! Each face position (bucketed bounding-box center) keeps a short ring of
//! per-frame votes. A label is confirmed only once it wins a quorum of the
//! ring, which suppresses single-frame misattributions.

use crate::types::BucketKey;
use std::collections::{HashMap, VecDeque};

/// Minimum votes a label needs.
pub const CONFIRM_FRAMES: usize = 4;
/// Minimum share of the ring a label needs.
pub const CONFIRM_RATIO: f32 = 0.66;
/// Bucket size in pixels.
pub const BUCKET_GRID: i32 = 60;
/// Ring capacity per bucket.
pub const BUFFER_CAPACITY: usize = CONFIRM_FRAMES + 2;

/// One frame's attribution for a face. `label == None` is an "unknown" vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub label: Option<String>,
    pub confidence: Option<f32>,
}

impl Vote {
    pub fn known(label: &str, confidence: f32) -> Self {
        Self {
            label: Some(label.to_string()),
            confidence: Some(confidence),
        }
    }

    pub fn unknown() -> Self {
        Self {
            label: None,
            confidence: None,
        }
    }
}

/// Winning label and mean confidence of its votes.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub label: String,
    pub confidence: Option<f32>,
}

/// Decide whether a ring of votes confirms one label.
///
/// Unknown votes never win; the most frequent known label wins if its count
/// reaches `max(CONFIRM_FRAMES, ceil(len × CONFIRM_RATIO))`, where `len` is
/// the whole ring, unknown votes included. Ties go to the label seen first.
pub fn confirm<'a, I>(votes: I) -> Option<Confirmation>
where
    I: IntoIterator<Item = &'a Vote>,
{
    let mut total = 0usize;
    let known: Vec<(&str, Option<f32>)> = votes
        .into_iter()
        .inspect(|_| total += 1)
        .filter_map(|v| v.label.as_deref().map(|l| (l, v.confidence)))
        .collect();
    if known.is_empty() {
        return None;
    }

    // (label, count) in order of first appearance.
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for (label, _) in &known {
        match tally.iter().position(|(l, _)| l == label) {
            Some(i) => tally[i].1 += 1,
            None => tally.push((*label, 1)),
        }
    }
    let (winner, count) = tally
        .iter()
        .copied()
        .fold(None::<(&str, usize)>, |best, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })?;

    let quorum = CONFIRM_FRAMES.max((total as f32 * CONFIRM_RATIO).ceil() as usize);
    if count < quorum {
        return None;
    }

    let confidences: Vec<f32> = known
        .iter()
        .filter(|(l, _)| *l == winner)
        .filter_map(|(_, c)| *c)
        .collect();
    let confidence = if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
    };
    Some(Confirmation {
        label: winner.to_string(),
        confidence,
    })
}

/// Per-bucket bounded vote rings, created lazily.
#[derive(Debug, Default)]
pub struct VoteBuffers {
    rings: HashMap<BucketKey, VecDeque<Vote>>,
}

impl VoteBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote and evaluate the bucket's ring.
    pub fn push(&mut self, bucket: BucketKey, vote: Vote) -> Option<Confirmation> {
        let ring = self
            .rings
            .entry(bucket)
            .or_insert_with(|| VecDeque::with_capacity(BUFFER_CAPACITY));
        if ring.len() == BUFFER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(vote);
        confirm(ring.iter())
    }

    pub fn len(&self, bucket: BucketKey) -> usize {
        self.rings.get(&bucket).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.rings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn votes(labels: &[Option<&str>]) -> Vec<Vote> {
        labels
            .iter()
            .map(|l| match l {
                Some(l) => Vote::known(l, 0.8),
                None => Vote::unknown(),
            })
            .collect()
    }

    #[test]
    fn test_quorum_four_of_six() {
        let v = votes(&[Some("Alice"), Some("Bob"), Some("Alice"), Some("Alice"), Some("Bob"), Some("Alice")]);
        let c = confirm(&v).unwrap();
        assert_eq!(c.label, "Alice");
        assert!((c.confidence.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_three_of_six_rejected() {
        let v = votes(&[Some("Alice"), Some("Bob"), Some("Alice"), Some("Bob"), Some("Alice"), Some("Bob")]);
        assert!(confirm(&v).is_none());
    }

    #[test]
    fn test_unknown_votes_dropped() {
        let v = votes(&[None, Some("Alice"), Some("Alice"), None, Some("Alice"), Some("Alice")]);
        assert_eq!(confirm(&v).unwrap().label, "Alice");
        assert!(confirm(&votes(&[None, None])).is_none());
        assert!(confirm(&votes(&[])).is_none());
    }

    #[test]
    fn test_unknown_votes_count_toward_ring_length() {
        let mut labels = vec![None; 5];
        labels.extend([Some("Alice"); 5]);
        assert!(confirm(&votes(&labels)).is_none());

        labels[0] = Some("Alice");
        labels[1] = Some("Alice");
        assert_eq!(confirm(&votes(&labels)).unwrap().label, "Alice");
    }

    #[test]
    fn test_confidence_ignores_absent_values() {
        let mut v = votes(&[Some("Alice"), Some("Alice"), Some("Alice")]);
        v.push(Vote {
            label: Some("Alice".into()),
            confidence: None,
        });
        v[0].confidence = Some(0.5);
        let c = confirm(&v).unwrap();
        assert!((c.confidence.unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_buffers_bounded_and_separate() {
        let mut buffers = VoteBuffers::new();
        let a = BucketKey(1, 1);
        let b = BucketKey(5, 5);
        for _ in 0..3 {
            assert!(buffers.push(a, Vote::known("Alice", 0.9)).is_none());
        }
        assert!(buffers.push(b, Vote::known("Alice", 0.9)).is_none());
        assert_eq!(buffers.push(a, Vote::known("Alice", 0.9)).unwrap().label, "Alice");

        for _ in 0..10 {
            buffers.push(a, Vote::unknown());
        }
        assert_eq!(buffers.len(a), BUFFER_CAPACITY);
        assert_eq!(buffers.len(b), 1);
    }
}
