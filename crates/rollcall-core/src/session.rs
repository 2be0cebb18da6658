//! Per-frame recognition context.
//!
//! Owns everything that lives across frames: smoothing history and vote
//! rings per face position, the active classifier snapshot and the
//! attendance tracker.

use crate::attendance::{AttendanceConfig, AttendanceSink, AttendanceTracker, Countdown, Moment, Step};
use crate::classifier::{ClassifierModel, PROBABILITY_THRESHOLD};
use crate::confirm::{Confirmation, Vote, VoteBuffers, BUCKET_GRID};
use crate::embedding::{smooth, EmbeddingPipeline};
use crate::identity::Gallery;
use crate::matcher::{EuclideanMatcher, Matcher, FALLBACK_THRESHOLD};
use crate::types::{Attribution, AttributionSource, BoundingBox, BucketKey, LandmarkSet};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub probability_threshold: f32,
    pub fallback_threshold: f32,
    pub attendance: AttendanceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probability_threshold: PROBABILITY_THRESHOLD,
            fallback_threshold: FALLBACK_THRESHOLD,
            attendance: AttendanceConfig::default(),
        }
    }
}

/// What happened to one face in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    /// This frame's attribution, before confirmation.
    pub attribution: Option<Attribution>,
    pub confirmed: Option<Confirmation>,
    /// Attendance step taken for the confirmed identity.
    pub step: Option<Step>,
    pub countdown: Option<Countdown>,
}

pub struct RecognitionSession {
    pipeline: EmbeddingPipeline,
    model: Option<ClassifierModel>,
    matcher: EuclideanMatcher,
    probability_threshold: f32,
    votes: VoteBuffers,
    smoothing: HashMap<BucketKey, Vec<f32>>,
    attendance: AttendanceTracker,
}

impl RecognitionSession {
    pub fn new(pipeline: EmbeddingPipeline, model: Option<ClassifierModel>, config: SessionConfig) -> Self {
        Self {
            pipeline,
            model,
            matcher: EuclideanMatcher {
                threshold: config.fallback_threshold,
            },
            probability_threshold: config.probability_threshold,
            votes: VoteBuffers::new(),
            smoothing: HashMap::new(),
            attendance: AttendanceTracker::new(config.attendance),
        }
    }

    pub fn pipeline(&self) -> &EmbeddingPipeline {
        &self.pipeline
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Swap in a newly accepted classifier.
    pub fn replace_model(&mut self, model: ClassifierModel) {
        self.model = Some(model);
    }

    pub fn attendance(&self) -> &AttendanceTracker {
        &self.attendance
    }

    pub fn attendance_mut(&mut self) -> &mut AttendanceTracker {
        &mut self.attendance
    }

    /// Classifier first; the distance fallback only when it yields nothing.
    pub fn attribute(&self, v: &[f32], gallery: &Gallery) -> Option<Attribution> {
        if let Some(p) = self
            .model
            .as_ref()
            .and_then(|m| m.predict(v, self.probability_threshold))
        {
            return Some(Attribution {
                label: p.label,
                confidence: p.confidence,
                source: AttributionSource::Classifier,
            });
        }
        self.matcher.best_match(v, gallery).map(|m| Attribution {
            label: m.label,
            confidence: m.similarity,
            source: AttributionSource::Fallback,
        })
    }

    /// Run one detected face through embed → attribute → confirm → attendance.
    pub fn process_face(
        &mut self,
        landmarks: &LandmarkSet,
        frame_size: (u32, u32),
        gallery: &Gallery,
        at: Moment,
        sink: &mut dyn AttendanceSink,
    ) -> Option<FaceReport> {
        let bbox = landmarks.bounding_box(frame_size.0, frame_size.1)?;
        let bucket = bbox.bucket(BUCKET_GRID);

        let raw = self.pipeline.extract(landmarks);
        let smoothed = smooth(&raw, self.smoothing.get(&bucket).map(Vec::as_slice));
        let v = self.pipeline.normalize(&smoothed);
        self.smoothing.insert(bucket, smoothed);

        let attribution = self.attribute(&v, gallery);
        let vote = match &attribution {
            Some(a) => Vote::known(&a.label, a.confidence),
            None => Vote::unknown(),
        };
        let confirmed = self.votes.push(bucket, vote);

        let (step, countdown) = match &confirmed {
            Some(c) => {
                let step = self.attendance.observe(&c.label, gallery.get(&c.label), at, sink);
                (Some(step), self.attendance.countdown(&c.label, at.instant))
            }
            None => (None, None),
        };

        Some(FaceReport {
            bbox,
            attribution,
            confirmed,
            step,
            countdown,
        })
    }

    /// Per-frame housekeeping after all faces were processed.
    pub fn end_frame(&mut self, now: Instant) -> Vec<String> {
        self.attendance.sweep(now)
    }

    /// Drop per-face history, e.g. after the camera was used for enrollment.
    pub fn clear_tracking(&mut self) {
        self.votes.clear();
        self.smoothing.clear();
    }
}
