//! Enrollment capture: pose-gated per-angle sampling and bulk sampling.
//!
//! Capture pulls from a [`CaptureFeed`], which interleaves detected
//! landmarks with operator control (start trigger, cancel). Each angle waits
//! for an explicit start, then samples for a fixed window; only frames whose
//! estimated yaw matches the requested pose are kept.

use crate::embedding::{estimate_yaw, EmbeddingPipeline};
use crate::types::{Angle, FeatureVector, LandmarkSet, Samples};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentConfig {
    /// Sampling window per angle once started.
    pub pose_window: Duration,
    /// Extra attempts per angle after the first yields no valid frame.
    pub max_retries: u32,
    /// Minimum absolute yaw (degrees) for the side poses.
    pub yaw_threshold: f32,
    /// Run a bulk capture before the pose capture.
    pub bulk_enabled: bool,
    pub bulk_target: usize,
    pub bulk_timeout: Duration,
    /// How long to wait for the operator's start trigger.
    pub start_timeout: Duration,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            pose_window: Duration::from_secs(4),
            max_retries: 2,
            yaw_threshold: 12.0,
            bulk_enabled: true,
            bulk_target: 20,
            bulk_timeout: Duration::from_secs(20),
            start_timeout: Duration::from_secs(120),
        }
    }
}

/// One item pulled from the capture feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A processed frame: landmarks of the first detected face, if any.
    Frame(Option<LandmarkSet>),
    /// Operator pressed start.
    Start,
    /// Operator cancelled.
    Cancel,
    /// The frame source ended.
    Closed,
}

/// Source of frames and operator control during enrollment.
pub trait CaptureFeed {
    fn next_event(&mut self) -> FeedEvent;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("capture cancelled")]
    Cancelled,
    #[error("frame source closed during capture")]
    SourceClosed,
    #[error("no start trigger for {0} pose")]
    StartTimeout(Angle),
    #[error("no valid frames for {0} pose after all attempts")]
    PoseFailed(Angle),
    #[error("no valid frames captured")]
    NoSamples,
}

/// Whether a frame with `yaw` degrees matches the requested pose.
pub fn pose_accepts(angle: Angle, yaw: f32, threshold: f32) -> bool {
    match angle {
        Angle::Frontal => true,
        Angle::Right => yaw <= -threshold,
        Angle::Left => yaw >= threshold,
    }
}

fn mean(vectors: &[FeatureVector]) -> Option<FeatureVector> {
    let first = vectors.first()?;
    let mut out = vec![0.0f32; first.len()];
    for v in vectors {
        for (o, x) in out.iter_mut().zip(v) {
            *o += x;
        }
    }
    let n = vectors.len() as f32;
    out.iter_mut().for_each(|o| *o /= n);
    Some(out)
}

fn wait_for_start(feed: &mut dyn CaptureFeed, angle: Angle, timeout: Duration) -> Result<(), CaptureError> {
    let started = Instant::now();
    loop {
        match feed.next_event() {
            FeedEvent::Start => return Ok(()),
            FeedEvent::Cancel => return Err(CaptureError::Cancelled),
            FeedEvent::Closed => return Err(CaptureError::SourceClosed),
            FeedEvent::Frame(_) => {}
        }
        if started.elapsed() >= timeout {
            return Err(CaptureError::StartTimeout(angle));
        }
    }
}

/// Sample one angle for the configured window. Returns the accepted vectors;
/// a source that closes mid-window ends the window early.
fn sample_angle(
    pipeline: &EmbeddingPipeline,
    feed: &mut dyn CaptureFeed,
    angle: Angle,
    config: &EnrollmentConfig,
) -> Result<Vec<FeatureVector>, CaptureError> {
    let started = Instant::now();
    let mut accepted = Vec::new();
    let mut rejected = 0usize;
    while started.elapsed() < config.pose_window {
        match feed.next_event() {
            FeedEvent::Frame(Some(landmarks)) => {
                let yaw = estimate_yaw(&landmarks);
                if pose_accepts(angle, yaw, config.yaw_threshold) {
                    accepted.push(pipeline.embed(&landmarks));
                } else {
                    rejected += 1;
                }
            }
            FeedEvent::Frame(None) | FeedEvent::Start => {}
            FeedEvent::Cancel => return Err(CaptureError::Cancelled),
            FeedEvent::Closed => break,
        }
    }
    tracing::debug!(angle = %angle, accepted = accepted.len(), rejected, "pose window finished");
    Ok(accepted)
}

/// Capture frontal, right and left in turn, each averaged over its window.
pub fn capture_poses(
    pipeline: &EmbeddingPipeline,
    feed: &mut dyn CaptureFeed,
    config: &EnrollmentConfig,
) -> Result<Samples, CaptureError> {
    let mut samples = Samples::new();
    for angle in Angle::ALL {
        let mut captured = None;
        for attempt in 0..=config.max_retries {
            tracing::info!(angle = %angle, attempt = attempt + 1, "waiting for capture start");
            wait_for_start(feed, angle, config.start_timeout)?;
            let vectors = sample_angle(pipeline, feed, angle, config)?;
            if let Some(avg) = mean(&vectors) {
                tracing::info!(angle = %angle, frames = vectors.len(), "angle captured");
                captured = Some(avg);
                break;
            }
            tracing::warn!(angle = %angle, attempt = attempt + 1, "no valid frames, retrying");
        }
        match captured {
            Some(v) => {
                samples.insert(angle, Some(v));
            }
            None => return Err(CaptureError::PoseFailed(angle)),
        }
    }
    Ok(samples)
}

/// Bulk sampling loop. Also reports whether a start trigger arrived while
/// it ran.
fn bulk_vectors(
    pipeline: &EmbeddingPipeline,
    feed: &mut dyn CaptureFeed,
    config: &EnrollmentConfig,
) -> Result<(Vec<FeatureVector>, bool), CaptureError> {
    let started = Instant::now();
    let mut vectors = Vec::new();
    let mut start_pressed = false;
    while vectors.len() < config.bulk_target && started.elapsed() < config.bulk_timeout {
        match feed.next_event() {
            FeedEvent::Frame(Some(landmarks)) => vectors.push(pipeline.embed(&landmarks)),
            FeedEvent::Frame(None) => {}
            FeedEvent::Start => start_pressed = true,
            FeedEvent::Cancel => return Err(CaptureError::Cancelled),
            FeedEvent::Closed => break,
        }
    }
    Ok((vectors, start_pressed))
}

/// Collect up to `bulk_target` vectors within `bulk_timeout`, averaged into
/// the frontal sample; the side angles are left absent.
pub fn capture_bulk(
    pipeline: &EmbeddingPipeline,
    feed: &mut dyn CaptureFeed,
    config: &EnrollmentConfig,
) -> Result<Samples, CaptureError> {
    let (vectors, _) = bulk_vectors(pipeline, feed, config)?;
    let frontal = mean(&vectors).ok_or(CaptureError::NoSamples)?;
    tracing::info!(frames = vectors.len(), "bulk capture finished");

    let mut samples = Samples::new();
    samples.insert(Angle::Frontal, Some(frontal));
    samples.insert(Angle::Right, None);
    samples.insert(Angle::Left, None);
    Ok(samples)
}

/// Feed that hands out one held-back start trigger before reading on.
struct HeldStart<'a> {
    feed: &'a mut dyn CaptureFeed,
    start: bool,
}

impl CaptureFeed for HeldStart<'_> {
    fn next_event(&mut self) -> FeedEvent {
        if std::mem::take(&mut self.start) {
            return FeedEvent::Start;
        }
        self.feed.next_event()
    }
}

/// Full enrollment capture. When bulk capture is enabled it runs first as a
/// warm-up and its result is discarded; the pose capture result is returned.
/// A start trigger received during the warm-up starts the frontal pose.
pub fn run_enrollment(
    pipeline: &EmbeddingPipeline,
    feed: &mut dyn CaptureFeed,
    config: &EnrollmentConfig,
) -> Result<Samples, CaptureError> {
    let mut start = false;
    if config.bulk_enabled {
        let (vectors, start_pressed) = bulk_vectors(pipeline, feed, config)?;
        tracing::debug!(frames = vectors.len(), start_pressed, "bulk warm-up done, continuing with pose capture");
        start = start_pressed;
    }
    capture_poses(pipeline, &mut HeldStart { feed, start }, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EYE_INDICES, LANDMARK_COUNT, NOSE_INDEX};
    use crate::types::Point;
    use std::collections::VecDeque;

    fn face(nose_x: f32) -> LandmarkSet {
        let mut points: Vec<Point> = (0..LANDMARK_COUNT)
            .map(|i| Point::new(0.3 + 0.4 * (i as f32 / LANDMARK_COUNT as f32), 0.5))
            .collect();
        points[EYE_INDICES.0] = Point::new(0.4, 0.4);
        points[EYE_INDICES.1] = Point::new(0.6, 0.4);
        points[NOSE_INDEX] = Point::new(nose_x, 0.55);
        LandmarkSet::new(points)
    }

    fn frontal() -> FeedEvent {
        FeedEvent::Frame(Some(face(0.5)))
    }
    fn right() -> FeedEvent {
        FeedEvent::Frame(Some(face(0.44)))
    }
    fn left() -> FeedEvent {
        FeedEvent::Frame(Some(face(0.56)))
    }

    /// Replays scripted events; once a script step is exhausted, repeats
    /// `idle` with a short sleep so time-bounded windows can elapse.
    struct ScriptedFeed {
        script: VecDeque<FeedEvent>,
        idle: FeedEvent,
    }

    impl ScriptedFeed {
        fn new(script: Vec<FeedEvent>, idle: FeedEvent) -> Self {
            Self {
                script: script.into(),
                idle,
            }
        }
    }

    impl CaptureFeed for ScriptedFeed {
        fn next_event(&mut self) -> FeedEvent {
            std::thread::sleep(Duration::from_millis(1));
            self.script.pop_front().unwrap_or_else(|| self.idle.clone())
        }
    }

    fn fast_config() -> EnrollmentConfig {
        EnrollmentConfig {
            pose_window: Duration::from_millis(20),
            max_retries: 2,
            yaw_threshold: 12.0,
            bulk_enabled: false,
            bulk_target: 3,
            bulk_timeout: Duration::from_millis(200),
            start_timeout: Duration::from_millis(500),
        }
    }

    /// Start trigger followed by enough pose frames to fill a window.
    fn pose_block(frame: fn() -> FeedEvent) -> Vec<FeedEvent> {
        let mut events = vec![FeedEvent::Start];
        events.extend((0..40).map(|_| frame()));
        events
    }

    #[test]
    fn test_pose_gate() {
        assert!(pose_accepts(Angle::Right, -12.0, 12.0));
        assert!(!pose_accepts(Angle::Right, -11.9, 12.0));
        assert!(pose_accepts(Angle::Left, 12.0, 12.0));
        assert!(!pose_accepts(Angle::Left, 0.0, 12.0));
        assert!(pose_accepts(Angle::Frontal, 40.0, 12.0));
    }

    #[test]
    fn test_three_poses_captured() {
        let pipeline = EmbeddingPipeline::default();
        let mut script = pose_block(frontal);
        script.extend(pose_block(right));
        script.extend(pose_block(left));
        let mut feed = ScriptedFeed::new(script, FeedEvent::Frame(None));

        let samples = capture_poses(&pipeline, &mut feed, &fast_config()).unwrap();
        assert_eq!(samples.len(), 3);
        for angle in Angle::ALL {
            assert_eq!(samples[&angle].as_ref().unwrap().len(), pipeline.dim());
        }
    }

    #[test]
    fn test_off_pose_retries_then_fails() {
        let pipeline = EmbeddingPipeline::default();
        let mut script = pose_block(frontal);
        // Three attempts at "right" while the face stays frontal.
        for _ in 0..3 {
            script.extend(pose_block(frontal));
        }
        let mut feed = ScriptedFeed::new(script, FeedEvent::Frame(None));
        let err = capture_poses(&pipeline, &mut feed, &fast_config()).unwrap_err();
        assert_eq!(err, CaptureError::PoseFailed(Angle::Right));
    }

    #[test]
    fn test_retry_succeeds_on_second_attempt() {
        let pipeline = EmbeddingPipeline::default();
        let mut script = pose_block(frontal);
        script.extend(pose_block(frontal));
        script.extend(pose_block(right));
        script.extend(pose_block(left));
        let mut feed = ScriptedFeed::new(script, FeedEvent::Frame(None));
        let samples = capture_poses(&pipeline, &mut feed, &fast_config()).unwrap();
        assert!(samples[&Angle::Right].is_some());
    }

    #[test]
    fn test_cancel_aborts() {
        let pipeline = EmbeddingPipeline::default();
        let mut feed = ScriptedFeed::new(vec![frontal(), FeedEvent::Cancel], FeedEvent::Frame(None));
        let err = capture_poses(&pipeline, &mut feed, &fast_config()).unwrap_err();
        assert_eq!(err, CaptureError::Cancelled);
    }

    #[test]
    fn test_start_timeout_and_closed_source() {
        let pipeline = EmbeddingPipeline::default();
        let mut feed = ScriptedFeed::new(vec![], FeedEvent::Frame(None));
        let config = EnrollmentConfig {
            start_timeout: Duration::from_millis(10),
            ..fast_config()
        };
        assert_eq!(
            capture_poses(&pipeline, &mut feed, &config).unwrap_err(),
            CaptureError::StartTimeout(Angle::Frontal)
        );

        let mut feed = ScriptedFeed::new(vec![], FeedEvent::Closed);
        assert_eq!(
            capture_poses(&pipeline, &mut feed, &fast_config()).unwrap_err(),
            CaptureError::SourceClosed
        );
    }

    #[test]
    fn test_bulk_capture_fills_frontal() {
        let pipeline = EmbeddingPipeline::default();
        let mut feed = ScriptedFeed::new(vec![], frontal());
        let samples = capture_bulk(&pipeline, &mut feed, &fast_config()).unwrap();
        assert!(samples[&Angle::Frontal].is_some());
        assert_eq!(samples[&Angle::Right], None);
        assert_eq!(samples[&Angle::Left], None);

        let mut empty = ScriptedFeed::new(vec![], FeedEvent::Frame(None));
        assert_eq!(
            capture_bulk(&pipeline, &mut empty, &fast_config()).unwrap_err(),
            CaptureError::NoSamples
        );
    }

    #[test]
    fn test_start_during_bulk_starts_frontal_pose() {
        let pipeline = EmbeddingPipeline::default();
        let config = EnrollmentConfig {
            bulk_enabled: true,
            ..fast_config()
        };
        let mut script = vec![right(), FeedEvent::Start, right(), right()];
        script.extend((0..40).map(|_| frontal()));
        script.extend(pose_block(right));
        script.extend(pose_block(left));
        let mut feed = ScriptedFeed::new(script, FeedEvent::Frame(None));

        let samples = run_enrollment(&pipeline, &mut feed, &config).unwrap();
        let frontal_vec = samples[&Angle::Frontal].as_ref().unwrap();
        let expected = pipeline.embed(&face(0.5));
        assert!(frontal_vec.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));
        assert!(samples[&Angle::Left].is_some());
    }

    #[test]
    fn test_enrollment_discards_bulk_result() {
        let pipeline = EmbeddingPipeline::default();
        let config = EnrollmentConfig {
            bulk_enabled: true,
            ..fast_config()
        };
        let mut script: Vec<FeedEvent> = (0..3).map(|_| right()).collect();
        script.extend(pose_block(frontal));
        script.extend(pose_block(right));
        script.extend(pose_block(left));
        let mut feed = ScriptedFeed::new(script, FeedEvent::Frame(None));

        let samples = run_enrollment(&pipeline, &mut feed, &config).unwrap();
        // Pose capture fills every angle; bulk would have left the sides empty.
        assert!(samples.values().all(Option::is_some));
        let frontal_vec = samples[&Angle::Frontal].as_ref().unwrap();
        let expected = pipeline.embed(&face(0.5));
        assert!(frontal_vec.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));
    }
}
