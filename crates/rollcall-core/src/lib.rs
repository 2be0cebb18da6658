//! rollcall-core — Landmark-based identity recognition and attendance tracking.
//!
//! Turns per-frame face-mesh landmarks into normalized feature vectors,
//! attributes them to enrolled identities (kernel classifier with a
//! nearest-sample fallback), confirms identities over several frames, and
//! drives the per-identity entry/exit attendance lifecycle.

pub mod attendance;
pub mod classifier;
pub mod confirm;
pub mod embedding;
pub mod enrollment;
pub mod identity;
pub mod landmarker;
pub mod matcher;
pub mod session;
pub mod types;

pub use attendance::{AttendanceOutcome, AttendanceSink, AttendanceTracker, MarkKind};
pub use classifier::{ClassifierModel, RetrainOutcome};
pub use embedding::EmbeddingPipeline;
pub use identity::{Gallery, IdentityRecord};
pub use landmarker::{FaceMeshLandmarker, LandmarkOracle};
pub use matcher::{EuclideanMatcher, Matcher};
pub use session::RecognitionSession;
pub use types::{Angle, Attribution, AttributionSource, BoundingBox, FeatureVector, LandmarkSet, Point};
