use crate::config::{Config, Roster};
use crate::sheet::{AttendanceSheet, SheetError};
use crate::store::{self, IdentitySummary, IdentityUpdate, ModelStore, SampleStore, StoreError};
use rollcall_core::attendance::{Moment, Step};
use rollcall_core::classifier::{self, RetrainOutcome};
use rollcall_core::enrollment::{run_enrollment, CaptureError, CaptureFeed, EnrollmentConfig, FeedEvent};
use rollcall_core::identity::UNSET;
use rollcall_core::landmarker::OracleError;
use rollcall_core::session::{FaceReport, SessionConfig};
use rollcall_core::types::Samples;
use rollcall_core::{
    AttendanceOutcome, EmbeddingPipeline, FaceMeshLandmarker, Gallery, IdentityRecord, LandmarkOracle,
    RecognitionSession,
};
use rollcall_hw::{Camera, Clahe, Frame, FrameSource, ImageSequence, SourceError};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("frame source error: {0}")]
    Source(#[from] SourceError),
    #[error("landmark model error: {0}")]
    Oracle(#[from] OracleError),
    #[error("attendance sheet error: {0}")]
    Sheet(#[from] SheetError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("an enrollment is already pending")]
    EnrollmentPending,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Who is being enrolled. Blank request fields fall back to placeholders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrollee {
    pub name: String,
    pub registration: String,
    pub group: String,
    pub subject: String,
}

impl Enrollee {
    pub fn with_defaults(name: &str, registration: &str, group: &str, subject: &str, roster: &Roster) -> Self {
        let or = |value: &str, fallback: &str| {
            let value = value.trim();
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };
        Self {
            name: or(name, "SinNombre"),
            registration: or(registration, "SinRegistro"),
            group: or(group, roster.default_group()),
            subject: or(subject, UNSET),
        }
    }
}

/// Operator control during enrollment capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureControl {
    Start,
    Cancel,
}

/// Notifications pushed out of the engine, forwarded as D-Bus signals.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SubjectRequested { name: String, group: String },
    AttendanceRecorded { name: String, outcome: AttendanceOutcome },
    EnrollmentFinished { name: String, success: bool, message: String },
}

/// Why the frame loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineExit {
    /// Every handle was dropped.
    Shutdown,
    /// The frame source ran out of frames.
    Exhausted,
    SourceFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainSummary {
    Accepted { accuracy: f32 },
    Rejected { accuracy: f32 },
    Insufficient,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub source: String,
    pub identities: usize,
    pub model_loaded: bool,
    pub frames: u64,
    pub faces: u64,
    pub pending_subjects: Vec<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        enrollee: Enrollee,
    },
    SetSubject {
        name: String,
        subject: String,
        group: Option<String>,
    },
    CancelSubject {
        name: String,
    },
    PendingSubjects {
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ListIdentities {
        query: Option<String>,
        reply: oneshot::Sender<Vec<IdentitySummary>>,
    },
    UpdateIdentity {
        name: String,
        update: IdentityUpdate,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    RemoveIdentity {
        name: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Retrain {
        reply: oneshot::Sender<RetrainSummary>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    control: mpsc::UnboundedSender<CaptureControl>,
    enrolling: Arc<AtomicBool>,
}

impl EngineHandle {
    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn ask<T>(&self, req: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(req(reply_tx)).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Queue an enrollment. Refused while another one is pending.
    pub async fn enroll(&self, enrollee: Enrollee) -> Result<(), EngineError> {
        if self.enrolling.swap(true, Ordering::SeqCst) {
            return Err(EngineError::EnrollmentPending);
        }
        let sent = self.send(EngineRequest::Enroll { enrollee }).await;
        if sent.is_err() {
            self.enrolling.store(false, Ordering::SeqCst);
        }
        sent
    }

    pub fn is_enrolling(&self) -> bool {
        self.enrolling.load(Ordering::SeqCst)
    }

    pub fn start_capture(&self) -> Result<(), EngineError> {
        self.control
            .send(CaptureControl::Start)
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn cancel_capture(&self) -> Result<(), EngineError> {
        self.control
            .send(CaptureControl::Cancel)
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn set_subject(&self, name: &str, subject: &str, group: Option<&str>) -> Result<(), EngineError> {
        self.send(EngineRequest::SetSubject {
            name: name.to_string(),
            subject: subject.to_string(),
            group: group.map(str::to_string),
        })
        .await
    }

    pub async fn cancel_subject(&self, name: &str) -> Result<(), EngineError> {
        self.send(EngineRequest::CancelSubject { name: name.to_string() })
            .await
    }

    pub async fn pending_subjects(&self) -> Result<Vec<String>, EngineError> {
        self.ask(|reply| EngineRequest::PendingSubjects { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.ask(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn list_identities(&self, query: Option<&str>) -> Result<Vec<IdentitySummary>, EngineError> {
        let query = query.map(str::to_string);
        self.ask(|reply| EngineRequest::ListIdentities { query, reply })
            .await
    }

    pub async fn update_identity(&self, name: &str, update: IdentityUpdate) -> Result<String, EngineError> {
        let name = name.to_string();
        self.ask(|reply| EngineRequest::UpdateIdentity { name, update, reply })
            .await?
    }

    pub async fn remove_identity(&self, name: &str) -> Result<(), EngineError> {
        let name = name.to_string();
        self.ask(|reply| EngineRequest::RemoveIdentity { name, reply })
            .await?
    }

    pub async fn retrain(&self) -> Result<RetrainSummary, EngineError> {
        self.ask(|reply| EngineRequest::Retrain { reply }).await
    }
}

/// Receivers returned alongside the handle when the engine starts.
pub struct EngineChannels {
    pub handle: EngineHandle,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub done: oneshot::Receiver<EngineExit>,
}

/// Tunables the engine needs beyond its resources.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub session: SessionConfig,
    pub enrollment: EnrollmentConfig,
    pub accept_accuracy: f32,
}

/// Everything the frame loop owns.
pub struct Engine {
    source: Box<dyn FrameSource>,
    oracle: Box<dyn LandmarkOracle + Send>,
    session: RecognitionSession,
    gallery: Gallery,
    samples: SampleStore,
    models: ModelStore,
    sheet: AttendanceSheet,
    clahe: Clahe,
    settings: EngineSettings,
    frames: u64,
    faces: u64,
}

impl Engine {
    /// Open the frame source, landmark model, stores and sheet named by
    /// `config`. Fails fast if any of them is unavailable.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        let source: Box<dyn FrameSource> = match &config.image_dir {
            Some(dir) => Box::new(ImageSequence::open(dir)?),
            None => Box::new(Camera::open(&config.camera_device, config.frame_width, config.frame_height)?),
        };
        tracing::info!(source = %source.describe(), "frame source opened");

        let model_path = config.face_mesh_model_path();
        let oracle = FaceMeshLandmarker::load(&model_path)?.with_presence_threshold(config.presence_threshold);
        tracing::info!(path = %model_path, presence = config.presence_threshold, "face mesh landmarker loaded");

        let sheet = AttendanceSheet::open(&config.attendance_db_path())?;
        let samples = SampleStore::new(config.identity_store_path());
        let models = ModelStore::new(config.data_dir.clone());

        Ok(Self::new(
            source,
            Box::new(oracle),
            sheet,
            samples,
            models,
            EngineSettings {
                session: config.session(),
                enrollment: config.enrollment(),
                accept_accuracy: config.accept_accuracy,
            },
        ))
    }

    pub fn new(
        source: Box<dyn FrameSource>,
        oracle: Box<dyn LandmarkOracle + Send>,
        sheet: AttendanceSheet,
        samples: SampleStore,
        models: ModelStore,
        settings: EngineSettings,
    ) -> Self {
        let pipeline = EmbeddingPipeline::default();
        let gallery = samples.load();
        let model = models.load().filter(|m| {
            let usable = m.n_features() == pipeline.dim();
            if !usable {
                tracing::warn!(
                    expected = pipeline.dim(),
                    found = m.n_features(),
                    "stored classifier has the wrong input size, ignoring"
                );
            }
            usable
        });
        tracing::info!(identities = gallery.len(), model_loaded = model.is_some(), "engine state restored");

        Self {
            source,
            oracle,
            session: RecognitionSession::new(pipeline, model, settings.session),
            gallery,
            samples,
            models,
            sheet,
            clahe: Clahe::default(),
            settings,
            frames: 0,
            faces: 0,
        }
    }

    /// Start the frame loop on a dedicated OS thread.
    pub fn spawn(self) -> Result<EngineChannels, EngineError> {
        let (tx, inbox) = mpsc::channel::<EngineRequest>(16);
        let (control_tx, control) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (done_tx, done) = oneshot::channel();
        let enrolling = Arc::new(AtomicBool::new(false));

        let mut worker = Worker {
            engine: self,
            inbox,
            control,
            events: events_tx,
            enrolling: Arc::clone(&enrolling),
            pending: None,
        };

        std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                let exit = worker.run();
                drop(worker);
                tracing::info!(exit = ?exit, "engine thread exiting");
                let _ = done_tx.send(exit);
            })
            .map_err(EngineError::Spawn)?;

        Ok(EngineChannels {
            handle: EngineHandle {
                tx,
                control: control_tx,
                enrolling,
            },
            events,
            done,
        })
    }

    fn process_frame(&mut self, mut frame: Frame, events: &mpsc::UnboundedSender<EngineEvent>) {
        self.frames += 1;
        let at = Moment::now();
        if frame.is_dark {
            tracing::trace!(sequence = frame.sequence, "dark frame skipped");
        } else {
            frame.enhance(&self.clahe);
            match self.oracle.detect(&frame.data, frame.width, frame.height) {
                Ok(faces) => {
                    for landmarks in &faces {
                        let report = self.session.process_face(
                            landmarks,
                            (frame.width, frame.height),
                            &self.gallery,
                            at,
                            &mut self.sheet,
                        );
                        if let Some(report) = report {
                            self.faces += 1;
                            self.publish(&report, events);
                        }
                    }
                }
                Err(e) => tracing::warn!(sequence = frame.sequence, error = %e, "landmark detection failed"),
            }
        }
        self.session.end_frame(at.instant);
    }

    fn publish(&self, report: &FaceReport, events: &mpsc::UnboundedSender<EngineEvent>) {
        let Some(confirmed) = &report.confirmed else {
            return;
        };
        let name = confirmed.label.clone();
        let event = match report.step {
            Some(Step::SubjectRequested) => {
                let group = self
                    .gallery
                    .get(&name)
                    .map_or_else(|| UNSET.to_string(), |r| r.group.clone());
                Some(EngineEvent::SubjectRequested { name, group })
            }
            Some(Step::Entry(outcome)) | Some(Step::Exit(outcome)) => {
                Some(EngineEvent::AttendanceRecorded { name, outcome })
            }
            _ => None,
        };
        if let Some(countdown) = &report.countdown {
            tracing::trace!(person = %confirmed.label, countdown = %countdown, "attendance timer");
        }
        if let Some(event) = event {
            let _ = events.send(event);
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            source: self.source.describe(),
            identities: self.gallery.len(),
            model_loaded: self.session.has_model(),
            frames: self.frames,
            faces: self.faces,
            pending_subjects: self.session.attendance().pending_subjects(),
        }
    }

    fn save_gallery(&self) -> Result<(), EngineError> {
        self.samples.save(&self.gallery).map_err(|e| {
            tracing::warn!(error = %e, "identity store write failed");
            EngineError::from(e)
        })
    }

    fn retrain(&mut self) -> RetrainSummary {
        let dim = self.session.pipeline().dim();
        match classifier::retrain(&self.gallery, dim, self.settings.accept_accuracy) {
            RetrainOutcome::Accepted { model, accuracy } => {
                if let Err(e) = self.models.save_active(&model) {
                    tracing::warn!(error = %e, "failed to persist accepted classifier");
                }
                self.session.replace_model(model);
                tracing::info!(accuracy, "classifier retrained and activated");
                RetrainSummary::Accepted { accuracy }
            }
            RetrainOutcome::Rejected { candidate, accuracy } => {
                let ts = chrono::Utc::now().timestamp();
                if let Err(e) = self.models.archive(&candidate, ts) {
                    tracing::warn!(error = %e, "failed to archive rejected classifier");
                }
                tracing::warn!(
                    accuracy,
                    required = self.settings.accept_accuracy,
                    "retrained classifier below acceptance bar, keeping the active one"
                );
                RetrainSummary::Rejected { accuracy }
            }
            RetrainOutcome::Insufficient => RetrainSummary::Insufficient,
        }
    }

    fn commit_enrollment(&mut self, enrollee: &Enrollee, samples: Samples) -> Result<RetrainSummary, EngineError> {
        let record = IdentityRecord::new(&enrollee.registration, &enrollee.group, &enrollee.subject, samples);
        let previous = self.gallery.insert(enrollee.name.clone(), record);
        if let Err(e) = self.save_gallery() {
            match previous {
                Some(previous) => self.gallery.insert(enrollee.name.clone(), previous),
                None => self.gallery.remove(&enrollee.name),
            };
            return Err(e);
        }
        self.session.attendance_mut().forget(&enrollee.name);
        tracing::info!(name = %enrollee.name, group = %enrollee.group, "identity enrolled");
        Ok(self.retrain())
    }

    fn handle(&mut self, req: EngineRequest, pending: &mut Option<Enrollee>) {
        match req {
            EngineRequest::Enroll { enrollee } => {
                tracing::info!(name = %enrollee.name, "enrollment queued");
                *pending = Some(enrollee);
            }
            EngineRequest::SetSubject { name, subject, group } => {
                let record = self.gallery.get(&name);
                self.session
                    .attendance_mut()
                    .set_subject(&name, &subject, group.as_deref(), record, Instant::now());
            }
            EngineRequest::CancelSubject { name } => {
                tracing::info!(person = %name, "subject dialog dismissed");
                self.session.attendance_mut().cancel_subject(&name);
            }
            EngineRequest::PendingSubjects { reply } => {
                let _ = reply.send(self.session.attendance().pending_subjects());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::ListIdentities { query, reply } => {
                let rows = match query {
                    Some(q) => store::search(&self.gallery, &q),
                    None => store::list(&self.gallery),
                };
                let _ = reply.send(rows);
            }
            EngineRequest::UpdateIdentity { name, update, reply } => {
                let before = self.gallery.clone();
                let result = store::update(&mut self.gallery, &name, &update)
                    .map_err(EngineError::from)
                    .and_then(|renamed| self.save_gallery().map(|()| renamed));
                match &result {
                    Ok(renamed) => {
                        if *renamed != name {
                            self.session.attendance_mut().forget(&name);
                        }
                        tracing::info!(name = %name, now = %renamed, "identity updated");
                    }
                    Err(_) => self.gallery = before,
                }
                let _ = reply.send(result);
            }
            EngineRequest::RemoveIdentity { name, reply } => {
                let before = self.gallery.clone();
                let result = store::remove(&mut self.gallery, &name)
                    .map_err(EngineError::from)
                    .and_then(|()| self.save_gallery());
                match &result {
                    Ok(()) => {
                        self.session.attendance_mut().forget(&name);
                        tracing::info!(name = %name, "identity removed");
                    }
                    Err(_) => self.gallery = before,
                }
                let _ = reply.send(result);
            }
            EngineRequest::Retrain { reply } => {
                let _ = reply.send(self.retrain());
            }
        }
    }
}

/// Engine plus the channel ends only the engine thread touches.
struct Worker {
    engine: Engine,
    inbox: mpsc::Receiver<EngineRequest>,
    control: mpsc::UnboundedReceiver<CaptureControl>,
    events: mpsc::UnboundedSender<EngineEvent>,
    enrolling: Arc<AtomicBool>,
    pending: Option<Enrollee>,
}

impl Worker {
    fn run(&mut self) -> EngineExit {
        loop {
            loop {
                match self.inbox.try_recv() {
                    Ok(req) => self.engine.handle(req, &mut self.pending),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return EngineExit::Shutdown,
                }
            }

            if let Some(enrollee) = self.pending.take() {
                self.enroll(enrollee);
                continue;
            }

            let frame = match self.engine.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(source = %self.engine.source.describe(), "frame source exhausted");
                    return EngineExit::Exhausted;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame source failed");
                    return EngineExit::SourceFailed(e.to_string());
                }
            };

            let (engine, events) = (&mut self.engine, &self.events);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| engine.process_frame(frame, events)));
            if result.is_err() {
                tracing::error!("frame processing panicked, continuing with the next frame");
            }
        }
    }

    fn enroll(&mut self, enrollee: Enrollee) {
        while self.control.try_recv().is_ok() {}
        tracing::info!(name = %enrollee.name, "enrollment capture started");

        let engine = &mut self.engine;
        let captured = {
            let mut feed = LiveFeed {
                source: engine.source.as_mut(),
                oracle: engine.oracle.as_mut(),
                clahe: &engine.clahe,
                control: &mut self.control,
            };
            run_enrollment(engine.session.pipeline(), &mut feed, &engine.settings.enrollment)
        };
        engine.session.clear_tracking();

        let result = captured
            .map_err(EngineError::from)
            .and_then(|samples| engine.commit_enrollment(&enrollee, samples));
        let (success, message) = match result {
            Ok(summary) => (true, serde_json::to_string(&summary).unwrap_or_default()),
            Err(e) => {
                tracing::warn!(name = %enrollee.name, error = %e, "enrollment did not complete");
                (false, e.to_string())
            }
        };

        self.enrolling.store(false, Ordering::SeqCst);
        let _ = self.events.send(EngineEvent::EnrollmentFinished {
            name: enrollee.name,
            success,
            message,
        });
    }
}

/// Live frames plus operator control, as seen by the enrollment capture.
struct LiveFeed<'a> {
    source: &'a mut dyn FrameSource,
    oracle: &'a mut (dyn LandmarkOracle + Send),
    clahe: &'a Clahe,
    control: &'a mut mpsc::UnboundedReceiver<CaptureControl>,
}

impl CaptureFeed for LiveFeed<'_> {
    fn next_event(&mut self) -> FeedEvent {
        match self.control.try_recv() {
            Ok(CaptureControl::Start) => return FeedEvent::Start,
            Ok(CaptureControl::Cancel) | Err(TryRecvError::Disconnected) => return FeedEvent::Cancel,
            Err(TryRecvError::Empty) => {}
        }
        let mut frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return FeedEvent::Closed,
            Err(e) => {
                tracing::warn!(error = %e, "frame source failed during enrollment");
                return FeedEvent::Closed;
            }
        };
        if frame.is_dark {
            return FeedEvent::Frame(None);
        }
        frame.enhance(self.clahe);
        match self.oracle.detect(&frame.data, frame.width, frame.height) {
            Ok(faces) => FeedEvent::Frame(faces.into_iter().next()),
            Err(e) => {
                tracing::warn!(error = %e, "landmark detection failed during enrollment");
                FeedEvent::Frame(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::embedding::{EYE_INDICES, LANDMARK_COUNT, NOSE_INDEX};
    use rollcall_core::{LandmarkSet, Point};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct SyntheticSource {
        remaining: Option<u32>,
        sequence: u32,
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
            }
            std::thread::sleep(Duration::from_millis(2));
            self.sequence += 1;
            let frame = Frame::from_luma(vec![128; 64 * 48], 64, 48, self.sequence).unwrap();
            Ok(Some(frame))
        }

        fn describe(&self) -> String {
            "synthetic".into()
        }
    }

    fn face(nose_x: f32) -> LandmarkSet {
        let mut points: Vec<Point> = (0..LANDMARK_COUNT)
            .map(|i| Point::new(0.3 + 0.4 * (i as f32 / LANDMARK_COUNT as f32), 0.5))
            .collect();
        points[EYE_INDICES.0] = Point::new(0.4, 0.4);
        points[EYE_INDICES.1] = Point::new(0.6, 0.4);
        points[NOSE_INDEX] = Point::new(nose_x, 0.55);
        LandmarkSet::new(points)
    }

    /// Cycles through frontal, right and left faces; or sees nothing.
    struct CyclingOracle {
        faces: Vec<LandmarkSet>,
        calls: usize,
    }

    impl LandmarkOracle for CyclingOracle {
        fn detect(&mut self, _frame: &[u8], _w: u32, _h: u32) -> Result<Vec<LandmarkSet>, OracleError> {
            self.calls += 1;
            if self.faces.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![self.faces[self.calls % self.faces.len()].clone()])
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcalld-engine-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine(dir: &Path, frames: Option<u32>, faces: Vec<LandmarkSet>) -> Engine {
        engine_with_store(dir, SampleStore::new(dir.join("identities.json")), frames, faces)
    }

    fn engine_with_store(dir: &Path, samples: SampleStore, frames: Option<u32>, faces: Vec<LandmarkSet>) -> Engine {
        let enrollment = EnrollmentConfig {
            pose_window: Duration::from_millis(60),
            bulk_enabled: false,
            start_timeout: Duration::from_secs(5),
            ..EnrollmentConfig::default()
        };
        Engine::new(
            Box::new(SyntheticSource {
                remaining: frames,
                sequence: 0,
            }),
            Box::new(CyclingOracle { faces, calls: 0 }),
            AttendanceSheet::open(Path::new(":memory:")).unwrap(),
            samples,
            ModelStore::new(dir.to_path_buf()),
            EngineSettings {
                session: SessionConfig::default(),
                enrollment,
                accept_accuracy: 0.70,
            },
        )
    }

    fn roster() -> Roster {
        Roster::default()
    }

    #[test]
    fn test_enrollee_defaults() {
        let e = Enrollee::with_defaults("", " ", "", "", &roster());
        assert_eq!(e.name, "SinNombre");
        assert_eq!(e.registration, "SinRegistro");
        assert_eq!(e.group, "7O");
        assert_eq!(e.subject, "-");

        let e = Enrollee::with_defaults(" Ana ", "A-1", "7P", "ML", &roster());
        assert_eq!(e.name, "Ana");
        assert_eq!(e.group, "7P");
    }

    #[tokio::test]
    async fn test_exhausted_source_stops_loop() {
        let dir = scratch_dir("exhausted");
        let channels = engine(&dir, Some(5), Vec::new()).spawn().unwrap();
        assert_eq!(channels.done.await.unwrap(), EngineExit::Exhausted);
        assert!(matches!(
            channels.handle.status().await,
            Err(EngineError::ChannelClosed)
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_shuts_down() {
        let dir = scratch_dir("shutdown");
        let EngineChannels { handle, done, .. } = engine(&dir, None, Vec::new()).spawn().unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.source, "synthetic");
        assert_eq!(status.identities, 0);
        assert!(!status.model_loaded);
        drop(handle);
        assert_eq!(done.await.unwrap(), EngineExit::Shutdown);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_subject_requests_and_admin_ops() {
        let dir = scratch_dir("admin");
        let mut samples = Samples::new();
        samples.insert(rollcall_core::Angle::Frontal, Some(vec![0.5; 8]));
        let mut gallery = Gallery::new();
        gallery.insert("Ana".into(), IdentityRecord::new("A-1", "7O", "-", samples));
        SampleStore::new(dir.join("identities.json")).save(&gallery).unwrap();

        let EngineChannels { handle, .. } = engine(&dir, None, Vec::new()).spawn().unwrap();

        assert_eq!(handle.list_identities(None).await.unwrap().len(), 1);
        assert!(handle.list_identities(Some("zzz")).await.unwrap().is_empty());

        handle.set_subject("Ana", "ML", None).await.unwrap();
        handle.cancel_subject("Ana").await.unwrap();
        assert!(handle.pending_subjects().await.unwrap().is_empty());

        let renamed = handle
            .update_identity(
                "Ana",
                IdentityUpdate {
                    name: "Ana R.".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed, "Ana R.");
        assert!(SampleStore::new(dir.join("identities.json")).load().contains_key("Ana R."));

        assert!(matches!(
            handle.remove_identity("Ana").await,
            Err(EngineError::Store(StoreError::UnknownIdentity(_)))
        ));
        handle.remove_identity("Ana R.").await.unwrap();
        assert_eq!(handle.retrain().await.unwrap(), RetrainSummary::Insufficient);
        assert!(SampleStore::new(dir.join("identities.json")).load().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_failed_enrollment_write_leaves_memory_untouched() {
        let dir = scratch_dir("unwritable");
        // A regular file where the store's directory should be.
        std::fs::write(dir.join("blocker"), "").unwrap();
        let store = SampleStore::new(dir.join("blocker").join("identities.json"));
        let mut engine = engine_with_store(&dir, store, Some(0), Vec::new());

        let mut original = Samples::new();
        original.insert(rollcall_core::Angle::Frontal, Some(vec![0.1; 8]));
        engine
            .gallery
            .insert("Ana".into(), IdentityRecord::new("A-1", "7O", "ML", original.clone()));
        engine
            .session
            .attendance_mut()
            .set_subject("Ana", "ML", None, None, Instant::now());

        let mut fresh = Samples::new();
        fresh.insert(rollcall_core::Angle::Frontal, Some(vec![0.9; 8]));
        let ana = Enrollee::with_defaults("Ana", "A-2", "7P", "PDI", &roster());
        assert!(matches!(
            engine.commit_enrollment(&ana, fresh.clone()),
            Err(EngineError::Store(StoreError::Io { .. }))
        ));
        let kept = &engine.gallery["Ana"];
        assert_eq!(kept.registration, "A-1");
        assert_eq!(kept.samples, original);
        assert!(engine.session.attendance().state("Ana").is_some());

        let luis = Enrollee::with_defaults("Luis", "", "", "", &roster());
        assert!(engine.commit_enrollment(&luis, fresh).is_err());
        assert!(!engine.gallery.contains_key("Luis"));
        assert_eq!(engine.gallery.len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    async fn next_finished(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Option<(String, bool)> {
        while let Some(event) = events.recv().await {
            if let EngineEvent::EnrollmentFinished { name, success, .. } = event {
                return Some((name, success));
            }
        }
        None
    }

    #[tokio::test]
    async fn test_enrollment_through_handle() {
        let dir = scratch_dir("enroll");
        let faces = vec![face(0.5), face(0.44), face(0.56)];
        let EngineChannels {
            handle, mut events, ..
        } = engine(&dir, None, faces).spawn().unwrap();

        let enrollee = Enrollee::with_defaults("Ana", "A-1", "", "ML", &roster());
        handle.enroll(enrollee.clone()).await.unwrap();
        assert!(handle.is_enrolling());
        assert!(matches!(
            handle.enroll(enrollee).await,
            Err(EngineError::EnrollmentPending)
        ));

        let trigger = handle.clone();
        let starter = tokio::spawn(async move {
            while trigger.is_enrolling() {
                let _ = trigger.start_capture();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let finished = tokio::time::timeout(Duration::from_secs(20), next_finished(&mut events))
            .await
            .unwrap();
        assert_eq!(finished, Some(("Ana".to_string(), true)));
        starter.await.unwrap();

        let listed = handle.list_identities(Some("ana")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].group, "7O");
        assert_eq!(listed[0].angles.len(), 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_enrollment_persists_nothing() {
        let dir = scratch_dir("cancel");
        let EngineChannels {
            handle, mut events, ..
        } = engine(&dir, None, vec![face(0.5)]).spawn().unwrap();

        handle
            .enroll(Enrollee::with_defaults("Luis", "", "", "", &roster()))
            .await
            .unwrap();
        let trigger = handle.clone();
        let canceller = tokio::spawn(async move {
            while trigger.is_enrolling() {
                let _ = trigger.cancel_capture();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let finished = tokio::time::timeout(Duration::from_secs(20), next_finished(&mut events))
            .await
            .unwrap();
        assert_eq!(finished, Some(("Luis".to_string(), false)));
        canceller.await.unwrap();
        assert!(handle.list_identities(None).await.unwrap().is_empty());
        assert!(!dir.join("identities.json").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
