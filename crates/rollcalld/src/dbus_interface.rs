use crate::config::Roster;
use crate::engine::{EngineEvent, EngineHandle, Enrollee};
use crate::sheet::{AttendanceLog, RecordFilter, DATE_FORMAT};
use crate::store::IdentityUpdate;
use tokio::sync::mpsc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// The enrollment and subject dialogs are clients of this interface: they
/// answer `SubjectRequested` with `SetSubject`/`CancelSubject` and drive
/// capture with `StartCapture`/`CancelCapture`.
pub struct AttendanceService {
    engine: EngineHandle,
    log: AttendanceLog,
    roster: Roster,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, log: AttendanceLog, roster: Roster) -> Self {
        Self { engine, log, roster }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Queue an enrollment. Blank fields take their defaults. Returns the
    /// effective identity as JSON; capture waits for `StartCapture`.
    async fn enroll(
        &self,
        name: &str,
        registration: &str,
        group: &str,
        subject: &str,
    ) -> zbus::fdo::Result<String> {
        let enrollee = Enrollee::with_defaults(name, registration, group, subject, &self.roster);
        tracing::info!(name = %enrollee.name, group = %enrollee.group, "enroll requested");
        self.engine.enroll(enrollee.clone()).await.map_err(failed)?;
        serde_json::to_string(&enrollee).map_err(failed)
    }

    /// Begin sampling the current enrollment pose.
    async fn start_capture(&self) -> zbus::fdo::Result<()> {
        if !self.engine.is_enrolling() {
            return Err(zbus::fdo::Error::Failed("no enrollment in progress".into()));
        }
        self.engine.start_capture().map_err(failed)
    }

    /// Abort the current enrollment; nothing is stored.
    async fn cancel_capture(&self) -> zbus::fdo::Result<()> {
        tracing::info!("capture cancel requested");
        self.engine.cancel_capture().map_err(failed)
    }

    /// Answer a subject request. A blank group keeps the enrolled group.
    async fn set_subject(&self, name: &str, subject: &str, group: &str) -> zbus::fdo::Result<()> {
        tracing::info!(name, subject, group, "subject selected");
        let group = Some(group.trim()).filter(|g| !g.is_empty());
        self.engine.set_subject(name, subject, group).await.map_err(failed)
    }

    async fn cancel_subject(&self, name: &str) -> zbus::fdo::Result<()> {
        self.engine.cancel_subject(name).await.map_err(failed)
    }

    async fn pending_subjects(&self) -> zbus::fdo::Result<Vec<String>> {
        self.engine.pending_subjects().await.map_err(failed)
    }

    /// Groups and subjects the dialogs offer, as JSON.
    async fn roster(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "groups": self.roster.groups,
            "subjects": self.roster.subjects,
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        if self.engine.is_enrolling() {
            return Ok(serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "enrolling": true,
            })
            .to_string());
        }
        let status = self.engine.status().await.map_err(failed)?;
        let today = chrono::Local::now().format(DATE_FORMAT).to_string();
        let open_rows = self.log.open_rows(&today).await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolling": false,
            "source": status.source,
            "identities": status.identities,
            "model_loaded": status.model_loaded,
            "frames": status.frames,
            "faces": status.faces,
            "pending_subjects": status.pending_subjects,
            "open_rows_today": open_rows,
        })
        .to_string())
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let rows = self.engine.list_identities(None).await.map_err(failed)?;
        serde_json::to_string(&rows).map_err(failed)
    }

    /// Identities whose name or registration contains `query`.
    async fn search_identities(&self, query: &str) -> zbus::fdo::Result<String> {
        let rows = self.engine.list_identities(Some(query)).await.map_err(failed)?;
        serde_json::to_string(&rows).map_err(failed)
    }

    /// Change an identity's fields; blank arguments are left unchanged.
    /// Returns the identity's name afterwards.
    async fn update_identity(
        &self,
        name: &str,
        new_name: &str,
        registration: &str,
        group: &str,
        subject: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, new_name, "update_identity requested");
        let update = IdentityUpdate {
            name: new_name.to_string(),
            registration: registration.to_string(),
            group: group.to_string(),
            subject: subject.to_string(),
        };
        self.engine.update_identity(name, update).await.map_err(failed)
    }

    async fn remove_identity(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove_identity requested");
        self.engine.remove_identity(name).await.map_err(failed)?;
        Ok(true)
    }

    /// Attendance rows as JSON; blank filters match everything.
    async fn list_attendance(&self, date: &str, group: &str, subject: &str) -> zbus::fdo::Result<String> {
        let rows = self
            .log
            .records(RecordFilter::from_args(date, group, subject))
            .await
            .map_err(failed)?;
        serde_json::to_string(&rows).map_err(failed)
    }

    async fn retrain(&self) -> zbus::fdo::Result<String> {
        let summary = self.engine.retrain().await.map_err(failed)?;
        serde_json::to_string(&summary).map_err(failed)
    }

    #[zbus(signal)]
    async fn subject_requested(emitter: &SignalEmitter<'_>, name: &str, group: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn attendance_recorded(emitter: &SignalEmitter<'_>, name: &str, outcome: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn enrollment_finished(
        emitter: &SignalEmitter<'_>,
        name: &str,
        success: bool,
        message: &str,
    ) -> zbus::Result<()>;
}

/// Forward engine notifications as signals until the engine goes away.
pub async fn forward_events(conn: zbus::Connection, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit signals");
            return;
        }
    };
    while let Some(event) = events.recv().await {
        let sent = match &event {
            EngineEvent::SubjectRequested { name, group } => {
                AttendanceService::subject_requested(&emitter, name, group).await
            }
            EngineEvent::AttendanceRecorded { name, outcome } => {
                AttendanceService::attendance_recorded(&emitter, name, outcome.as_str()).await
            }
            EngineEvent::EnrollmentFinished { name, success, message } => {
                AttendanceService::enrollment_finished(&emitter, name, *success, message).await
            }
        };
        if let Err(e) = sent {
            tracing::warn!(event = ?event, error = %e, "signal emission failed");
        }
    }
}
