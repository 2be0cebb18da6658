//! Per-identity attendance lifecycle.
//!
//! ```text
//! NoSubject ──set_subject──▶ HasSubject { NoEntry ─▶ Entered ─▶ Exited }
//!     ▲                                                         │
//!     └──────────────── not sighted for `stale_after` ──────────┘
//! ```
//!
//! The tracker only sees identities that were already confirmed over several
//! frames, so an exit is recorded only while the person is in front of the
//! camera once the exit delay has elapsed.

use crate::identity::{IdentityRecord, UNSET};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

pub const EXIT_AFTER: Duration = Duration::from_secs(30);
pub const DEBOUNCE: Duration = Duration::from_millis(1200);
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// A point in time on both the monotonic clock (timers) and the local wall
/// clock (attendance rows).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moment {
    pub instant: Instant,
    pub local: NaiveDateTime,
}

impl Moment {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            local: chrono::Local::now().naive_local(),
        }
    }

    pub fn advance(&self, by: Duration) -> Self {
        let local = chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| self.local.checked_add_signed(d))
            .unwrap_or(self.local);
        Self {
            instant: self.instant + by,
            local,
        }
    }
}

/// Sink result codes. The string forms are the codes stored and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceOutcome {
    EntryOk,
    EntryDuplicate,
    ExitOk,
    NoEntry,
    ExitDuplicate,
    Error,
}

impl AttendanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceOutcome::EntryOk => "entrada_ok",
            AttendanceOutcome::EntryDuplicate => "entrada_duplicada",
            AttendanceOutcome::ExitOk => "salida_ok",
            AttendanceOutcome::NoEntry => "sin_entrada",
            AttendanceOutcome::ExitDuplicate => "salida_duplicada",
            AttendanceOutcome::Error => "error",
        }
    }
}

impl fmt::Display for AttendanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkKind {
    Entry,
    Exit,
}

/// Everything the sink needs to write or close a row.
#[derive(Debug, Clone, Copy)]
pub struct AttendanceMark<'a> {
    pub person: &'a str,
    pub registration: &'a str,
    pub group: &'a str,
    pub subject: &'a str,
}

/// Persistent attendance log.
///
/// `Entry` appends an open row unless one exists for (date, person, subject);
/// `Exit` closes the most recent open row for that key. Both are idempotent
/// against duplicates and report what happened through the outcome code.
pub trait AttendanceSink {
    fn record(&mut self, mark: &AttendanceMark<'_>, kind: MarkKind, at: NaiveDateTime) -> AttendanceOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceConfig {
    pub exit_after: Duration,
    pub debounce: Duration,
    pub stale_after: Duration,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            exit_after: EXIT_AFTER,
            debounce: DEBOUNCE,
            stale_after: STALE_AFTER,
        }
    }
}

/// Phase shown by a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entry,
    Exit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Entry => "entrada",
            Phase::Exit => "salida",
        }
    }

    pub fn next(&self) -> Phase {
        match self {
            Phase::Entry => Phase::Exit,
            Phase::Exit => Phase::Entry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timer {
    pub phase: Phase,
    pub started: Instant,
}

/// Time left until the next phase of a live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub next: Phase,
    /// Whole seconds remaining; `<= 0` means ready.
    pub remaining: i64,
}

impl Countdown {
    pub fn is_ready(&self) -> bool {
        self.remaining <= 0
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            write!(f, "ready for {}", self.next.as_str())
        } else {
            write!(f, "{} in {}s", self.next.as_str(), self.remaining)
        }
    }
}

/// Attendance bookkeeping for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonState {
    pub entry_marked: bool,
    pub exit_marked: bool,
    pub entry_time: Option<Instant>,
    pub last_seen: Instant,
    pub last_action: Option<Instant>,
    /// Subject chosen for this session; `None` until the dialog answers.
    pub subject: Option<String>,
    pub group: Option<String>,
    pub registration: String,
    subject_requested: bool,
}

impl PersonState {
    fn new(registration: String, now: Instant) -> Self {
        Self {
            entry_marked: false,
            exit_marked: false,
            entry_time: None,
            last_seen: now,
            last_action: None,
            subject: None,
            group: None,
            registration,
            subject_requested: false,
        }
    }

    fn is_initial(&self) -> bool {
        !self.entry_marked
            && !self.exit_marked
            && self.entry_time.is_none()
            && self.subject.is_none()
            && self.group.is_none()
            && !self.subject_requested
    }

    fn reset(&mut self) {
        self.entry_marked = false;
        self.exit_marked = false;
        self.entry_time = None;
        self.last_action = None;
        self.subject = None;
        self.group = None;
        self.subject_requested = false;
    }

    pub fn subject_requested(&self) -> bool {
        self.subject_requested
    }
}

/// What a confirmed sighting did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// First sighting without a subject: ask for one.
    SubjectRequested,
    /// Still waiting on the subject dialog.
    AwaitingSubject,
    /// Inside the debounce window.
    Debounced,
    Entry(AttendanceOutcome),
    Exit(AttendanceOutcome),
    /// Entered; exit delay not yet elapsed.
    Waiting,
    /// Entered and exited; nothing more until the state goes stale.
    Complete,
}

/// Session-wide attendance state, keyed by identity name.
#[derive(Debug, Default)]
pub struct AttendanceTracker {
    config: AttendanceConfig,
    states: HashMap<String, PersonState>,
    timers: HashMap<String, Timer>,
}

impl AttendanceTracker {
    pub fn new(config: AttendanceConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AttendanceConfig {
        &self.config
    }

    pub fn state(&self, label: &str) -> Option<&PersonState> {
        self.states.get(label)
    }

    pub fn timer(&self, label: &str) -> Option<&Timer> {
        self.timers.get(label)
    }

    fn state_mut(&mut self, label: &str, record: Option<&IdentityRecord>, now: Instant) -> &mut PersonState {
        self.states.entry(label.to_string()).or_insert_with(|| {
            let registration = record.map_or_else(|| UNSET.to_string(), |r| r.registration.clone());
            PersonState::new(registration, now)
        })
    }

    /// Handle one confirmed sighting of `label`.
    pub fn observe(
        &mut self,
        label: &str,
        record: Option<&IdentityRecord>,
        at: Moment,
        sink: &mut dyn AttendanceSink,
    ) -> Step {
        let config = self.config;
        let now = at.instant;
        let state = self.state_mut(label, record, now);

        if state.subject.is_none() {
            state.last_seen = now;
            if state.subject_requested {
                return Step::AwaitingSubject;
            }
            state.subject_requested = true;
            tracing::info!(person = label, "requesting subject selection");
            return Step::SubjectRequested;
        }

        if state
            .last_action
            .is_some_and(|t| now.saturating_duration_since(t) < config.debounce)
        {
            state.last_seen = now;
            return Step::Debounced;
        }

        let subject = state
            .subject
            .clone()
            .or_else(|| record.map(|r| r.subject.clone()))
            .unwrap_or_else(|| UNSET.to_string());
        let group = state
            .group
            .clone()
            .or_else(|| record.map(|r| r.group.clone()))
            .unwrap_or_else(|| UNSET.to_string());
        let registration = state.registration.clone();
        let mark = AttendanceMark {
            person: label,
            registration: &registration,
            group: &group,
            subject: &subject,
        };

        let mut new_timer = None;
        let step = if !state.entry_marked && !state.exit_marked {
            let outcome = sink.record(&mark, MarkKind::Entry, at.local);
            state.last_action = Some(now);
            match outcome {
                AttendanceOutcome::EntryOk => {
                    state.entry_marked = true;
                    state.entry_time = Some(now);
                    new_timer = Some(Phase::Entry);
                    tracing::info!(person = label, subject = %subject, "entry recorded");
                }
                AttendanceOutcome::EntryDuplicate => {
                    tracing::info!(person = label, subject = %subject, "entry already recorded");
                }
                other => {
                    tracing::warn!(person = label, outcome = %other, "entry not recorded");
                }
            }
            Step::Entry(outcome)
        } else if state.entry_marked && !state.exit_marked {
            let due = state
                .entry_time
                .is_some_and(|t| now.saturating_duration_since(t) >= config.exit_after);
            if due {
                let outcome = sink.record(&mark, MarkKind::Exit, at.local);
                state.last_action = Some(now);
                match outcome {
                    AttendanceOutcome::ExitOk | AttendanceOutcome::ExitDuplicate => {
                        state.exit_marked = true;
                        new_timer = Some(Phase::Exit);
                        tracing::info!(person = label, subject = %subject, outcome = %outcome, "exit recorded");
                    }
                    AttendanceOutcome::NoEntry => {
                        state.entry_marked = false;
                        state.entry_time = None;
                        tracing::warn!(person = label, subject = %subject, "exit without an open entry");
                    }
                    other => {
                        tracing::warn!(person = label, outcome = %other, "exit not recorded");
                    }
                }
                Step::Exit(outcome)
            } else {
                Step::Waiting
            }
        } else {
            Step::Complete
        };

        state.last_seen = now;
        if let Some(phase) = new_timer {
            self.timers.insert(label.to_string(), Timer { phase, started: now });
        }
        step
    }

    /// Answer to the subject dialog. An empty subject is stored as `"-"`.
    pub fn set_subject(
        &mut self,
        label: &str,
        subject: &str,
        group: Option<&str>,
        record: Option<&IdentityRecord>,
        now: Instant,
    ) {
        let state = self.state_mut(label, record, now);
        let subject = subject.trim();
        state.subject = Some(if subject.is_empty() { UNSET.to_string() } else { subject.to_string() });
        state.group = group
            .filter(|g| !g.trim().is_empty())
            .map(str::to_string)
            .or_else(|| record.map(|r| r.group.clone()));
        if let Some(r) = record {
            state.registration = r.registration.clone();
        }
        state.subject_requested = false;
        state.last_seen = now;
        tracing::info!(person = label, subject = ?state.subject, group = ?state.group, "subject set");
    }

    /// Dialog dismissed: allow the request to be raised again.
    pub fn cancel_subject(&mut self, label: &str) {
        if let Some(state) = self.states.get_mut(label) {
            state.subject_requested = false;
        }
    }

    /// Identities waiting on a subject dialog.
    pub fn pending_subjects(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| s.subject_requested && s.subject.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Reset identities not sighted for `stale_after`. Returns the labels reset.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let stale_after = self.config.stale_after;
        let mut reset = Vec::new();
        for (label, state) in self.states.iter_mut() {
            if now.saturating_duration_since(state.last_seen) > stale_after && !state.is_initial() {
                state.reset();
                reset.push(label.clone());
            }
        }
        for label in &reset {
            self.timers.remove(label);
            tracing::debug!(person = %label, "attendance state went stale, reset");
        }
        reset
    }

    pub fn countdown(&self, label: &str, now: Instant) -> Option<Countdown> {
        let timer = self.timers.get(label)?;
        let elapsed = now.saturating_duration_since(timer.started).as_secs_f64();
        let remaining = (self.config.exit_after.as_secs_f64() - elapsed) as i64;
        Some(Countdown {
            next: timer.phase.next(),
            remaining,
        })
    }

    pub fn forget(&mut self, label: &str) {
        self.states.remove(label);
        self.timers.remove(label);
    }
}
