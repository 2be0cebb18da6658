//! SQLite attendance sheet.
//!
//! The engine thread writes through [`AttendanceSheet`] (synchronous
//! `rusqlite`, called from the frame loop); D-Bus handlers read through
//! [`AttendanceLog`] (`tokio-rusqlite`) on the same database file.

use chrono::NaiveDateTime;
use rollcall_core::attendance::{AttendanceMark, AttendanceOutcome, AttendanceSink, MarkKind};
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
const NOT_SET: &str = "-";

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
     CREATE TABLE IF NOT EXISTS attendance (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         date TEXT NOT NULL,
         person TEXT NOT NULL,
         registration TEXT NOT NULL,
         group_name TEXT NOT NULL,
         subject TEXT NOT NULL,
         entry_time TEXT NOT NULL,
         exit_time TEXT NOT NULL DEFAULT '-'
     );
     CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(date, person, subject);";

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("cannot create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn ensure_parent(path: &Path) -> Result<(), SheetError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|source| SheetError::Io {
                path: parent.display().to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Write side of the attendance table.
pub struct AttendanceSheet {
    conn: rusqlite::Connection,
}

impl AttendanceSheet {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self, SheetError> {
        ensure_parent(path)?;
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "attendance sheet opened");
        Ok(Self { conn })
    }

    fn try_record(
        &self,
        mark: &AttendanceMark<'_>,
        kind: MarkKind,
        at: NaiveDateTime,
    ) -> Result<AttendanceOutcome, rusqlite::Error> {
        let date = at.format(DATE_FORMAT).to_string();
        let time = at.format(TIME_FORMAT).to_string();

        match kind {
            MarkKind::Entry => {
                let entered: u64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM attendance
                     WHERE date = ?1 AND person = ?2 AND subject = ?3 AND entry_time != '-'",
                    rusqlite::params![date, mark.person, mark.subject],
                    |row| row.get(0),
                )?;
                if entered > 0 {
                    return Ok(AttendanceOutcome::EntryDuplicate);
                }
                self.conn.execute(
                    "INSERT INTO attendance (date, person, registration, group_name, subject, entry_time, exit_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![date, mark.person, mark.registration, mark.group, mark.subject, time, NOT_SET],
                )?;
                Ok(AttendanceOutcome::EntryOk)
            }
            MarkKind::Exit => {
                let rows: u64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND person = ?2 AND subject = ?3",
                    rusqlite::params![date, mark.person, mark.subject],
                    |row| row.get(0),
                )?;
                if rows == 0 {
                    return Ok(AttendanceOutcome::NoEntry);
                }
                let open: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT id FROM attendance
                         WHERE date = ?1 AND person = ?2 AND subject = ?3
                           AND entry_time != '-' AND exit_time = '-'
                         ORDER BY id DESC LIMIT 1",
                        rusqlite::params![date, mark.person, mark.subject],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(id) = open else {
                    return Ok(AttendanceOutcome::ExitDuplicate);
                };
                self.conn.execute(
                    "UPDATE attendance SET exit_time = ?1 WHERE id = ?2",
                    rusqlite::params![time, id],
                )?;
                Ok(AttendanceOutcome::ExitOk)
            }
        }
    }
}

impl AttendanceSink for AttendanceSheet {
    fn record(&mut self, mark: &AttendanceMark<'_>, kind: MarkKind, at: NaiveDateTime) -> AttendanceOutcome {
        match self.try_record(mark, kind, at) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(person = mark.person, kind = ?kind, error = %e, "attendance write failed");
                AttendanceOutcome::Error
            }
        }
    }
}

/// One attendance row as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub date: String,
    pub person: String,
    pub registration: String,
    pub group: String,
    pub subject: String,
    pub entry: String,
    pub exit: String,
}

/// Row filter; `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub date: Option<String>,
    pub group: Option<String>,
    pub subject: Option<String>,
}

impl RecordFilter {
    /// Build a filter from D-Bus arguments, where an empty string means "any".
    pub fn from_args(date: &str, group: &str, subject: &str) -> Self {
        let arg = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            date: arg(date),
            group: arg(group),
            subject: arg(subject),
        }
    }
}

/// Read side of the attendance table.
#[derive(Clone)]
pub struct AttendanceLog {
    conn: tokio_rusqlite::Connection,
}

impl AttendanceLog {
    pub async fn open(path: &Path) -> Result<Self, SheetError> {
        ensure_parent(path)?;
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn records(&self, filter: RecordFilter) -> Result<Vec<AttendanceRow>, SheetError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT date, person, registration, group_name, subject, entry_time, exit_time
                     FROM attendance
                     WHERE (?1 IS NULL OR date = ?1)
                       AND (?2 IS NULL OR group_name = ?2)
                       AND (?3 IS NULL OR subject = ?3)
                     ORDER BY id",
                )?;
                let rows = stmt.query_map(rusqlite::params![filter.date, filter.group, filter.subject], |row| {
                    Ok(AttendanceRow {
                        date: row.get(0)?,
                        person: row.get(1)?,
                        registration: row.get(2)?,
                        group: row.get(3)?,
                        subject: row.get(4)?,
                        entry: row.get(5)?,
                        exit: row.get(6)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(SheetError::from)
    }

    /// Rows for the day with an entry but no exit yet.
    pub async fn open_rows(&self, date: &str) -> Result<u64, SheetError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND exit_time = '-'",
                    [&date],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(SheetError::from)
    }
}
