//! Session store: durable, append-only log of recognition events plus
//! derived per-day aggregates.
//!
//! Backed by SQLite. The event log is the only source of truth; the
//! `daily_aggregates` table is maintained incrementally inside the same
//! transaction as each append, and [`SessionStore::recompute_aggregates`]
//! rebuilds the same values from the log alone so audits can prove the
//! two never drift. Confidence sums are kept in integer millionths so
//! incremental and recomputed values are bit-identical regardless of
//! summation order.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{RecognitionEvent, SessionAggregate, SourceModality};

const CONFIDENCE_SCALE: f64 = 1_000_000.0;

/// Errors from the session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Whether an append inserted a new row or hit an existing id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Duplicate,
}

/// Inclusive date range for queries
#[derive(Debug, Clone, Copy)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }
}

/// SQLite-backed session store.
///
/// A single connection behind a mutex serializes appends against
/// concurrent queries; each append runs in its own transaction so
/// readers never observe a partially written event.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) a store at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, demo)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS recognition_events (
                id              TEXT PRIMARY KEY,
                source_modality TEXT NOT NULL,
                text            TEXT NOT NULL,
                confidence      REAL NOT NULL,
                captured_at     INTEGER NOT NULL,
                day             TEXT NOT NULL,
                subject_tag     TEXT,
                supersedes      TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_day ON recognition_events(day);
            CREATE INDEX IF NOT EXISTS idx_events_captured_at ON recognition_events(captured_at);

            CREATE TABLE IF NOT EXISTS daily_aggregates (
                day             TEXT NOT NULL,
                subject_tag     TEXT NOT NULL DEFAULT '',
                event_count     INTEGER NOT NULL,
                confidence_sum  INTEGER NOT NULL,
                PRIMARY KEY (day, subject_tag)
            );
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the log.
    ///
    /// Idempotent on `id`: re-appending an already stored event is a
    /// no-op (`Duplicate`), not an error, so upstream at-least-once
    /// delivery cannot double-count aggregates.
    pub fn append(&self, event: &RecognitionEvent) -> Result<AppendOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO recognition_events
             (id, source_modality, text, confidence, captured_at, day, subject_tag, supersedes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.to_string(),
                event.source_modality.as_str(),
                event.text,
                event.confidence as f64,
                event.captured_at.timestamp_micros(),
                event.day().to_string(),
                event.subject_tag,
                event.supersedes.map(|id| id.to_string()),
            ],
        )?;

        if inserted == 0 {
            tx.commit()?;
            debug!(event_id = %event.id, "Duplicate append ignored");
            return Ok(AppendOutcome::Duplicate);
        }

        tx.execute(
            "INSERT INTO daily_aggregates (day, subject_tag, event_count, confidence_sum)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(day, subject_tag) DO UPDATE SET
                 event_count = event_count + 1,
                 confidence_sum = confidence_sum + excluded.confidence_sum",
            params![
                event.day().to_string(),
                event.subject_tag.as_deref().unwrap_or(""),
                confidence_units(event.confidence),
            ],
        )?;

        tx.commit()?;
        Ok(AppendOutcome::Inserted)
    }

    /// Events within the range (and subject, if given), ordered by
    /// `captured_at` ascending
    pub fn query(
        &self,
        range: DateRange,
        subject_tag: Option<&str>,
    ) -> Result<Vec<RecognitionEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let base = "SELECT id, source_modality, text, confidence, captured_at, subject_tag, supersedes
                    FROM recognition_events
                    WHERE day >= ?1 AND day <= ?2";

        let mut events = Vec::new();
        match subject_tag {
            Some(tag) => {
                let sql = format!("{} AND subject_tag = ?3 ORDER BY captured_at ASC", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![range.from.to_string(), range.to.to_string(), tag],
                    row_to_event,
                )?;
                for row in rows {
                    events.push(row??);
                }
            }
            None => {
                let sql = format!("{} ORDER BY captured_at ASC", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![range.from.to_string(), range.to.to_string()],
                    row_to_event,
                )?;
                for row in rows {
                    events.push(row??);
                }
            }
        }

        Ok(events)
    }

    /// Look up a single event by id
    pub fn get(&self, id: Uuid) -> Result<Option<RecognitionEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_modality, text, confidence, captured_at, subject_tag, supersedes
             FROM recognition_events WHERE id = ?1",
        )?;

        let row = stmt
            .query_row(params![id.to_string()], row_to_event)
            .optional()?;

        row.transpose()
    }

    /// Incrementally maintained aggregates for the range, ordered by
    /// day then subject
    pub fn aggregate(&self, range: DateRange) -> Result<Vec<SessionAggregate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT day, subject_tag, event_count, confidence_sum
             FROM daily_aggregates
             WHERE day >= ?1 AND day <= ?2
             ORDER BY day ASC, subject_tag ASC",
        )?;

        let rows = stmt.query_map(
            params![range.from.to_string(), range.to.to_string()],
            row_to_aggregate,
        )?;

        let mut aggregates = Vec::new();
        for row in rows {
            aggregates.push(row??);
        }
        Ok(aggregates)
    }

    /// Rebuild the aggregates for the range purely from the event log.
    ///
    /// Used to audit the incrementally maintained table: the result
    /// must always equal [`aggregate`](Self::aggregate) for the same
    /// range.
    pub fn recompute_aggregates(
        &self,
        range: DateRange,
    ) -> Result<Vec<SessionAggregate>, StoreError> {
        let events = self.query(range, None)?;

        // Group on the typed day derived from each event's validated
        // timestamp; a corrupt row surfaces from `query` instead of
        // being silently folded into another day
        let mut grouped: std::collections::BTreeMap<(NaiveDate, String), (u64, i64)> =
            std::collections::BTreeMap::new();

        for event in &events {
            let key = (event.day(), event.subject_tag.clone().unwrap_or_default());
            let entry = grouped.entry(key).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += confidence_units(event.confidence);
        }

        Ok(grouped
            .into_iter()
            .map(|((day, tag), (count, sum))| SessionAggregate {
                day,
                subject_tag: (!tag.is_empty()).then_some(tag),
                event_count: count,
                avg_confidence: sum as f64 / CONFIDENCE_SCALE / count as f64,
            })
            .collect())
    }
}

/// Confidence in integer millionths, the unit of `confidence_sum`
fn confidence_units(confidence: f32) -> i64 {
    (confidence as f64 * CONFIDENCE_SCALE).round() as i64
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RecognitionEvent, StoreError>> {
    let id: String = row.get(0)?;
    let source: String = row.get(1)?;
    let text: String = row.get(2)?;
    let confidence: f64 = row.get(3)?;
    let captured_at: i64 = row.get(4)?;
    let subject_tag: Option<String> = row.get(5)?;
    let supersedes: Option<String> = row.get(6)?;

    Ok(build_event(
        id,
        source,
        text,
        confidence,
        captured_at,
        subject_tag,
        supersedes,
    ))
}

fn build_event(
    id: String,
    source: String,
    text: String,
    confidence: f64,
    captured_at: i64,
    subject_tag: Option<String>,
    supersedes: Option<String>,
) -> Result<RecognitionEvent, StoreError> {
    let id = Uuid::parse_str(&id).map_err(|e| corrupt_field("id", e))?;
    let source_modality = SourceModality::parse(&source)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown source modality: {}", source)))?;
    let captured_at = DateTime::<Utc>::from_timestamp_micros(captured_at)
        .ok_or_else(|| StoreError::CorruptRow(format!("bad timestamp: {}", captured_at)))?;
    let supersedes = supersedes
        .map(|s| Uuid::parse_str(&s).map_err(|e| corrupt_field("supersedes", e)))
        .transpose()?;

    Ok(RecognitionEvent {
        id,
        source_modality,
        text,
        confidence: confidence as f32,
        captured_at,
        subject_tag,
        supersedes,
    })
}

fn row_to_aggregate(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<SessionAggregate, StoreError>> {
    let day: String = row.get(0)?;
    let subject_tag: String = row.get(1)?;
    let event_count: i64 = row.get(2)?;
    let confidence_sum: i64 = row.get(3)?;

    Ok(day
        .parse::<NaiveDate>()
        .map_err(|e| StoreError::CorruptRow(format!("bad day '{}': {}", day, e)))
        .map(|day| SessionAggregate {
            day,
            subject_tag: (!subject_tag.is_empty()).then_some(subject_tag),
            event_count: event_count as u64,
            avg_confidence: confidence_sum as f64
                / CONFIDENCE_SCALE
                / (event_count.max(1)) as f64,
        }))
}

fn corrupt_field(name: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow(format!("bad {}: {}", name, err))
}
