//! Canonical recognition events and the per-day aggregates derived
//! from them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which modality (or combination) produced a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceModality {
    Vision,
    Audio,
    Fused,
}

impl SourceModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceModality::Vision => "vision",
            SourceModality::Audio => "audio",
            SourceModality::Fused => "fused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vision" => Some(SourceModality::Vision),
            "audio" => Some(SourceModality::Audio),
            "fused" => Some(SourceModality::Fused),
            _ => None,
        }
    }
}

/// The canonical, persisted recognition record.
///
/// Created exclusively by the fusion engine and never mutated after
/// creation; a correction creates a new event whose `supersedes` field
/// references the replaced one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionEvent {
    /// Unique identifier, the idempotency key for `SessionStore::append`
    pub id: Uuid,

    /// Modality the winning result came from
    pub source_modality: SourceModality,

    /// Recognized problem text
    pub text: String,

    /// Confidence of the winning result, always at or above the
    /// configured acceptance threshold
    pub confidence: f32,

    /// When the capture completed
    pub captured_at: DateTime<Utc>,

    /// Optional subject classification (math, english, ...)
    pub subject_tag: Option<String>,

    /// Id of the event this one corrects, if any
    pub supersedes: Option<Uuid>,
}

impl RecognitionEvent {
    /// Create a new event with the current timestamp
    pub fn new(source_modality: SourceModality, text: String, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_modality,
            text,
            confidence,
            captured_at: Utc::now(),
            subject_tag: None,
            supersedes: None,
        }
    }

    /// Attach a subject classification
    pub fn with_subject_tag(mut self, tag: impl Into<String>) -> Self {
        self.subject_tag = Some(tag.into());
        self
    }

    /// Build a correction of this event. The original stays in the log;
    /// the new event carries the corrected text and points back here.
    pub fn correction(&self, text: String, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_modality: self.source_modality,
            text,
            confidence,
            captured_at: Utc::now(),
            subject_tag: self.subject_tag.clone(),
            supersedes: Some(self.id),
        }
    }

    /// Day key used for aggregation
    pub fn day(&self) -> NaiveDate {
        self.captured_at.date_naive()
    }
}

/// Derived per-day, per-subject statistics.
///
/// Never a source of truth: always reconstructable from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregate {
    pub day: NaiveDate,
    pub subject_tag: Option<String>,
    pub event_count: u64,
    pub avg_confidence: f64,
}
