//! Fusion engine: reconciles per-modality results into canonical
//! recognition events.
//!
//! A logical capture session may span one or two modalities. The broker
//! registers each session with the number of requests it issued and
//! guarantees exactly one terminal result per request, so fusion fires
//! as soon as every expected result has arrived; the session window
//! only bounds eviction of sessions abandoned mid-capture. Every
//! created event is appended to the session store before the caller
//! sees `Recognized`, so observing success implies durability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecognizerConfig;
use crate::domain::{Modality, RawRecognitionResult, RecognitionEvent, SourceModality};
use crate::store::{SessionStore, StoreError};

/// What a delivered result led to
#[derive(Debug, Clone)]
pub enum FusionOutcome {
    /// Session still waits on another modality
    Pending,

    /// A canonical event was created and durably stored
    Recognized(RecognitionEvent),

    /// Every result in the session was unusable; no event created
    NoRecognition,
}

struct PendingSession {
    expected: usize,
    received: Vec<RawRecognitionResult>,
    deadline: Instant,
}

/// The core arbiter between the vision and audio pipelines
pub struct FusionEngine {
    store: Arc<SessionStore>,
    config: RecognizerConfig,
    pending: Mutex<HashMap<Uuid, PendingSession>>,
}

impl FusionEngine {
    pub fn new(store: Arc<SessionStore>, config: RecognizerConfig) -> Self {
        Self {
            store,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Announce a capture session and how many terminal results it will
    /// deliver (1 for a single-modality capture, 2 for a dual capture).
    pub async fn register_session(&self, session_id: Uuid, expected: usize) {
        let deadline = Instant::now()
            + Duration::from_millis(self.config.capture_timeout_ms + self.config.session_window_ms);

        let mut pending = self.pending.lock().await;
        pending.insert(
            session_id,
            PendingSession {
                expected,
                received: Vec::new(),
                deadline,
            },
        );
    }

    /// Deliver one terminal result. Called at most once per request id
    /// (the broker enforces that).
    pub async fn on_result(
        &self,
        result: RawRecognitionResult,
    ) -> Result<FusionOutcome, StoreError> {
        let mut pending = self.pending.lock().await;
        self.evict_stale(&mut pending);

        let session_id = result.session_id;
        let complete = {
            let session = pending.entry(session_id).or_insert_with(|| {
                // Unregistered session: a standalone single-modality capture
                PendingSession {
                    expected: 1,
                    received: Vec::new(),
                    deadline: Instant::now()
                        + Duration::from_millis(
                            self.config.capture_timeout_ms + self.config.session_window_ms,
                        ),
                }
            });

            debug!(
                %session_id,
                modality = %result.modality,
                outcome = ?result.outcome,
                "Result delivered to fusion"
            );
            session.received.push(result);
            session.received.len() >= session.expected
        };

        if !complete {
            return Ok(FusionOutcome::Pending);
        }

        match pending.remove(&session_id) {
            Some(session) => self.finalize(session_id, session.received),
            None => Ok(FusionOutcome::Pending),
        }
    }

    /// Number of sessions still awaiting results
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Evict and finalize sessions whose deadline passed. Returns the
    /// outcomes of any sessions that could still produce an event from
    /// the results that did arrive.
    pub async fn flush_stale(&self) -> Result<Vec<FusionOutcome>, StoreError> {
        let mut pending = self.pending.lock().await;

        let now = Instant::now();
        let stale: Vec<Uuid> = pending
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut outcomes = Vec::new();
        for session_id in stale {
            if let Some(session) = pending.remove(&session_id) {
                warn!(%session_id, received = session.received.len(), "Evicting stale capture session");
                if !session.received.is_empty() {
                    outcomes.push(self.finalize(session_id, session.received)?);
                }
            }
        }
        Ok(outcomes)
    }

    fn evict_stale(&self, pending: &mut HashMap<Uuid, PendingSession>) {
        let now = Instant::now();
        let stale: Vec<Uuid> = pending
            .iter()
            .filter(|(_, s)| s.deadline <= now && s.received.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for session_id in stale {
            warn!(%session_id, "Dropping abandoned capture session");
            pending.remove(&session_id);
        }
    }

    fn finalize(
        &self,
        session_id: Uuid,
        results: Vec<RawRecognitionResult>,
    ) -> Result<FusionOutcome, StoreError> {
        match fuse(&results, &self.config) {
            Some(winner) => {
                let mut event = winner;
                if let Some(tag) = classify_subject(&event.text) {
                    event = event.with_subject_tag(tag);
                }

                // Durable before the caller observes success
                self.store.append(&event)?;
                info!(
                    %session_id,
                    event_id = %event.id,
                    source = ?event.source_modality,
                    confidence = event.confidence,
                    "Recognition event stored"
                );
                Ok(FusionOutcome::Recognized(event))
            }
            None => {
                info!(%session_id, "No usable recognition in session");
                Ok(FusionOutcome::NoRecognition)
            }
        }
    }
}

/// Apply the fusion rules to a session's terminal results.
///
/// A lone usable result wins outright; when both modalities are usable,
/// agreement on the same text fuses them, and otherwise the higher
/// confidence wins with vision preferred inside the tie epsilon
/// (photographed text is typically the more literal rendering of a
/// homework problem).
fn fuse(results: &[RawRecognitionResult], config: &RecognizerConfig) -> Option<RecognitionEvent> {
    let usable: Vec<&RawRecognitionResult> = results
        .iter()
        .filter(|r| r.is_usable(config.confidence_threshold))
        .collect();

    match usable.as_slice() {
        [] => None,
        [only] => Some(event_from(only, source_of(only.modality))),
        pool => {
            let vision = pool.iter().find(|r| r.modality == Modality::Vision);
            let audio = pool.iter().find(|r| r.modality == Modality::Audio);

            match (vision, audio) {
                (Some(v), Some(a)) => {
                    if normalize(&v.text) == normalize(&a.text) {
                        // Both modalities agree: a fused event with the
                        // stronger confidence
                        let confidence = v.confidence.max(a.confidence);
                        let mut event = event_from(v, SourceModality::Fused);
                        event.confidence = confidence;
                        return Some(event);
                    }

                    let winner = if a.confidence - v.confidence > config.fusion_tie_epsilon {
                        *a
                    } else {
                        // Higher vision confidence, or a tie within
                        // epsilon: vision wins
                        *v
                    };
                    Some(event_from(winner, source_of(winner.modality)))
                }
                // Same-modality duplicates cannot happen (one request
                // per modality per session); fall back to best
                _ => pool
                    .iter()
                    .max_by(|x, y| x.confidence.total_cmp(&y.confidence))
                    .map(|r| event_from(r, source_of(r.modality))),
            }
        }
    }
}

fn event_from(result: &RawRecognitionResult, source: SourceModality) -> RecognitionEvent {
    RecognitionEvent::new(source, result.text.clone(), result.confidence)
}

fn source_of(modality: Modality) -> SourceModality {
    match modality {
        Modality::Vision => SourceModality::Vision,
        Modality::Audio => SourceModality::Audio,
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Crude keyword classifier assigning a subject tag to recognized text
pub fn classify_subject(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();

    const MATH: &[&str] = &["solve", "equation", "times", "divided", "integral", "fraction", "="];
    const ENGLISH: &[&str] = &["translate", "sentence", "grammar", "vocabulary", "word"];
    const PHYSICS: &[&str] = &["force", "velocity", "acceleration", "energy", "newton"];
    const CHEMISTRY: &[&str] = &["atom", "molecule", "reaction", "element", "acid"];

    for (tag, keywords) in [
        ("physics", PHYSICS),
        ("chemistry", CHEMISTRY),
        ("english", ENGLISH),
        ("math", MATH),
    ] {
        if keywords.iter().any(|k| lower.contains(k)) {
            return Some(tag);
        }
    }

    // Bare arithmetic with no keywords still reads as math
    if lower.chars().any(|c| c.is_ascii_digit())
        && lower.chars().any(|c| "+-×÷*/=".contains(c))
    {
        return Some("math");
    }

    None
}
