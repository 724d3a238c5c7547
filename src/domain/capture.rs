//! Capture requests and the raw results pipelines produce for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Input modality driving a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Camera frames submitted to the OCR engine
    Vision,

    /// Microphone audio driven through wake-word/VAD/ASR
    Audio,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Vision => write!(f, "vision"),
            Modality::Audio => write!(f, "audio"),
        }
    }
}

/// A user-initiated capture request, immutable once issued.
///
/// Created by the capture broker, consumed by exactly one pipeline, and
/// terminated by completion, cancellation, or timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Unique identifier for this request
    pub id: Uuid,

    /// Logical capture session this request belongs to. A dual capture
    /// (speak while pointing the camera) issues two requests sharing
    /// one session id.
    pub session_id: Uuid,

    /// Which pipeline handles this request
    pub modality: Modality,

    /// When the broker issued the request
    pub created_at: DateTime<Utc>,

    /// Budget for the whole capture, including engine latency
    pub timeout_ms: u64,
}

impl CaptureRequest {
    /// Create a new request under the given session
    pub fn new(session_id: Uuid, modality: Modality, timeout_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            modality,
            created_at: Utc::now(),
            timeout_ms,
        }
    }
}

/// Why a capture produced no usable recognition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No engine result within the request budget
    Timeout,

    /// User or system abort
    Cancelled,

    /// Underlying SDK error or crash
    NativeFault(String),

    /// Vision quality gate rejected every candidate frame
    NoUsableFrame,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::NativeFault(reason) => write!(f, "native fault: {}", reason),
            FailureReason::NoUsableFrame => write!(f, "no usable frame"),
        }
    }
}

/// Terminal outcome of a capture request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionOutcome {
    /// Engine succeeded with confidence at or above the threshold
    Success,

    /// Engine succeeded but confidence fell below the threshold
    LowConfidence,

    /// Engine succeeded but recognized no text
    Empty,

    /// No recognition was produced
    Failed(FailureReason),
}

/// The single result a pipeline (or the broker, for synthesized
/// timeout/cancel outcomes) produces for a capture request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecognitionResult {
    /// The request this result terminates
    pub request_id: Uuid,

    /// Session the request belonged to
    pub session_id: Uuid,

    /// Modality that produced the result
    pub modality: Modality,

    /// Recognized text, empty for failures
    pub text: String,

    /// Engine confidence in [0, 1], zero for failures
    pub confidence: f32,

    /// Wall time from request start to this result
    pub latency_ms: u64,

    /// How the request ended
    pub outcome: RecognitionOutcome,
}

impl RawRecognitionResult {
    /// Build a result from engine output, classifying it against the
    /// acceptance threshold.
    pub fn recognized(
        request: &CaptureRequest,
        text: String,
        confidence: f32,
        latency_ms: u64,
        threshold: f32,
    ) -> Self {
        let outcome = if text.trim().is_empty() {
            RecognitionOutcome::Empty
        } else if confidence >= threshold {
            RecognitionOutcome::Success
        } else {
            RecognitionOutcome::LowConfidence
        };

        Self {
            request_id: request.id,
            session_id: request.session_id,
            modality: request.modality,
            text,
            confidence,
            latency_ms,
            outcome,
        }
    }

    /// Build a failed result for the given reason
    pub fn failed(request: &CaptureRequest, reason: FailureReason, latency_ms: u64) -> Self {
        Self {
            request_id: request.id,
            session_id: request.session_id,
            modality: request.modality,
            text: String::new(),
            confidence: 0.0,
            latency_ms,
            outcome: RecognitionOutcome::Failed(reason),
        }
    }

    /// Whether this result can become a canonical recognition event.
    ///
    /// `Success` is always usable; `LowConfidence` only if it still
    /// clears the configured acceptance threshold (a pipeline may
    /// classify against a stricter engine-local floor).
    pub fn is_usable(&self, threshold: f32) -> bool {
        match self.outcome {
            RecognitionOutcome::Success => true,
            RecognitionOutcome::LowConfidence => self.confidence >= threshold,
            RecognitionOutcome::Empty | RecognitionOutcome::Failed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(modality: Modality) -> CaptureRequest {
        CaptureRequest::new(Uuid::new_v4(), modality, 8000)
    }

    #[test]
    fn test_recognized_classifies_against_threshold() {
        let req = request(Modality::Vision);

        let ok = RawRecognitionResult::recognized(&req, "2x + 3 = 7".into(), 0.9, 120, 0.5);
        assert_eq!(ok.outcome, RecognitionOutcome::Success);

        let low = RawRecognitionResult::recognized(&req, "2x + 3 = 7".into(), 0.3, 120, 0.5);
        assert_eq!(low.outcome, RecognitionOutcome::LowConfidence);

        let empty = RawRecognitionResult::recognized(&req, "   ".into(), 0.9, 120, 0.5);
        assert_eq!(empty.outcome, RecognitionOutcome::Empty);
    }

    #[test]
    fn test_failed_result_is_never_usable() {
        let req = request(Modality::Audio);
        let failed = RawRecognitionResult::failed(&req, FailureReason::Timeout, 8000);

        assert!(!failed.is_usable(0.0));
        assert_eq!(
            failed.outcome,
            RecognitionOutcome::Failed(FailureReason::Timeout)
        );
    }

    #[test]
    fn test_result_serialization_round_trip() {
        let req = request(Modality::Audio);
        let result = RawRecognitionResult::recognized(&req, "what is seven times eight".into(), 0.82, 950, 0.5);

        let json = serde_json::to_string(&result).unwrap();
        let parsed: RawRecognitionResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, req.id);
        assert_eq!(parsed.outcome, RecognitionOutcome::Success);
    }
}
