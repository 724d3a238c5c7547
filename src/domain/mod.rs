//! Data model for the recognition orchestration core.
//!
//! Capture requests and raw results flow from the broker through the
//! pipelines into the fusion engine; canonical recognition events are
//! what the session store persists. All of these are immutable once
//! created.

mod capture;
mod event;

pub use capture::{
    CaptureRequest, FailureReason, Modality, RawRecognitionResult, RecognitionOutcome,
};
pub use event::{RecognitionEvent, SessionAggregate, SourceModality};
