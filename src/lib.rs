//! studylens - Recognition orchestration core for a study-assistant app
//!
//! Coordinates camera OCR and wake-word/VAD/ASR audio recognition into
//! durable, queryable study sessions.
//!
//! # Architecture
//!
//! Recognition flows one way through the crate:
//! - Pipelines (`audio`, `vision`) drive the native engines behind the
//!   [`bridge::NativeBridge`] trait and emit raw per-modality results
//! - The [`fusion::FusionEngine`] reconciles a session's results into at
//!   most one canonical recognition event
//! - The [`store::SessionStore`] makes events durable and serves the
//!   history and per-day aggregate queries
//! - The [`broker::CaptureBroker`] sits on top, enforcing one
//!   outstanding request per modality with timeouts and cancellation
//!
//! # Modules
//!
//! - `bridge`: Native engine abstraction plus a scripted test double
//! - `audio`: Wake-word / voice-activity / transcription state machine
//! - `vision`: Frame quality gate and OCR capture
//! - `fusion`: Cross-modality arbitration and subject tagging
//! - `store`: SQLite event log and daily aggregates
//! - `broker`: Capture lifecycle coordinator
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a scripted dual capture
//! studylens demo
//!
//! # Inspect stored recognition events
//! studylens history --from 2026-08-01 --to 2026-08-25
//!
//! # Per-day, per-subject statistics
//! studylens stats
//! ```

pub mod audio;
pub mod bridge;
pub mod broker;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod fusion;
pub mod store;
pub mod vision;

// Re-export main types at crate root for convenience
pub use broker::{CaptureBroker, CaptureCompletion};
pub use config::{RecognizerConfig, ResolvedConfig};
pub use domain::{
    CaptureRequest, FailureReason, Modality, RawRecognitionResult, RecognitionEvent,
    RecognitionOutcome, SourceModality,
};
pub use error::CaptureError;
pub use fusion::{FusionEngine, FusionOutcome};
pub use store::{AppendOutcome, DateRange, SessionStore, StoreError};
