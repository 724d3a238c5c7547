//! Native bridge adapter boundary.
//!
//! Wraps the platform speech/vision SDKs (wake-word, VAD, ASR, OCR) as
//! uniform asynchronous operations with explicit lifecycle and typed
//! errors. Engine handles never leak upward; pipelines only see
//! `EngineHandle` tokens. No business logic lives here.

pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use scripted::ScriptedBridge;

/// The four native engine kinds behind the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    WakeWord,
    Vad,
    Asr,
    Ocr,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::WakeWord => write!(f, "wake_word"),
            EngineKind::Vad => write!(f, "vad"),
            EngineKind::Asr => write!(f, "asr"),
            EngineKind::Ocr => write!(f, "ocr"),
        }
    }
}

/// Opaque token for a loaded engine instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    id: Uuid,
    kind: EngineKind,
}

impl EngineHandle {
    pub fn kind(&self) -> EngineKind {
        self.kind
    }
}

/// A single luma (grayscale) camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major luma samples, one byte per pixel
    pub luma: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(luma: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(luma.len(), (width * height) as usize);
        Self { luma, width, height }
    }
}

/// Input handed to `recognize_once`
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// PCM audio window for the wake-word/VAD/ASR engines
    Audio { samples: Vec<i16>, sample_rate: u32 },

    /// Image frame for the OCR engine
    Image(Frame),
}

/// Typed result from a native engine.
///
/// Wake-word and VAD engines report only a confidence (detection
/// probability / speech probability) with empty text.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub confidence: f32,
}

impl EngineOutput {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// Output carrying only a confidence score
    pub fn score(confidence: f32) -> Self {
        Self {
            text: String::new(),
            confidence,
        }
    }
}

/// Errors crossing the bridge boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("failed to load {kind} engine: {reason}")]
    LoadError { kind: EngineKind, reason: String },

    #[error("engine produced no result within the budget")]
    Timeout,

    #[error("native fault: {0}")]
    NativeFault(String),

    #[error("invalid input for engine: {0}")]
    InvalidInput(String),
}

/// Uniform async contract over the native SDK capabilities.
///
/// Implementations own the real engine handles exclusively; tests and
/// the demo substitute [`ScriptedBridge`].
#[async_trait]
pub trait NativeBridge: Send + Sync {
    /// Load an engine of the given kind, returning an opaque handle
    async fn load_engine(&self, kind: EngineKind) -> Result<EngineHandle, BridgeError>;

    /// Run one recognition pass. Blocking-until-callback underneath;
    /// callers bound the wait with `timeout`.
    async fn recognize_once(
        &self,
        handle: &EngineHandle,
        input: EngineInput,
        timeout: Duration,
    ) -> Result<EngineOutput, BridgeError>;

    /// Release an engine handle
    async fn unload_engine(&self, handle: EngineHandle) -> Result<(), BridgeError>;
}

pub(crate) fn new_handle(kind: EngineKind) -> EngineHandle {
    EngineHandle {
        id: Uuid::new_v4(),
        kind,
    }
}
