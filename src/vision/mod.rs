//! Vision pipeline: camera frames through the quality gate to OCR.
//!
//! Gate rejections retry with the next available frame up to a small
//! bound; OCR engine failures are terminal for the request so a
//! persistently failing engine cannot burn the whole timeout budget.
//! The caller loads and releases the OCR engine around
//! [`VisionPipeline::capture`], so the handle survives even when the
//! capture future is dropped by a cancel or timeout race.

pub mod quality;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::bridge::{BridgeError, EngineHandle, EngineInput, EngineKind, Frame, NativeBridge};
use crate::config::RecognizerConfig;
use crate::domain::{CaptureRequest, FailureReason, RawRecognitionResult};

use quality::QualityGate;

/// Source of camera frames, one per call.
///
/// Returns `None` when no further frame is available within the
/// capture.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Fixed sequence of frames, for tests and the demo command
pub struct BufferedFrameSource {
    frames: VecDeque<Frame>,
}

impl BufferedFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

#[async_trait]
impl FrameSource for BufferedFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }
}

/// Drives one OCR capture per [`capture`](VisionPipeline::capture) call
pub struct VisionPipeline {
    bridge: Arc<dyn NativeBridge>,
    config: RecognizerConfig,
    gate: QualityGate,
}

impl VisionPipeline {
    pub fn new(bridge: Arc<dyn NativeBridge>, config: RecognizerConfig) -> Self {
        Self {
            bridge,
            config,
            gate: QualityGate::default(),
        }
    }

    pub fn with_gate(mut self, gate: QualityGate) -> Self {
        self.gate = gate;
        self
    }

    /// Load the OCR engine for one capture
    pub async fn load(&self) -> Result<EngineHandle, BridgeError> {
        self.bridge.load_engine(EngineKind::Ocr).await
    }

    /// Release the OCR engine
    pub async fn unload(&self, ocr: EngineHandle) {
        if let Err(e) = self.bridge.unload_engine(ocr).await {
            warn!(error = %e, "Failed to unload OCR engine");
        }
    }

    /// Run one capture against an already loaded OCR engine: pull
    /// frames until one passes the quality gate (at most
    /// `max_frame_retries` rejections), submit it, and return the
    /// terminal result.
    #[instrument(skip(self, source, ocr), fields(request_id = %request.id))]
    pub async fn capture(
        &self,
        request: &CaptureRequest,
        source: &mut dyn FrameSource,
        ocr: &EngineHandle,
    ) -> RawRecognitionResult {
        let started = Instant::now();
        let budget = Duration::from_millis(request.timeout_ms);
        let max_attempts = self.config.max_frame_retries + 1;

        for attempt in 1..=max_attempts {
            let Some(frame) = source.next_frame().await else {
                debug!(attempt, "Frame source exhausted");
                return RawRecognitionResult::failed(
                    request,
                    FailureReason::NoUsableFrame,
                    elapsed_ms(started),
                );
            };

            if let Err(rejection) = self.gate.check(&frame) {
                debug!(attempt, ?rejection, "Quality gate rejected frame");
                continue;
            }

            // OCR failures are terminal for this request: no retry
            return match self
                .bridge
                .recognize_once(ocr, EngineInput::Image(frame), budget)
                .await
            {
                Ok(out) => RawRecognitionResult::recognized(
                    request,
                    out.text,
                    out.confidence,
                    elapsed_ms(started),
                    self.config.confidence_threshold,
                ),
                Err(BridgeError::Timeout) => RawRecognitionResult::failed(
                    request,
                    FailureReason::Timeout,
                    elapsed_ms(started),
                ),
                Err(e) => RawRecognitionResult::failed(
                    request,
                    FailureReason::NativeFault(e.to_string()),
                    elapsed_ms(started),
                ),
            };
        }

        RawRecognitionResult::failed(request, FailureReason::NoUsableFrame, elapsed_ms(started))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EngineOutput, ScriptedBridge};
    use crate::domain::{Modality, RecognitionOutcome};
    use uuid::Uuid;

    fn request() -> CaptureRequest {
        CaptureRequest::new(Uuid::new_v4(), Modality::Vision, 8000)
    }

    fn sharp_frame() -> Frame {
        let luma: Vec<u8> = (0..64 * 64)
            .map(|i| if i % 2 == 0 { 30 } else { 220 })
            .collect();
        Frame::new(luma, 64, 64)
    }

    fn blurry_frame() -> Frame {
        Frame::new(vec![128; 64 * 64], 64, 64)
    }

    fn pipeline(bridge: Arc<ScriptedBridge>) -> VisionPipeline {
        VisionPipeline::new(bridge, RecognizerConfig::default())
    }

    async fn run_capture(
        bridge: Arc<ScriptedBridge>,
        source: &mut BufferedFrameSource,
    ) -> RawRecognitionResult {
        let pipeline = pipeline(bridge);
        let ocr = pipeline.load().await.unwrap();
        let result = pipeline.capture(&request(), source, &ocr).await;
        pipeline.unload(ocr).await;
        result
    }

    #[tokio::test]
    async fn test_sharp_frame_reaches_ocr() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_output(EngineKind::Ocr, EngineOutput::new("2x + 3 = 7", 0.93))
            .await;

        let mut source = BufferedFrameSource::new(vec![sharp_frame()]);
        let result = run_capture(bridge.clone(), &mut source).await;

        assert_eq!(result.outcome, RecognitionOutcome::Success);
        assert_eq!(result.text, "2x + 3 = 7");
        assert_eq!(result.modality, Modality::Vision);
    }

    #[tokio::test]
    async fn test_gate_rejection_retries_with_next_frame() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_output(EngineKind::Ocr, EngineOutput::new("y = mx + b", 0.9))
            .await;

        // Two rejects, then a usable frame: within the default 2 retries
        let mut source =
            BufferedFrameSource::new(vec![blurry_frame(), blurry_frame(), sharp_frame()]);
        let result = run_capture(bridge.clone(), &mut source).await;

        assert_eq!(result.outcome, RecognitionOutcome::Success);
        assert_eq!(result.text, "y = mx + b");
    }

    #[tokio::test]
    async fn test_all_frames_rejected_reports_no_usable_frame() {
        let bridge = Arc::new(ScriptedBridge::new());

        let mut source = BufferedFrameSource::new(vec![
            blurry_frame(),
            blurry_frame(),
            blurry_frame(),
            // A fourth good frame exists but the retry bound is exhausted
            sharp_frame(),
        ]);
        let result = run_capture(bridge.clone(), &mut source).await;

        assert_eq!(
            result.outcome,
            RecognitionOutcome::Failed(FailureReason::NoUsableFrame)
        );
    }

    #[tokio::test]
    async fn test_source_exhaustion_reports_no_usable_frame() {
        let bridge = Arc::new(ScriptedBridge::new());

        let mut source = BufferedFrameSource::new(vec![blurry_frame()]);
        let result = run_capture(bridge.clone(), &mut source).await;

        assert_eq!(
            result.outcome,
            RecognitionOutcome::Failed(FailureReason::NoUsableFrame)
        );
    }

    #[tokio::test]
    async fn test_ocr_fault_is_terminal_without_retry() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_error(EngineKind::Ocr, BridgeError::NativeFault("ocr crashed".into()))
            .await;
        // A second response is queued but must never be consumed
        bridge
            .push_output(EngineKind::Ocr, EngineOutput::new("unreachable", 0.9))
            .await;

        let mut source = BufferedFrameSource::new(vec![sharp_frame(), sharp_frame()]);
        let result = run_capture(bridge.clone(), &mut source).await;

        assert!(matches!(
            result.outcome,
            RecognitionOutcome::Failed(FailureReason::NativeFault(_))
        ));
        assert_eq!(bridge.remaining(EngineKind::Ocr).await, 1);
    }
}
