//! Capture broker: the top-level coordinator for user capture intents.
//!
//! Enforces at-most-one outstanding request per modality, owns the
//! per-request timeout timer, and routes every terminal result into the
//! fusion engine exactly once. Cancellation is cooperative: the capture
//! task races the pipeline against a cancel signal and the timeout, and
//! whichever loses is dropped, so a native callback arriving after
//! cancellation is never delivered. The broker synthesizes
//! `Failed(Timeout)` / `Failed(Cancelled)` results on those paths so
//! downstream bookkeeping sees a terminal result no matter how a
//! request ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audio::{AudioPipeline, AudioSource};
use crate::bridge::NativeBridge;
use crate::config::RecognizerConfig;
use crate::domain::{CaptureRequest, FailureReason, Modality, RawRecognitionResult};
use crate::error::CaptureError;
use crate::fusion::{FusionEngine, FusionOutcome};
use crate::store::SessionStore;
use crate::vision::{FrameSource, VisionPipeline};

/// Broadcast to observers when a capture reaches its terminal state
#[derive(Debug, Clone)]
pub struct CaptureCompletion {
    pub request: CaptureRequest,
    pub result: RawRecognitionResult,
    pub outcome: FusionOutcome,
}

struct ActiveCapture {
    request: CaptureRequest,
    cancel: watch::Sender<bool>,
}

/// Top-level coordinator over the vision/audio pipelines, fusion
/// engine, and session store
pub struct CaptureBroker {
    config: RecognizerConfig,
    fusion: Arc<FusionEngine>,
    store: Arc<SessionStore>,
    audio: Arc<AudioPipeline>,
    vision: Arc<VisionPipeline>,
    active: Arc<Mutex<HashMap<Modality, ActiveCapture>>>,
    completions: broadcast::Sender<CaptureCompletion>,
}

impl CaptureBroker {
    pub fn new(
        bridge: Arc<dyn NativeBridge>,
        store: Arc<SessionStore>,
        config: RecognizerConfig,
    ) -> Self {
        let fusion = Arc::new(FusionEngine::new(store.clone(), config.clone()));
        let audio = Arc::new(AudioPipeline::new(bridge.clone(), config.clone()));
        let vision = Arc::new(VisionPipeline::new(bridge, config.clone()));
        let (completions, _) = broadcast::channel(64);

        Self {
            config,
            fusion,
            store,
            audio,
            vision,
            active: Arc::new(Mutex::new(HashMap::new())),
            completions,
        }
    }

    /// The session store, for read-only history/chart queries
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The fusion engine, so the embedding app can flush stale sessions
    pub fn fusion(&self) -> &Arc<FusionEngine> {
        &self.fusion
    }

    /// Subscribe to capture completions
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureCompletion> {
        self.completions.subscribe()
    }

    /// Modalities with an outstanding request
    pub fn active_modalities(&self) -> Vec<Modality> {
        self.active.lock().unwrap().keys().copied().collect()
    }

    /// Start a vision capture. Fails with `Busy` if a vision request is
    /// already outstanding.
    #[instrument(skip(self, frames))]
    pub async fn start_vision_capture(
        &self,
        frames: Box<dyn FrameSource>,
    ) -> Result<CaptureRequest, CaptureError> {
        let session_id = Uuid::new_v4();

        // Reserve before registering so a Busy rejection cannot strand
        // a pending fusion session
        let request = self.reserve(session_id, Modality::Vision)?;
        self.fusion.register_session(session_id, 1).await;
        self.spawn_vision_task(request.clone(), frames);
        Ok(request)
    }

    /// Start an audio capture. Fails with `Busy` if an audio request is
    /// already outstanding.
    #[instrument(skip(self, source))]
    pub async fn start_audio_capture(
        &self,
        source: Box<dyn AudioSource>,
    ) -> Result<CaptureRequest, CaptureError> {
        let session_id = Uuid::new_v4();

        let request = self.reserve(session_id, Modality::Audio)?;
        self.fusion.register_session(session_id, 1).await;
        self.spawn_audio_task(request.clone(), source);
        Ok(request)
    }

    /// Start a dual capture ("speak while pointing the camera"): both
    /// modalities under one session, fused into at most one event.
    #[instrument(skip(self, frames, audio_source))]
    pub async fn start_dual_capture(
        &self,
        frames: Box<dyn FrameSource>,
        audio_source: Box<dyn AudioSource>,
    ) -> Result<(CaptureRequest, CaptureRequest), CaptureError> {
        let session_id = Uuid::new_v4();

        // Reserve both slots atomically so a dual capture cannot
        // half-start
        let (vision_req, audio_req) = {
            let mut active = self.active.lock().unwrap();
            for modality in [Modality::Vision, Modality::Audio] {
                if active.contains_key(&modality) {
                    return Err(CaptureError::Busy(modality));
                }
            }

            let vision_req =
                CaptureRequest::new(session_id, Modality::Vision, self.config.capture_timeout_ms);
            let audio_req =
                CaptureRequest::new(session_id, Modality::Audio, self.config.capture_timeout_ms);

            for request in [&vision_req, &audio_req] {
                let (cancel, _) = watch::channel(false);
                active.insert(
                    request.modality,
                    ActiveCapture {
                        request: request.clone(),
                        cancel,
                    },
                );
            }
            (vision_req, audio_req)
        };

        self.fusion.register_session(session_id, 2).await;

        info!(%session_id, "Dual capture started");
        self.spawn_vision_task(vision_req.clone(), frames);
        self.spawn_audio_task(audio_req.clone(), audio_source);
        Ok((vision_req, audio_req))
    }

    /// Cancel an outstanding request. The capture task synthesizes a
    /// `Failed(Cancelled)` result and routes it to fusion; the
    /// pipeline's own late result, if any, is dropped.
    pub fn cancel(&self, request_id: Uuid) -> Result<(), CaptureError> {
        let active = self.active.lock().unwrap();

        let capture = active
            .values()
            .find(|c| c.request.id == request_id)
            .ok_or(CaptureError::NotFound(request_id))?;

        info!(%request_id, modality = %capture.request.modality, "Cancelling capture");
        // The task observes the change at its next suspension point
        let _ = capture.cancel.send(true);
        Ok(())
    }

    fn reserve(
        &self,
        session_id: Uuid,
        modality: Modality,
    ) -> Result<CaptureRequest, CaptureError> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&modality) {
            return Err(CaptureError::Busy(modality));
        }

        let request = CaptureRequest::new(session_id, modality, self.config.capture_timeout_ms);
        let (cancel, _) = watch::channel(false);
        active.insert(
            modality,
            ActiveCapture {
                request: request.clone(),
                cancel,
            },
        );
        Ok(request)
    }

    fn spawn_vision_task(&self, request: CaptureRequest, mut frames: Box<dyn FrameSource>) {
        let vision = self.vision.clone();
        let ctx = self.task_context(&request);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut cancel_rx = ctx.cancel_rx.clone();
            let budget = Duration::from_millis(ctx.request.timeout_ms);

            // The task owns the engine lifecycle: a dropped capture
            // future must not strand a loaded handle
            let result = match vision.load().await {
                Ok(ocr) => {
                    let result = tokio::select! {
                        res = vision.capture(&ctx.request, frames.as_mut(), &ocr) => res,
                        _ = cancel_rx.changed() => synthesized(&ctx.request, FailureReason::Cancelled, started),
                        _ = tokio::time::sleep(budget) => synthesized(&ctx.request, FailureReason::Timeout, started),
                    };
                    vision.unload(ocr).await;
                    result
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load OCR engine");
                    synthesized(&ctx.request, FailureReason::NativeFault(e.to_string()), started)
                }
            };

            ctx.complete(result).await;
        });
    }

    fn spawn_audio_task(&self, request: CaptureRequest, mut source: Box<dyn AudioSource>) {
        let audio = self.audio.clone();
        let ctx = self.task_context(&request);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut cancel_rx = ctx.cancel_rx.clone();
            let budget = Duration::from_millis(ctx.request.timeout_ms);

            let result = match audio.load().await {
                Ok(engines) => {
                    let result = tokio::select! {
                        res = audio.run(&ctx.request, source.as_mut(), &engines) => res,
                        _ = cancel_rx.changed() => synthesized(&ctx.request, FailureReason::Cancelled, started),
                        _ = tokio::time::sleep(budget) => synthesized(&ctx.request, FailureReason::Timeout, started),
                    };
                    audio.unload(engines).await;
                    result
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load speech engines");
                    synthesized(&ctx.request, FailureReason::NativeFault(e.to_string()), started)
                }
            };

            ctx.complete(result).await;
        });
    }

    fn task_context(&self, request: &CaptureRequest) -> TaskContext {
        let cancel_rx = {
            let active = self.active.lock().unwrap();
            active
                .get(&request.modality)
                .map(|c| c.cancel.subscribe())
                // The slot was reserved by the caller; a fresh channel
                // here would simply never fire
                .unwrap_or_else(|| watch::channel(false).1)
        };

        TaskContext {
            request: request.clone(),
            cancel_rx,
            fusion: self.fusion.clone(),
            active: self.active.clone(),
            completions: self.completions.clone(),
        }
    }
}

struct TaskContext {
    request: CaptureRequest,
    cancel_rx: watch::Receiver<bool>,
    fusion: Arc<FusionEngine>,
    active: Arc<Mutex<HashMap<Modality, ActiveCapture>>>,
    completions: broadcast::Sender<CaptureCompletion>,
}

impl TaskContext {
    /// Release the modality slot, deliver the terminal result to fusion
    /// (exactly once per request), and notify observers.
    async fn complete(self, result: RawRecognitionResult) {
        {
            let mut active = self.active.lock().unwrap();
            let matches = active
                .get(&self.request.modality)
                .is_some_and(|c| c.request.id == self.request.id);
            if matches {
                active.remove(&self.request.modality);
            }
        }

        let outcome = match self.fusion.on_result(result.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(request_id = %self.request.id, error = %e, "Failed to persist recognition event");
                FusionOutcome::NoRecognition
            }
        };

        if let FusionOutcome::NoRecognition = outcome {
            warn!(
                request_id = %self.request.id,
                outcome = ?result.outcome,
                "Capture produced no recognition"
            );
        }

        // No subscribers is fine
        let _ = self.completions.send(CaptureCompletion {
            request: self.request,
            result,
            outcome,
        });
    }
}

fn synthesized(
    request: &CaptureRequest,
    reason: FailureReason,
    started: Instant,
) -> RawRecognitionResult {
    RawRecognitionResult::failed(request, reason, started.elapsed().as_millis() as u64)
}
