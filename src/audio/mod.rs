//! Audio pipeline: wake-word, VAD-gated voice capture, transcription.
//!
//! The pipeline drives the pure state machine in [`state`] against a
//! [`NativeBridge`], pulling PCM windows from an [`AudioSource`]. All
//! per-capture state lives on the stack of [`AudioPipeline::run`], so a
//! cancelled capture (the broker drops the future) leaves nothing to
//! corrupt; a late engine callback simply has no task waiting on it.
//! The caller loads and releases the speech engines around `run`, so
//! the handles survive a dropped capture future and are always
//! returned to the bridge.

pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::bridge::{BridgeError, EngineHandle, EngineInput, EngineKind, NativeBridge};
use crate::config::RecognizerConfig;
use crate::domain::{CaptureRequest, FailureReason, RawRecognitionResult};

use state::{transition, AudioEffect, AudioPolicy, AudioSignal, AudioState};

/// VAD speech probability at or above which a window counts as voiced
const VAD_SPEECH_FLOOR: f32 = 0.5;

/// One PCM window pulled from the microphone
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

impl AudioWindow {
    fn as_input(&self) -> EngineInput {
        EngineInput::Audio {
            samples: self.samples.clone(),
            sample_rate: self.sample_rate,
        }
    }
}

/// Source of microphone audio, one window at a time.
///
/// Returns `None` when the stream ends (device closed, test script
/// exhausted).
#[async_trait]
pub trait AudioSource: Send {
    async fn next_window(&mut self) -> Option<AudioWindow>;
}

/// Fixed sequence of windows, for tests and the demo command
pub struct BufferedAudioSource {
    windows: VecDeque<AudioWindow>,
}

impl BufferedAudioSource {
    pub fn new(windows: Vec<AudioWindow>) -> Self {
        Self {
            windows: windows.into(),
        }
    }

    /// `count` windows of silence-shaped PCM, `frame_ms` each
    pub fn uniform(count: usize, frame_ms: u64) -> Self {
        let windows = (0..count)
            .map(|_| AudioWindow {
                samples: vec![0i16; (16 * frame_ms) as usize],
                sample_rate: 16000,
                duration_ms: frame_ms,
            })
            .collect();
        Self::new(windows)
    }
}

#[async_trait]
impl AudioSource for BufferedAudioSource {
    async fn next_window(&mut self) -> Option<AudioWindow> {
        self.windows.pop_front()
    }
}

/// The three speech engine handles for one capture, loaded together
/// and released together
pub struct SpeechEngines {
    wake: EngineHandle,
    vad: EngineHandle,
    asr: EngineHandle,
}

/// Drives one audio capture cycle per [`run`](AudioPipeline::run) call
pub struct AudioPipeline {
    bridge: Arc<dyn NativeBridge>,
    config: RecognizerConfig,
}

impl AudioPipeline {
    pub fn new(bridge: Arc<dyn NativeBridge>, config: RecognizerConfig) -> Self {
        Self { bridge, config }
    }

    /// Load the wake-word, VAD, and ASR engines for one capture.
    ///
    /// A failed load rolls back the engines already acquired.
    pub async fn load(&self) -> Result<SpeechEngines, BridgeError> {
        let wake = self.bridge.load_engine(EngineKind::WakeWord).await?;
        let vad = match self.bridge.load_engine(EngineKind::Vad).await {
            Ok(vad) => vad,
            Err(e) => {
                self.release([wake]).await;
                return Err(e);
            }
        };
        let asr = match self.bridge.load_engine(EngineKind::Asr).await {
            Ok(asr) => asr,
            Err(e) => {
                self.release([wake, vad]).await;
                return Err(e);
            }
        };
        Ok(SpeechEngines { wake, vad, asr })
    }

    /// Release the speech engines
    pub async fn unload(&self, engines: SpeechEngines) {
        self.release([engines.wake, engines.vad, engines.asr]).await;
    }

    async fn release<const N: usize>(&self, handles: [EngineHandle; N]) {
        for handle in handles {
            let kind = handle.kind();
            if let Err(e) = self.bridge.unload_engine(handle).await {
                warn!(engine = %kind, error = %e, "Failed to unload engine");
            }
        }
    }

    /// Run one capture cycle against already loaded engines: listen for
    /// the wake word, debounce voice activity, transcribe, and return
    /// the terminal result.
    ///
    /// Exactly one `RawRecognitionResult` is returned per call. A
    /// spurious trigger (silence inside the debounce window) re-arms
    /// wake-word listening rather than terminating the capture; the
    /// broker's timeout bounds the whole cycle.
    #[instrument(skip(self, source, engines), fields(request_id = %request.id))]
    pub async fn run(
        &self,
        request: &CaptureRequest,
        source: &mut dyn AudioSource,
        engines: &SpeechEngines,
    ) -> RawRecognitionResult {
        let started = Instant::now();
        let policy = AudioPolicy {
            wake_word_min_confidence: self.config.wake_word_min_confidence,
            voice_active_debounce_ms: self.config.voice_active_debounce_ms,
            error_cooldown_ms: self.config.error_cooldown_ms,
        };
        let engine_budget = Duration::from_millis(request.timeout_ms);

        let mut state = AudioState::Idle;
        let mut voiced_samples: Vec<i16> = Vec::new();
        let mut sample_rate = 16000u32;
        let mut emitted: Option<RawRecognitionResult> = None;

        let mut pending = vec![AudioSignal::CaptureStarted];

        loop {
            // Drain queued signals through the transition function
            while let Some(signal) = pending.pop() {
                let (next, effects) = transition(state, signal, &policy);
                debug!(state = ?next, "Audio state transition");
                state = next;

                for effect in effects {
                    match effect {
                        AudioEffect::ArmWakeWord | AudioEffect::StartVoiceDetection => {
                            // Window routing below follows the state
                        }
                        AudioEffect::StartTranscription => {
                            let signal = self
                                .transcribe(engines, &voiced_samples, sample_rate, engine_budget)
                                .await;
                            pending.push(signal);
                        }
                        AudioEffect::EmitTranscript { text, confidence } => {
                            emitted = Some(RawRecognitionResult::recognized(
                                request,
                                text,
                                confidence,
                                elapsed_ms(started),
                                self.config.confidence_threshold,
                            ));
                        }
                        AudioEffect::EmitFailure(reason) => {
                            emitted = Some(RawRecognitionResult::failed(
                                request,
                                reason,
                                elapsed_ms(started),
                            ));
                        }
                        AudioEffect::StopEngines => {
                            voiced_samples.clear();
                        }
                        AudioEffect::BeginCooldown => {
                            tokio::time::sleep(Duration::from_millis(policy.error_cooldown_ms))
                                .await;
                            pending.push(AudioSignal::CooldownElapsed);
                        }
                    }
                }
            }

            if state == AudioState::Idle {
                if let Some(result) = emitted {
                    return result;
                }
                // False trigger: re-arm and keep listening
                pending.push(AudioSignal::CaptureStarted);
                continue;
            }

            // Pull the next microphone window for the current state
            let Some(window) = source.next_window().await else {
                return RawRecognitionResult::failed(
                    request,
                    FailureReason::Timeout,
                    elapsed_ms(started),
                );
            };
            sample_rate = window.sample_rate;

            match state {
                AudioState::ListeningForWakeWord => {
                    match self
                        .bridge
                        .recognize_once(&engines.wake, window.as_input(), engine_budget)
                        .await
                    {
                        Ok(out) => pending.push(AudioSignal::WakeWordDetected {
                            confidence: out.confidence,
                        }),
                        // No detection inside this window: keep listening
                        Err(BridgeError::Timeout) => {}
                        Err(e) => pending.push(AudioSignal::NativeFault {
                            reason: e.to_string(),
                        }),
                    }
                }
                AudioState::VoiceActive { .. } => {
                    voiced_samples.extend_from_slice(&window.samples);
                    match self
                        .bridge
                        .recognize_once(&engines.vad, window.as_input(), engine_budget)
                        .await
                    {
                        Ok(out) => pending.push(AudioSignal::VoiceFrame {
                            is_speech: out.confidence >= VAD_SPEECH_FLOOR,
                            frame_ms: window.duration_ms,
                        }),
                        Err(BridgeError::Timeout) => pending.push(AudioSignal::VoiceFrame {
                            is_speech: false,
                            frame_ms: window.duration_ms,
                        }),
                        Err(e) => pending.push(AudioSignal::NativeFault {
                            reason: e.to_string(),
                        }),
                    }
                }
                // Transcribing and Error are driven by queued signals,
                // not by microphone windows
                _ => {}
            }
        }
    }

    async fn transcribe(
        &self,
        engines: &SpeechEngines,
        samples: &[i16],
        sample_rate: u32,
        budget: Duration,
    ) -> AudioSignal {
        let input = EngineInput::Audio {
            samples: samples.to_vec(),
            sample_rate,
        };

        match self.bridge.recognize_once(&engines.asr, input, budget).await {
            Ok(out) => AudioSignal::TranscriptReady {
                text: out.text,
                confidence: out.confidence,
            },
            Err(BridgeError::Timeout) => AudioSignal::SilenceTimeout,
            Err(e) => AudioSignal::NativeFault {
                reason: e.to_string(),
            },
        }
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
        CaptureRequest::new(Uuid::new_v4(), Modality::Audio, 8000)
    }

    fn pipeline(bridge: Arc<ScriptedBridge>) -> AudioPipeline {
        AudioPipeline::new(bridge, RecognizerConfig::default())
    }

    async fn run_cycle(
        bridge: Arc<ScriptedBridge>,
        source: &mut BufferedAudioSource,
    ) -> RawRecognitionResult {
        let pipeline = pipeline(bridge);
        let engines = pipeline.load().await.unwrap();
        let result = pipeline.run(&request(), source, &engines).await;
        pipeline.unload(engines).await;
        result
    }

    #[tokio::test]
    async fn test_full_cycle_produces_transcript() {
        let bridge = Arc::new(ScriptedBridge::new());

        // One quiet window, then a detection
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.1))
            .await;
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
            .await;
        // Two voiced windows meet the 200ms debounce
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.9)).await;
        bridge
            .push_output(EngineKind::Asr, EngineOutput::new("solve for x", 0.88))
            .await;

        let mut source = BufferedAudioSource::uniform(8, 100);
        let result = run_cycle(bridge.clone(), &mut source).await;

        assert_eq!(result.outcome, RecognitionOutcome::Success);
        assert_eq!(result.text, "solve for x");
        assert_eq!(result.modality, Modality::Audio);
    }

    #[tokio::test]
    async fn test_false_trigger_rearms_and_recovers() {
        let bridge = Arc::new(ScriptedBridge::new());

        // First detection is a false trigger: one voiced window then
        // silence inside the 200ms debounce
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
            .await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.1)).await;
        // Second detection goes through
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
            .await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.9)).await;
        bridge
            .push_output(EngineKind::Asr, EngineOutput::new("seven times eight", 0.8))
            .await;

        let mut source = BufferedAudioSource::uniform(12, 100);
        let result = run_cycle(bridge.clone(), &mut source).await;

        assert_eq!(result.outcome, RecognitionOutcome::Success);
        assert_eq!(result.text, "seven times eight");
    }

    #[tokio::test]
    async fn test_exhausted_source_is_a_timeout() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.0))
            .await;

        let mut source = BufferedAudioSource::uniform(1, 100);
        let result = run_cycle(bridge.clone(), &mut source).await;

        assert_eq!(
            result.outcome,
            RecognitionOutcome::Failed(FailureReason::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_fault_fails_after_cooldown() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_error(
                EngineKind::WakeWord,
                BridgeError::NativeFault("engine crashed".into()),
            )
            .await;

        let mut source = BufferedAudioSource::uniform(4, 100);
        let result = run_cycle(bridge.clone(), &mut source).await;

        match result.outcome {
            RecognitionOutcome::Failed(FailureReason::NativeFault(reason)) => {
                assert!(reason.contains("engine crashed"));
            }
            other => panic!("expected native fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_confidence_transcript_classified() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge
            .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
            .await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
        bridge.push_output(EngineKind::Vad, EngineOutput::score(0.9)).await;
        bridge
            .push_output(EngineKind::Asr, EngineOutput::new("mumbled words", 0.2))
            .await;

        let mut source = BufferedAudioSource::uniform(6, 100);
        let result = run_cycle(bridge.clone(), &mut source).await;

        assert_eq!(result.outcome, RecognitionOutcome::LowConfidence);
    }

    #[tokio::test]
    async fn test_engine_load_failure_surfaces() {
        let bridge = Arc::new(ScriptedBridge::new());
        bridge.fail_load(EngineKind::Asr).await;

        let result = pipeline(bridge.clone()).load().await;

        assert!(matches!(result, Err(BridgeError::LoadError { .. })));
    }
}
