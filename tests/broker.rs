//! Capture Broker Integration Tests
//!
//! Covers the broker's lifecycle guarantees: one outstanding request
//! per modality, exactly one terminal result per request, synthesized
//! timeout results, and cancellation that drops late pipeline output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use studylens::audio::{AudioSource, AudioWindow, BufferedAudioSource};
use studylens::bridge::{
    BridgeError, EngineHandle, EngineInput, EngineKind, EngineOutput, Frame, NativeBridge,
    ScriptedBridge,
};
use studylens::broker::CaptureBroker;
use studylens::config::RecognizerConfig;
use studylens::domain::{FailureReason, Modality, RecognitionOutcome};
use studylens::error::CaptureError;
use studylens::fusion::FusionOutcome;
use studylens::store::{DateRange, SessionStore};
use studylens::vision::{BufferedFrameSource, FrameSource};

/// Frame source that never yields, keeping a vision capture in flight
struct StuckFrameSource;

#[async_trait]
impl FrameSource for StuckFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        std::future::pending().await
    }
}

/// Audio source that never yields, keeping an audio capture in flight
struct StuckAudioSource;

#[async_trait]
impl AudioSource for StuckAudioSource {
    async fn next_window(&mut self) -> Option<AudioWindow> {
        std::future::pending().await
    }
}

/// Bridge wrapper counting engine loads and unloads
struct CountingBridge {
    inner: ScriptedBridge,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl CountingBridge {
    fn new() -> Self {
        Self {
            inner: ScriptedBridge::new(),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NativeBridge for CountingBridge {
    async fn load_engine(&self, kind: EngineKind) -> Result<EngineHandle, BridgeError> {
        let handle = self.inner.load_engine(kind).await?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn recognize_once(
        &self,
        handle: &EngineHandle,
        input: EngineInput,
        timeout: Duration,
    ) -> Result<EngineOutput, BridgeError> {
        self.inner.recognize_once(handle, input, timeout).await
    }

    async fn unload_engine(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.inner.unload_engine(handle).await?;
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sharp_frame() -> Frame {
    let luma: Vec<u8> = (0..64 * 64)
        .map(|i| if i % 2 == 0 { 30 } else { 220 })
        .collect();
    Frame::new(luma, 64, 64)
}

fn broker_with(
    bridge: Arc<ScriptedBridge>,
    config: RecognizerConfig,
) -> (CaptureBroker, Arc<SessionStore>) {
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    (CaptureBroker::new(bridge, store.clone(), config), store)
}

fn today() -> DateRange {
    DateRange::single_day(chrono::Utc::now().date_naive())
}

#[tokio::test]
async fn test_second_capture_per_modality_is_busy() {
    let bridge = Arc::new(ScriptedBridge::new());
    let (broker, _store) = broker_with(bridge, RecognizerConfig::default());

    let request = broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();

    let err = broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::Busy(Modality::Vision)));

    // The audio slot is independent
    broker
        .start_audio_capture(Box::new(StuckAudioSource))
        .await
        .unwrap();
    assert_eq!(broker.active_modalities().len(), 2);

    broker.cancel(request.id).unwrap();
}

#[tokio::test]
async fn test_dual_capture_fuses_and_stores_exactly_one_event() {
    let bridge = Arc::new(ScriptedBridge::new());
    bridge
        .push_output(EngineKind::Ocr, EngineOutput::new("2x + 3 = 7", 0.93))
        .await;
    bridge
        .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
        .await;
    bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
    bridge.push_output(EngineKind::Vad, EngineOutput::score(0.9)).await;
    bridge
        .push_output(EngineKind::Asr, EngineOutput::new("solve two x plus three", 0.79))
        .await;

    let (broker, store) = broker_with(bridge, RecognizerConfig::default());
    let mut completions = broker.subscribe();

    broker
        .start_dual_capture(
            Box::new(BufferedFrameSource::new(vec![sharp_frame()])),
            Box::new(BufferedAudioSource::uniform(8, 100)),
        )
        .await
        .unwrap();

    let first = completions.recv().await.unwrap();
    let second = completions.recv().await.unwrap();

    // Exactly one of the two completions carries the fused event
    let recognized: Vec<_> = [&first, &second]
        .iter()
        .filter_map(|c| match &c.outcome {
            FusionOutcome::Recognized(event) => Some(event.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(recognized.len(), 1);
    assert!(matches!(
        [&first.outcome, &second.outcome],
        [FusionOutcome::Pending, FusionOutcome::Recognized(_)]
            | [FusionOutcome::Recognized(_), FusionOutcome::Pending]
    ));

    let events = store.query(today(), None).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, recognized[0].id);

    // Both slots released once terminal
    assert!(broker.active_modalities().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_capture_synthesizes_failed_timeout() {
    let bridge = Arc::new(ScriptedBridge::new());
    let config = RecognizerConfig {
        capture_timeout_ms: 500,
        ..RecognizerConfig::default()
    };
    let (broker, store) = broker_with(bridge, config);
    let mut completions = broker.subscribe();

    broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();

    let completion = completions.recv().await.unwrap();
    assert_eq!(
        completion.result.outcome,
        RecognitionOutcome::Failed(FailureReason::Timeout)
    );
    assert!(matches!(completion.outcome, FusionOutcome::NoRecognition));
    assert!(store.query(today(), None).unwrap().is_empty());
    assert!(broker.active_modalities().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_capture_drops_late_pipeline_output() {
    let bridge = Arc::new(ScriptedBridge::new());
    // OCR would answer, but only after five seconds
    bridge
        .push_output_after(
            EngineKind::Ocr,
            EngineOutput::new("too late", 0.95),
            Duration::from_secs(5),
        )
        .await;

    let (broker, store) = broker_with(bridge, RecognizerConfig::default());
    let mut completions = broker.subscribe();

    let request = broker
        .start_vision_capture(Box::new(BufferedFrameSource::new(vec![sharp_frame()])))
        .await
        .unwrap();
    broker.cancel(request.id).unwrap();

    let completion = completions.recv().await.unwrap();
    assert_eq!(completion.request.id, request.id);
    assert_eq!(
        completion.result.outcome,
        RecognitionOutcome::Failed(FailureReason::Cancelled)
    );

    // The late OCR text never reaches the store
    assert!(store.query(today(), None).unwrap().is_empty());

    // The slot is free again
    broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_capture_releases_engines() {
    let bridge = Arc::new(CountingBridge::new());
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let broker = CaptureBroker::new(bridge.clone(), store, RecognizerConfig::default());
    let mut completions = broker.subscribe();

    let request = broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();
    broker.cancel(request.id).unwrap();

    let completion = completions.recv().await.unwrap();
    assert_eq!(
        completion.result.outcome,
        RecognitionOutcome::Failed(FailureReason::Cancelled)
    );

    // The OCR engine loaded for the capture is released even though the
    // capture future itself never finished
    assert_eq!(bridge.loads.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.unloads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_audio_capture_releases_engines() {
    let bridge = Arc::new(CountingBridge::new());
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let config = RecognizerConfig {
        capture_timeout_ms: 500,
        ..RecognizerConfig::default()
    };
    let broker = CaptureBroker::new(bridge.clone(), store, config);
    let mut completions = broker.subscribe();

    broker
        .start_audio_capture(Box::new(StuckAudioSource))
        .await
        .unwrap();

    let completion = completions.recv().await.unwrap();
    assert_eq!(
        completion.result.outcome,
        RecognitionOutcome::Failed(FailureReason::Timeout)
    );

    // All three speech engines are released after the timeout wins
    assert_eq!(bridge.loads.load(Ordering::SeqCst), 3);
    assert_eq!(bridge.unloads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_engine_load_failure_completes_with_native_fault() {
    let bridge = Arc::new(ScriptedBridge::new());
    bridge.fail_load(EngineKind::Ocr).await;

    let (broker, store) = broker_with(bridge, RecognizerConfig::default());
    let mut completions = broker.subscribe();

    broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();

    let completion = completions.recv().await.unwrap();
    assert!(matches!(
        completion.result.outcome,
        RecognitionOutcome::Failed(FailureReason::NativeFault(_))
    ));
    assert!(store.query(today(), None).unwrap().is_empty());
    assert!(broker.active_modalities().is_empty());
}

#[tokio::test]
async fn test_rejected_capture_leaves_no_pending_session() {
    let bridge = Arc::new(ScriptedBridge::new());
    let (broker, _store) = broker_with(bridge, RecognizerConfig::default());

    let request = broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap();
    assert_eq!(broker.fusion().pending_count().await, 1);

    let err = broker
        .start_vision_capture(Box::new(StuckFrameSource))
        .await
        .unwrap_err();
    assert!(matches!(err, CaptureError::Busy(Modality::Vision)));

    // The rejected attempt must not strand a session awaiting results
    assert_eq!(broker.fusion().pending_count().await, 1);

    broker.cancel(request.id).unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_request_reports_not_found() {
    let bridge = Arc::new(ScriptedBridge::new());
    let (broker, _store) = broker_with(bridge, RecognizerConfig::default());

    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        broker.cancel(id).unwrap_err(),
        CaptureError::NotFound(got) if got == id
    ));
}

#[tokio::test]
async fn test_single_audio_capture_flows_to_store() {
    let bridge = Arc::new(ScriptedBridge::new());
    bridge
        .push_output(EngineKind::WakeWord, EngineOutput::score(0.9))
        .await;
    bridge.push_output(EngineKind::Vad, EngineOutput::score(0.8)).await;
    bridge.push_output(EngineKind::Vad, EngineOutput::score(0.9)).await;
    bridge
        .push_output(EngineKind::Asr, EngineOutput::new("what is velocity", 0.9))
        .await;

    let (broker, _store) = broker_with(bridge, RecognizerConfig::default());
    let mut completions = broker.subscribe();

    broker
        .start_audio_capture(Box::new(BufferedAudioSource::uniform(8, 100)))
        .await
        .unwrap();

    let completion = completions.recv().await.unwrap();
    let event = match completion.outcome {
        FusionOutcome::Recognized(event) => event,
        other => panic!("expected Recognized, got {:?}", other),
    };
    assert_eq!(event.text, "what is velocity");
    assert_eq!(event.subject_tag.as_deref(), Some("physics"));
    // The broker exposes the store for history views
    assert_eq!(broker.store().query(today(), None).unwrap().len(), 1);
}
