//! Scripted in-memory bridge.
//!
//! Substitutes the native SDKs with queued per-engine responses so the
//! pipelines can be exercised deterministically in tests and by the
//! `demo` CLI command. Responses are consumed in FIFO order; an
//! optional latency simulates engine processing time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    new_handle, BridgeError, EngineHandle, EngineInput, EngineKind, EngineOutput, NativeBridge,
};

struct ScriptedResponse {
    result: Result<EngineOutput, BridgeError>,
    latency: Duration,
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<EngineKind, VecDeque<ScriptedResponse>>,
    loaded: HashSet<EngineHandle>,
    /// Engine kinds that refuse to load
    load_failures: HashSet<EngineKind>,
}

/// In-memory [`NativeBridge`] with scripted responses
#[derive(Default)]
pub struct ScriptedBridge {
    inner: Mutex<Inner>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for the given engine
    pub async fn push_output(&self, kind: EngineKind, output: EngineOutput) {
        self.push(kind, Ok(output), Duration::ZERO).await;
    }

    /// Queue a successful response delivered after `latency`
    pub async fn push_output_after(&self, kind: EngineKind, output: EngineOutput, latency: Duration) {
        self.push(kind, Ok(output), latency).await;
    }

    /// Queue an error response for the given engine
    pub async fn push_error(&self, kind: EngineKind, error: BridgeError) {
        self.push(kind, Err(error), Duration::ZERO).await;
    }

    /// Queue an error response delivered after `latency`
    pub async fn push_error_after(&self, kind: EngineKind, error: BridgeError, latency: Duration) {
        self.push(kind, Err(error), latency).await;
    }

    /// Make `load_engine` fail for the given kind
    pub async fn fail_load(&self, kind: EngineKind) {
        self.inner.lock().await.load_failures.insert(kind);
    }

    /// Number of responses still queued for an engine
    pub async fn remaining(&self, kind: EngineKind) -> usize {
        self.inner
            .lock()
            .await
            .scripts
            .get(&kind)
            .map_or(0, |q| q.len())
    }

    async fn push(
        &self,
        kind: EngineKind,
        result: Result<EngineOutput, BridgeError>,
        latency: Duration,
    ) {
        self.inner
            .lock()
            .await
            .scripts
            .entry(kind)
            .or_default()
            .push_back(ScriptedResponse { result, latency });
    }
}

#[async_trait]
impl NativeBridge for ScriptedBridge {
    async fn load_engine(&self, kind: EngineKind) -> Result<EngineHandle, BridgeError> {
        let mut inner = self.inner.lock().await;

        if inner.load_failures.contains(&kind) {
            return Err(BridgeError::LoadError {
                kind,
                reason: "scripted load failure".into(),
            });
        }

        let handle = new_handle(kind);
        inner.loaded.insert(handle.clone());
        Ok(handle)
    }

    async fn recognize_once(
        &self,
        handle: &EngineHandle,
        input: EngineInput,
        timeout: Duration,
    ) -> Result<EngineOutput, BridgeError> {
        let response = {
            let mut inner = self.inner.lock().await;

            if !inner.loaded.contains(handle) {
                return Err(BridgeError::InvalidInput(format!(
                    "engine handle not loaded: {}",
                    handle.kind()
                )));
            }

            match (handle.kind(), &input) {
                (EngineKind::Ocr, EngineInput::Audio { .. }) => {
                    return Err(BridgeError::InvalidInput(
                        "OCR engine requires an image frame".into(),
                    ));
                }
                (EngineKind::WakeWord | EngineKind::Vad | EngineKind::Asr, EngineInput::Image(_)) => {
                    return Err(BridgeError::InvalidInput(
                        "speech engines require audio input".into(),
                    ));
                }
                _ => {}
            }

            inner
                .scripts
                .get_mut(&handle.kind())
                .and_then(|q| q.pop_front())
        };

        let Some(response) = response else {
            return Err(BridgeError::NativeFault(format!(
                "no scripted response left for {} engine",
                handle.kind()
            )));
        };

        if response.latency > timeout {
            // Simulate the callback never arriving within the budget
            tokio::time::sleep(timeout).await;
            return Err(BridgeError::Timeout);
        }

        if !response.latency.is_zero() {
            tokio::time::sleep(response.latency).await;
        }

        response.result
    }

    async fn unload_engine(&self, handle: EngineHandle) -> Result<(), BridgeError> {
        self.inner.lock().await.loaded.remove(&handle);
        Ok(())
    }
}
