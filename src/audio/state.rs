//! Audio pipeline state machine.
//!
//! An explicit tagged-state value with a pure transition function
//! `(state, signal) -> (state, effects)`. The async driver in the
//! parent module feeds signals derived from engine callbacks and
//! performs the returned effects; keeping the transitions pure lets
//! the whole table be unit-tested without hardware.

use crate::domain::FailureReason;

/// Tunable knobs the transition function consults
#[derive(Debug, Clone, Copy)]
pub struct AudioPolicy {
    /// Wake-word detections below this confidence are ignored
    pub wake_word_min_confidence: f32,

    /// Sustained voice energy required before transcription starts
    pub voice_active_debounce_ms: u64,

    /// Cooldown before an errored pipeline returns to idle
    pub error_cooldown_ms: u64,
}

/// The audio pipeline's single state value
#[derive(Debug, Clone, PartialEq)]
pub enum AudioState {
    Idle,
    ListeningForWakeWord,
    /// Wake word fired; accumulating voiced milliseconds toward the
    /// debounce window
    VoiceActive { voiced_ms: u64 },
    Transcribing,
    /// Unrecoverable engine fault; waiting out the cooldown
    Error,
}

/// Signals fed into the transition function
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSignal {
    /// A capture was started (or continuous listening enabled)
    CaptureStarted,

    /// Wake-word engine reported a detection with this confidence
    WakeWordDetected { confidence: f32 },

    /// VAD classified one audio window
    VoiceFrame { is_speech: bool, frame_ms: u64 },

    /// ASR returned a final transcript
    TranscriptReady { text: String, confidence: f32 },

    /// ASR produced no final result within the request budget
    SilenceTimeout,

    /// Explicit cancel from the broker
    Cancelled,

    /// Native bridge reported an unrecoverable fault
    NativeFault { reason: String },

    /// Error cooldown has elapsed
    CooldownElapsed,
}

/// Effects the driver must perform after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEffect {
    /// Start feeding windows to the wake-word engine
    ArmWakeWord,

    /// Start feeding windows to the VAD engine
    StartVoiceDetection,

    /// Submit buffered audio to the ASR engine
    StartTranscription,

    /// Emit the recognized transcript as this capture's terminal result
    EmitTranscript { text: String, confidence: f32 },

    /// Emit a failure as this capture's terminal result
    EmitFailure(FailureReason),

    /// Stop feeding the native engines
    StopEngines,

    /// Sleep for the error cooldown, then feed `CooldownElapsed`
    BeginCooldown,
}

/// Pure transition function. Unknown state/signal combinations are
/// ignored: the state is returned unchanged with no effects.
pub fn transition(
    state: AudioState,
    signal: AudioSignal,
    policy: &AudioPolicy,
) -> (AudioState, Vec<AudioEffect>) {
    // An engine fault is terminal from every state
    if let AudioSignal::NativeFault { reason } = signal {
        return (
            AudioState::Error,
            vec![
                AudioEffect::EmitFailure(FailureReason::NativeFault(reason)),
                AudioEffect::BeginCooldown,
            ],
        );
    }

    match (state, signal) {
        (AudioState::Idle, AudioSignal::CaptureStarted) => (
            AudioState::ListeningForWakeWord,
            vec![AudioEffect::ArmWakeWord],
        ),

        (AudioState::ListeningForWakeWord, AudioSignal::WakeWordDetected { confidence }) => {
            if confidence >= policy.wake_word_min_confidence {
                (
                    AudioState::VoiceActive { voiced_ms: 0 },
                    vec![AudioEffect::StartVoiceDetection],
                )
            } else {
                // Below the floor: keep listening
                (AudioState::ListeningForWakeWord, vec![])
            }
        }

        (AudioState::ListeningForWakeWord, AudioSignal::Cancelled) => {
            // The broker synthesizes the Cancelled result; the pipeline
            // just stands down.
            (AudioState::Idle, vec![AudioEffect::StopEngines])
        }

        (AudioState::VoiceActive { voiced_ms }, AudioSignal::VoiceFrame { is_speech, frame_ms }) => {
            if is_speech {
                let voiced_ms = voiced_ms + frame_ms;
                if voiced_ms >= policy.voice_active_debounce_ms {
                    (AudioState::Transcribing, vec![AudioEffect::StartTranscription])
                } else {
                    (AudioState::VoiceActive { voiced_ms }, vec![])
                }
            } else {
                // Silence before the debounce window elapsed: spurious
                // trigger, no result emitted
                (AudioState::Idle, vec![AudioEffect::StopEngines])
            }
        }

        (AudioState::VoiceActive { .. }, AudioSignal::Cancelled) => {
            (AudioState::Idle, vec![AudioEffect::StopEngines])
        }

        (AudioState::Transcribing, AudioSignal::TranscriptReady { text, confidence }) => (
            AudioState::Idle,
            vec![AudioEffect::EmitTranscript { text, confidence }],
        ),

        (AudioState::Transcribing, AudioSignal::SilenceTimeout) => (
            AudioState::Idle,
            vec![AudioEffect::EmitFailure(FailureReason::Timeout)],
        ),

        // Only one transcription may be in flight; wake words heard
        // while transcribing are ignored
        (AudioState::Transcribing, AudioSignal::WakeWordDetected { .. }) => {
            (AudioState::Transcribing, vec![])
        }

        (AudioState::Transcribing, AudioSignal::Cancelled) => {
            (AudioState::Idle, vec![AudioEffect::StopEngines])
        }

        (AudioState::Error, AudioSignal::CooldownElapsed) => (AudioState::Idle, vec![]),

        // Everything else is a no-op
        (state, _) => (state, vec![]),
    }
}
