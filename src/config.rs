//! Configuration for the recognition core.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STUDYLENS_HOME, STUDYLENS_DB)
//! 2. Config file (studylens.yaml, path given by the caller)
//! 3. Defaults
//!
//! Pipelines take a `RecognizerConfig` by value so tests can construct
//! one directly instead of going through a file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub recognition: RecognitionSection,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionSection {
    pub confidence_threshold: Option<f32>,
    pub capture_timeout_ms: Option<u64>,
    pub wake_word_min_confidence: Option<f32>,
    pub voice_active_debounce_ms: Option<u64>,
    pub fusion_tie_epsilon: Option<f32>,
    pub max_frame_retries: Option<u32>,
    pub session_window_ms: Option<u64>,
    pub error_cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// SQLite database path (relative paths resolve against the
    /// config file's directory)
    pub db_path: Option<String>,
}

/// Resolved recognition settings used by the broker and pipelines
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// Minimum confidence for a result to be persisted
    pub confidence_threshold: f32,

    /// Per-request budget covering worst-case ASR/OCR latency
    pub capture_timeout_ms: u64,

    /// Confidence floor for wake-word detections
    pub wake_word_min_confidence: f32,

    /// Sustained voice energy required before transcription starts
    pub voice_active_debounce_ms: u64,

    /// Confidence gap within which a vision/audio tie prefers vision
    pub fusion_tie_epsilon: f32,

    /// Additional frames tried when the quality gate rejects one
    pub max_frame_retries: u32,

    /// How long an abandoned fusion session stays pending before eviction
    pub session_window_ms: u64,

    /// Cooldown before an errored audio pipeline returns to idle
    pub error_cooldown_ms: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            capture_timeout_ms: 8000,
            wake_word_min_confidence: 0.6,
            voice_active_debounce_ms: 200,
            fusion_tie_epsilon: 0.02,
            max_frame_retries: 2,
            session_window_ms: 1500,
            error_cooldown_ms: 1000,
        }
    }
}

/// Fully resolved configuration: recognizer settings plus store location
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub recognizer: RecognizerConfig,
    pub db_path: PathBuf,
}

impl ResolvedConfig {
    /// Load configuration, merging an optional YAML file over defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => Some((load_config_file(path)?, path.to_path_buf())),
            None => None,
        };

        let recognizer = match &file {
            Some((config, _)) => merge_recognition(&config.recognition),
            None => RecognizerConfig::default(),
        };

        let db_path = resolve_db_path(file.as_ref())?;

        Ok(Self {
            recognizer,
            db_path,
        })
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn merge_recognition(section: &RecognitionSection) -> RecognizerConfig {
    let defaults = RecognizerConfig::default();
    RecognizerConfig {
        confidence_threshold: section
            .confidence_threshold
            .unwrap_or(defaults.confidence_threshold),
        capture_timeout_ms: section
            .capture_timeout_ms
            .unwrap_or(defaults.capture_timeout_ms),
        wake_word_min_confidence: section
            .wake_word_min_confidence
            .unwrap_or(defaults.wake_word_min_confidence),
        voice_active_debounce_ms: section
            .voice_active_debounce_ms
            .unwrap_or(defaults.voice_active_debounce_ms),
        fusion_tie_epsilon: section
            .fusion_tie_epsilon
            .unwrap_or(defaults.fusion_tie_epsilon),
        max_frame_retries: section
            .max_frame_retries
            .unwrap_or(defaults.max_frame_retries),
        session_window_ms: section
            .session_window_ms
            .unwrap_or(defaults.session_window_ms),
        error_cooldown_ms: section
            .error_cooldown_ms
            .unwrap_or(defaults.error_cooldown_ms),
    }
}

fn resolve_db_path(file: Option<&(ConfigFile, PathBuf)>) -> Result<PathBuf> {
    // Env var wins over the config file
    if let Ok(env_db) = std::env::var("STUDYLENS_DB") {
        return Ok(PathBuf::from(env_db));
    }

    if let Some((config, config_path)) = file {
        if let Some(ref db) = config.store.db_path {
            let path = PathBuf::from(db);
            if path.is_absolute() {
                return Ok(path);
            }
            let base = config_path.parent().unwrap_or(Path::new("."));
            return Ok(base.join(path));
        }
    }

    let home = match std::env::var("STUDYLENS_HOME") {
        Ok(home) => PathBuf::from(home),
        Err(_) => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".studylens"),
    };

    Ok(home.join("sessions.db"))
}
