//! Command-line interface for studylens.
//!
//! `demo` drives a scripted dual capture end to end; `history` and
//! `stats` expose the session store's read-only queries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use crate::audio::BufferedAudioSource;
use crate::bridge::{EngineKind, EngineOutput, Frame, ScriptedBridge};
use crate::broker::CaptureBroker;
use crate::config::ResolvedConfig;
use crate::fusion::FusionOutcome;
use crate::store::{DateRange, SessionStore};
use crate::vision::BufferedFrameSource;

/// studylens - study-assistant recognition core
#[derive(Parser, Debug)]
#[command(name = "studylens")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a studylens.yaml config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scripted dual capture against the in-process engines
    Demo,

    /// List recognition events, ordered by capture time
    History {
        /// Start date (YYYY-MM-DD, default today)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// End date (YYYY-MM-DD, default today)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Filter by subject tag
        #[arg(short, long)]
        subject: Option<String>,
    },

    /// Show per-day, per-subject aggregates
    Stats {
        /// Start date (YYYY-MM-DD, default today)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// End date (YYYY-MM-DD, default today)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = ResolvedConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Demo => run_demo(&config).await,
            Commands::History { from, to, subject } => {
                let store = open_store(&config)?;
                let events = store.query(range(from, to), subject.as_deref())?;

                if events.is_empty() {
                    println!("No recognition events in range.");
                    return Ok(());
                }

                for event in events {
                    println!(
                        "{}  [{:>6}]  {:.2}  {:<10}  {}",
                        event.captured_at.format("%Y-%m-%d %H:%M:%S"),
                        event.source_modality.as_str(),
                        event.confidence,
                        event.subject_tag.as_deref().unwrap_or("-"),
                        event.text,
                    );
                }
                Ok(())
            }
            Commands::Stats { from, to } => {
                let store = open_store(&config)?;
                let aggregates = store.aggregate(range(from, to))?;

                if aggregates.is_empty() {
                    println!("No events in range.");
                    return Ok(());
                }

                println!("{:<12} {:<12} {:>7} {:>10}", "day", "subject", "events", "avg conf");
                for agg in aggregates {
                    println!(
                        "{:<12} {:<12} {:>7} {:>10.3}",
                        agg.day,
                        agg.subject_tag.as_deref().unwrap_or("-"),
                        agg.event_count,
                        agg.avg_confidence,
                    );
                }
                Ok(())
            }
        }
    }
}

fn open_store(config: &ResolvedConfig) -> Result<Arc<SessionStore>> {
    SessionStore::open(&config.db_path)
        .with_context(|| format!("Failed to open session store at {}", config.db_path.display()))
        .map(Arc::new)
}

fn range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> DateRange {
    let today = Utc::now().date_naive();
    DateRange::new(from.unwrap_or(today), to.unwrap_or(today))
}

/// A canned dual capture: a sharp photographed equation plus a spoken
/// rendition of the same problem.
async fn run_demo(config: &ResolvedConfig) -> Result<()> {
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
        .push_output(
            EngineKind::Asr,
            EngineOutput::new("two x plus three equals seven", 0.79),
        )
        .await;

    let store = open_store(config)?;
    let broker = CaptureBroker::new(bridge, store, config.recognizer.clone());
    let mut completions = broker.subscribe();

    let frames = Box::new(BufferedFrameSource::new(vec![demo_frame()]));
    let audio = Box::new(BufferedAudioSource::uniform(8, 100));

    let (vision_req, audio_req) = broker.start_dual_capture(frames, audio).await?;
    println!(
        "Capture started (session {}): vision={} audio={}",
        vision_req.session_id, vision_req.id, audio_req.id
    );

    for _ in 0..2 {
        let completion = tokio::time::timeout(Duration::from_secs(10), completions.recv())
            .await
            .context("Timed out waiting for capture completion")?
            .context("Completion channel closed")?;

        println!(
            "  {} finished: {:?} ({} ms)",
            completion.request.modality, completion.result.outcome, completion.result.latency_ms
        );

        if let FusionOutcome::Recognized(event) = completion.outcome {
            println!(
                "Recognized [{}] \"{}\" confidence {:.2} subject {}",
                event.source_modality.as_str(),
                event.text,
                event.confidence,
                event.subject_tag.as_deref().unwrap_or("-"),
            );
        }
    }

    Ok(())
}

/// High-contrast checkerboard luma that passes the quality gate
fn demo_frame() -> Frame {
    let luma: Vec<u8> = (0..64 * 64)
        .map(|i| if i % 2 == 0 { 30 } else { 220 })
        .collect();
    Frame::new(luma, 64, 64)
}
