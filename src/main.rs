// src/main.rs
//
// Demo harness: runs the controller against a synthetic scripted scene with
// an emergency vehicle appearing partway through, and writes every signal
// event as JSONL for offline inspection.

use anyhow::{Context, Result};
use serde::Serialize;
use signalx::sim::{LoggingEmitter, SceneDetector, ScriptedScene};
use signalx::types::Config;
use signalx::{SignalEvent, SignalRuntime};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_LOG_PATH: &str = "signal_events.jsonl";
const SUMMARY_PATH: &str = "run_summary.json";

#[derive(Serialize)]
struct EventRecord<'a> {
    tick: u64,
    now: f64,
    #[serde(flatten)]
    event: &'a SignalEvent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("🚦 signalx starting with config {}", config_path);
    info!(
        "   {} lanes, tick {}Hz, worker deadline {}ms",
        config.lanes.count, config.worker.tick_hz, config.worker.deadline_ms
    );

    // ~40s of scripted traffic at 30Hz; an emergency vehicle occupies lane 2
    // between ticks 300 and 450.
    let total_ticks: u64 = 1200;
    let scene = Arc::new(ScriptedScene::with_emergency_window(
        config.lanes.count,
        total_ticks as usize,
        2,
        300,
        450,
    ));
    let detector = Arc::new(SceneDetector);
    let emitter = Arc::new(LoggingEmitter::new());

    let mut runtime = SignalRuntime::new(config, scene, detector, emitter)?;

    let event_log = File::create(EVENT_LOG_PATH)
        .with_context(|| format!("creating {}", EVENT_LOG_PATH))?;
    let mut event_log = BufWriter::new(event_log);

    let mut tick: u64 = 0;
    runtime
        .run(Some(total_ticks), |report| {
            tick += 1;
            for event in &report.events {
                let record = EventRecord {
                    tick,
                    now: report.state.now,
                    event,
                };
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(err) = writeln!(event_log, "{}", line) {
                            warn!("event log write failed: {}", err);
                        }
                    }
                    Err(err) => warn!("event serialization failed: {}", err),
                }
            }
        })
        .await?;

    event_log.flush().context("flushing event log")?;

    let state = runtime.current_state();
    let summary = runtime.controller().metrics().summary();
    info!("🏁 run complete after {} cycles", state.cycle_count);
    info!(
        "   ticks={} ({:.1}/s), phase changes={}, emergencies={}/{}, \
         stale substitutions={}",
        summary.ticks,
        summary.tick_rate,
        summary.phase_changes,
        summary.emergency_entries,
        summary.emergency_exits,
        summary.stale_substitutions
    );

    let summary_file = File::create(SUMMARY_PATH)
        .with_context(|| format!("creating {}", SUMMARY_PATH))?;
    serde_json::to_writer_pretty(summary_file, &summary).context("writing run summary")?;
    info!("   events → {}, summary → {}", EVENT_LOG_PATH, SUMMARY_PATH);

    Ok(())
}
