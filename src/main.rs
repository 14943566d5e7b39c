//! Source Monitor — Binary Entrypoint
//! Loads the monitor config, wires the HTTP fetcher, RSS extractor and
//! JSONL event sink, then runs one polling cycle per tick forever.
//!
//! Env knobs: `DRIFTWATCH_CONFIG` (config path), `DRIFTWATCH_TICK_SECS`
//! (cycle cadence, default 60), `DRIFTWATCH_EVENT_LOG` (JSONL path),
//! `RUST_LOG` (tracing filter).

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftwatch::extract::RssExtractor;
use driftwatch::fetch::HttpFetcher;
use driftwatch::monitor::MonitorOrchestrator;
use driftwatch::sink::JsonlSink;
use driftwatch::{config, CycleReport};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading monitor config")?;
    let rotate_ua = cfg.rotate_user_agent;

    let tick_secs: u64 = std::env::var("DRIFTWATCH_TICK_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);
    let event_log = std::env::var("DRIFTWATCH_EVENT_LOG")
        .unwrap_or_else(|_| "state/events.jsonl".to_string());

    let fetcher = Arc::new(
        HttpFetcher::new(rotate_ua)
            .map_err(|e| anyhow::anyhow!("building http client: {e}"))?,
    );
    let orchestrator = MonitorOrchestrator::new(
        cfg,
        fetcher,
        Arc::new(RssExtractor),
        Arc::new(JsonlSink::new(event_log)),
    )
    .context("building monitor")?;

    tracing::info!(tick_secs, "monitor started");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(tick_secs));
    loop {
        ticker.tick().await;
        match orchestrator.run_cycle().await {
            Ok(report) => log_report(&report),
            // Store/config-level errors only; unreachable sources never land here.
            Err(e) => tracing::error!(error = ?e, "cycle failed"),
        }
    }
}

fn log_report(report: &CycleReport) {
    for ev in &report.events {
        tracing::info!(
            source = %ev.source_id,
            category = %ev.category,
            ratio = ?ev.change_ratio,
            title = %ev.payload.title,
            "event"
        );
    }
}
