//! # Monitor orchestrator
//! Drives one polling cycle over all configured sources: rate-limited,
//! retried fetches with bounded concurrency, item-set or semantic-diff
//! change detection per source, and a single batched state persist at the
//! end of the cycle. Per-source failures are isolated; only config and
//! state-store errors abort a cycle.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::MonitorConfig;
use crate::diff::SemanticDiff;
use crate::extract::{self, ExtractedItem, ItemExtractor};
use crate::fetch::{self, Fetcher};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;
use crate::sink::EventSink;
use crate::state::{self, SourceState, StateStore};
use crate::types::{CycleReport, Event, EventPayload, SourceConfig, SourceMode, SourceOutcome};

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("monitor_cycles_total", "Completed polling cycles.");
        describe_counter!("monitor_events_total", "Change events emitted.");
        describe_counter!(
            "monitor_fetch_errors_total",
            "Fetches that exhausted all retries."
        );
        describe_counter!(
            "monitor_sources_skipped_total",
            "Sources skipped because their origin is exhausted."
        );
        describe_histogram!("monitor_cycle_ms", "Cycle duration in milliseconds.");
        describe_gauge!("monitor_last_cycle_ts", "Unix ts of the last completed cycle.");
    });
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Collaborators shared by every per-source task in a cycle.
struct Shared {
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    differ: Arc<SemanticDiff>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn ItemExtractor>,
    max_errors: u32,
    seen_cap: usize,
}

struct TaskResult {
    id: String,
    outcome: SourceOutcome,
    /// `None` leaves the stored state untouched (skips).
    state: Option<SourceState>,
    events: Vec<Event>,
}

pub struct MonitorOrchestrator {
    cfg: MonitorConfig,
    shared: Arc<Shared>,
    store: StateStore,
    sink: Arc<dyn EventSink>,
    /// Cycles are serialized; sources within a cycle are not.
    cycle_lock: Mutex<()>,
}

impl MonitorOrchestrator {
    pub fn new(
        cfg: MonitorConfig,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn ItemExtractor>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let differ = Arc::new(SemanticDiff::new(
            cfg.diff.significance_threshold,
            &cfg.diff.noise_patterns,
        )?);
        let limiter = Arc::new(RateLimiter::new(cfg.rate.clone()));
        let retry = RetryExecutor::new(
            cfg.retry.max_retries,
            Duration::from_millis(cfg.retry.base_delay_ms),
        );
        let store = StateStore::new(cfg.state_path.clone());
        let shared = Arc::new(Shared {
            limiter,
            retry,
            differ,
            fetcher,
            extractor,
            max_errors: cfg.rate.max_consecutive_errors,
            seen_cap: cfg.seen_ids_cap,
        });
        Ok(Self {
            cfg,
            shared,
            store,
            sink,
            cycle_lock: Mutex::new(()),
        })
    }

    /// The per-origin rate limiter, for diagnostics and tests.
    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// Run one full cycle with no deadline.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_with_deadline(None).await
    }

    /// Run one full cycle. With a deadline, in-flight fetches are aborted
    /// once it passes, but results that already completed are still
    /// persisted and reported.
    pub async fn run_cycle_with_deadline(&self, deadline: Option<Duration>) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        ensure_metrics_described();
        let t0 = std::time::Instant::now();

        let mut states = self.store.load().context("loading source state")?;
        let sem = Arc::new(Semaphore::new(self.cfg.max_in_flight));
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut join = JoinSet::new();

        // Higher-priority sources are dispatched first.
        let mut sources = self.cfg.sources.clone();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        for src in sources {
            let prior = states.get(&src.id).cloned();
            let shared = self.shared.clone();
            let sem = sem.clone();
            let tx = tx.clone();
            join.spawn(async move {
                let res = process_source(shared, sem, src, prior).await;
                let _ = tx.send(res);
            });
        }
        drop(tx);

        let mut results: Vec<TaskResult> = Vec::with_capacity(self.cfg.sources.len());
        match deadline {
            None => {
                while let Some(r) = rx.recv().await {
                    results.push(r);
                }
            }
            Some(d) => {
                let until = tokio::time::Instant::now() + d;
                loop {
                    match tokio::time::timeout_at(until, rx.recv()).await {
                        Ok(Some(r)) => results.push(r),
                        Ok(None) => break,
                        Err(_) => {
                            tracing::warn!("cycle deadline reached; aborting in-flight fetches");
                            join.abort_all();
                            while let Ok(r) = rx.try_recv() {
                                results.push(r);
                            }
                            break;
                        }
                    }
                }
            }
        }
        while join.join_next().await.is_some() {}
        // A task may have finished between the deadline firing and the abort.
        while let Ok(r) = rx.try_recv() {
            results.push(r);
        }

        let mut events: Vec<Event> = Vec::new();
        let mut outcomes: Vec<(String, SourceOutcome)> = Vec::with_capacity(self.cfg.sources.len());
        let mut completed: HashSet<String> = HashSet::new();
        for r in results {
            completed.insert(r.id.clone());
            if let Some(st) = r.state {
                states.insert(r.id.clone(), st);
            }
            events.extend(r.events);
            outcomes.push((r.id, r.outcome));
        }
        // Sources aborted by the deadline never reported back.
        for src in &self.cfg.sources {
            if !completed.contains(&src.id) {
                outcomes.push((src.id.clone(), SourceOutcome::Skipped));
            }
        }

        // Publish before persisting: if the sink fails, stored state is left
        // as-is and the next cycle re-emits (at-least-once).
        self.sink
            .publish(&events)
            .await
            .context("publishing events")?;

        for st in states.values_mut() {
            st.trim(self.cfg.seen_ids_cap);
        }
        self.store.save(&states).context("persisting source state")?;

        let report = CycleReport { events, outcomes };
        counter!("monitor_cycles_total").increment(1);
        gauge!("monitor_last_cycle_ts").set(unix_now() as f64);
        histogram!("monitor_cycle_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(
            events = report.events.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "cycle complete"
        );
        Ok(report)
    }
}

async fn process_source(
    shared: Arc<Shared>,
    sem: Arc<Semaphore>,
    src: SourceConfig,
    prior: Option<SourceState>,
) -> TaskResult {
    let origin = fetch::origin_of(&src.url);
    let now = unix_now();

    if let Some(last) = prior.as_ref().and_then(|st| st.last_attempt_unix) {
        if src.poll_interval_secs > 0 && now.saturating_sub(last) < src.poll_interval_secs {
            tracing::debug!(source = %src.id, "not due yet");
            return TaskResult {
                id: src.id,
                outcome: SourceOutcome::Skipped,
                state: None,
                events: Vec::new(),
            };
        }
    }

    if shared.limiter.should_skip(&origin, shared.max_errors).await {
        counter!("monitor_sources_skipped_total").increment(1);
        tracing::warn!(source = %src.id, origin = %origin, "origin exhausted; skipping");
        return TaskResult {
            id: src.id,
            outcome: SourceOutcome::Skipped,
            state: None,
            events: Vec::new(),
        };
    }

    let Ok(_permit) = sem.acquire_owned().await else {
        return TaskResult {
            id: src.id,
            outcome: SourceOutcome::Skipped,
            state: None,
            events: Vec::new(),
        };
    };

    let was_first = prior.is_none();
    let mut st = prior.unwrap_or_default();
    st.last_attempt_unix = Some(now);

    shared.limiter.acquire(&origin).await;

    let fetch_res = shared
        .retry
        .execute(|| {
            let fetcher = shared.fetcher.clone();
            let limiter = shared.limiter.clone();
            let url = src.url.clone();
            let origin = origin.clone();
            let kind = src.kind;
            async move {
                match fetcher.fetch(&url, kind).await {
                    Ok(body) => Ok(body),
                    Err(e) => {
                        limiter.report_failure(&origin, e.status()).await;
                        Err(e)
                    }
                }
            }
        })
        .await;

    let raw = match fetch_res {
        Ok(body) => body,
        Err(e) => {
            counter!("monitor_fetch_errors_total").increment(1);
            tracing::warn!(source = %src.id, error = %e, "fetch failed after retries");
            st.consecutive_errors = st.consecutive_errors.saturating_add(1);
            return TaskResult {
                id: src.id,
                outcome: SourceOutcome::Failed,
                state: Some(st),
                events: Vec::new(),
            };
        }
    };
    shared.limiter.report_success(&origin).await;

    match src.mode {
        SourceMode::Feed => {
            let items = match shared.extractor.extract_items(&raw, &src) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(source = %src.id, error = %e, "extraction failed");
                    st.consecutive_errors = st.consecutive_errors.saturating_add(1);
                    return TaskResult {
                        id: src.id,
                        outcome: SourceOutcome::Failed,
                        state: Some(st),
                        events: Vec::new(),
                    };
                }
            };

            st.consecutive_errors = 0;
            st.last_success_unix = Some(now);
            st.fingerprint = Some(state::fingerprint(&raw));

            let mut events = Vec::new();
            if was_first {
                // Baseline: remember everything, emit nothing.
                for it in items {
                    st.note_seen(it.id, shared.seen_cap);
                }
                tracing::info!(source = %src.id, "baseline established");
            } else {
                let mut cycle_seen: HashSet<String> = HashSet::new();
                for it in items {
                    if st.has_seen(&it.id) || !cycle_seen.insert(it.id.clone()) {
                        continue;
                    }
                    events.push(feed_event(&src, &it, now));
                    st.note_seen(it.id, shared.seen_cap);
                }
            }
            counter!("monitor_events_total").increment(events.len() as u64);
            TaskResult {
                id: src.id,
                outcome: SourceOutcome::Succeeded {
                    events: events.len(),
                },
                state: Some(st),
                events,
            }
        }
        SourceMode::Page => {
            let normalized = extract::normalize_text(&raw);
            let fp = state::fingerprint(&normalized);
            st.consecutive_errors = 0;
            st.last_success_unix = Some(now);

            let mut events = Vec::new();
            if let Some(prev) = st.snapshot.take() {
                if st.fingerprint.as_deref() != Some(fp.as_str()) {
                    let res = shared.differ.is_significant_change(&prev, &normalized);
                    if res.significant {
                        events.push(page_event(&src, res.ratio, &res.summary, &fp, now));
                    } else {
                        tracing::debug!(
                            source = %src.id,
                            ratio = res.ratio,
                            "change below significance threshold"
                        );
                    }
                }
            } else if was_first {
                tracing::info!(source = %src.id, "baseline established");
            }
            // Snapshot and fingerprint always advance on success, so noise
            // never re-triggers a comparison against stale content.
            st.snapshot = Some(normalized);
            st.fingerprint = Some(fp);

            counter!("monitor_events_total").increment(events.len() as u64);
            TaskResult {
                id: src.id,
                outcome: SourceOutcome::Succeeded {
                    events: events.len(),
                },
                state: Some(st),
                events,
            }
        }
    }
}

fn feed_event(src: &SourceConfig, it: &ExtractedItem, now: u64) -> Event {
    Event {
        id: format!("{}:{}", src.id, &state::fingerprint(&it.id)[..16]),
        source_id: src.id.clone(),
        category: src.category.clone(),
        ts_unix: now,
        payload: EventPayload {
            title: it.title.clone(),
            url: it.url.clone(),
            summary: None,
        },
        change_ratio: None,
    }
}

fn page_event(src: &SourceConfig, ratio: f64, summary: &str, fp: &str, now: u64) -> Event {
    Event {
        id: format!("{}:{}", src.id, &fp[..16]),
        source_id: src.id.clone(),
        category: src.category.clone(),
        ts_unix: now,
        payload: EventPayload {
            title: format!("{} content changed", src.id),
            url: Some(src.url.clone()),
            summary: Some(summary.to_string()),
        },
        change_ratio: Some(ratio),
    }
}
