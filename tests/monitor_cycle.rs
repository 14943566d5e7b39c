// tests/monitor_cycle.rs
// Full-cycle behavior of the orchestrator against scripted transports.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use driftwatch::config::{DiffConfig, MonitorConfig, RateConfig, RetryConfig};
use driftwatch::extract::RssExtractor;
use driftwatch::fetch::{FetchError, Fetcher};
use driftwatch::monitor::MonitorOrchestrator;
use driftwatch::sink::{EventSink, MemorySink};
use driftwatch::state::StateStore;
use driftwatch::types::{Event, FetchKind, SourceConfig, SourceMode, SourceOutcome};

#[derive(Clone)]
enum Script {
    Body(String),
    Fail(FetchError),
    Hang,
}

struct MockFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockFetcher {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, url: &str, steps: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(steps);
    }

    fn calls_for(&self, url: &str) -> u32 {
        *self.calls.lock().unwrap().get(url).unwrap_or(&0)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, _kind: FetchKind) -> Result<String, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front());
        match step {
            Some(Script::Body(b)) => Ok(b),
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(FetchError::Transport("script exhausted".into())),
        }
    }
}

struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn publish(&self, _events: &[Event]) -> Result<()> {
        anyhow::bail!("sink unavailable")
    }
}

fn rss(items: &[(&str, &str)]) -> String {
    let mut body = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel>"#);
    for (guid, title) in items {
        body.push_str(&format!(
            "<item><guid>{guid}</guid><title>{title}</title><link>https://feed.example/{guid}</link></item>"
        ));
    }
    body.push_str("</channel></rss>");
    body
}

fn feed_source(id: &str, url: &str) -> SourceConfig {
    SourceConfig {
        id: id.into(),
        url: url.into(),
        kind: FetchKind::Plain,
        mode: SourceMode::Feed,
        poll_interval_secs: 0,
        category: "test".into(),
        priority: 0,
    }
}

fn page_source(id: &str, url: &str) -> SourceConfig {
    SourceConfig {
        mode: SourceMode::Page,
        ..feed_source(id, url)
    }
}

fn test_cfg(sources: Vec<SourceConfig>, dir: &Path) -> MonitorConfig {
    MonitorConfig {
        sources,
        rate: RateConfig {
            default_delay_secs: 0.01,
            max_delay_secs: 1.0,
            max_consecutive_errors: 5,
            jitter: 0.0,
        },
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
        },
        diff: DiffConfig {
            significance_threshold: 0.1,
            noise_patterns: Vec::new(),
        },
        max_in_flight: 4,
        seen_ids_cap: 100,
        rotate_user_agent: false,
        state_path: dir.join("state.json"),
    }
}

fn monitor(
    cfg: MonitorConfig,
    fetcher: Arc<MockFetcher>,
    sink: Arc<MemorySink>,
) -> MonitorOrchestrator {
    MonitorOrchestrator::new(cfg, fetcher, Arc::new(RssExtractor), sink).unwrap()
}

#[tokio::test(start_paused = true)]
async fn first_poll_establishes_baseline_without_events() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://feed.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(url, vec![Script::Body(rss(&[("a", "First"), ("b", "Second")]))]);

    let cfg = test_cfg(vec![feed_source("fed", url)], tmp.path());
    let state_path = cfg.state_path.clone();
    let m = monitor(cfg, fetcher, Arc::new(MemorySink::new()));

    let report = m.run_cycle().await.unwrap();
    assert!(report.events.is_empty());
    assert_eq!(report.outcome_for("fed"), Some(SourceOutcome::Succeeded { events: 0 }));

    let states = StateStore::new(state_path).load().unwrap();
    let st = states.get("fed").unwrap();
    assert_eq!(st.seen_ids.len(), 2);
    assert!(st.fingerprint.is_some());
    assert_eq!(st.consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn two_new_items_yield_exactly_two_events_with_unique_ids() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://feed.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(
        url,
        vec![
            Script::Body(rss(&[("a", "First"), ("b", "Second")])),
            Script::Body(rss(&[("c", "Third"), ("a", "First"), ("b", "Second"), ("d", "Fourth")])),
        ],
    );

    let sink = Arc::new(MemorySink::new());
    let m = monitor(test_cfg(vec![feed_source("fed", url)], tmp.path()), fetcher, sink.clone());

    m.run_cycle().await.unwrap();
    let report = m.run_cycle().await.unwrap();

    assert_eq!(report.events.len(), 2);
    assert_ne!(report.events[0].id, report.events[1].id);
    let titles: Vec<_> = report.events.iter().map(|e| e.payload.title.as_str()).collect();
    assert_eq!(titles, vec!["Third", "Fourth"]); // extraction order
    // Both cycles published through the sink.
    assert_eq!(sink.published.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failing_source_is_isolated_and_counted() {
    let tmp = tempfile::tempdir().unwrap();
    let bad = "https://down.example/rss.xml";
    let good = "https://up.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    // Transport errors on every retry.
    fetcher.script(
        bad,
        vec![
            Script::Fail(FetchError::Transport("timeout".into())),
            Script::Fail(FetchError::Transport("timeout".into())),
            Script::Fail(FetchError::Transport("timeout".into())),
        ],
    );
    fetcher.script(good, vec![Script::Body(rss(&[("a", "Fine")]))]);

    let cfg = test_cfg(vec![feed_source("bad", bad), feed_source("good", good)], tmp.path());
    let state_path = cfg.state_path.clone();
    let m = monitor(cfg, fetcher.clone(), Arc::new(MemorySink::new()));

    let report = m.run_cycle().await.unwrap();
    assert!(report.events.is_empty()); // good source is on its baseline poll
    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(fetcher.calls_for(bad), 3); // max_retries

    let states = StateStore::new(state_path).load().unwrap();
    assert_eq!(states.get("bad").unwrap().consecutive_errors, 1);
    assert_eq!(states.get("good").unwrap().consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_twice_then_success_resets_origin() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://throttled.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(
        url,
        vec![
            Script::Fail(FetchError::RateLimited { status: 429 }),
            Script::Fail(FetchError::RateLimited { status: 429 }),
            Script::Body(rss(&[("a", "Finally")])),
        ],
    );

    let m = monitor(
        test_cfg(vec![feed_source("throttled", url)], tmp.path()),
        fetcher.clone(),
        Arc::new(MemorySink::new()),
    );

    let report = m.run_cycle().await.unwrap();
    assert_eq!(fetcher.calls_for(url), 3);
    assert_eq!(report.outcome_for("throttled"), Some(SourceOutcome::Succeeded { events: 0 }));
    // The trailing success reset the origin's consecutive-error count.
    assert_eq!(m.limiter().consecutive_errors("throttled.example").await, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_origin_is_skipped_until_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://dead.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    // Cycle 1: 3 transport failures -> origin error count reaches 3.
    fetcher.script(
        url,
        vec![
            Script::Fail(FetchError::Transport("refused".into())),
            Script::Fail(FetchError::Transport("refused".into())),
            Script::Fail(FetchError::Transport("refused".into())),
        ],
    );

    let mut cfg = test_cfg(vec![feed_source("dead", url)], tmp.path());
    cfg.rate.max_consecutive_errors = 3;
    let m = monitor(cfg, fetcher.clone(), Arc::new(MemorySink::new()));

    let first = m.run_cycle().await.unwrap();
    assert_eq!(first.outcome_for("dead"), Some(SourceOutcome::Failed));
    assert_eq!(fetcher.calls_for(url), 3);

    // Cycle 2: origin exhausted, not even attempted.
    let second = m.run_cycle().await.unwrap();
    assert_eq!(second.outcome_for("dead"), Some(SourceOutcome::Skipped));
    assert_eq!(fetcher.calls_for(url), 3);
}

#[tokio::test(start_paused = true)]
async fn page_source_emits_on_significant_change_and_ignores_noise() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://status.example/";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(
        url,
        vec![
            Script::Body("<html><body>All systems operational. Updated 2024-07-01T10:00:00Z</body></html>".into()),
            Script::Body("<html><body>Major outage: API requests are failing worldwide. Updated 2024-07-01T10:05:00Z</body></html>".into()),
            Script::Body("<html><body>Major outage: API requests are failing worldwide. Updated 2024-07-01T10:10:00Z</body></html>".into()),
        ],
    );

    let sink = Arc::new(MemorySink::new());
    let m = monitor(
        test_cfg(vec![page_source("status", url)], tmp.path()),
        fetcher,
        sink,
    );

    // Baseline.
    let c1 = m.run_cycle().await.unwrap();
    assert!(c1.events.is_empty());

    // Real change.
    let c2 = m.run_cycle().await.unwrap();
    assert_eq!(c2.events.len(), 1);
    let ev = &c2.events[0];
    assert!(ev.change_ratio.unwrap() > 0.1);
    assert!(ev.payload.summary.as_deref().unwrap().contains("outage"));

    // Only the timestamp moved: noise, no event.
    let c3 = m.run_cycle().await.unwrap();
    assert!(c3.events.is_empty());
    assert_eq!(c3.outcome_for("status"), Some(SourceOutcome::Succeeded { events: 0 }));
}

#[tokio::test(start_paused = true)]
async fn deadline_aborts_stragglers_but_keeps_completed_results() {
    let tmp = tempfile::tempdir().unwrap();
    let slow = "https://slow.example/rss.xml";
    let fast = "https://fast.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(slow, vec![Script::Hang]);
    fetcher.script(fast, vec![Script::Body(rss(&[("a", "Quick")]))]);

    let cfg = test_cfg(vec![feed_source("slow", slow), feed_source("fast", fast)], tmp.path());
    let state_path = cfg.state_path.clone();
    let m = monitor(cfg, fetcher, Arc::new(MemorySink::new()));

    let report = m
        .run_cycle_with_deadline(Some(std::time::Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(report.outcome_for("fast"), Some(SourceOutcome::Succeeded { events: 0 }));
    assert_eq!(report.outcome_for("slow"), Some(SourceOutcome::Skipped));

    // The completed source's state was still persisted.
    let states = StateStore::new(state_path).load().unwrap();
    assert!(states.contains_key("fast"));
    assert!(!states.contains_key("slow"));
}

#[tokio::test(start_paused = true)]
async fn sink_failure_aborts_cycle_before_state_persist() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://feed.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.script(
        url,
        vec![
            Script::Body(rss(&[("a", "First")])),
            Script::Body(rss(&[("a", "First"), ("b", "Second")])),
        ],
    );

    let cfg = test_cfg(vec![feed_source("fed", url)], tmp.path());
    let state_path = cfg.state_path.clone();
    let m = MonitorOrchestrator::new(
        cfg.clone(),
        fetcher.clone(),
        Arc::new(RssExtractor),
        Arc::new(FailingSink),
    )
    .unwrap();

    // Baseline publishes an empty batch; a failing sink still errors the cycle.
    let err = m.run_cycle().await;
    assert!(err.is_err());
    // State was not persisted, so nothing is lost for the next run.
    let states = StateStore::new(state_path).load().unwrap();
    assert!(states.is_empty());
}

#[tokio::test(start_paused = true)]
async fn seen_ids_are_capped_oldest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let url = "https://feed.example/rss.xml";
    let fetcher = Arc::new(MockFetcher::new());
    let many: Vec<(String, String)> = (0..6).map(|i| (format!("id-{i}"), format!("Item {i}"))).collect();
    let many_ref: Vec<(&str, &str)> = many.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    fetcher.script(url, vec![Script::Body(rss(&many_ref))]);

    let mut cfg = test_cfg(vec![feed_source("fed", url)], tmp.path());
    cfg.seen_ids_cap = 4;
    let state_path = cfg.state_path.clone();
    let m = monitor(cfg, fetcher, Arc::new(MemorySink::new()));

    m.run_cycle().await.unwrap();
    let states = StateStore::new(state_path).load().unwrap();
    let st = states.get("fed").unwrap();
    assert_eq!(st.seen_ids.len(), 4);
    assert!(!st.seen_ids.contains(&"id-0".to_string()));
    assert!(st.seen_ids.contains(&"id-5".to_string()));
}
