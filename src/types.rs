// src/types.rs
use serde::{Deserialize, Serialize};

/// Transport used to fetch a source. Closed set: adding a new kind means
/// extending this enum and the dispatch in the fetcher, not runtime probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// Plain HTTP GET.
    Plain,
    /// Browser-rendered fetch (JS-heavy pages). Dispatched through the same
    /// `Fetcher` seam; the default HTTP fetcher degrades to a plain GET.
    Rendered,
}

impl Default for FetchKind {
    fn default() -> Self {
        FetchKind::Plain
    }
}

/// Change-detection strategy for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Discrete entries (RSS/Atom): new item identifiers become events.
    Feed,
    /// Unstructured page: semantic diff against the stored snapshot.
    Page,
}

/// One configured pollable resource. Immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub kind: FetchKind,
    pub mode: SourceMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub category: String,
    /// Higher-priority sources are dispatched first within a cycle.
    #[serde(default)]
    pub priority: i32,
}

fn default_poll_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
}

/// One newly observed or changed item. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub source_id: String,
    pub category: String,
    pub ts_unix: u64,
    pub payload: EventPayload,
    /// Present for page sources: the semantic-diff change ratio in [0, 1].
    pub change_ratio: Option<f64>,
}

/// Per-source result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Fetched and compared; `events` may be zero.
    Succeeded { events: usize },
    /// Retries exhausted or extraction failed; error counter bumped.
    Failed,
    /// Not attempted: origin exhausted, not yet due, or cycle deadline hit.
    Skipped,
}

/// What one full polling cycle produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub events: Vec<Event>,
    /// `(source id, outcome)` for every configured source.
    pub outcomes: Vec<(String, SourceOutcome)>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SourceOutcome::Succeeded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SourceOutcome::Failed))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SourceOutcome::Skipped))
            .count()
    }

    pub fn outcome_for(&self, source_id: &str) -> Option<SourceOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == source_id)
            .map(|(_, o)| *o)
    }
}
