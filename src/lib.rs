// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod diff;
pub mod extract;
pub mod fetch;
pub mod monitor;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod state;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::config::MonitorConfig;
pub use crate::diff::{DiffResult, SemanticDiff};
pub use crate::monitor::MonitorOrchestrator;
pub use crate::rate_limit::RateLimiter;
pub use crate::retry::RetryExecutor;
pub use crate::types::{CycleReport, Event, FetchKind, SourceConfig, SourceMode, SourceOutcome};
