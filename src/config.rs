// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::SourceConfig;

const ENV_PATH: &str = "DRIFTWATCH_CONFIG";

/// Rate-limiter tunables, applied per origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateConfig {
    /// Baseline minimum interval between requests to one origin, seconds.
    pub default_delay_secs: f64,
    /// Backoff ceiling, seconds.
    pub max_delay_secs: f64,
    /// Consecutive failures before an origin's sources are skipped.
    pub max_consecutive_errors: u32,
    /// Symmetric jitter fraction applied to waits (0.2 = plus/minus 20%).
    pub jitter: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            default_delay_secs: 1.0,
            max_delay_secs: 300.0,
            max_consecutive_errors: 5,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per fetch, including the first.
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffConfig {
    /// Fraction of content that must differ after noise removal.
    pub significance_threshold: f64,
    /// Custom noise regexes layered on top of the built-in defaults.
    #[serde(default)]
    pub noise_patterns: Vec<String>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            significance_threshold: 0.1,
            noise_patterns: Vec::new(),
        }
    }
}

/// Full monitor configuration: source list plus global tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Seen-item identifiers kept per source; oldest evicted first.
    #[serde(default = "default_seen_ids_cap")]
    pub seen_ids_cap: usize,
    #[serde(default)]
    pub rotate_user_agent: bool,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_seen_ids_cap() -> usize {
    500
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/driftwatch.json")
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<MonitorConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading monitor config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())
}

/// Load config using env var + fallbacks:
/// 1) $DRIFTWATCH_CONFIG
/// 2) config/driftwatch.toml
/// 3) config/driftwatch.json
///
/// A missing config is fatal: without sources there is nothing to monitor.
pub fn load_default() -> Result<MonitorConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        } else {
            return Err(anyhow!("DRIFTWATCH_CONFIG points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/driftwatch.toml");
    if toml_p.exists() {
        return load_from(&toml_p);
    }
    let json_p = PathBuf::from("config/driftwatch.json");
    if json_p.exists() {
        return load_from(&json_p);
    }
    Err(anyhow!(
        "no monitor config found (set DRIFTWATCH_CONFIG or create config/driftwatch.toml)"
    ))
}

fn parse_config(s: &str, hint_ext: &str) -> Result<MonitorConfig> {
    let cfg: MonitorConfig = if hint_ext == "json" {
        serde_json::from_str(s).context("parsing JSON monitor config")?
    } else {
        toml::from_str(s).context("parsing TOML monitor config")?
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &MonitorConfig) -> Result<()> {
    if cfg.sources.is_empty() {
        return Err(anyhow!("monitor config has no sources"));
    }
    let mut seen = std::collections::BTreeSet::new();
    for s in &cfg.sources {
        if s.id.trim().is_empty() {
            return Err(anyhow!("source with empty id (url {})", s.url));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(anyhow!("duplicate source id {}", s.id));
        }
    }
    if cfg.rate.default_delay_secs <= 0.0 || cfg.rate.max_delay_secs < cfg.rate.default_delay_secs {
        return Err(anyhow!("rate delays must satisfy 0 < default <= max"));
    }
    if !(0.0..1.0).contains(&cfg.rate.jitter) {
        return Err(anyhow!("jitter must be in [0, 1)"));
    }
    if cfg.retry.max_retries == 0 {
        return Err(anyhow!("retry.max_retries must be at least 1"));
    }
    if cfg.max_in_flight == 0 {
        return Err(anyhow!("max_in_flight must be at least 1"));
    }
    Ok(())
}
