//! # Fetch transport seam
//! The orchestrator talks to remote sources through the [`Fetcher`] trait
//! only; [`HttpFetcher`] is the plain-GET implementation. A browser-backed
//! fetcher for `FetchKind::Rendered` plugs in behind the same trait.

use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use std::fmt;
use std::time::Duration;

use crate::types::FetchKind;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
];

/// Transport failure classes. Retry and backoff policy depends on the class:
/// 429 grows an origin's delay harder than a generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP 429 or an equivalent throttle signal.
    RateLimited { status: u16 },
    /// Any other non-2xx response.
    Status { status: u16 },
    /// Timeout, connection error, body read failure.
    Transport(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::RateLimited { status } | FetchError::Status { status } => Some(*status),
            FetchError::Transport(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::RateLimited { status } => write!(f, "rate limited (status {status})"),
            FetchError::Status { status } => write!(f, "unexpected status {status}"),
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Fetch raw content for a URL with the given transport kind.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, kind: FetchKind) -> Result<String, FetchError>;
}

/// Plain-HTTP fetcher on reqwest. `Rendered` sources degrade to a plain GET
/// with a warning; swap in a browser-backed [`Fetcher`] to render them.
pub struct HttpFetcher {
    client: reqwest::Client,
    rotate_user_agent: bool,
}

impl HttpFetcher {
    pub fn new(rotate_user_agent: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            rotate_user_agent,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, kind: FetchKind) -> Result<String, FetchError> {
        if kind == FetchKind::Rendered {
            tracing::warn!(url, "no rendered transport configured; falling back to plain GET");
        }

        let mut req = self.client.get(url);
        if self.rotate_user_agent {
            let ua = USER_AGENTS
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or(USER_AGENTS[0]);
            req = req.header(reqwest::header::USER_AGENT, ua);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(FetchError::RateLimited { status });
        }
        if !resp.status().is_success() {
            return Err(FetchError::Status { status });
        }

        resp.text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

/// Network host/authority portion of a URL: the unit of rate limiting.
/// Falls back to the whole input when there is nothing recognizable.
pub fn origin_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(rest)
        .trim();
    if authority.is_empty() {
        url.to_ascii_lowercase()
    } else {
        authority.to_ascii_lowercase()
    }
}
