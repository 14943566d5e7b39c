//! # Noise-tolerant semantic diff
//! Decides whether two snapshots of the same resource differ in a way that
//! matters. Noise (timestamps, session ids, view counters) is replaced with
//! a placeholder before measuring, so cosmetic churn never trips the
//! threshold.
//!
//! Change ratio: `1 - strsim::normalized_levenshtein` over the normalized
//! forms, capped in length for large pages.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use strsim::normalized_levenshtein;

/// Token substituted for every noise match before comparison.
const PLACEHOLDER: &str = "\u{fffd}";

/// Levenshtein is quadratic; cap what we feed it for big pages.
const MAX_COMPARE_CHARS: usize = 20_000;

const SUMMARY_MAX_CHARS: usize = 240;

static BUILTIN_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // ISO-8601-ish timestamps: 2024-03-01T12:34:56Z, 2024-03-01 12:34
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
        // Session-id-like tokens near a session/token keyword
        r"(?i)\b(session|sess|sid|token|csrf)[-_=:]?\s*[A-Za-z0-9+/=-]{8,}",
        // Counters near engagement keywords: "1,234 views", "17 likes"
        r"(?i)\b\d[\d,.]*\s*(views?|likes?|comments?|shares?|visitors?|hits)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("builtin noise pattern"))
    .collect()
});

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("ws pattern"));

/// Verdict for one comparison. Ephemeral; consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub significant: bool,
    /// Fraction of normalized content that changed, in [0, 1].
    pub ratio: f64,
    /// Which regions changed, truncated, for logs.
    pub summary: String,
}

#[derive(Debug)]
pub struct SemanticDiff {
    threshold: f64,
    custom_noise: Vec<Regex>,
}

impl SemanticDiff {
    /// `threshold` is the change fraction above which a diff is significant.
    /// `custom_patterns` are layered on top of the built-in noise defaults.
    pub fn new(threshold: f64, custom_patterns: &[String]) -> Result<Self> {
        let custom_noise = custom_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compiling noise pattern {p:?}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            threshold: threshold.clamp(0.0, 1.0),
            custom_noise,
        })
    }

    /// Replace every noise match with the placeholder, collapse spacing.
    pub fn normalize(&self, s: &str) -> String {
        let mut out = s.to_string();
        for re in BUILTIN_NOISE.iter().chain(self.custom_noise.iter()) {
            out = re.replace_all(&out, PLACEHOLDER).into_owned();
        }
        let out = RE_WS.replace_all(&out, " ");
        out.trim().to_string()
    }

    /// Compare two snapshots. Identical inputs always come back with ratio 0
    /// and `significant = false`; exactly one empty input is ratio 1.
    pub fn is_significant_change(&self, old: &str, new: &str) -> DiffResult {
        let a = self.normalize(old);
        let b = self.normalize(new);

        if a == b {
            return DiffResult {
                significant: false,
                ratio: 0.0,
                summary: String::new(),
            };
        }
        if a.is_empty() || b.is_empty() {
            return DiffResult {
                significant: true,
                ratio: 1.0,
                summary: "content appeared or vanished entirely".to_string(),
            };
        }

        let a_cap = cap_chars(&a, MAX_COMPARE_CHARS);
        let b_cap = cap_chars(&b, MAX_COMPARE_CHARS);
        let ratio = (1.0 - normalized_levenshtein(a_cap, b_cap)).clamp(0.0, 1.0);

        DiffResult {
            significant: ratio > self.threshold,
            ratio,
            summary: changed_lines_summary(&a, &b),
        }
    }
}

fn cap_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Name the first normalized lines present in `new` but not in `old`.
fn changed_lines_summary(old: &str, new: &str) -> String {
    let old_lines: HashSet<&str> = old.lines().map(str::trim).collect();
    let mut summary = String::new();
    for line in new.lines().map(str::trim) {
        if line.is_empty() || old_lines.contains(line) {
            continue;
        }
        if !summary.is_empty() {
            summary.push_str(" | ");
        }
        summary.push_str(line);
        if summary.chars().count() >= SUMMARY_MAX_CHARS {
            break;
        }
    }
    if summary.is_empty() {
        summary = "content reordered or removed".to_string();
    } else if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = format!("{}...", cap_chars(&summary, SUMMARY_MAX_CHARS));
    }
    summary
}
