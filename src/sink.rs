// src/sink.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::types::Event;

/// Where emitted events go. The monitor is agnostic to what happens
/// downstream; it only requires that a failed publish surfaces an error so
/// events are re-emitted next cycle instead of silently lost.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, events: &[Event]) -> Result<()>;
}

/// Appends one JSON object per event to a log file.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn publish(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating event log dir {}", dir.display()))?;
            }
        }
        let mut body = String::new();
        for ev in events {
            body.push_str(&serde_json::to_string(ev).context("serializing event")?);
            body.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, body.as_bytes())
            .await
            .with_context(|| format!("appending to event log {}", self.path.display()))?;
        Ok(())
    }
}

// --- Test helper ---
pub struct MemorySink {
    pub published: std::sync::Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            published: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, events: &[Event]) -> Result<()> {
        self.published.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}
