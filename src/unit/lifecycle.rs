//! Lifecycle telemetry
//!
//! Start/stop/error events for a unit are written to a durable event sink,
//! keyed by role, unit id, and timestamp. Publication is best-effort: sink
//! failures are logged and swallowed, and a deployment without a sink is a
//! no-op. Events are append-only and never read back by the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::role::Role;

/// Errors from the durable event sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write-only durable event sink
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SinkError>;
}

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEventKind {
    Started,
    Stopped,
    Error,
}

/// One lifecycle event as written to the sink
#[derive(Debug, Serialize)]
struct LifecycleEvent<'a> {
    event: LifecycleEventKind,
    role: &'a str,
    unit_id: Uuid,
    payload: serde_json::Value,
    timestamp: i64,
}

/// Best-effort lifecycle event publisher for one unit
pub struct LifecycleNotifier {
    sink: Option<Arc<dyn EventSink>>,
    role: Role,
    unit_id: Uuid,
}

impl LifecycleNotifier {
    pub fn new(sink: Option<Arc<dyn EventSink>>, role: Role, unit_id: Uuid) -> Self {
        Self {
            sink,
            role,
            unit_id,
        }
    }

    /// Publish an event; never fails and never blocks serving on sink errors
    pub async fn publish(&self, kind: LifecycleEventKind, payload: serde_json::Value) {
        let Some(sink) = &self.sink else {
            return;
        };

        let now_ms = Utc::now().timestamp_millis();
        let key = format!("units:{}:{}:{}", self.role, self.unit_id, now_ms);
        let event = LifecycleEvent {
            event: kind,
            role: self.role.as_str(),
            unit_id: self.unit_id,
            payload,
            timestamp: now_ms,
        };

        let serialized = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(role = %self.role, unit = %self.unit_id, error = %e, "failed to serialize lifecycle event");
                return;
            }
        };

        if let Err(e) = sink.put(&key, &serialized).await {
            warn!(role = %self.role, unit = %self.unit_id, error = %e, "failed to write lifecycle event");
        }
    }
}

/// File-backed event sink: one file per key under a directory
pub struct FileEventSink {
    dir: PathBuf,
}

impl FileEventSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.json", key.replace(':', "_")));
        tokio::fs::write(path, value).await?;
        Ok(())
    }
}
