// ABOUTME: Exchange history events and the sinks that receive them
// ABOUTME: One event per record outcome plus informational and terminal events, in processing order

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Classification of an exchange step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    /// Informational steps and the terminal completed/interrupted events.
    Unknown,
    Insert,
    Update,
    /// The run failed and was aborted.
    UnknownError,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExchangeStatus::Unknown => "Unknown",
            ExchangeStatus::Insert => "Insert",
            ExchangeStatus::Update => "Update",
            ExchangeStatus::UnknownError => "UnknownError",
        };
        f.write_str(label)
    }
}

/// Immutable record of one exchange step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    /// Exchange entity the step belongs to; `None` for run-level events.
    pub entity: Option<String>,
    /// Destination record the step touched, for per-record events.
    pub entity_uid: Option<Uuid>,
    pub status: ExchangeStatus,
    pub comment: String,
    pub error_text: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Set on the single terminal event of a run.
    pub is_finish: bool,
}

impl ExchangeEvent {
    pub fn new(entity: Option<&str>, status: ExchangeStatus, comment: impl Into<String>) -> Self {
        Self {
            entity: entity.map(str::to_string),
            entity_uid: None,
            status,
            comment: comment.into(),
            error_text: None,
            recorded_at: Utc::now(),
            is_finish: false,
        }
    }

    pub fn with_uid(mut self, uid: Uuid) -> Self {
        self.entity_uid = Some(uid);
        self
    }

    pub fn with_error(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }

    pub fn finish(mut self) -> Self {
        self.is_finish = true;
        self
    }

    /// True when the event reports a rejected record or a failed run.
    pub fn is_error(&self) -> bool {
        self.error_text.is_some() || self.status == ExchangeStatus::UnknownError
    }
}

impl fmt::Display for ExchangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            self.entity.as_deref().unwrap_or("exchange"),
            self.status,
            self.comment
        )?;
        if let Some(uid) = self.entity_uid {
            write!(f, " (uid {})", uid)?;
        }
        if let Some(error) = &self.error_text {
            write!(f, " - {}", error)?;
        }
        if self.is_finish {
            write!(f, " [finish]")?;
        }
        Ok(())
    }
}

/// Receives exchange events in the order they were raised.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ExchangeEvent);
}

impl EventSink for UnboundedSender<ExchangeEvent> {
    fn publish(&self, event: ExchangeEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Exchange event receiver dropped; event discarded");
        }
    }
}

/// Adapts a closure into a sink.
pub struct CallbackSink<F>(pub F);

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(ExchangeEvent) + Send + Sync,
{
    fn publish(&self, event: ExchangeEvent) {
        (self.0)(event)
    }
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ExchangeEvent) {
        if event.is_error() {
            tracing::warn!("{}", event);
        } else {
            tracing::info!("{}", event);
        }
    }
}

/// Prints every event to stdout as one JSON document per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn publish(&self, event: ExchangeEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Failed to serialize exchange event: {}", e),
        }
    }
}
