use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::key::Identity;

/// Which non-routine decision produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Rejected,
    Degraded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Rejected => "rejected",
            EventKind::Degraded => "degraded",
        }
    }
}

/// One event per `Reject` and per `AllowDegraded` decision
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionEvent {
    pub identity: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub reason: String,
}

impl AdmissionEvent {
    pub fn new(
        identity: &Identity,
        timestamp: DateTime<Utc>,
        kind: EventKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.as_str().to_string(),
            timestamp,
            kind,
            reason: reason.into(),
        }
    }
}

/// Write-only observability sink
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &AdmissionEvent);
}

/// Sink that writes events to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &AdmissionEvent) {
        match event.kind {
            EventKind::Rejected => info!(
                identity = %event.identity,
                timestamp = %event.timestamp.to_rfc3339(),
                reason = %event.reason,
                "request rejected"
            ),
            EventKind::Degraded => warn!(
                identity = %event.identity,
                timestamp = %event.timestamp.to_rfc3339(),
                reason = %event.reason,
                "admitted without enforcement"
            ),
        }
    }
}

/// Forwards every event to each inner sink
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &AdmissionEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
