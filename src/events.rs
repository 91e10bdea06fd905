//! Append-only structured event records.
//!
//! Rows are partitioned by calendar date with the RFC3339 timestamp and the
//! event type forming the row key. Writes are best-effort: an event that
//! cannot be stored is worth a WARN line, never a failed session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::cloud::types::TableRow;
use crate::cloud::TableApi;
use crate::error::{Error, Result};

pub const EVENTS_TABLE: &str = "SessionEvents";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServerStart,
    SessionStart,
    Lease,
    Release,
    Failure,
    ScaleUp,
    ScaleDown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ServerStart => "server_start",
            EventType::SessionStart => "session_start",
            EventType::Lease => "lease",
            EventType::Release => "release",
            EventType::Failure => "failure",
            EventType::ScaleUp => "scale_up",
            EventType::ScaleDown => "scale_down",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub session_id: Option<String>,
    pub box_id: Option<String>,
    pub user_key: Option<String>,
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            session_id: None,
            box_id: None,
            user_key: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn boxed(mut self, box_id: &str) -> Self {
        self.box_id = Some(box_id.to_string());
        self
    }

    pub fn user(mut self, user_key: &str) -> Self {
        self.user_key = Some(user_key.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Clone)]
pub struct EventLogger {
    table: Arc<dyn TableApi>,
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger").finish()
    }
}

impl EventLogger {
    /// A missing table client is a configuration error, surfaced here once
    /// rather than on every write.
    pub fn new(table: Option<Arc<dyn TableApi>>) -> Result<Self> {
        match table {
            Some(table) => Ok(Self { table }),
            None => Err(Error::Unavailable("event log table client not configured".into())),
        }
    }

    /// Appends one event. Duplicate rows (possible on retry) and storage
    /// failures are tolerated.
    pub async fn write(&self, event: Event) {
        let row = TableRow {
            partition_key: event.timestamp.format("%Y-%m-%d").to_string(),
            row_key: format!(
                "{}_{}",
                event.timestamp.to_rfc3339(),
                event.event_type.as_str()
            ),
            body: serde_json::json!({
                "type": event.event_type.as_str(),
                "sessionId": event.session_id,
                "boxId": event.box_id,
                "userKey": event.user_key,
                "details": event.details,
            }),
        };
        match self.table.insert_row(EVENTS_TABLE, row).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                debug!("events: duplicate {} row dropped", event.event_type.as_str());
            }
            Err(err) => {
                warn!("events: failed to write {}: {}", event.event_type.as_str(), err);
            }
        }
    }
}
