//! Persisted, hash-chained log rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventType, Metadata, SecurityEvent, Severity};

/// An entry as handed to the store, before sequencing and hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub event_type: EventType,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Metadata,
    pub message: Option<String>,
}

impl From<SecurityEvent> for NewLogEntry {
    fn from(ev: SecurityEvent) -> Self {
        Self {
            event_type: ev.event_type,
            severity: ev.severity,
            user_id: ev.user_id,
            email: ev.email,
            ip_address: ev.ip_address,
            user_agent: ev.user_agent,
            session_id: ev.session_id,
            metadata: ev.metadata,
            message: None,
        }
    }
}

/// A persisted log row.
///
/// Rows are append-only: `sequence_number` is gap-free starting at 1,
/// `previous_hash` is `None` only for the first row, and `current_hash`
/// covers every stored field (see [`crate::hash::chain_hash`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub sequence_number: u64,
    pub event_type: EventType,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Metadata,
    pub message: Option<String>,
    pub previous_hash: Option<String>,
    pub current_hash: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    /// Reconstruct the event view of this row (used to seed rule contexts).
    pub fn to_event(&self) -> SecurityEvent {
        SecurityEvent {
            event_type: self.event_type.clone(),
            timestamp: self.created_at,
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            session_id: self.session_id.clone(),
            metadata: self.metadata.clone(),
            severity: self.severity,
        }
    }
}
