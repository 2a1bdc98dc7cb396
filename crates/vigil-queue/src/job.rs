//! Job definitions for the ingestion queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use vigil_core::SecurityEvent;

/// Job identifier.
pub type JobId = Uuid;

/// The four kinds of work the queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    LogEvent,
    BatchLog,
    Cleanup,
    VerifyIntegrity,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogEvent => "log_event",
            Self::BatchLog => "batch_log",
            Self::Cleanup => "cleanup",
            Self::VerifyIntegrity => "verify_integrity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "log_event" => Some(Self::LogEvent),
            "batch_log" => Some(Self::BatchLog),
            "cleanup" => Some(Self::Cleanup),
            "verify_integrity" => Some(Self::VerifyIntegrity),
            _ => None,
        }
    }
}

/// Payload of a [`JobKind::LogEvent`] job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEventPayload {
    pub event: SecurityEvent,
}

/// Payload of a [`JobKind::BatchLog`] job. Events are persisted in order to
/// preserve chain sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLogPayload {
    pub events: Vec<SecurityEvent>,
}

/// Payload of a [`JobKind::Cleanup`] job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub days_to_keep: u32,
}

/// Payload of a [`JobKind::VerifyIntegrity`] job. An absent bound means
/// "from genesis" / "to head".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyIntegrityPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_seq: Option<u64>,
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in queue.
    Pending,
    /// Currently being processed.
    Running,
    /// Successfully completed (completed jobs are removed from the backend).
    Completed,
    /// Failed, scheduled for retry (with attempt count).
    Failed(u32),
    /// Permanently failed after max retries; retained for inspection.
    DeadLetter,
}

/// Result of one handler invocation.
#[derive(Debug)]
pub enum JobOutcome {
    /// Job succeeded.
    Success,
    /// Job failed but should retry.
    Retry(String),
    /// Job failed permanently.
    Fatal(String),
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant { millis: u64 },
    Exponential { initial_millis: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_millis: 2_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the given retry attempt (0-based), with up to 10%
    /// jitter so retries from a burst don't land on the same tick.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = match self {
            Self::Constant { millis } => *millis,
            Self::Exponential {
                initial_millis,
                multiplier,
            } => (*initial_millis as f64 * multiplier.powi(attempt.min(16) as i32)) as u64,
        };
        let jitter = (base_ms / 10).max(1);
        Duration::from_millis(base_ms + rand::random_range(0..jitter))
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// 0 is the highest priority.
    pub priority: u8,
    /// Within the priority-0 lane, deliver newest-first.
    pub lifo: bool,
    /// Initial delivery delay.
    pub delay: Option<Duration>,
    /// Attempts before dead-lettering.
    pub max_retries: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            lifo: false,
            delay: None,
            max_retries: 3,
        }
    }
}

impl EnqueueOptions {
    /// Options for critical-severity events: priority 0, LIFO.
    pub fn critical() -> Self {
        Self {
            priority: 0,
            lifo: true,
            ..Self::default()
        }
    }

    /// Elevated priority used by integrity checks.
    pub fn elevated() -> Self {
        Self {
            priority: 1,
            ..Self::default()
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: u8,
    pub lifo: bool,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

/// Queue observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}
