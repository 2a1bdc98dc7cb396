//! The log writer: the single logical consumer that turns queued events
//! into chained rows and feeds the rule engine.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use vigil_core::{EventType, LogEntry, NewLogEntry, RuleContext, SecurityEvent};
use vigil_engine::RuleEngine;
use vigil_persist::{LogStore, StoreError};
use vigil_queue::{BatchLogPayload, JobEntry, JobHandler, JobOutcome, LogEventPayload};

/// Serializes chain appends and drives post-persist rule evaluation.
///
/// Holding `append_lock` across the head read + insert keeps sequence
/// numbers gap-free even when the maintenance lanes share the store.
pub struct LogWriter {
    store: Arc<dyn LogStore>,
    engine: Arc<RuleEngine>,
    append_lock: Mutex<()>,
    recent_window_minutes: i64,
    recent_window_cap: u32,
}

impl LogWriter {
    pub fn new(
        store: Arc<dyn LogStore>,
        engine: Arc<RuleEngine>,
        recent_window_minutes: i64,
        recent_window_cap: u32,
    ) -> Self {
        Self {
            store,
            engine,
            append_lock: Mutex::new(()),
            recent_window_minutes,
            recent_window_cap,
        }
    }

    async fn persist(
        &self,
        event: &SecurityEvent,
        job: &JobEntry,
    ) -> Result<LogEntry, StoreError> {
        let mut fields = NewLogEntry::from(event.clone());
        fields.metadata.insert("jobId", job.id.to_string());
        fields.metadata.insert("attempt", (job.attempts + 1) as i64);
        fields
            .metadata
            .insert("queuedAt", job.created_at.to_rfc3339());
        fields
            .metadata
            .insert("processedAt", chrono::Utc::now().to_rfc3339());

        let _guard = self.append_lock.lock().await;
        self.store.append(fields).await
    }

    /// Persist one event and, unless it is itself a SUSPICIOUS_ACTIVITY
    /// record, run the rules over it with a bounded history window.
    pub async fn process_event(
        &self,
        event: SecurityEvent,
        job: &JobEntry,
    ) -> Result<LogEntry, StoreError> {
        let entry = self.persist(&event, job).await?;
        debug!(seq = entry.sequence_number, event_type = %entry.event_type, "Persisted log entry");

        if event.event_type != EventType::SuspiciousActivity {
            let recents = self
                .store
                .recent_window(
                    entry.created_at,
                    self.recent_window_minutes,
                    self.recent_window_cap,
                )
                .await?;
            let recent_events: Vec<SecurityEvent> = recents
                .iter()
                .filter(|e| e.sequence_number != entry.sequence_number)
                .map(LogEntry::to_event)
                .collect();

            self.engine
                .evaluate(RuleContext::new(event, recent_events))
                .await;
        }

        Ok(entry)
    }
}

/// Handler for LOG_EVENT jobs.
pub struct LogEventHandler {
    writer: Arc<LogWriter>,
}

impl LogEventHandler {
    pub fn new(writer: Arc<LogWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl JobHandler for LogEventHandler {
    async fn handle(&self, job: &JobEntry) -> JobOutcome {
        let payload: LogEventPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobOutcome::Fatal(format!("undecodable payload: {e}")),
        };
        match self.writer.process_event(payload.event, job).await {
            Ok(_) => JobOutcome::Success,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Log event processing failed");
                JobOutcome::Retry(e.to_string())
            }
        }
    }
}

/// Handler for BATCH_LOG jobs. Events are persisted strictly in order;
/// a mid-batch failure retries the whole job, which is why batch producers
/// must tolerate duplicates or keep batches idempotent.
pub struct BatchLogHandler {
    writer: Arc<LogWriter>,
}

impl BatchLogHandler {
    pub fn new(writer: Arc<LogWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl JobHandler for BatchLogHandler {
    async fn handle(&self, job: &JobEntry) -> JobOutcome {
        let payload: BatchLogPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobOutcome::Fatal(format!("undecodable payload: {e}")),
        };
        for event in payload.events {
            if let Err(e) = self.writer.process_event(event, job).await {
                error!(job_id = %job.id, error = %e, "Batch log processing failed");
                return JobOutcome::Retry(e.to_string());
            }
        }
        JobOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_core::{verify_chain, Severity};
    use vigil_engine::{EngineConfig, SecurityBus};
    use vigil_persist::MemLogStore;
    use vigil_queue::{JobKind, JobStatus};
    use uuid::Uuid;

    fn job(payload: serde_json::Value) -> JobEntry {
        JobEntry {
            id: Uuid::new_v4(),
            kind: JobKind::LogEvent,
            payload,
            status: JobStatus::Running,
            priority: 5,
            lifo: false,
            created_at: Utc::now(),
            run_at: Utc::now(),
            attempts: 0,
            max_retries: 3,
            last_error: None,
        }
    }

    fn writer(store: Arc<MemLogStore>) -> Arc<LogWriter> {
        let engine = Arc::new(RuleEngine::new(EngineConfig::default(), SecurityBus::new()));
        Arc::new(LogWriter::new(store, engine, 60, 500))
    }

    #[tokio::test]
    async fn events_are_enriched_and_chained() {
        let store = Arc::new(MemLogStore::new());
        let writer = writer(store.clone());

        let mut event = SecurityEvent::new(EventType::LoginFailed);
        event.user_id = Some("u".to_string());
        event.severity = Severity::Medium;

        let payload = serde_json::to_value(LogEventPayload { event }).unwrap();
        let handler = LogEventHandler::new(writer);
        assert!(matches!(handler.handle(&job(payload)).await, JobOutcome::Success));

        let entry = store.latest().await.unwrap().unwrap();
        assert_eq!(entry.sequence_number, 1);
        assert!(entry.metadata.get_str("jobId").is_some());
        assert!(entry.metadata.get_str("processedAt").is_some());
    }

    #[tokio::test]
    async fn batches_persist_in_order() {
        let store = Arc::new(MemLogStore::new());
        let writer = writer(store.clone());

        let events: Vec<SecurityEvent> = (0..5)
            .map(|i| {
                let mut e = SecurityEvent::new(EventType::PageView);
                e.user_id = Some(format!("u{i}"));
                e
            })
            .collect();
        let payload = serde_json::to_value(BatchLogPayload { events }).unwrap();

        let handler = BatchLogHandler::new(writer);
        assert!(matches!(handler.handle(&job(payload)).await, JobOutcome::Success));

        let chain = store.range(1, 10, 10).await.unwrap();
        assert_eq!(chain.len(), 5);
        assert!(verify_chain(&chain, None).ok);
        let users: Vec<_> = chain.iter().filter_map(|e| e.user_id.clone()).collect();
        assert_eq!(users, vec!["u0", "u1", "u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_fatal() {
        let store = Arc::new(MemLogStore::new());
        let handler = LogEventHandler::new(writer(store));
        let outcome = handler.handle(&job(serde_json::json!({"not": "an event"}))).await;
        assert!(matches!(outcome, JobOutcome::Fatal(_)));
    }
}
