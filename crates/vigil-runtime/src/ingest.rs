//! Queue-backed ingestion: the producer-facing surface and the engine's
//! event sink.

use async_trait::async_trait;
use std::sync::Arc;

use vigil_core::{EventSink, SecurityEvent, Severity, SinkError};
use vigil_queue::{
    BatchLogPayload, CleanupPayload, EnqueueOptions, JobId, JobKind, LogEventPayload, QueueBackend,
    QueueError, VerifyIntegrityPayload,
};

/// Thin producer over the queue. Returns as soon as the job is durable.
#[derive(Clone)]
pub struct QueueIngestor {
    queue: Arc<dyn QueueBackend>,
    max_retries: u32,
}

impl QueueIngestor {
    pub fn new(queue: Arc<dyn QueueBackend>, max_retries: u32) -> Self {
        Self { queue, max_retries }
    }

    fn options_for(&self, event: &SecurityEvent) -> EnqueueOptions {
        let mut opts = if event.severity >= Severity::Critical {
            // Critical events take the LIFO priority-0 lane.
            EnqueueOptions::critical()
        } else {
            EnqueueOptions::default()
        };
        opts.max_retries = self.max_retries;
        opts
    }

    /// Enqueue one event; critical severity is routed to the fast lane
    /// automatically.
    pub async fn enqueue(&self, event: SecurityEvent) -> Result<JobId, QueueError> {
        let opts = self.options_for(&event);
        let payload = serde_json::to_value(LogEventPayload { event })?;
        self.queue.enqueue(JobKind::LogEvent, payload, opts).await
    }

    /// Enqueue at priority 0, LIFO, regardless of the event's severity.
    pub async fn enqueue_critical(&self, event: SecurityEvent) -> Result<JobId, QueueError> {
        let mut opts = EnqueueOptions::critical();
        opts.max_retries = self.max_retries;
        let payload = serde_json::to_value(LogEventPayload { event })?;
        self.queue.enqueue(JobKind::LogEvent, payload, opts).await
    }

    /// Enqueue a batch persisted in order by a single job.
    pub async fn enqueue_batch(&self, events: Vec<SecurityEvent>) -> Result<JobId, QueueError> {
        let mut opts = EnqueueOptions::default();
        opts.max_retries = self.max_retries;
        let payload = serde_json::to_value(BatchLogPayload { events })?;
        self.queue.enqueue(JobKind::BatchLog, payload, opts).await
    }

    /// One-shot cleanup job (the scheduler enqueues these on its cron).
    pub async fn schedule_cleanup_once(&self, days_to_keep: u32) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(CleanupPayload { days_to_keep })?;
        self.queue
            .enqueue(JobKind::Cleanup, payload, EnqueueOptions::default())
            .await
    }

    /// Integrity check over an optional sequence range, elevated priority.
    pub async fn schedule_integrity_check(
        &self,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<JobId, QueueError> {
        let payload = serde_json::to_value(VerifyIntegrityPayload { start_seq, end_seq })?;
        self.queue
            .enqueue(JobKind::VerifyIntegrity, payload, EnqueueOptions::elevated())
            .await
    }
}

#[async_trait]
impl EventSink for QueueIngestor {
    async fn submit(&self, event: SecurityEvent) -> Result<uuid::Uuid, SinkError> {
        self.enqueue(event)
            .await
            .map_err(|e| SinkError::EnqueueFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::EventType;
    use vigil_queue::MemoryQueue;

    #[tokio::test]
    async fn critical_severity_takes_the_fast_lane() {
        let queue = Arc::new(MemoryQueue::new());
        let ingestor = QueueIngestor::new(queue.clone(), 3);

        let mut normal = SecurityEvent::new(EventType::LoginFailed);
        normal.severity = Severity::Medium;
        let normal_id = ingestor.enqueue(normal).await.unwrap();

        let mut critical = SecurityEvent::new(EventType::SuspiciousActivity);
        critical.severity = Severity::Critical;
        let critical_id = ingestor.enqueue(critical).await.unwrap();

        // The critical event overtakes despite being enqueued second.
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, critical_id);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, normal_id);
    }

    #[tokio::test]
    async fn integrity_checks_are_elevated() {
        let queue = Arc::new(MemoryQueue::new());
        let ingestor = QueueIngestor::new(queue.clone(), 3);

        ingestor.enqueue(SecurityEvent::new(EventType::PageView)).await.unwrap();
        let verify_id = ingestor
            .schedule_integrity_check(Some(1), None)
            .await
            .unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, verify_id);
    }
}
