//! Queue backend trait.

use async_trait::async_trait;
use std::time::Duration;

use crate::job::{EnqueueOptions, JobEntry, JobId, JobKind, JobStatus, QueueCounts};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A durable work queue with priority lanes.
///
/// Producers return as soon as the job is durably enqueued; consumers pull
/// as fast as they persist. Completed jobs are removed, dead-lettered jobs
/// are retained for inspection.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job payload. Returns once the job is durable.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Pull the next ready job, marking it running.
    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError>;

    /// Ack/nack a job. `delay` schedules the retry when `status` is
    /// [`JobStatus::Failed`].
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
        delay: Option<Duration>,
    ) -> Result<(), QueueError>;

    /// Fetch a job (pending, running, or dead-lettered).
    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Observability counters.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
