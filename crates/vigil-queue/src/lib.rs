//! # Vigil Queue
//!
//! Durable ingestion queue for the security log pipeline.
//!
//! Features:
//! - Four job kinds: log-event, batch-log, cleanup, integrity-verify
//! - Priority lanes with a LIFO lane for critical events
//! - Retry with exponential backoff; dead letters retained for inspection
//! - Worker pool with bounded concurrency and drain-on-shutdown

pub mod backend;
pub mod job;
pub mod memory;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use job::{
    BackoffStrategy, BatchLogPayload, CleanupPayload, EnqueueOptions, JobEntry, JobId, JobKind,
    JobOutcome, JobStatus, LogEventPayload, QueueCounts, VerifyIntegrityPayload,
};
pub use memory::MemoryQueue;
pub use worker::{JobHandler, WorkerConfig, WorkerPool, FALLBACK_TARGET};
