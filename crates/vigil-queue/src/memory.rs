//! In-memory queue with priority scheduling.
//!
//! Ordering inside the heap: lower priority number first; the priority-0
//! lane is LIFO for jobs enqueued with that flag, every other lane is FIFO
//! by ready-time. Chain integrity does not
//! depend on this ordering; sequence numbers are assigned at persist time.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{EnqueueOptions, JobEntry, JobId, JobKind, JobStatus, QueueCounts};

#[derive(Debug, Clone, Eq, PartialEq)]
struct SlotKey {
    priority: u8,
    lifo: bool,
    run_at: DateTime<Utc>,
    enqueue_seq: u64,
    id: Uuid,
}

impl Ord for SlotKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: greater = delivered first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| {
                if self.priority == 0 && self.lifo && other.lifo {
                    // LIFO lane: newest enqueue wins.
                    self.enqueue_seq.cmp(&other.enqueue_seq)
                } else {
                    // FIFO lanes: earliest ready-time wins, then enqueue order.
                    other
                        .run_at
                        .cmp(&self.run_at)
                        .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
                }
            })
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for SlotKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Non-durable queue backend for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    heap: RwLock<BinaryHeap<SlotKey>>,
    enqueue_seq: AtomicU64,
    completed: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let run_at = match opts.delay {
            Some(d) => now + ChronoDuration::milliseconds(d.as_millis() as i64),
            None => now,
        };

        let entry = JobEntry {
            id,
            kind,
            payload,
            status: JobStatus::Pending,
            priority: opts.priority,
            lifo: opts.lifo,
            created_at: now,
            run_at,
            attempts: 0,
            max_retries: opts.max_retries,
            last_error: None,
        };

        let mut heap = self.heap.write().await;
        self.jobs.write().await.insert(id, entry);
        heap.push(SlotKey {
            priority: opts.priority,
            lifo: opts.lifo,
            run_at,
            enqueue_seq: self.enqueue_seq.fetch_add(1, AtomicOrdering::SeqCst),
            id,
        });

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        let mut heap = self.heap.write().await;
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();

        // A delayed high-priority job must not starve ready lower-priority
        // work; skip over not-ready keys and reinsert them afterwards.
        let mut deferred: Vec<SlotKey> = Vec::new();
        let mut taken: Option<JobEntry> = None;

        while let Some(key) = heap.pop() {
            if key.run_at > now {
                deferred.push(key);
                continue;
            }
            match jobs.get_mut(&key.id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.status = JobStatus::Running;
                    taken = Some(job.clone());
                    break;
                }
                // Stale key (completed, dead-lettered, or re-queued): drop it.
                _ => continue,
            }
        }

        for key in deferred {
            heap.push(key);
        }

        Ok(taken)
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        // Lock order must match dequeue: heap before jobs.
        let mut heap = self.heap.write().await;
        let mut jobs = self.jobs.write().await;

        match status {
            JobStatus::Completed => {
                // Completed jobs are removed; only the counter survives.
                if jobs.remove(&id).is_none() {
                    return Err(QueueError::NotFound);
                }
                self.completed.fetch_add(1, AtomicOrdering::SeqCst);
            }
            JobStatus::Failed(attempt) => {
                let job = jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
                let backoff = delay.unwrap_or(Duration::from_secs(2u64 << attempt.min(6)));
                let run_at = Utc::now() + ChronoDuration::milliseconds(backoff.as_millis() as i64);
                job.attempts = attempt;
                job.last_error = error;
                job.run_at = run_at;
                job.status = JobStatus::Pending;

                tracing::debug!(
                    job_id = %id,
                    attempt,
                    delay_ms = backoff.as_millis() as u64,
                    "Re-queuing job with backoff"
                );

                heap.push(SlotKey {
                    priority: job.priority,
                    lifo: false,
                    run_at,
                    enqueue_seq: self.enqueue_seq.fetch_add(1, AtomicOrdering::SeqCst),
                    id,
                });
            }
            other => {
                let job = jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
                job.status = other;
                job.last_error = error;
            }
        }

        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let jobs = self.jobs.read().await;
        let now = Utc::now();
        let mut counts = QueueCounts {
            completed: self.completed.load(AtomicOrdering::SeqCst),
            ..QueueCounts::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending if job.run_at > now => counts.delayed += 1,
                JobStatus::Pending => counts.waiting += 1,
                JobStatus::Running => counts.active += 1,
                JobStatus::DeadLetter | JobStatus::Failed(_) => counts.failed += 1,
                JobStatus::Completed => {}
            }
        }
        Ok(counts)
    }
}
