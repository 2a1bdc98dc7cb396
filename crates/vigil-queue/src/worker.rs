//! Worker pool: long-lived consumers that loop dequeue → handle → ack.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use crate::backend::QueueBackend;
use crate::job::{BackoffStrategy, JobEntry, JobKind, JobOutcome, JobStatus};

/// Target for terminal-failure logs; operators route this to the fallback
/// sink so exhausted jobs are never silent.
pub const FALLBACK_TARGET: &str = "vigil::fallback";

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_interval: Duration::from_millis(100),
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Handles one kind of job. Handlers are shared across worker tasks.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobEntry) -> JobOutcome;
}

/// Pool of consumers over one queue backend.
///
/// Kinds registered through [`WorkerPool::register_serial`] are processed
/// by a dedicated single consumer in dequeue order, the single-partition
/// guarantee the chain append requires. Everything else fans out under the
/// concurrency cap.
pub struct WorkerPool {
    backend: Arc<dyn QueueBackend>,
    config: WorkerConfig,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    serial_kinds: HashSet<JobKind>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Buffered jobs per serial lane before dequeue backpressure kicks in.
const SERIAL_LANE_DEPTH: usize = 32;

impl WorkerPool {
    pub fn new(backend: Arc<dyn QueueBackend>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            config,
            handlers: HashMap::new(),
            serial_kinds: HashSet::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Register the handler for a job kind. Last registration wins.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Register a handler whose jobs must be processed strictly one at a
    /// time, in dequeue order.
    pub fn register_serial(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
        self.serial_kinds.insert(kind);
    }

    /// Signal handle for shutting the pool down from elsewhere.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is signalled, then drain active jobs: the
    /// serial lanes finish their buffered work and the fan-out permits all
    /// come home before this returns.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut shutdown = self.shutdown_rx.clone();

        let mut serial_lanes: HashMap<JobKind, mpsc::Sender<JobEntry>> = HashMap::new();
        let mut lane_tasks = Vec::new();
        for kind in &self.serial_kinds {
            let (tx, mut rx) = mpsc::channel::<JobEntry>(SERIAL_LANE_DEPTH);
            serial_lanes.insert(*kind, tx);
            let pool = self.clone();
            lane_tasks.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    pool.process(job).await;
                }
            }));
        }

        info!(
            concurrency = self.config.max_concurrency,
            serial_lanes = serial_lanes.len(),
            "Worker pool started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if semaphore.available_permits() == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self.backend.dequeue().await {
                Ok(Some(job)) => {
                    if let Some(lane) = serial_lanes.get(&job.kind) {
                        if lane.send(job).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue dequeue error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // Drain: close the serial lanes and let them empty, then wait for
        // every fan-out permit to come back.
        drop(serial_lanes);
        for task in lane_tasks {
            let _ = task.await;
        }
        let _ = semaphore
            .acquire_many(self.config.max_concurrency as u32)
            .await;
        info!("Worker pool drained and stopped");
    }

    async fn process(&self, job: JobEntry) {
        let Some(handler) = self.handlers.get(&job.kind) else {
            warn!(kind = job.kind.as_str(), job_id = %job.id, "No handler registered");
            let _ = self
                .backend
                .update_status(
                    job.id,
                    JobStatus::DeadLetter,
                    Some(format!("No handler for {}", job.kind.as_str())),
                    None,
                )
                .await;
            return;
        };

        let outcome = handler.handle(&job).await;
        match outcome {
            JobOutcome::Success => {
                let _ = self
                    .backend
                    .update_status(job.id, JobStatus::Completed, None, None)
                    .await;
            }
            JobOutcome::Retry(e) if job.attempts + 1 < job.max_retries => {
                let attempt = job.attempts + 1;
                let delay = self.config.backoff.delay(job.attempts);
                info!(
                    job_id = %job.id,
                    kind = job.kind.as_str(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, scheduling retry with backoff"
                );
                let _ = self
                    .backend
                    .update_status(job.id, JobStatus::Failed(attempt), Some(e), Some(delay))
                    .await;
            }
            JobOutcome::Retry(e) | JobOutcome::Fatal(e) => {
                // Terminal failure: preserve the job and raise the alarm on
                // the fallback sink.
                error!(
                    target: FALLBACK_TARGET,
                    job_id = %job.id,
                    kind = job.kind.as_str(),
                    attempts = job.attempts + 1,
                    error = %e,
                    "Job exhausted retries, dead-lettered"
                );
                let _ = self
                    .backend
                    .update_status(job.id, JobStatus::DeadLetter, Some(e), None)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EnqueueOptions;
    use crate::memory::MemoryQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait::async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &JobEntry) -> JobOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                JobOutcome::Success
            } else {
                JobOutcome::Retry(format!("transient failure {call}"))
            }
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            max_concurrency: 2,
            poll_interval: Duration::from_millis(5),
            backoff: BackoffStrategy::Constant { millis: 10 },
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let backend = Arc::new(MemoryQueue::new());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        });

        let mut pool = WorkerPool::new(backend.clone(), fast_config());
        pool.register(JobKind::LogEvent, handler.clone());
        let pool = Arc::new(pool);
        let stop = pool.shutdown_handle();
        let running = tokio::spawn(pool.run());

        backend
            .enqueue(JobKind::LogEvent, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = stop.send(true);
        running.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_job() {
        let backend = Arc::new(MemoryQueue::new());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });

        let mut pool = WorkerPool::new(backend.clone(), fast_config());
        pool.register(JobKind::LogEvent, handler.clone());
        let pool = Arc::new(pool);
        let stop = pool.shutdown_handle();
        let running = tokio::spawn(pool.run());

        let id = backend
            .enqueue(JobKind::LogEvent, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = stop.send(true);
        running.await.unwrap();

        // 3 attempts total, then retained as a dead letter.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let job = backend.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
    }

    struct OrderRecorder {
        seen: tokio::sync::Mutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl JobHandler for OrderRecorder {
        async fn handle(&self, job: &JobEntry) -> JobOutcome {
            // Jitter would let later jobs overtake if processing were not
            // serialized.
            let n = job.payload["n"].as_u64().unwrap();
            tokio::time::sleep(Duration::from_millis((n % 3) * 7)).await;
            self.seen.lock().await.push(n);
            JobOutcome::Success
        }
    }

    #[tokio::test]
    async fn serial_lane_preserves_dequeue_order() {
        let backend = Arc::new(MemoryQueue::new());
        let recorder = Arc::new(OrderRecorder {
            seen: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut pool = WorkerPool::new(
            backend.clone(),
            WorkerConfig {
                max_concurrency: 4,
                ..fast_config()
            },
        );
        pool.register_serial(JobKind::LogEvent, recorder.clone());
        let pool = Arc::new(pool);
        let stop = pool.shutdown_handle();
        let running = tokio::spawn(pool.run());

        for n in 0..10u64 {
            backend
                .enqueue(JobKind::LogEvent, json!({ "n": n }), EnqueueOptions::default())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = stop.send(true);
        running.await.unwrap();

        let seen = recorder.seen.lock().await;
        assert_eq!(*seen, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn unhandled_kind_is_dead_lettered() {
        let backend = Arc::new(MemoryQueue::new());
        let pool = Arc::new(WorkerPool::new(backend.clone(), fast_config()));
        let stop = pool.shutdown_handle();
        let running = tokio::spawn(pool.run());

        let id = backend
            .enqueue(JobKind::Cleanup, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stop.send(true);
        running.await.unwrap();

        let job = backend.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
    }
}
