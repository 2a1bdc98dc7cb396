//! The service facade: one object wiring queue, writer, engine, stores and
//! schedules, exposing the ingestion, query and rule-admin APIs.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use vigil_core::{ConditionType, LogEntry, RuleRecord, RuleStatus, SecurityEvent, Severity};
use vigil_engine::{
    EngineConfig, EngineError, EngineMetrics, RuleEngine, RuleRepository, SecurityBus,
};
use vigil_persist::{LogFilter, LogStore, RuleStore, RuleUpdate, StoreError};
use vigil_queue::{
    JobId, JobKind, QueueBackend, QueueCounts, QueueError, WorkerConfig, WorkerPool,
};

use crate::archive::LogArchiver;
use crate::cleanup::CleanupHandler;
use crate::config::Config;
use crate::ingest::QueueIngestor;
use crate::integrity::{ChainStatus, IntegrityReport, IntegrityVerifier, VerifyIntegrityHandler};
use crate::scheduler::{spawn_cleanup_cron, spawn_hot_reload, ScheduleError};
use crate::writer::{BatchLogHandler, LogEventHandler, LogWriter};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Aggregate statistics for reporting surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_event_type: BTreeMap<String, u64>,
    pub queue: QueueCounts,
    pub engine_metrics: EngineMetrics,
}

/// Input for creating a rule. New rules start in TESTING at 1.0.0.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRule {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub condition_type: ConditionType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The assembled pipeline.
pub struct SecurityLogService {
    config: Config,
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn LogStore>,
    rules: Arc<dyn RuleStore>,
    engine: Arc<RuleEngine>,
    repository: Arc<RuleRepository>,
    ingestor: QueueIngestor,
    verifier: IntegrityVerifier,
    chain_status: Arc<ChainStatus>,
    shutdown: watch::Sender<bool>,
    periodic_stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityLogService {
    /// Wire and start the pipeline: load rules, start the worker pool
    /// (serial log lane + concurrent maintenance), arm the cleanup cron
    /// and the hot-reload loop.
    pub async fn start(
        config: Config,
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn LogStore>,
        rules: Arc<dyn RuleStore>,
    ) -> Result<Arc<Self>, ServiceError> {
        let bus = SecurityBus::new();
        let engine = Arc::new(RuleEngine::new(
            EngineConfig {
                rule_timeout: config.rule_timeout(),
            },
            bus,
        ));

        let ingestor = QueueIngestor::new(queue.clone(), config.max_retries);
        engine.set_sink(Arc::new(ingestor.clone())).await;

        let repository = Arc::new(RuleRepository::new(rules.clone(), engine.clone()));
        let loaded = repository.sync().await?;
        info!(rules = loaded, "Rule registry loaded");

        let chain_status = Arc::new(ChainStatus::new());
        let writer = Arc::new(LogWriter::new(
            store.clone(),
            engine.clone(),
            config.recent_window_minutes,
            config.recent_window_cap,
        ));
        let archiver = Arc::new(LogArchiver::new(store.clone(), config.archive_dir.clone()));
        let verifier = IntegrityVerifier::new(store.clone(), config.batch_size);

        let mut pool = WorkerPool::new(
            queue.clone(),
            WorkerConfig {
                max_concurrency: config.worker_concurrency,
                poll_interval: std::time::Duration::from_millis(50),
                backoff: vigil_queue::BackoffStrategy::Exponential {
                    initial_millis: config.backoff_delay_ms,
                    multiplier: 2.0,
                },
            },
        );
        pool.register_serial(JobKind::LogEvent, Arc::new(LogEventHandler::new(writer.clone())));
        pool.register_serial(JobKind::BatchLog, Arc::new(BatchLogHandler::new(writer)));
        pool.register(
            JobKind::VerifyIntegrity,
            Arc::new(VerifyIntegrityHandler::new(
                IntegrityVerifier::new(store.clone(), config.batch_size),
                chain_status.clone(),
            )),
        );
        pool.register(
            JobKind::Cleanup,
            Arc::new(CleanupHandler::new(
                store.clone(),
                archiver,
                chain_status.clone(),
            )),
        );

        let shutdown = pool.shutdown_handle();
        let mut tasks = vec![tokio::spawn(Arc::new(pool).run())];

        let (stop_tx, stop_rx) = watch::channel(false);
        // The pool owns one shutdown channel, the periodic tasks another;
        // `shutdown()` flips both.
        if let Some(handle) = spawn_hot_reload(
            repository.clone(),
            config.hot_reload_interval(),
            stop_rx.clone(),
        ) {
            tasks.push(handle);
        }
        tasks.push(spawn_cleanup_cron(
            ingestor.clone(),
            &config.cleanup_cron,
            config.retention_days,
            stop_rx,
        )?);

        let service = Arc::new(Self {
            config,
            queue,
            store,
            rules,
            engine,
            repository,
            ingestor,
            verifier,
            chain_status,
            shutdown,
            periodic_stop: stop_tx,
            tasks: Mutex::new(tasks),
        });
        // Bridge the pool shutdown signal onto the periodic tasks' channel.
        service.tasks.lock().await.push(tokio::spawn(hold(
            service.periodic_stop.clone(),
            service.shutdown.subscribe(),
        )));
        Ok(service)
    }

    // --- Ingestion API ---

    pub async fn enqueue(&self, event: SecurityEvent) -> Result<JobId, QueueError> {
        self.ingestor.enqueue(event).await
    }

    pub async fn enqueue_critical(&self, event: SecurityEvent) -> Result<JobId, QueueError> {
        self.ingestor.enqueue_critical(event).await
    }

    pub async fn enqueue_batch(&self, events: Vec<SecurityEvent>) -> Result<JobId, QueueError> {
        self.ingestor.enqueue_batch(events).await
    }

    pub async fn schedule_integrity_check(
        &self,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<JobId, QueueError> {
        self.ingestor.schedule_integrity_check(start_seq, end_seq).await
    }

    /// Arm an additional recurring cleanup on its own cron expression.
    /// The default daily schedule from the configuration stays active.
    pub async fn schedule_cleanup(
        &self,
        days_to_keep: u32,
        cron_expr: &str,
    ) -> Result<(), ServiceError> {
        let handle = spawn_cleanup_cron(
            self.ingestor.clone(),
            cron_expr,
            days_to_keep,
            self.periodic_stop.subscribe(),
        )?;
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Run an integrity check inline and return the report.
    pub async fn verify_integrity(
        &self,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<IntegrityReport, StoreError> {
        let report = self.verifier.verify(start_seq, end_seq).await?;
        if !report.ok {
            self.chain_status.mark_broken();
        }
        Ok(report)
    }

    // --- Query API ---

    pub async fn get_entries(
        &self,
        filter: &LogFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.store.find(filter, page, page_size).await
    }

    pub async fn get_entry(&self, id: Uuid) -> Result<Option<LogEntry>, StoreError> {
        self.store.get(id).await
    }

    pub async fn count(&self, filter: &LogFilter) -> Result<u64, StoreError> {
        self.store.count(filter).await
    }

    pub async fn get_statistics(&self) -> Result<Statistics, ServiceError> {
        let store_stats = self.store.statistics().await?;
        let queue = self.queue.counts().await?;
        let engine_metrics = self.engine.metrics().await;
        Ok(Statistics {
            total: store_stats.total,
            by_severity: store_stats.by_severity,
            by_event_type: store_stats.by_event_type,
            queue,
            engine_metrics,
        })
    }

    // --- Rule admin API ---

    pub async fn create_rule(&self, dto: CreateRule) -> Result<RuleRecord, ServiceError> {
        let now = Utc::now();
        let record = RuleRecord {
            id: dto.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: dto.name,
            description: dto.description,
            version: "1.0.0".to_string(),
            status: RuleStatus::Testing,
            severity: dto.severity,
            condition_type: dto.condition_type,
            config: dto.config,
            tags: dto.tags,
            created_at: now,
            updated_at: now,
        };
        self.rules.insert(record.clone()).await?;
        self.repository.sync().await?;
        Ok(record)
    }

    pub async fn update_rule(
        &self,
        id: &str,
        update: RuleUpdate,
    ) -> Result<RuleRecord, ServiceError> {
        let record = self.rules.update(id, update).await?;
        self.repository.sync().await?;
        Ok(record)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<bool, ServiceError> {
        let removed = self.rules.delete(id).await?;
        self.repository.sync().await?;
        Ok(removed)
    }

    pub async fn get_rule(&self, id: &str) -> Result<Option<RuleRecord>, StoreError> {
        self.rules.get(id).await
    }

    pub async fn list_rules(
        &self,
        status: Option<RuleStatus>,
    ) -> Result<Vec<RuleRecord>, StoreError> {
        self.rules.list(status).await
    }

    // --- Lifecycle & wiring accessors ---

    pub fn bus(&self) -> &SecurityBus {
        self.engine.bus()
    }

    pub fn chain_status(&self) -> &ChainStatus {
        &self.chain_status
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop accepting work and drain: the pool finishes active jobs, the
    /// periodic tasks exit.
    pub async fn shutdown(&self) {
        info!("Service shutting down, draining workers");
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Bridges the service shutdown signal onto the periodic tasks' channel.
async fn hold(stop_tx: watch::Sender<bool>, mut pool_shutdown: watch::Receiver<bool>) {
    loop {
        if pool_shutdown.changed().await.is_err() {
            let _ = stop_tx.send(true);
            return;
        }
        if *pool_shutdown.borrow() {
            let _ = stop_tx.send(true);
            return;
        }
    }
}
