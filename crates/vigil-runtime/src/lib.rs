//! # Vigil Runtime
//!
//! The assembled pipeline: queue consumers that write the hash chain and
//! drive the rule engine, integrity verification, compressed archival,
//! retention cleanup, cron scheduling, and the [`SecurityLogService`]
//! facade external callers talk to.
//!
//! ## Data flow
//!
//! ```text
//! enqueue(event) ─► queue ─► writer (serial lane) ─► store.append
//!                                   │
//!                                   └► engine.evaluate ─► matches
//!                                        │        │
//!                                        │        └► action/alert bus
//!                                        └► SUSPICIOUS_ACTIVITY re-enqueued
//! ```

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod ingest;
pub mod integrity;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod writer;

pub use archive::{read_archive, ArchiveDocument, ArchiveError, ArchiveOutcome, LogArchiver};
pub use cleanup::CleanupHandler;
pub use config::Config;
pub use ingest::QueueIngestor;
pub use integrity::{ChainStatus, IntegrityReport, IntegrityVerifier, VerifyIntegrityHandler};
pub use scheduler::{parse_cron, spawn_cleanup_cron, ScheduleError};
pub use service::{CreateRule, SecurityLogService, ServiceError, Statistics};
pub use telemetry::init_tracing;
pub use writer::{BatchLogHandler, LogEventHandler, LogWriter};
