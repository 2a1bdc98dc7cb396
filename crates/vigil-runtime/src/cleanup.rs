//! Retention cleanup: archive first, delete only what the archive covers.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use vigil_persist::LogStore;
use vigil_queue::{CleanupPayload, JobEntry, JobHandler, JobOutcome, FALLBACK_TARGET};

use crate::archive::LogArchiver;
use crate::integrity::ChainStatus;

/// Handler for CLEANUP jobs.
///
/// Failure semantics: a broken chain or a failed archive aborts the
/// delete. Re-running after a completed cleanup is a no-op because the
/// archiver reports an empty range.
pub struct CleanupHandler {
    store: Arc<dyn LogStore>,
    archiver: Arc<LogArchiver>,
    chain_status: Arc<ChainStatus>,
}

impl CleanupHandler {
    pub fn new(
        store: Arc<dyn LogStore>,
        archiver: Arc<LogArchiver>,
        chain_status: Arc<ChainStatus>,
    ) -> Self {
        Self {
            store,
            archiver,
            chain_status,
        }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn handle(&self, job: &JobEntry) -> JobOutcome {
        let payload: CleanupPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(p) => p,
            Err(e) => return JobOutcome::Fatal(format!("undecodable payload: {e}")),
        };

        if !self.chain_status.is_intact() {
            warn!("Cleanup skipped: chain is marked broken");
            return JobOutcome::Fatal("chain broken, cleanup halted".to_string());
        }

        let cutoff = Utc::now() - Duration::days(payload.days_to_keep as i64);

        let outcome = match self.archiver.archive_before(cutoff).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                info!(%cutoff, "Cleanup: nothing to archive, no-op");
                return JobOutcome::Success;
            }
            Err(e) => {
                // Archive failure aborts cleanup; the next cycle retries.
                error!(error = %e, "Archive failed, cleanup aborted");
                return JobOutcome::Retry(e.to_string());
            }
        };

        if !outcome.chain_intact {
            self.chain_status.mark_broken();
            error!(
                target: FALLBACK_TARGET,
                archive = %outcome.path.display(),
                "CHAIN BROKEN detected during archival, cleanup halted"
            );
            return JobOutcome::Fatal("archived range failed chain verification".to_string());
        }

        match self.store.delete_before(cutoff).await {
            Ok(deleted) => {
                info!(
                    deleted,
                    archived = outcome.total_logs,
                    archive = %outcome.path.display(),
                    "Retention cleanup complete"
                );
                JobOutcome::Success
            }
            Err(e) => {
                error!(error = %e, "Delete failed after successful archive");
                JobOutcome::Retry(e.to_string())
            }
        }
    }
}
