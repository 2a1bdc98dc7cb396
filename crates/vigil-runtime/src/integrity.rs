//! Chain integrity verification, batched over the store.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use vigil_core::{verify_chain, ChainBroken, LogEntry};
use vigil_persist::{LogStore, StoreError};
use vigil_queue::{JobEntry, JobHandler, JobOutcome, VerifyIntegrityPayload, FALLBACK_TARGET};

/// Shared chain-health flag. Cleanup refuses to run while the chain is
/// marked broken; an operator resets it after repair.
#[derive(Debug, Default)]
pub struct ChainStatus {
    broken: AtomicBool,
}

impl ChainStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_intact(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one verification run.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub start_seq: u64,
    pub end_seq: u64,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken: Option<ChainBroken>,
}

/// Walks `[start_seq, end_seq]` in store batches, carrying the boundary
/// entry between batches so links across batch edges are still checked.
pub struct IntegrityVerifier {
    store: Arc<dyn LogStore>,
    batch_size: u32,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn LogStore>, batch_size: u32) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn verify(
        &self,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<IntegrityReport, StoreError> {
        let start = start_seq.unwrap_or(1).max(1);
        let end = match end_seq {
            Some(e) => e,
            None => match self.store.latest().await? {
                Some(entry) => entry.sequence_number,
                None => {
                    return Ok(IntegrityReport {
                        ok: true,
                        start_seq: start,
                        end_seq: 0,
                        checked: 0,
                        broken: None,
                    })
                }
            },
        };

        // A segment starting past genesis verifies against its predecessor.
        let mut predecessor: Option<LogEntry> = if start > 1 {
            self.store.range(start - 1, start - 1, 1).await?.pop()
        } else {
            None
        };

        let mut checked = 0usize;
        let mut cursor = start;
        while cursor <= end {
            let batch_end = cursor.saturating_add(self.batch_size as u64 - 1).min(end);
            let batch = self.store.range(cursor, batch_end, self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let report = verify_chain(&batch, predecessor.as_ref());
            checked += report.checked;
            if let Some(broken) = report.broken {
                return Ok(IntegrityReport {
                    ok: false,
                    start_seq: start,
                    end_seq: end,
                    checked,
                    broken: Some(broken),
                });
            }

            predecessor = batch.last().cloned();
            cursor = batch_end + 1;
        }

        Ok(IntegrityReport {
            ok: true,
            start_seq: start,
            end_seq: end,
            checked,
            broken: None,
        })
    }
}

/// Handler for VERIFY_INTEGRITY jobs.
pub struct VerifyIntegrityHandler {
    verifier: IntegrityVerifier,
    chain_status: Arc<ChainStatus>,
}

impl VerifyIntegrityHandler {
    pub fn new(verifier: IntegrityVerifier, chain_status: Arc<ChainStatus>) -> Self {
        Self {
            verifier,
            chain_status,
        }
    }
}

#[async_trait]
impl JobHandler for VerifyIntegrityHandler {
    async fn handle(&self, job: &JobEntry) -> JobOutcome {
        let payload: VerifyIntegrityPayload =
            match serde_json::from_value(job.payload.clone()) {
                Ok(p) => p,
                Err(e) => return JobOutcome::Fatal(format!("undecodable payload: {e}")),
            };

        match self.verifier.verify(payload.start_seq, payload.end_seq).await {
            Ok(report) if report.ok => {
                info!(
                    checked = report.checked,
                    start = report.start_seq,
                    end = report.end_seq,
                    "Chain integrity verified"
                );
                JobOutcome::Success
            }
            Ok(report) => {
                self.chain_status.mark_broken();
                let broken = report.broken.as_ref();
                error!(
                    target: FALLBACK_TARGET,
                    broken_seq = broken.map(|b| b.sequence_number),
                    detail = %broken.map(|b| b.message.as_str()).unwrap_or("unknown"),
                    "CHAIN BROKEN: tampering or corruption detected, cleanup halted"
                );
                JobOutcome::Fatal(
                    broken
                        .map(|b| b.message.clone())
                        .unwrap_or_else(|| "chain broken".to_string()),
                )
            }
            Err(e) => JobOutcome::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{BreakKind, EventType, Metadata, NewLogEntry, Severity};
    use vigil_persist::MemLogStore;

    async fn seeded_store(n: usize) -> Arc<MemLogStore> {
        let store = Arc::new(MemLogStore::new());
        for i in 0..n {
            store
                .append(NewLogEntry {
                    event_type: EventType::SessionActivity,
                    severity: Severity::Info,
                    user_id: Some(format!("u{i}")),
                    email: None,
                    ip_address: None,
                    user_agent: None,
                    session_id: None,
                    metadata: Metadata::new(),
                    message: None,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn intact_chain_verifies_across_batches() {
        let store = seeded_store(25).await;
        let verifier = IntegrityVerifier::new(store, 10);
        let report = verifier.verify(None, None).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 25);
    }

    #[tokio::test]
    async fn tampered_entry_is_reported_with_its_sequence() {
        let store = seeded_store(100).await;
        store
            .corrupt(42, |entry| {
                entry.metadata.insert("tampered", true);
            })
            .await;

        let verifier = IntegrityVerifier::new(store, 10);
        let report = verifier.verify(None, None).await.unwrap();
        assert!(!report.ok);
        let broken = report.broken.unwrap();
        assert_eq!(broken.sequence_number, 42);
        assert_eq!(broken.kind, BreakKind::HashMismatch);
        assert_eq!(broken.message, "Hash mismatch at sequence 42");
    }

    #[tokio::test]
    async fn segment_verification_fetches_the_predecessor() {
        let store = seeded_store(30).await;
        let verifier = IntegrityVerifier::new(store, 7);
        let report = verifier.verify(Some(10), Some(25)).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 16);
    }

    #[tokio::test]
    async fn empty_store_verifies_trivially() {
        let store = Arc::new(MemLogStore::new());
        let verifier = IntegrityVerifier::new(store, 10);
        let report = verifier.verify(None, None).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn failed_verification_marks_the_chain_broken() {
        let store = seeded_store(10).await;
        store
            .corrupt(5, |entry| entry.message = Some("forged".to_string()))
            .await;

        let status = Arc::new(ChainStatus::new());
        let handler = VerifyIntegrityHandler::new(
            IntegrityVerifier::new(store, 100),
            status.clone(),
        );

        let job = JobEntry {
            id: uuid::Uuid::new_v4(),
            kind: vigil_queue::JobKind::VerifyIntegrity,
            payload: serde_json::to_value(VerifyIntegrityPayload::default()).unwrap(),
            status: vigil_queue::JobStatus::Running,
            priority: 1,
            lifo: false,
            created_at: chrono::Utc::now(),
            run_at: chrono::Utc::now(),
            attempts: 0,
            max_retries: 3,
            last_error: None,
        };

        assert!(status.is_intact());
        assert!(matches!(handler.handle(&job).await, JobOutcome::Fatal(_)));
        assert!(!status.is_intact());
        status.reset();
        assert!(status.is_intact());
    }
}
