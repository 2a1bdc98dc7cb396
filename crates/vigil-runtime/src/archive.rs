//! Compressed archival of expired log ranges.
//!
//! Archives are gzip-compressed JSON documents named
//! `security-logs-<timestamp>.json.gz` with a sibling `.sha256` holding the
//! digest of the uncompressed payload. Every write is round-trip verified
//! before cleanup may touch the archived rows.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use vigil_core::{verify_chain, LogEntry};
use vigil_persist::{LogStore, StoreError};

pub const ARCHIVE_VERSION: &str = "1.0";
/// Rows streamed from the store per chunk.
const CHUNK_SIZE: u32 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("archive verification failed: {0}")]
    Verification(String),
}

/// Archived row. Sequence numbers are decimal strings for portability to
/// consumers without 64-bit integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedEntry {
    pub id: String,
    pub sequence_number: String,
    pub event_type: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub current_hash: String,
    pub created_at: String,
}

impl From<&LogEntry> for ArchivedEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            sequence_number: entry.sequence_number.to_string(),
            event_type: entry.event_type.as_str().to_string(),
            severity: entry.severity.as_str().to_string(),
            user_id: entry.user_id.clone(),
            email: entry.email.clone(),
            ip_address: entry.ip_address.clone(),
            user_agent: entry.user_agent.clone(),
            session_id: entry.session_id.clone(),
            metadata: serde_json::to_value(&entry.metadata)
                .unwrap_or(serde_json::Value::Null),
            message: entry.message.clone(),
            previous_hash: entry.previous_hash.clone(),
            current_hash: entry.current_hash.clone(),
            created_at: vigil_core::canonical_timestamp(entry.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMetadata {
    pub created_at: String,
    pub cutoff_date: String,
    pub total_logs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_log_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_log_date: Option<String>,
    pub hash_chain_intact: bool,
    pub archive_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDocument {
    pub metadata: ArchiveMetadata,
    pub logs: Vec<ArchivedEntry>,
}

/// Result of a successful archive run.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub path: PathBuf,
    pub sha256_path: PathBuf,
    pub sha256: String,
    pub total_logs: u64,
    pub chain_intact: bool,
}

/// Streams expired rows out of the store into verified archive files.
pub struct LogArchiver {
    store: Arc<dyn LogStore>,
    dir: PathBuf,
}

impl LogArchiver {
    pub fn new(store: Arc<dyn LogStore>, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
        }
    }

    /// Archive every entry with `created_at < cutoff`.
    ///
    /// Returns `Ok(None)` when there is nothing to archive, which is what
    /// makes cleanup idempotent. The written file is decompressed, hash
    /// compared and parsed back before this returns.
    pub async fn archive_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ArchiveOutcome>, ArchiveError> {
        let total = self.store.count_before(cutoff).await?;
        if total == 0 {
            return Ok(None);
        }

        let mut entries: Vec<LogEntry> = Vec::with_capacity(total.min(CHUNK_SIZE as u64) as usize);
        let mut offset = 0u64;
        loop {
            let chunk = self.store.find_before(cutoff, CHUNK_SIZE, offset).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            entries.extend(chunk);
        }

        // Verify the archived segment against its predecessor before the
        // rows disappear from the live table.
        let predecessor = match entries.first() {
            Some(first) if first.sequence_number > 1 => self
                .store
                .range(first.sequence_number - 1, first.sequence_number - 1, 1)
                .await?
                .pop(),
            _ => None,
        };
        let chain_intact = verify_chain(&entries, predecessor.as_ref()).ok;

        let document = ArchiveDocument {
            metadata: ArchiveMetadata {
                created_at: vigil_core::canonical_timestamp(Utc::now()),
                cutoff_date: vigil_core::canonical_timestamp(cutoff),
                total_logs: entries.len() as u64,
                first_log_date: entries
                    .first()
                    .map(|e| vigil_core::canonical_timestamp(e.created_at)),
                last_log_date: entries
                    .last()
                    .map(|e| vigil_core::canonical_timestamp(e.created_at)),
                hash_chain_intact: chain_intact,
                archive_version: ARCHIVE_VERSION.to_string(),
            },
            logs: entries.iter().map(ArchivedEntry::from).collect(),
        };

        let payload = serde_json::to_vec(&document)?;
        let sha256 = hex::encode(Sha256::digest(&payload));

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = self.dir.join(format!("security-logs-{stamp}.json.gz"));
        let sha256_path = self.dir.join(format!("security-logs-{stamp}.json.gz.sha256"));

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;
        tokio::fs::write(&path, &compressed).await?;
        tokio::fs::write(&sha256_path, format!("{sha256}\n")).await?;

        self.verify_roundtrip(&path, &sha256, document.metadata.total_logs)
            .await?;

        info!(
            path = %path.display(),
            total = document.metadata.total_logs,
            chain_intact,
            "Archive written and verified"
        );

        Ok(Some(ArchiveOutcome {
            path,
            sha256_path,
            sha256,
            total_logs: document.metadata.total_logs,
            chain_intact,
        }))
    }

    /// Decompress a written archive, compare the payload digest and parse
    /// the document back.
    async fn verify_roundtrip(
        &self,
        path: &Path,
        expected_sha256: &str,
        expected_total: u64,
    ) -> Result<(), ArchiveError> {
        let document = read_archive(path).await?;
        let reread = serde_json::to_vec(&document)?;
        let digest = hex::encode(Sha256::digest(&reread));
        if digest != expected_sha256 {
            return Err(ArchiveError::Verification(format!(
                "payload digest mismatch: {digest} != {expected_sha256}"
            )));
        }
        if document.metadata.total_logs != expected_total
            || document.logs.len() as u64 != expected_total
        {
            return Err(ArchiveError::Verification(format!(
                "log count mismatch: metadata {} / rows {} / expected {}",
                document.metadata.total_logs,
                document.logs.len(),
                expected_total
            )));
        }
        Ok(())
    }
}

/// Read and decompress an archive file.
pub async fn read_archive(path: &Path) -> Result<ArchiveDocument, ArchiveError> {
    let compressed = tokio::fs::read(path).await?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut payload = Vec::new();
    decoder.read_to_end(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vigil_core::{EventType, Metadata, NewLogEntry, Severity};
    use vigil_persist::MemLogStore;

    async fn seeded_store(n: usize) -> Arc<MemLogStore> {
        let store = Arc::new(MemLogStore::new());
        for i in 0..n {
            store
                .append(NewLogEntry {
                    event_type: EventType::LoginSuccess,
                    severity: Severity::Info,
                    user_id: Some(format!("u{i}")),
                    email: None,
                    ip_address: Some("203.0.113.1".to_string()),
                    user_agent: None,
                    session_id: None,
                    metadata: Metadata::new().with("country", "DE"),
                    message: None,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn archive_round_trips_bit_identical() {
        let store = seeded_store(25).await;
        let dir = tempfile::tempdir().unwrap();
        let archiver = LogArchiver::new(store, dir.path());

        let cutoff = Utc::now() + Duration::seconds(1);
        let outcome = archiver.archive_before(cutoff).await.unwrap().unwrap();

        assert_eq!(outcome.total_logs, 25);
        assert!(outcome.chain_intact);
        assert!(outcome.path.exists());
        assert!(outcome.sha256_path.exists());

        let name = outcome.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("security-logs-"));
        assert!(name.ends_with(".json.gz"));

        let document = read_archive(&outcome.path).await.unwrap();
        assert_eq!(document.metadata.archive_version, "1.0");
        assert!(document.metadata.hash_chain_intact);
        // Sequence numbers are decimal strings.
        assert_eq!(document.logs[0].sequence_number, "1");
        assert_eq!(document.logs[24].sequence_number, "25");

        let sidecar = tokio::fs::read_to_string(&outcome.sha256_path).await.unwrap();
        assert_eq!(sidecar.trim(), outcome.sha256);
    }

    #[tokio::test]
    async fn empty_range_archives_nothing() {
        let store = seeded_store(3).await;
        let dir = tempfile::tempdir().unwrap();
        let archiver = LogArchiver::new(store, dir.path());

        let cutoff = Utc::now() - Duration::days(1);
        assert!(archiver.archive_before(cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_rows_flag_the_archive() {
        let store = seeded_store(10).await;
        store
            .corrupt(4, |entry| entry.message = Some("edited".to_string()))
            .await;
        let dir = tempfile::tempdir().unwrap();
        let archiver = LogArchiver::new(store, dir.path());

        let outcome = archiver
            .archive_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.chain_intact);
    }
}
