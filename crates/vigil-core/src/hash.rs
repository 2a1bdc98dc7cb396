//! Chain hashing and integrity verification.
//!
//! Every persisted entry carries `current_hash = SHA256(canonical(entry,
//! previous_hash))`. The canonical form is a pipe-delimited join of the
//! stored fields; missing fields render as empty strings, metadata as
//! key-ordered JSON, timestamps as ISO-8601 with millisecond precision and
//! a `Z` suffix.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::entry::{LogEntry, NewLogEntry};

/// A SHA-256 hash (32 bytes).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Combine two hashes (Merkle internal nodes).
    pub fn combine(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Render a timestamp the way the canonical string expects it.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Canonical pre-image for an entry's chain hash.
pub fn canonical_string(
    sequence_number: u64,
    entry: &NewLogEntry,
    created_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let seq = sequence_number.to_string();
    let metadata_json = entry.metadata.canonical_json();
    let created = canonical_timestamp(created_at);
    let parts: [&str; 12] = [
        &seq,
        entry.event_type.as_str(),
        entry.severity.as_str(),
        entry.user_id.as_deref().unwrap_or(""),
        entry.email.as_deref().unwrap_or(""),
        entry.ip_address.as_deref().unwrap_or(""),
        entry.user_agent.as_deref().unwrap_or(""),
        entry.session_id.as_deref().unwrap_or(""),
        &metadata_json,
        entry.message.as_deref().unwrap_or(""),
        &created,
        previous_hash.unwrap_or(""),
    ];
    parts.join("|")
}

/// Compute the chain hash for an entry about to be persisted.
pub fn chain_hash(
    sequence_number: u64,
    entry: &NewLogEntry,
    created_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let canonical = canonical_string(sequence_number, entry, created_at, previous_hash);
    Hash::digest(canonical.as_bytes()).to_hex()
}

fn entry_fields(entry: &LogEntry) -> NewLogEntry {
    NewLogEntry {
        event_type: entry.event_type.clone(),
        severity: entry.severity,
        user_id: entry.user_id.clone(),
        email: entry.email.clone(),
        ip_address: entry.ip_address.clone(),
        user_agent: entry.user_agent.clone(),
        session_id: entry.session_id.clone(),
        metadata: entry.metadata.clone(),
        message: entry.message.clone(),
    }
}

/// Recompute a stored entry's hash and compare.
pub fn verify_entry(entry: &LogEntry, previous_hash: Option<&str>) -> bool {
    let recomputed = chain_hash(
        entry.sequence_number,
        &entry_fields(entry),
        entry.created_at,
        previous_hash,
    );
    recomputed == entry.current_hash
}

/// Ways a chain can be broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    FirstEntryHasPrevious,
    LinkMismatch,
    SequenceGap,
    HashMismatch,
}

/// Chain verification failure.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ChainBroken {
    pub kind: BreakKind,
    pub index: usize,
    pub sequence_number: u64,
    pub message: String,
}

/// Outcome of a chain walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub ok: bool,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken: Option<ChainBroken>,
}

impl ChainReport {
    fn intact(checked: usize) -> Self {
        Self {
            ok: true,
            checked,
            broken: None,
        }
    }

    fn broken(checked: usize, broken: ChainBroken) -> Self {
        Self {
            ok: false,
            checked,
            broken: Some(broken),
        }
    }
}

/// Walk a seq-sorted slice of entries and verify every chain invariant.
///
/// `predecessor` carries the entry just before the slice when verifying a
/// segment out of a longer chain; pass `None` when the slice starts at the
/// genesis entry. Returns on the first violation.
pub fn verify_chain(entries: &[LogEntry], predecessor: Option<&LogEntry>) -> ChainReport {
    let mut prev: Option<&LogEntry> = predecessor;

    for (i, entry) in entries.iter().enumerate() {
        match prev {
            None => {
                if entry.previous_hash.is_some() {
                    return ChainReport::broken(
                        i,
                        ChainBroken {
                            kind: BreakKind::FirstEntryHasPrevious,
                            index: i,
                            sequence_number: entry.sequence_number,
                            message: format!(
                                "First entry (sequence {}) carries a previous hash",
                                entry.sequence_number
                            ),
                        },
                    );
                }
            }
            Some(p) => {
                if entry.sequence_number != p.sequence_number + 1 {
                    return ChainReport::broken(
                        i,
                        ChainBroken {
                            kind: BreakKind::SequenceGap,
                            index: i,
                            sequence_number: entry.sequence_number,
                            message: format!(
                                "Sequence gap: expected {}, found {}",
                                p.sequence_number + 1,
                                entry.sequence_number
                            ),
                        },
                    );
                }
                if entry.previous_hash.as_deref() != Some(p.current_hash.as_str()) {
                    return ChainReport::broken(
                        i,
                        ChainBroken {
                            kind: BreakKind::LinkMismatch,
                            index: i,
                            sequence_number: entry.sequence_number,
                            message: format!(
                                "Link mismatch at sequence {}",
                                entry.sequence_number
                            ),
                        },
                    );
                }
            }
        }

        if !verify_entry(entry, entry.previous_hash.as_deref()) {
            return ChainReport::broken(
                i,
                ChainBroken {
                    kind: BreakKind::HashMismatch,
                    index: i,
                    sequence_number: entry.sequence_number,
                    message: format!("Hash mismatch at sequence {}", entry.sequence_number),
                },
            );
        }

        prev = Some(entry);
    }

    ChainReport::intact(entries.len())
}

/// A verification checkpoint over a chain prefix.
///
/// Future verifications can start from the checkpointed entry instead of
/// walking from genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence_number: u64,
    pub hash: String,
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
}

/// Build a checkpoint over seq-sorted entries. `None` for an empty slice.
pub fn checkpoint(entries: &[LogEntry]) -> Option<Checkpoint> {
    let last = entries.last()?;
    let hashes: Vec<String> = entries.iter().map(|e| e.current_hash.clone()).collect();
    Some(Checkpoint {
        sequence_number: last.sequence_number,
        hash: last.current_hash.clone(),
        merkle_root: crate::merkle::merkle_root(&hashes),
        timestamp: Utc::now(),
        count: entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Metadata, Severity};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn fields(n: u32) -> NewLogEntry {
        NewLogEntry {
            event_type: EventType::LoginFailed,
            severity: Severity::Medium,
            user_id: Some(format!("user-{n}")),
            email: None,
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: None,
            session_id: None,
            metadata: Metadata::new().with("country", "DE"),
            message: Some("failed login".to_string()),
        }
    }

    fn build_chain(len: u32) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let mut prev_hash: Option<String> = None;
        for i in 1..=len {
            let created_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(i as i64);
            let f = fields(i);
            let current = chain_hash(i as u64, &f, created_at, prev_hash.as_deref());
            entries.push(LogEntry {
                id: Uuid::new_v4(),
                sequence_number: i as u64,
                event_type: f.event_type,
                severity: f.severity,
                user_id: f.user_id,
                email: f.email,
                ip_address: f.ip_address,
                user_agent: f.user_agent,
                session_id: f.session_id,
                metadata: f.metadata,
                message: f.message,
                previous_hash: prev_hash.clone(),
                current_hash: current.clone(),
                created_at,
            });
            prev_hash = Some(current);
        }
        entries
    }

    #[test]
    fn canonical_string_uses_pipes_and_empty_strings() {
        let f = NewLogEntry {
            event_type: EventType::PageView,
            severity: Severity::Info,
            user_id: None,
            email: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
            metadata: Metadata::new(),
            message: None,
        };
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let s = canonical_string(1, &f, ts, None);
        assert_eq!(s, "1|PAGE_VIEW|INFO||||||{}||2025-01-02T03:04:05.000Z|");
    }

    #[test]
    fn email_is_covered_by_the_hash() {
        let mut entries = build_chain(3);
        entries[1].email = Some("attacker@example.com".to_string());
        let report = verify_chain(&entries, None);
        let broken = report.broken.unwrap();
        assert_eq!(broken.kind, BreakKind::HashMismatch);
        assert_eq!(broken.sequence_number, 2);
    }

    #[test]
    fn verify_chain_accepts_intact_chain() {
        let entries = build_chain(10);
        let report = verify_chain(&entries, None);
        assert!(report.ok, "{:?}", report.broken);
        assert_eq!(report.checked, 10);
    }

    #[test]
    fn tampered_metadata_is_detected_at_its_sequence() {
        let mut entries = build_chain(100);
        entries[41].metadata.insert("country", "XX");
        let report = verify_chain(&entries, None);
        assert!(!report.ok);
        let broken = report.broken.unwrap();
        assert_eq!(broken.sequence_number, 42);
        assert_eq!(broken.kind, BreakKind::HashMismatch);
        assert_eq!(broken.message, "Hash mismatch at sequence 42");
    }

    #[test]
    fn relinked_entry_is_a_link_mismatch() {
        let mut entries = build_chain(5);
        entries[3].previous_hash = Some(Hash::digest(b"forged").to_hex());
        let report = verify_chain(&entries, None);
        let broken = report.broken.unwrap();
        assert_eq!(broken.kind, BreakKind::LinkMismatch);
        assert_eq!(broken.sequence_number, 4);
    }

    #[test]
    fn missing_row_is_a_sequence_gap() {
        let mut entries = build_chain(5);
        entries.remove(2);
        let report = verify_chain(&entries, None);
        let broken = report.broken.unwrap();
        assert_eq!(broken.kind, BreakKind::SequenceGap);
        assert_eq!(broken.sequence_number, 4);
    }

    #[test]
    fn genesis_with_previous_hash_is_rejected() {
        let mut entries = build_chain(2);
        entries[0].previous_hash = Some(Hash::digest(b"x").to_hex());
        let report = verify_chain(&entries, None);
        assert_eq!(
            report.broken.unwrap().kind,
            BreakKind::FirstEntryHasPrevious
        );
    }

    #[test]
    fn segment_verification_uses_predecessor() {
        let entries = build_chain(10);
        let report = verify_chain(&entries[4..], Some(&entries[3]));
        assert!(report.ok);
    }

    #[test]
    fn checkpoint_covers_last_entry() {
        let entries = build_chain(7);
        let cp = checkpoint(&entries).unwrap();
        assert_eq!(cp.sequence_number, 7);
        assert_eq!(cp.count, 7);
        assert_eq!(cp.hash, entries[6].current_hash);
        assert!(!cp.merkle_root.is_empty());
        assert!(checkpoint(&[]).is_none());
    }
}
