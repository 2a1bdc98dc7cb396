//! Append-only log store: trait, SQLite implementation, in-memory
//! implementation for tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use vigil_core::{chain_hash, EventType, LogEntry, NewLogEntry, Severity};

use crate::codec::{fmt_ts, parse_json, parse_ts};
use crate::error::StoreError;

/// Filter for queries over the log.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Aggregate counters for reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LogStatistics {
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_event_type: BTreeMap<String, u64>,
}

/// The persisted log.
///
/// `append` assigns the next sequence number, links the previous hash and
/// computes the entry hash. It does NOT serialize callers: the writer
/// must hold its append lock so two appends never race the head read.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError>;
    async fn latest(&self) -> Result<Option<LogEntry>, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<LogEntry>, StoreError>;
    /// Entries with `start_seq <= seq <= end_seq`, ascending, at most `limit`.
    async fn range(&self, start_seq: u64, end_seq: u64, limit: u32)
        -> Result<Vec<LogEntry>, StoreError>;
    async fn count(&self, filter: &LogFilter) -> Result<u64, StoreError>;
    /// Page through filtered entries, newest first. Pages are 1-based.
    async fn find(
        &self,
        filter: &LogFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LogEntry>, StoreError>;
    /// Chronological window ending at `until`, capped, for rule contexts.
    async fn recent_window(
        &self,
        until: DateTime<Utc>,
        minutes: i64,
        cap: u32,
    ) -> Result<Vec<LogEntry>, StoreError>;
    /// Entries older than `cutoff` in sequence order (archival streaming).
    async fn find_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<LogEntry>, StoreError>;
    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    /// Bulk delete of archived rows. Returns the number deleted.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn statistics(&self) -> Result<LogStatistics, StoreError>;
}

fn build_entry(
    sequence_number: u64,
    fields: NewLogEntry,
    created_at: DateTime<Utc>,
    previous_hash: Option<String>,
) -> LogEntry {
    let current_hash = chain_hash(sequence_number, &fields, created_at, previous_hash.as_deref());
    LogEntry {
        id: Uuid::new_v4(),
        sequence_number,
        event_type: fields.event_type,
        severity: fields.severity,
        user_id: fields.user_id,
        email: fields.email,
        ip_address: fields.ip_address,
        user_agent: fields.user_agent,
        session_id: fields.session_id,
        metadata: fields.metadata,
        message: fields.message,
        previous_hash,
        current_hash,
        created_at,
    }
}

fn matches(entry: &LogEntry, filter: &LogFilter) -> bool {
    filter
        .event_type
        .as_ref()
        .is_none_or(|t| entry.event_type == *t)
        && filter.severity.is_none_or(|s| entry.severity == s)
        && filter
            .user_id
            .as_deref()
            .is_none_or(|u| entry.user_id.as_deref() == Some(u))
        && filter
            .ip_address
            .as_deref()
            .is_none_or(|ip| entry.ip_address.as_deref() == Some(ip))
        && filter.since.is_none_or(|s| entry.created_at >= s)
        && filter.until.is_none_or(|u| entry.created_at <= u)
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemLogStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row replacement, for tamper-detection tests.
    pub async fn corrupt(&self, seq: u64, mutate: impl FnOnce(&mut LogEntry)) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.sequence_number == seq) {
            mutate(entry);
        }
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn append(&self, fields: NewLogEntry) -> Result<LogEntry, StoreError> {
        let mut entries = self.entries.write().await;
        let sequence_number = entries.last().map_or(1, |e| e.sequence_number + 1);
        let previous_hash = entries.last().map(|e| e.current_hash.clone());
        let entry = build_entry(sequence_number, fields, Utc::now(), previous_hash);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn latest(&self) -> Result<Option<LogEntry>, StoreError> {
        Ok(self.entries.read().await.last().cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn range(
        &self,
        start_seq: u64,
        end_seq: u64,
        limit: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| (start_seq..=end_seq).contains(&e.sequence_number))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &LogFilter) -> Result<u64, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| matches(e, filter))
            .count() as u64)
    }

    async fn find(
        &self,
        filter: &LogFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let skip = (page.max(1) - 1) as usize * page_size as usize;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| matches(e, filter))
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn recent_window(
        &self,
        until: DateTime<Utc>,
        minutes: i64,
        cap: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let since = until - Duration::minutes(minutes);
        let mut window: Vec<LogEntry> = self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.created_at >= since && e.created_at <= until)
            .take(cap as usize)
            .cloned()
            .collect();
        window.reverse();
        Ok(window)
    }

    async fn find_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.created_at < cutoff)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.created_at < cutoff)
            .count() as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn statistics(&self) -> Result<LogStatistics, StoreError> {
        let entries = self.entries.read().await;
        let mut stats = LogStatistics {
            total: entries.len() as u64,
            ..LogStatistics::default()
        };
        for entry in entries.iter() {
            *stats
                .by_severity
                .entry(entry.severity.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_event_type
                .entry(entry.event_type.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}

/// SQLite-backed store.
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry, StoreError> {
        let id: String = row.try_get("id")?;
        let seq: i64 = row.try_get("seq")?;
        let event_type: String = row.try_get("event_type")?;
        let severity: String = row.try_get("severity")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(LogEntry {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Serialization(format!("bad uuid {id:?}: {e}")))?,
            sequence_number: seq as u64,
            event_type: EventType::from(event_type),
            severity: Severity::parse(&severity)
                .ok_or_else(|| StoreError::Serialization(format!("bad severity {severity:?}")))?,
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            session_id: row.try_get("session_id")?,
            metadata: parse_json(&metadata)?,
            message: row.try_get("message")?,
            previous_hash: row.try_get("previous_hash")?,
            current_hash: row.try_get("current_hash")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn filter_clause(filter: &LogFilter) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(t) = &filter.event_type {
            clauses.push("event_type = ?");
            binds.push(t.as_str().to_string());
        }
        if let Some(s) = filter.severity {
            clauses.push("severity = ?");
            binds.push(s.as_str().to_string());
        }
        if let Some(u) = &filter.user_id {
            clauses.push("user_id = ?");
            binds.push(u.clone());
        }
        if let Some(ip) = &filter.ip_address {
            clauses.push("ip_address = ?");
            binds.push(ip.clone());
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?");
            binds.push(fmt_ts(since));
        }
        if let Some(until) = filter.until {
            clauses.push("created_at <= ?");
            binds.push(fmt_ts(until));
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, binds)
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, fields: NewLogEntry) -> Result<LogEntry, StoreError> {
        let mut tx = self.pool.begin().await?;

        let head = sqlx::query("SELECT seq, current_hash FROM security_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;
        let (sequence_number, previous_hash) = match head {
            Some(row) => {
                let seq: i64 = row.try_get("seq")?;
                let hash: String = row.try_get("current_hash")?;
                (seq as u64 + 1, Some(hash))
            }
            None => (1, None),
        };

        let entry = build_entry(sequence_number, fields, Utc::now(), previous_hash);

        sqlx::query(
            "INSERT INTO security_log \
             (id, seq, event_type, severity, user_id, email, ip_address, user_agent, \
              session_id, metadata, message, previous_hash, current_hash, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.sequence_number as i64)
        .bind(entry.event_type.as_str())
        .bind(entry.severity.as_str())
        .bind(&entry.user_id)
        .bind(&entry.email)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.session_id)
        .bind(entry.metadata.canonical_json())
        .bind(&entry.message)
        .bind(&entry.previous_hash)
        .bind(&entry.current_hash)
        .bind(fmt_ts(entry.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn latest(&self) -> Result<Option<LogEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM security_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<LogEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM security_log WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn range(
        &self,
        start_seq: u64,
        end_seq: u64,
        limit: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM security_log WHERE seq >= ? AND seq <= ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(start_seq as i64)
        .bind(end_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn count(&self, filter: &LogFilter) -> Result<u64, StoreError> {
        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!("SELECT COUNT(*) AS n FROM security_log{clause}");
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let row = query.fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn find(
        &self,
        filter: &LogFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let (clause, binds) = Self::filter_clause(filter);
        let offset = (page.max(1) - 1) as i64 * page_size as i64;
        let sql =
            format!("SELECT * FROM security_log{clause} ORDER BY seq DESC LIMIT ? OFFSET ?");
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn recent_window(
        &self,
        until: DateTime<Utc>,
        minutes: i64,
        cap: u32,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let since = until - Duration::minutes(minutes);
        let rows = sqlx::query(
            "SELECT * FROM security_log WHERE created_at >= ? AND created_at <= ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(fmt_ts(since))
        .bind(fmt_ts(until))
        .bind(cap as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut window: Vec<LogEntry> =
            rows.iter().map(Self::row_to_entry).collect::<Result<_, _>>()?;
        window.reverse();
        Ok(window)
    }

    async fn find_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM security_log WHERE created_at < ? ORDER BY seq ASC LIMIT ? OFFSET ?",
        )
        .bind(fmt_ts(cutoff))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM security_log WHERE created_at < ?")
            .bind(fmt_ts(cutoff))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM security_log WHERE created_at < ?")
            .bind(fmt_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn statistics(&self) -> Result<LogStatistics, StoreError> {
        let mut stats = LogStatistics::default();

        let total = sqlx::query("SELECT COUNT(*) AS n FROM security_log")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = total.try_get("n")?;
        stats.total = n as u64;

        let by_severity =
            sqlx::query("SELECT severity, COUNT(*) AS n FROM security_log GROUP BY severity")
                .fetch_all(&self.pool)
                .await?;
        for row in by_severity {
            let severity: String = row.try_get("severity")?;
            let n: i64 = row.try_get("n")?;
            stats.by_severity.insert(severity, n as u64);
        }

        let by_type =
            sqlx::query("SELECT event_type, COUNT(*) AS n FROM security_log GROUP BY event_type")
                .fetch_all(&self.pool)
                .await?;
        for row in by_type {
            let event_type: String = row.try_get("event_type")?;
            let n: i64 = row.try_get("n")?;
            stats.by_event_type.insert(event_type, n as u64);
        }

        Ok(stats)
    }
}
