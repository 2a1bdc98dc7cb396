//! Durable queue backend over SQLite.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use vigil_queue::{
    EnqueueOptions, JobEntry, JobId, JobKind, JobStatus, QueueBackend, QueueCounts, QueueError,
};

use crate::codec::{fmt_ts, parse_ts};

/// Durable queue persisted in the same database as the log.
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobEntry, QueueError> {
        let id: String = row.try_get("id").map_err(backend_err)?;
        let kind: String = row.try_get("kind").map_err(backend_err)?;
        let payload: String = row.try_get("payload").map_err(backend_err)?;
        let status: String = row.try_get("status").map_err(backend_err)?;
        let priority: i64 = row.try_get("priority").map_err(backend_err)?;
        let lifo: i64 = row.try_get("lifo").map_err(backend_err)?;
        let created_at: String = row.try_get("created_at").map_err(backend_err)?;
        let run_at: String = row.try_get("run_at").map_err(backend_err)?;
        let attempts: i64 = row.try_get("attempts").map_err(backend_err)?;
        let max_retries: i64 = row.try_get("max_retries").map_err(backend_err)?;
        let last_error: Option<String> = row.try_get("last_error").map_err(backend_err)?;

        let status = match status.as_str() {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "failed" => JobStatus::Failed(attempts as u32),
            "dead_letter" => JobStatus::DeadLetter,
            other => return Err(QueueError::Backend(format!("bad status {other:?}"))),
        };

        Ok(JobEntry {
            id: Uuid::parse_str(&id).map_err(|_| QueueError::Backend("bad uuid".into()))?,
            kind: JobKind::parse(&kind)
                .ok_or_else(|| QueueError::Backend(format!("bad kind {kind:?}")))?,
            payload: serde_json::from_str(&payload)?,
            status,
            priority: priority as u8,
            lifo: lifo != 0,
            created_at: parse_ts(&created_at)
                .map_err(|e| QueueError::Backend(e.to_string()))?,
            run_at: parse_ts(&run_at).map_err(|e| QueueError::Backend(e.to_string()))?,
            attempts: attempts as u32,
            max_retries: max_retries as u32,
            last_error,
        })
    }
}

fn backend_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

#[async_trait]
impl QueueBackend for SqliteQueue {
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

        sqlx::query(
            "INSERT INTO jobs (id, kind, payload, status, priority, lifo, created_at, run_at, \
             attempts, max_retries) VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, 0, ?)",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(opts.priority as i64)
        .bind(opts.lifo as i64)
        .bind(fmt_ts(now))
        .bind(fmt_ts(run_at))
        .bind(opts.max_retries as i64)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        // Claim in one statement; the LIFO lane inverts rowid order so the
        // newest critical job surfaces first.
        let row = sqlx::query(
            "UPDATE jobs SET status = 'running' \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND run_at <= ? \
                 ORDER BY priority ASC, \
                          CASE WHEN lifo = 1 THEN -rowid ELSE rowid END ASC \
                 LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        match status {
            JobStatus::Completed => {
                let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)?;
                if result.rows_affected() == 0 {
                    return Err(QueueError::NotFound);
                }
                sqlx::query("UPDATE queue_stats SET completed = completed + 1 WHERE id = 1")
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)?;
            }
            JobStatus::Failed(attempt) => {
                let backoff = delay.unwrap_or(Duration::from_secs(2u64 << attempt.min(6)));
                let run_at =
                    Utc::now() + ChronoDuration::milliseconds(backoff.as_millis() as i64);
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', attempts = ?, last_error = ?, \
                     run_at = ? WHERE id = ?",
                )
                .bind(attempt as i64)
                .bind(error)
                .bind(fmt_ts(run_at))
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            }
            other => {
                let status_str = match other {
                    JobStatus::Pending => "pending",
                    JobStatus::Running => "running",
                    JobStatus::DeadLetter => "dead_letter",
                    _ => unreachable!("handled above"),
                };
                sqlx::query("UPDATE jobs SET status = ?, last_error = ? WHERE id = ?")
                    .bind(status_str)
                    .bind(error)
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)?;
            }
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or(QueueError::NotFound)?;
        Self::row_to_job(&row)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = fmt_ts(Utc::now());
        let row = sqlx::query(
            "SELECT \
               SUM(CASE WHEN status = 'pending' AND run_at <= ?1 THEN 1 ELSE 0 END) AS waiting, \
               SUM(CASE WHEN status = 'pending' AND run_at > ?1 THEN 1 ELSE 0 END) AS delayed, \
               SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END) AS active, \
               SUM(CASE WHEN status IN ('failed', 'dead_letter') THEN 1 ELSE 0 END) AS failed \
             FROM jobs",
        )
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;

        let completed_row = sqlx::query("SELECT completed FROM queue_stats WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let completed: i64 = completed_row.try_get("completed").map_err(backend_err)?;

        let get = |name: &str| -> Result<u64, QueueError> {
            let v: Option<i64> = row.try_get(name).map_err(backend_err)?;
            Ok(v.unwrap_or(0) as u64)
        };

        Ok(QueueCounts {
            waiting: get("waiting")?,
            active: get("active")?,
            completed: completed as u64,
            failed: get("failed")?,
            delayed: get("delayed")?,
        })
    }
}
