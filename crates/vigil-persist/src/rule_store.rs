//! Rule configuration rows: CRUD plus version bumping.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use vigil_core::{ConditionType, RuleRecord, RuleStatus, Severity};

use crate::codec::{fmt_ts, parse_json, parse_ts, to_json};
use crate::error::StoreError;

/// Partial update applied to a rule row. Absent fields are untouched; a
/// `config` change bumps the patch version.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<RuleStatus>,
    pub severity: Option<Severity>,
    pub config: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
}

impl RuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.severity.is_none()
            && self.config.is_none()
            && self.tags.is_none()
    }
}

/// Persistence of rule configuration.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert(&self, record: RuleRecord) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<RuleRecord>, StoreError>;
    /// All rows the engine should load (ACTIVE and TESTING).
    async fn loadable(&self) -> Result<Vec<RuleRecord>, StoreError>;
    async fn list(&self, status: Option<RuleStatus>) -> Result<Vec<RuleRecord>, StoreError>;
    /// Apply a partial update. No-op updates leave the version untouched.
    async fn update(&self, id: &str, update: RuleUpdate) -> Result<RuleRecord, StoreError>;
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

fn apply_update(record: &mut RuleRecord, update: RuleUpdate) {
    if update.is_empty() {
        return;
    }
    if let Some(name) = update.name {
        record.name = name;
    }
    if let Some(description) = update.description {
        record.description = description;
    }
    if let Some(status) = update.status {
        record.status = status;
    }
    if let Some(severity) = update.severity {
        record.severity = severity;
    }
    if let Some(tags) = update.tags {
        record.tags = tags;
    }
    if let Some(config) = update.config {
        if config != record.config {
            record.config = config;
            record.bump_patch();
        }
    }
    record.updated_at = Utc::now();
}

/// In-memory rule store for tests.
#[derive(Debug, Default)]
pub struct MemRuleStore {
    rules: RwLock<Vec<RuleRecord>>,
}

impl MemRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemRuleStore {
    async fn insert(&self, record: RuleRecord) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        rules.push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RuleRecord>, StoreError> {
        Ok(self.rules.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn loadable(&self) -> Result<Vec<RuleRecord>, StoreError> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.status.is_loadable())
            .cloned()
            .collect())
    }

    async fn list(&self, status: Option<RuleStatus>) -> Result<Vec<RuleRecord>, StoreError> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, update: RuleUpdate) -> Result<RuleRecord, StoreError> {
        let mut rules = self.rules.write().await;
        let record = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_update(record, update);
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        Ok(rules.len() < before)
    }
}

/// SQLite-backed rule store.
pub struct SqliteRuleStore {
    pool: SqlitePool,
}

impl SqliteRuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<RuleRecord, StoreError> {
        let status: String = row.try_get("status")?;
        let severity: String = row.try_get("severity")?;
        let condition_type: String = row.try_get("condition_type")?;
        let config: String = row.try_get("config")?;
        let tags: String = row.try_get("tags")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(RuleRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            status: RuleStatus::parse(&status)
                .ok_or_else(|| StoreError::Serialization(format!("bad status {status:?}")))?,
            severity: Severity::parse(&severity)
                .ok_or_else(|| StoreError::Serialization(format!("bad severity {severity:?}")))?,
            condition_type: ConditionType::parse(&condition_type).ok_or_else(|| {
                StoreError::Serialization(format!("bad condition type {condition_type:?}"))
            })?,
            config: parse_json(&config)?,
            tags: parse_json(&tags)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    async fn write(&self, record: &RuleRecord, insert: bool) -> Result<(), StoreError> {
        let sql = if insert {
            "INSERT INTO security_rules \
             (id, name, description, version, status, severity, condition_type, config, tags, \
              created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        } else {
            "UPDATE security_rules SET name = ?2, description = ?3, version = ?4, status = ?5, \
             severity = ?6, condition_type = ?7, config = ?8, tags = ?9, created_at = ?10, \
             updated_at = ?11 WHERE id = ?1"
        };
        sqlx::query(sql)
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.description)
            .bind(&record.version)
            .bind(record.status.as_str())
            .bind(record.severity.as_str())
            .bind(record.condition_type.as_str())
            .bind(to_json(&record.config)?)
            .bind(to_json(&record.tags)?)
            .bind(fmt_ts(record.created_at))
            .bind(fmt_ts(record.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn insert(&self, record: RuleRecord) -> Result<(), StoreError> {
        if self.get(&record.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.write(&record, true).await
    }

    async fn get(&self, id: &str) -> Result<Option<RuleRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM security_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn loadable(&self) -> Result<Vec<RuleRecord>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM security_rules WHERE status IN ('ACTIVE', 'TESTING')")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list(&self, status: Option<RuleStatus>) -> Result<Vec<RuleRecord>, StoreError> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM security_rules WHERE status = ? ORDER BY id")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM security_rules ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update(&self, id: &str, update: RuleUpdate) -> Result<RuleRecord, StoreError> {
        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_update(&mut record, update);
        self.write(&record, false).await?;
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM security_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
