//! SQLite bootstrap: pool construction, pragmas, embedded migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use crate::error::StoreError;

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g. "sqlite:vigil.db?mode=rwc" or "sqlite::memory:").
    pub url: String,
    pub max_connections: u32,
    /// WAL journal mode for better read concurrency.
    pub wal_mode: bool,
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:vigil.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// In-memory database for tests. A single connection keeps the data
    /// visible across queries.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

/// Open a pool, apply pragmas and run the embedded migrations.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, StoreError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| StoreError::Connection(e.to_string()))?
        .pragma("foreign_keys", "ON")
        .pragma("busy_timeout", (config.busy_timeout_secs * 1_000).to_string());

    if config.wal_mode {
        options = options.pragma("journal_mode", "WAL");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StoreError::Connection(format!("Migration failed: {e}")))?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");
    Ok(pool)
}
