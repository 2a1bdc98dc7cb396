//! # Vigil Persistence
//!
//! Storage for the security subsystem:
//! - append-only, hash-chained log rows ([`LogStore`])
//! - detection-rule configuration ([`RuleStore`])
//! - the durable ingestion queue ([`SqliteQueue`])
//!
//! SQLite is the single-node backend; in-memory implementations back the
//! test suites.

pub mod codec;
pub mod error;
pub mod log_store;
pub mod queue;
pub mod rule_store;
pub mod sqlite;

pub use error::StoreError;
pub use log_store::{LogFilter, LogStatistics, LogStore, MemLogStore, SqliteLogStore};
pub use queue::SqliteQueue;
pub use rule_store::{MemRuleStore, RuleStore, RuleUpdate, SqliteRuleStore};
pub use sqlite::{connect, SqliteConfig};
