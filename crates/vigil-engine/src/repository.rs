//! Rule repository: loads configuration rows, instantiates implementations
//! and keeps the engine in sync with the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use vigil_persist::RuleStore;
use vigil_rules::instantiate;

use crate::engine::RuleEngine;

/// Keeps the engine registry synchronized with the persisted rule rows.
///
/// The cache maps rule id to the version last registered; hot reload diffs
/// versions instead of re-instantiating everything each tick.
pub struct RuleRepository {
    store: Arc<dyn RuleStore>,
    engine: Arc<RuleEngine>,
    cache: RwLock<HashMap<String, String>>,
}

impl RuleRepository {
    pub fn new(store: Arc<dyn RuleStore>, engine: Arc<RuleEngine>) -> Self {
        Self {
            store,
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load every ACTIVE/TESTING row and register it. Returns how many
    /// rules are live afterwards. Rows that fail to instantiate or
    /// validate are skipped and logged, never fatal.
    pub async fn sync(&self) -> Result<usize, vigil_persist::StoreError> {
        let records = self.store.loadable().await?;
        let mut cache = self.cache.write().await;
        let mut seen: HashMap<String, String> = HashMap::new();

        for record in records {
            seen.insert(record.id.clone(), record.version.clone());
            if cache.get(&record.id) == Some(&record.version) {
                continue;
            }
            match instantiate(&record) {
                Ok(rule) => match self.engine.register(rule).await {
                    Ok(()) => {
                        cache.insert(record.id.clone(), record.version.clone());
                    }
                    Err(e) => {
                        warn!(rule_id = %record.id, error = %e, "Rule refused by engine");
                    }
                },
                Err(e) => {
                    error!(rule_id = %record.id, error = %e, "Rule instantiation failed");
                }
            }
        }

        // Rows deleted or demoted out of ACTIVE/TESTING drop out of the
        // engine.
        let stale: Vec<String> = cache
            .keys()
            .filter(|id| !seen.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            self.engine.unregister(&id).await;
            cache.remove(&id);
        }

        Ok(cache.len())
    }

    /// Run `sync` on a fixed interval until shutdown flips. The first sync
    /// is expected to have run at startup; this keeps drift bounded.
    pub async fn hot_reload(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "Rule hot-reload loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync().await {
                        error!(error = %e, "Rule hot reload failed, keeping current registry");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Rule hot-reload loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SecurityBus;
    use crate::engine::EngineConfig;
    use chrono::Utc;
    use vigil_core::{ConditionType, RuleRecord, RuleStatus, Severity};
    use vigil_persist::{MemRuleStore, RuleUpdate};

    fn record(id: &str, condition_type: ConditionType, status: RuleStatus) -> RuleRecord {
        RuleRecord {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            status,
            severity: Severity::Medium,
            condition_type,
            config: serde_json::Value::Null,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn engine() -> Arc<RuleEngine> {
        Arc::new(RuleEngine::new(EngineConfig::default(), SecurityBus::new()))
    }

    #[tokio::test]
    async fn sync_registers_loadable_rows_only() {
        let store = Arc::new(MemRuleStore::new());
        store
            .insert(record("bf", ConditionType::Threshold, RuleStatus::Active))
            .await
            .unwrap();
        store
            .insert(record("geo", ConditionType::GeoBased, RuleStatus::Testing))
            .await
            .unwrap();
        store
            .insert(record("off", ConditionType::TimeBased, RuleStatus::Inactive))
            .await
            .unwrap();

        let engine = engine();
        let repo = RuleRepository::new(store, engine.clone());
        assert_eq!(repo.sync().await.unwrap(), 2);

        let mut ids = engine.registered_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["bf", "geo"]);
    }

    #[tokio::test]
    async fn sync_picks_up_updates_and_deletes() {
        let store = Arc::new(MemRuleStore::new());
        store
            .insert(record("bf", ConditionType::Threshold, RuleStatus::Active))
            .await
            .unwrap();

        let engine = engine();
        let repo = RuleRepository::new(store.clone(), engine.clone());
        repo.sync().await.unwrap();
        assert_eq!(engine.registered_ids().await, vec!["bf"]);

        // Version bump re-registers; deletion unregisters.
        store
            .update(
                "bf",
                RuleUpdate {
                    config: Some(serde_json::json!({"threshold": 9})),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap();
        store
            .insert(record("geo", ConditionType::GeoBased, RuleStatus::Active))
            .await
            .unwrap();
        assert_eq!(repo.sync().await.unwrap(), 2);

        store.delete("bf").await.unwrap();
        assert_eq!(repo.sync().await.unwrap(), 1);
        assert_eq!(engine.registered_ids().await, vec!["geo"]);
    }

    #[tokio::test]
    async fn broken_rows_are_skipped_not_fatal() {
        let store = Arc::new(MemRuleStore::new());
        let mut bad = record("bad", ConditionType::Threshold, RuleStatus::Active);
        bad.config = serde_json::json!({"threshold": "NaN"});
        store.insert(bad).await.unwrap();
        store
            .insert(record("ok", ConditionType::GeoBased, RuleStatus::Active))
            .await
            .unwrap();

        let engine = engine();
        let repo = RuleRepository::new(store, engine.clone());
        assert_eq!(repo.sync().await.unwrap(), 1);
        assert_eq!(engine.registered_ids().await, vec!["ok"]);
    }
}
