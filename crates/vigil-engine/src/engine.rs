//! The rule engine: registry, concurrent evaluation, statistics, and match
//! side-effects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{error, info, warn};

use vigil_core::{
    meta_keys, EventSink, EventType, Rule, RuleContext, RuleEvaluation, SecurityEvent, Severity,
};

use crate::bus::{AlertNotification, SecurityBus, ThreatDetected};

/// Engine-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid rule config for {0}")]
    InvalidRuleConfig(String),
}

/// Per-rule execution counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleStats {
    pub executions: u64,
    pub matches: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub avg_execution_ms: f64,
}

impl RuleStats {
    fn record(&mut self, elapsed_ms: f64) {
        self.executions += 1;
        self.last_execution = Some(Utc::now());
        // Running average over all executions.
        self.avg_execution_ms +=
            (elapsed_ms - self.avg_execution_ms) / self.executions as f64;
    }
}

/// Aggregated engine metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub registered_rules: usize,
    pub total_executions: u64,
    pub total_matches: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub per_rule: BTreeMap<String, RuleStats>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline per rule evaluation; a rule past it is cancelled and
    /// counted as timed out.
    pub rule_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rule_timeout: Duration::from_millis(500),
        }
    }
}

struct Registered {
    rule: Arc<dyn Rule>,
    stats: RuleStats,
}

/// The engine. Read-mostly registry behind an `RwLock`; evaluation
/// snapshots the registry so rule updates never block a running pass.
pub struct RuleEngine {
    registry: RwLock<HashMap<String, Registered>>,
    config: EngineConfig,
    bus: SecurityBus,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl RuleEngine {
    pub fn new(config: EngineConfig, bus: SecurityBus) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            config,
            bus,
            sink: RwLock::new(None),
        }
    }

    pub fn bus(&self) -> &SecurityBus {
        &self.bus
    }

    /// Attach the sink that receives synthesized SUSPICIOUS_ACTIVITY
    /// events. Wired after construction because the sink (the ingestor)
    /// needs the engine first.
    pub async fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write().await = Some(sink);
    }

    /// Register a rule, replacing any entry with the same id.
    pub async fn register(&self, rule: Arc<dyn Rule>) -> Result<(), EngineError> {
        if !rule.validate() {
            return Err(EngineError::InvalidRuleConfig(rule.id().to_string()));
        }
        let id = rule.id().to_string();
        info!(rule_id = %id, version = rule.version(), "Registering rule");
        self.registry.write().await.insert(
            id,
            Registered {
                rule,
                stats: RuleStats::default(),
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, rule_id: &str) -> bool {
        let removed = self.registry.write().await.remove(rule_id).is_some();
        if removed {
            info!(rule_id, "Unregistered rule");
        }
        removed
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        self.registry.read().await.keys().cloned().collect()
    }

    /// Evaluate every registered rule against the context concurrently.
    ///
    /// Result order is undefined. A rule erroring or timing out does not
    /// affect the others; both outcomes are counted and logged.
    pub async fn evaluate(&self, ctx: RuleContext) -> Vec<RuleEvaluation> {
        let snapshot: Vec<(String, Arc<dyn Rule>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(id, reg)| (id.clone(), reg.rule.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return Vec::new();
        }

        let ctx = Arc::new(ctx);
        let deadline = self.config.rule_timeout;

        let tasks = snapshot.into_iter().map(|(id, rule)| {
            let ctx = ctx.clone();
            async move {
                let started = std::time::Instant::now();
                let outcome = timeout(deadline, rule.evaluate(&ctx)).await;
                (id, started.elapsed().as_secs_f64() * 1_000.0, outcome)
            }
        });
        let outcomes = futures::future::join_all(tasks).await;

        let mut matches = Vec::new();
        {
            let mut registry = self.registry.write().await;
            for (id, elapsed_ms, outcome) in outcomes {
                let Some(reg) = registry.get_mut(&id) else {
                    continue;
                };
                reg.stats.record(elapsed_ms);
                match outcome {
                    Ok(Ok(result)) if result.matched => {
                        reg.stats.matches += 1;
                        matches.push(result);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        reg.stats.errors += 1;
                        error!(rule_id = %id, error = %e, "Rule evaluation failed");
                    }
                    Err(_) => {
                        reg.stats.timeouts += 1;
                        warn!(
                            rule_id = %id,
                            deadline_ms = deadline.as_millis() as u64,
                            "Rule evaluation timed out"
                        );
                    }
                }
            }
        }

        if !matches.is_empty() {
            self.dispatch(&ctx.event, &matches).await;
        }

        matches
    }

    /// Side effects for a batch of matches: threat aggregate, per-match
    /// alerts and follow-up events (severity >= HIGH), action notices.
    async fn dispatch(&self, event: &SecurityEvent, matches: &[RuleEvaluation]) {
        self.bus.publish_threat(ThreatDetected {
            event: event.clone(),
            results: matches.to_vec(),
            timestamp: Utc::now(),
        });

        let sink = self.sink.read().await.clone();

        for result in matches {
            let severity = result.severity.unwrap_or(Severity::Low);

            if severity >= Severity::High {
                self.bus.publish_alert(AlertNotification {
                    alert_type: result
                        .rule_name
                        .clone()
                        .unwrap_or_else(|| "rule-match".to_string()),
                    severity,
                    details: result.reason.clone().unwrap_or_default(),
                    additional_info: serde_json::json!({
                        "ruleName": result.rule_name,
                        "ruleId": result.rule_id,
                        "score": result.score,
                        "evidence": result.evidence,
                    }),
                });

                match &sink {
                    Some(sink) => {
                        if let Err(e) = sink.submit(synthesize_followup(event, result)).await {
                            error!(error = %e, "Failed to re-enqueue suspicious-activity event");
                        }
                    }
                    None => warn!("No event sink attached, suspicious activity not re-enqueued"),
                }
            }

            for action in &result.suggested_actions {
                self.bus.publish_action(*action, event, result);
            }
        }
    }

    pub async fn metrics(&self) -> EngineMetrics {
        let registry = self.registry.read().await;
        let mut metrics = EngineMetrics {
            registered_rules: registry.len(),
            ..EngineMetrics::default()
        };
        for (id, reg) in registry.iter() {
            metrics.total_executions += reg.stats.executions;
            metrics.total_matches += reg.stats.matches;
            metrics.total_errors += reg.stats.errors;
            metrics.total_timeouts += reg.stats.timeouts;
            metrics.per_rule.insert(id.clone(), reg.stats.clone());
        }
        metrics
    }
}

/// Build the SUSPICIOUS_ACTIVITY event describing a match. It re-enters
/// the queue instead of being persisted inline, so the pipeline never
/// recurses.
fn synthesize_followup(event: &SecurityEvent, result: &RuleEvaluation) -> SecurityEvent {
    let severity = result.severity.unwrap_or(Severity::Low);
    let mut followup = SecurityEvent::new(EventType::SuspiciousActivity);
    followup.severity = severity;
    followup.user_id = event.user_id().map(str::to_string);
    followup.email = event.email().map(str::to_string);
    followup.ip_address = event.ip_address.clone();
    followup.session_id = event.session_id().map(str::to_string);
    if let Some(rule_id) = &result.rule_id {
        followup.metadata.insert("ruleId", rule_id.as_str());
    }
    if let Some(rule_name) = &result.rule_name {
        followup.metadata.insert("ruleName", rule_name.as_str());
    }
    if let Some(score) = result.score {
        followup.metadata.insert("score", score as i64);
    }
    if let Some(reason) = &result.reason {
        followup.metadata.insert("reason", reason.as_str());
    }
    if !result.evidence.is_empty() {
        let evidence = serde_json::to_string(&result.evidence).unwrap_or_default();
        followup.metadata.insert("evidence", evidence);
    }
    if let Some(triggering) = event.metadata.get_str(meta_keys::LOCATION) {
        followup.metadata.insert(meta_keys::LOCATION, triggering);
    }
    followup
}
