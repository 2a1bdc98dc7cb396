//! The rule contract: what a detection heuristic looks like to the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::event::{SecurityEvent, Severity};

/// Lifecycle status of a configured rule. Only ACTIVE and TESTING rules are
/// loaded into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Active,
    Testing,
    Inactive,
    Deprecated,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Testing => "TESTING",
            Self::Inactive => "INACTIVE",
            Self::Deprecated => "DEPRECATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "TESTING" => Some(Self::Testing),
            "INACTIVE" => Some(Self::Inactive),
            "DEPRECATED" => Some(Self::Deprecated),
            _ => None,
        }
    }

    /// Whether the engine should load rules in this status.
    pub fn is_loadable(&self) -> bool {
        matches!(self, Self::Active | Self::Testing)
    }
}

/// Condition family; determines the shape of the rule's `config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Threshold,
    Pattern,
    TimeBased,
    GeoBased,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "THRESHOLD",
            Self::Pattern => "PATTERN",
            Self::TimeBased => "TIME_BASED",
            Self::GeoBased => "GEO_BASED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "THRESHOLD" => Some(Self::Threshold),
            "PATTERN" => Some(Self::Pattern),
            "TIME_BASED" => Some(Self::TimeBased),
            "GEO_BASED" => Some(Self::GeoBased),
            _ => None,
        }
    }
}

/// Mitigation a matched rule recommends. Enforcement is external.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    BlockIp,
    #[serde(rename = "REQUIRE_2FA")]
    RequireTwoFactor,
    InvalidateSessions,
    IncreaseMonitoring,
}

impl Action {
    /// Broadcast channel this action publishes on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::BlockIp => "security.block.ip",
            Self::RequireTwoFactor => "security.require.2fa",
            Self::InvalidateSessions => "security.invalidate.sessions",
            Self::IncreaseMonitoring => "security.increase.monitoring",
        }
    }
}

/// A configured rule row, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub status: RuleStatus,
    pub severity: Severity,
    pub condition_type: ConditionType,
    pub config: serde_json::Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleRecord {
    /// Bump the patch component of the semver version, used when `config`
    /// changes. Unparseable versions reset to 1.0.1.
    pub fn bump_patch(&mut self) {
        self.version = match semver::Version::parse(&self.version) {
            Ok(mut v) => {
                v.patch += 1;
                v.to_string()
            }
            Err(_) => "1.0.1".to_string(),
        };
    }
}

/// Evaluation input: the current event plus a bounded, chronologically
/// ordered window of prior events.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub event: SecurityEvent,
    pub recent_events: Vec<SecurityEvent>,
}

impl RuleContext {
    pub fn new(event: SecurityEvent, mut recent_events: Vec<SecurityEvent>) -> Self {
        recent_events.sort_by_key(|e| e.timestamp);
        Self {
            event,
            recent_events,
        }
    }
}

/// Outcome of evaluating one rule against one context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub evidence: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub suggested_actions: BTreeSet<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl RuleEvaluation {
    pub fn no_match() -> Self {
        Self::default()
    }

    pub fn matched(severity: Severity, score: u32, reason: impl Into<String>) -> Self {
        Self {
            matched: true,
            severity: Some(severity),
            score: Some(score.min(100) as u8),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.suggested_actions.insert(action);
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.suggested_actions.extend(actions);
        self
    }

    pub fn with_evidence(mut self, key: &str, value: serde_json::Value) -> Self {
        self.evidence.insert(key.to_string(), value);
        self
    }
}

/// Errors surfaced by rule construction and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule config: {0}")]
    InvalidConfig(String),
    #[error("rule evaluation failed: {0}")]
    Evaluation(String),
}

/// A detection heuristic.
///
/// Implementations are polymorphic over {evaluate, validate, describe} and
/// are registered with the engine keyed by `id`. `evaluate` must be safe to
/// run concurrently with other rules and is subject to an engine deadline.
#[async_trait]
pub trait Rule: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn version(&self) -> &str;
    fn status(&self) -> RuleStatus;
    fn severity(&self) -> Severity;
    fn condition_type(&self) -> ConditionType;
    fn tags(&self) -> &[String];

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError>;

    /// Whether the rule's configuration is usable. Rules failing validation
    /// are refused at registration.
    fn validate(&self) -> bool;

    fn describe(&self) -> String {
        format!("{} v{} ({})", self.name(), self.version(), self.id())
    }

    /// Stamp identity fields onto an evaluation result.
    fn tag_result(&self, mut result: RuleEvaluation) -> RuleEvaluation {
        result.rule_id = Some(self.id().to_string());
        result.rule_name = Some(self.name().to_string());
        result.tags = self.tags().to_vec();
        result
    }
}

/// Errors from handing an event back into the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),
}

/// Where synthesized events (rule matches) are re-submitted.
///
/// Implemented by the queue-backed ingestor; keeping the seam here lets the
/// engine publish follow-up events without depending on the queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: SecurityEvent) -> Result<Uuid, SinkError>;
}
