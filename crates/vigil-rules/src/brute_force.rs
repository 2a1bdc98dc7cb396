//! Brute-force detection: repeated failed logins against one target.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, Severity,
};

use crate::common::{mean_interval_ms, parse_config, within_lookback, RuleMeta, Target};

/// Configuration for [`BruteForceRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BruteForceConfig {
    /// Failed attempts (including the triggering one) needed to match.
    pub threshold: u32,
    pub time_window_minutes: i64,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            time_window_minutes: 15,
        }
    }
}

/// THRESHOLD rule: counts failed logins to the same target (user id, then
/// email, then IP) inside the window, with escalation for distributed and
/// automated patterns.
#[derive(Debug, Clone)]
pub struct BruteForceRule {
    meta: RuleMeta,
    config: BruteForceConfig,
}

impl BruteForceRule {
    pub fn new(meta: RuleMeta, config: BruteForceConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }

    fn ladder(&self, attempts: u32) -> Severity {
        if attempts >= 20 {
            Severity::Critical
        } else if attempts > 10 {
            Severity::High
        } else if attempts >= 7 {
            Severity::Medium
        } else {
            // Below the ladder the configured base severity applies.
            self.meta.severity.max(Severity::Medium)
        }
    }
}

#[async_trait]
impl Rule for BruteForceRule {
    fn id(&self) -> &str {
        &self.meta.id
    }
    fn name(&self) -> &str {
        &self.meta.name
    }
    fn description(&self) -> &str {
        &self.meta.description
    }
    fn version(&self) -> &str {
        &self.meta.version
    }
    fn status(&self) -> RuleStatus {
        self.meta.status
    }
    fn severity(&self) -> Severity {
        self.meta.severity
    }
    fn condition_type(&self) -> ConditionType {
        ConditionType::Threshold
    }
    fn tags(&self) -> &[String] {
        &self.meta.tags
    }

    fn validate(&self) -> bool {
        self.config.threshold >= 1 && self.config.time_window_minutes >= 1
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: >= {} failed logins within {} minutes",
            self.meta.name, self.meta.version, self.config.threshold, self.config.time_window_minutes
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if event.event_type != EventType::LoginFailed {
            return Ok(RuleEvaluation::no_match());
        }
        let Some(target) = Target::of(event) else {
            return Ok(RuleEvaluation::no_match());
        };

        let related: Vec<_> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.time_window_minutes)
                .filter(|e| e.event_type == EventType::LoginFailed && target.matches(e))
                .collect();

        let attempts = related.len() as u32 + 1;
        if attempts < self.config.threshold {
            return Ok(RuleEvaluation::no_match());
        }

        let mut timestamps: Vec<_> = related.iter().map(|e| e.timestamp).collect();
        timestamps.push(event.timestamp);
        timestamps.sort();

        let mut ips: Vec<&str> = related
            .iter()
            .chain(std::iter::once(&event))
            .filter_map(|e| e.ip_address.as_deref())
            .collect();
        ips.sort_unstable();
        ips.dedup();
        let unique_ips = ips.len() as u32;

        let mut uas: Vec<&str> = related
            .iter()
            .chain(std::iter::once(&event))
            .filter_map(|e| e.user_agent())
            .collect();
        uas.sort_unstable();
        uas.dedup();
        let unique_uas = uas.len() as u32;

        let distributed = unique_ips > 1;
        let avg_interval = mean_interval_ms(&timestamps);
        let automated = avg_interval.is_some_and(|ms| ms < 1_000.0);

        let mut severity = self.ladder(attempts);
        if distributed {
            severity = severity.escalate();
        }

        let mut score = (attempts * 10).min(50);
        if distributed {
            score += 20;
        }
        if automated {
            score += 15;
        }
        if unique_uas > 3 {
            score += 10;
        }
        if attempts > 15 {
            score += 5;
        }

        let mut result = RuleEvaluation::matched(
            severity,
            score,
            format!(
                "{} failed login attempts against {} {} within {} minutes",
                attempts,
                target.kind(),
                target.value(),
                self.config.time_window_minutes
            ),
        )
        .with_action(Action::BlockIp);

        if attempts > 10 || distributed {
            result = result.with_action(Action::InvalidateSessions);
        }
        if attempts > 15 || distributed {
            result = result.with_action(Action::RequireTwoFactor);
        }
        if automated {
            result = result.with_action(Action::IncreaseMonitoring);
        }

        result = result
            .with_evidence("failedAttempts", json!(attempts))
            .with_evidence("uniqueIps", json!(unique_ips))
            .with_evidence("uniqueUserAgents", json!(unique_uas))
            .with_evidence("isDistributed", json!(distributed))
            .with_evidence("isAutomated", json!(automated))
            .with_evidence("windowMinutes", json!(self.config.time_window_minutes))
            .with_evidence("target", json!(target.value()))
            .with_evidence("targetType", json!(target.kind()));
        if let Some(ms) = avg_interval {
            result = result.with_evidence("avgIntervalMs", json!(ms));
        }

        Ok(self.tag_result(result))
    }
}
