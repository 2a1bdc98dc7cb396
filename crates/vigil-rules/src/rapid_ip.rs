//! Rapid IP change: one account surfacing from many addresses in quick
//! succession, including ping-pong alternation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SecurityEvent, Severity,
};

use crate::common::{ip_whitelisted, parse_config, within_lookback, RuleMeta};

/// Configuration for [`RapidIpChangeRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RapidIpChangeConfig {
    pub lookback_minutes: i64,
    /// Distinct IPs tolerated before `too_many_ips` fires.
    pub max_ip_changes: usize,
    /// Inter-change gap below which a change counts as rapid.
    pub min_time_between_changes_seconds: i64,
    /// Exact IPs or prefixes (`"10.0."`) that never count as changes.
    pub whitelist: Vec<String>,
}

impl Default for RapidIpChangeConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 30,
            max_ip_changes: 3,
            min_time_between_changes_seconds: 60,
            whitelist: Vec::new(),
        }
    }
}

/// PATTERN rule over one user's address sequence.
#[derive(Debug, Clone)]
pub struct RapidIpChangeRule {
    meta: RuleMeta,
    config: RapidIpChangeConfig,
}

impl RapidIpChangeRule {
    pub fn new(meta: RuleMeta, config: RapidIpChangeConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }
}

fn relevant(event: &SecurityEvent) -> bool {
    matches!(
        event.event_type,
        EventType::LoginSuccess | EventType::SessionActivity
    )
}

#[async_trait]
impl Rule for RapidIpChangeRule {
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
        ConditionType::Pattern
    }
    fn tags(&self) -> &[String] {
        &self.meta.tags
    }

    fn validate(&self) -> bool {
        self.config.lookback_minutes >= 1
            && self.config.max_ip_changes >= 1
            && self.config.min_time_between_changes_seconds >= 1
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: > {} IPs or changes faster than {} s per user",
            self.meta.name,
            self.meta.version,
            self.config.max_ip_changes,
            self.config.min_time_between_changes_seconds
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if !relevant(event) {
            return Ok(RuleEvaluation::no_match());
        }
        let (Some(user_id), Some(ip)) = (event.user_id(), event.ip_address.as_deref()) else {
            return Ok(RuleEvaluation::no_match());
        };
        if ip_whitelisted(ip, &self.config.whitelist) {
            return Ok(RuleEvaluation::no_match());
        }

        // Address observations for this user, oldest first, whitelist removed.
        let mut observations: Vec<(&str, chrono::DateTime<chrono::Utc>)> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.lookback_minutes)
                .filter(|e| relevant(e) && e.user_id() == Some(user_id))
                .filter_map(|e| e.ip_address.as_deref().map(|ip| (ip, e.timestamp)))
                .filter(|(ip, _)| !ip_whitelisted(ip, &self.config.whitelist))
                .collect();
        observations.push((ip, event.timestamp));
        observations.sort_by_key(|(_, ts)| *ts);

        // Compress consecutive repeats into a change sequence.
        let mut changes: Vec<(&str, chrono::DateTime<chrono::Utc>)> = Vec::new();
        for (ip, ts) in observations {
            if changes.last().map(|(last, _)| *last) != Some(ip) {
                changes.push((ip, ts));
            }
        }

        let mut distinct: Vec<&str> = changes.iter().map(|(ip, _)| *ip).collect();
        distinct.sort_unstable();
        distinct.dedup();
        let distinct_ips = distinct.len();

        let rapid_count = changes
            .windows(2)
            .filter(|w| {
                (w[1].1 - w[0].1).num_seconds() < self.config.min_time_between_changes_seconds
            })
            .count();
        let rapid = rapid_count > 0;

        let ips: Vec<&str> = changes.iter().map(|(ip, _)| *ip).collect();
        let ping_pong = ips.windows(4).any(|w| w[0] == w[2] && w[1] == w[3] && w[0] != w[1]);

        let too_many = distinct_ips > self.config.max_ip_changes;

        if !(too_many || rapid || ping_pong) {
            return Ok(RuleEvaluation::no_match());
        }

        let patterns = [too_many, rapid, ping_pong].iter().filter(|p| **p).count();
        let severity = if patterns >= 3 {
            Severity::Critical
        } else if rapid || ping_pong || distinct_ips > 5 {
            Severity::High
        } else {
            Severity::Medium
        };

        let mut score = (15 * distinct_ips as u32).min(45);
        if rapid {
            score += 25;
        }
        if ping_pong {
            score += 20;
        }
        if too_many {
            score += 10;
        }
        if rapid_count > 2 {
            score += 10;
        }

        let mut result = RuleEvaluation::matched(
            severity,
            score,
            format!(
                "User {user_id} seen from {distinct_ips} IP addresses within {} minutes",
                self.config.lookback_minutes
            ),
        )
        .with_actions([Action::RequireTwoFactor, Action::IncreaseMonitoring]);

        if patterns > 1 || distinct_ips > 4 {
            result = result.with_action(Action::InvalidateSessions);
        }
        if rapid && rapid_count > 2 {
            result = result.with_action(Action::BlockIp);
        }

        result = result
            .with_evidence("distinctIps", json!(distinct_ips))
            .with_evidence("ipSequence", json!(ips))
            .with_evidence("rapidChanges", json!(rapid_count))
            .with_evidence("pingPong", json!(ping_pong))
            .with_evidence("tooManyIps", json!(too_many));

        Ok(self.tag_result(result))
    }
}
