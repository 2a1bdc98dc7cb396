//! Credential stuffing: many distinct accounts tried from one origin IP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SecurityEvent, Severity,
};

use crate::common::{parse_config, within_lookback, RuleMeta};

/// Configuration for [`CredentialStuffingRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CredentialStuffingConfig {
    pub lookback_minutes: i64,
    /// Distinct emails from one IP needed to match.
    pub min_unique_users: usize,
    /// Gap below which two attempts count as rapid-sequential.
    pub max_time_between_attempts_ms: i64,
}

impl Default for CredentialStuffingConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 10,
            min_unique_users: 5,
            max_time_between_attempts_ms: 2_000,
        }
    }
}

/// PATTERN rule: login attempts from the same IP cycling through distinct
/// emails, the signature of breached-credential replay.
#[derive(Debug, Clone)]
pub struct CredentialStuffingRule {
    meta: RuleMeta,
    config: CredentialStuffingConfig,
}

impl CredentialStuffingRule {
    pub fn new(meta: RuleMeta, config: CredentialStuffingConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }
}

fn is_login(event: &SecurityEvent) -> bool {
    matches!(
        event.event_type,
        EventType::LoginFailed | EventType::LoginSuccess
    )
}

#[async_trait]
impl Rule for CredentialStuffingRule {
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
            && self.config.min_unique_users >= 2
            && self.config.max_time_between_attempts_ms > 0
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: >= {} distinct accounts from one IP within {} minutes",
            self.meta.name,
            self.meta.version,
            self.config.min_unique_users,
            self.config.lookback_minutes
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        let Some(ip) = event.ip_address.as_deref() else {
            return Ok(RuleEvaluation::no_match());
        };
        if ctx.recent_events.is_empty() || !is_login(event) {
            return Ok(RuleEvaluation::no_match());
        }

        let mut attempts: Vec<&SecurityEvent> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.lookback_minutes)
                .filter(|e| is_login(e) && e.ip_address.as_deref() == Some(ip))
                .collect();
        attempts.push(event);
        attempts.sort_by_key(|e| e.timestamp);

        let mut emails: Vec<&str> = attempts.iter().filter_map(|e| e.email()).collect();
        emails.sort_unstable();
        emails.dedup();
        let unique_users = emails.len();

        if unique_users < self.config.min_unique_users {
            return Ok(RuleEvaluation::no_match());
        }

        let total = attempts.len();
        let rapid_sequential = attempts
            .windows(2)
            .filter(|w| {
                (w[1].timestamp - w[0].timestamp).num_milliseconds()
                    < self.config.max_time_between_attempts_ms
            })
            .count();

        let score = ((unique_users as f64 / 10.0) * 50.0
            + (rapid_sequential as f64 / total as f64) * 50.0)
            .min(100.0) as u32;

        let result = RuleEvaluation::matched(
            Severity::Critical,
            score,
            format!(
                "{unique_users} distinct accounts attempted from {ip} within {} minutes",
                self.config.lookback_minutes
            ),
        )
        .with_actions([Action::BlockIp, Action::IncreaseMonitoring])
        .with_evidence("uniqueUsers", json!(unique_users))
        .with_evidence("totalAttempts", json!(total))
        .with_evidence("rapidSequential", json!(rapid_sequential))
        .with_evidence("ipAddress", json!(ip))
        .with_evidence("lookbackMinutes", json!(self.config.lookback_minutes));

        Ok(self.tag_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn attempt(email: &str, ip: &str, ts: chrono::DateTime<Utc>) -> SecurityEvent {
        let mut ev = SecurityEvent::new(EventType::LoginFailed);
        ev.email = Some(email.to_string());
        ev.ip_address = Some(ip.to_string());
        ev.timestamp = ts;
        ev
    }

    fn rule() -> CredentialStuffingRule {
        CredentialStuffingRule::new(
            RuleMeta::named("credential-stuffing", "Credential stuffing", Severity::Critical),
            CredentialStuffingConfig::default(),
        )
    }

    #[tokio::test]
    async fn five_accounts_in_five_seconds_is_critical() {
        let now = Utc.with_ymd_and_hms(2025, 5, 2, 8, 0, 4).unwrap();
        let current = attempt("user5@example.com", "10.0.0.1", now);
        let recents: Vec<_> = (1..=4)
            .map(|n| {
                attempt(
                    &format!("user{n}@example.com"),
                    "10.0.0.1",
                    now - Duration::seconds(5 - n as i64),
                )
            })
            .collect();

        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert_eq!(result.evidence["uniqueUsers"], json!(5));
        assert_eq!(result.evidence["totalAttempts"], json!(5));
        assert!(result.suggested_actions.contains(&Action::BlockIp));
        assert!(result
            .suggested_actions
            .contains(&Action::IncreaseMonitoring));
    }

    #[tokio::test]
    async fn same_account_retries_do_not_match() {
        let now = Utc::now();
        let current = attempt("one@example.com", "10.0.0.1", now);
        let recents: Vec<_> = (1..=6)
            .map(|n| attempt("one@example.com", "10.0.0.1", now - Duration::seconds(n)))
            .collect();
        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn other_ips_are_ignored() {
        let now = Utc::now();
        let current = attempt("user9@example.com", "10.0.0.1", now);
        let recents: Vec<_> = (1..=6)
            .map(|n| {
                attempt(
                    &format!("user{n}@example.com"),
                    "10.0.0.99",
                    now - Duration::seconds(n),
                )
            })
            .collect();
        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn slow_spray_scores_lower_than_rapid_burst() {
        let now = Utc.with_ymd_and_hms(2025, 5, 2, 8, 30, 0).unwrap();
        let slow_recents: Vec<_> = (1..=4)
            .map(|n| {
                attempt(
                    &format!("user{n}@example.com"),
                    "10.0.0.2",
                    now - Duration::minutes(2 * n as i64),
                )
            })
            .collect();
        let slow = rule()
            .evaluate(&RuleContext::new(
                attempt("user5@example.com", "10.0.0.2", now),
                slow_recents,
            ))
            .await
            .unwrap();

        let fast_recents: Vec<_> = (1..=4)
            .map(|n| {
                attempt(
                    &format!("user{n}@example.com"),
                    "10.0.0.2",
                    now - Duration::milliseconds(500 * n as i64),
                )
            })
            .collect();
        let fast = rule()
            .evaluate(&RuleContext::new(
                attempt("user5@example.com", "10.0.0.2", now),
                fast_recents,
            ))
            .await
            .unwrap();

        assert!(fast.score.unwrap() > slow.score.unwrap());
    }
}
