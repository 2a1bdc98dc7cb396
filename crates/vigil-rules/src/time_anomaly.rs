//! Time anomalies: logins outside allowed hours or days, and logins inside
//! the overnight window a user has never used before.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, Severity,
};

use crate::common::{parse_config, within_lookback, RuleMeta};

/// Inclusive hour range in UTC; wraps midnight when `start > end`
/// (`22..=6` covers 22:00–06:59).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&hour)
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// Configuration for [`TimeAnomalyRule`]. Days use 0 = Monday .. 6 = Sunday.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeAnomalyConfig {
    pub allowed_hours: Option<HourRange>,
    pub allowed_days: Option<Vec<u32>>,
    pub suspicious_hours: HourRange,
    /// When set, an overnight hour the user has logged in at before is
    /// treated as benign.
    pub check_user_pattern: bool,
    /// How much history to mine for the user's hour pattern.
    pub pattern_lookback_minutes: i64,
}

impl Default for TimeAnomalyConfig {
    fn default() -> Self {
        Self {
            allowed_hours: None,
            allowed_days: None,
            suspicious_hours: HourRange { start: 0, end: 6 },
            check_user_pattern: true,
            pattern_lookback_minutes: 60 * 24 * 30,
        }
    }
}

/// TIME_BASED rule on the login instant (UTC).
#[derive(Debug, Clone)]
pub struct TimeAnomalyRule {
    meta: RuleMeta,
    config: TimeAnomalyConfig,
}

impl TimeAnomalyRule {
    pub fn new(meta: RuleMeta, config: TimeAnomalyConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }
}

#[async_trait]
impl Rule for TimeAnomalyRule {
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
        ConditionType::TimeBased
    }
    fn tags(&self) -> &[String] {
        &self.meta.tags
    }

    fn validate(&self) -> bool {
        let hours_ok = |r: &HourRange| r.start < 24 && r.end < 24;
        self.config.allowed_hours.as_ref().map_or(true, hours_ok)
            && hours_ok(&self.config.suspicious_hours)
            && self
                .config
                .allowed_days
                .as_ref()
                .is_none_or(|days| days.iter().all(|d| *d < 7))
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: out-of-hours and overnight login detection",
            self.meta.name, self.meta.version
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if event.event_type != EventType::LoginSuccess {
            return Ok(RuleEvaluation::no_match());
        }

        let hour = event.timestamp.hour();
        let weekday = event.timestamp.weekday().num_days_from_monday();

        if let Some(allowed) = &self.config.allowed_hours {
            if !allowed.contains(hour) {
                let result = RuleEvaluation::matched(
                    Severity::High,
                    75,
                    format!("Login at {hour:02}:00 UTC, outside allowed hours"),
                )
                .with_actions([Action::RequireTwoFactor, Action::IncreaseMonitoring])
                .with_evidence("hour", json!(hour))
                .with_evidence("allowedStart", json!(allowed.start))
                .with_evidence("allowedEnd", json!(allowed.end));
                return Ok(self.tag_result(result));
            }
        }

        if let Some(days) = &self.config.allowed_days {
            if !days.contains(&weekday) {
                let result = RuleEvaluation::matched(
                    Severity::Medium,
                    60,
                    format!("Login on {}, outside allowed days", event.timestamp.weekday()),
                )
                .with_action(Action::IncreaseMonitoring)
                .with_evidence("weekday", json!(weekday));
                return Ok(self.tag_result(result));
            }
        }

        if self.config.suspicious_hours.contains(hour) {
            let history_hours: Vec<u32> = if self.config.check_user_pattern {
                within_lookback(
                    &ctx.recent_events,
                    event.timestamp,
                    self.config.pattern_lookback_minutes,
                )
                .filter(|e| {
                    e.event_type == EventType::LoginSuccess && e.user_id() == event.user_id()
                })
                .map(|e| e.timestamp.hour())
                .collect()
            } else {
                Vec::new()
            };

            if self.config.check_user_pattern && history_hours.contains(&hour) {
                // The user habitually logs in at this hour.
                return Ok(RuleEvaluation::no_match());
            }

            let (severity, score) = if self.config.check_user_pattern && history_hours.is_empty() {
                // No pattern data to judge against.
                (Severity::Low, 40)
            } else {
                (Severity::Medium, 55)
            };
            let result = RuleEvaluation::matched(
                severity,
                score,
                format!("Login at {hour:02}:00 UTC inside the suspicious overnight window"),
            )
            .with_action(Action::IncreaseMonitoring)
            .with_evidence("hour", json!(hour))
            .with_evidence("knownHours", json!(history_hours));
            return Ok(self.tag_result(result));
        }

        Ok(RuleEvaluation::no_match())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use vigil_core::SecurityEvent;

    fn login(user: &str, ts: chrono::DateTime<Utc>) -> SecurityEvent {
        let mut ev = SecurityEvent::new(EventType::LoginSuccess);
        ev.user_id = Some(user.to_string());
        ev.timestamp = ts;
        ev
    }

    fn rule(config: TimeAnomalyConfig) -> TimeAnomalyRule {
        TimeAnomalyRule::new(
            RuleMeta::named("time-anomaly", "Time anomaly", Severity::Medium),
            config,
        )
    }

    #[tokio::test]
    async fn outside_allowed_hours_is_high() {
        let config = TimeAnomalyConfig {
            allowed_hours: Some(HourRange { start: 8, end: 18 }),
            ..TimeAnomalyConfig::default()
        };
        let ts = Utc.with_ymd_and_hms(2025, 5, 7, 22, 15, 0).unwrap();
        let result = rule(config)
            .evaluate(&RuleContext::new(login("u", ts), vec![]))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::High));
        assert!(result.suggested_actions.contains(&Action::RequireTwoFactor));
    }

    #[tokio::test]
    async fn weekend_login_is_medium_when_days_are_restricted() {
        let config = TimeAnomalyConfig {
            allowed_days: Some(vec![0, 1, 2, 3, 4]),
            ..TimeAnomalyConfig::default()
        };
        // 2025-05-10 is a Saturday.
        let ts = Utc.with_ymd_and_hms(2025, 5, 10, 12, 0, 0).unwrap();
        let result = rule(config)
            .evaluate(&RuleContext::new(login("u", ts), vec![]))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Medium));
    }

    #[tokio::test]
    async fn overnight_login_with_matching_history_is_benign() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 7, 3, 0, 0).unwrap();
        let history = vec![
            login("u", ts - Duration::days(1)),
            login("u", ts - Duration::days(7)),
        ];
        let result = rule(TimeAnomalyConfig::default())
            .evaluate(&RuleContext::new(login("u", ts), history))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn overnight_login_with_daytime_history_is_medium() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 7, 3, 0, 0).unwrap();
        let history: Vec<_> = (1..=5)
            .map(|d| login("u", Utc.with_ymd_and_hms(2025, 5, 7 - d, 14, 0, 0).unwrap()))
            .collect();
        let result = rule(TimeAnomalyConfig::default())
            .evaluate(&RuleContext::new(login("u", ts), history))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Medium));
    }

    #[tokio::test]
    async fn overnight_login_without_history_is_low() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 7, 3, 0, 0).unwrap();
        let result = rule(TimeAnomalyConfig::default())
            .evaluate(&RuleContext::new(login("u", ts), vec![]))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Low));
    }

    #[tokio::test]
    async fn daytime_login_is_clean() {
        let ts = Utc.with_ymd_and_hms(2025, 5, 7, 14, 0, 0).unwrap();
        let result = rule(TimeAnomalyConfig::default())
            .evaluate(&RuleContext::new(login("u", ts), vec![]))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[test]
    fn hour_range_wraps_midnight() {
        let range = HourRange { start: 22, end: 6 };
        assert!(range.contains(23));
        assert!(range.contains(2));
        assert!(!range.contains(12));
    }
}
