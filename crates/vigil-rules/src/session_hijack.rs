//! Session hijacking: one session id observed from shifting origins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    meta_keys, Action, ConditionType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SecurityEvent, Severity,
};

use crate::common::{parse_config, within_lookback, RuleMeta};

/// Configuration for [`SessionHijackRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionHijackConfig {
    pub lookback_minutes: i64,
    /// IP changes within one session tolerated before matching.
    pub max_session_ip_changes: usize,
}

impl Default for SessionHijackConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 60,
            max_session_ip_changes: 2,
        }
    }
}

/// PATTERN rule over a single session's history. Checks run in order (IP
/// hops, then user-agent swap, then country jump), returning the first hit,
/// which is also the most severe.
#[derive(Debug, Clone)]
pub struct SessionHijackRule {
    meta: RuleMeta,
    config: SessionHijackConfig,
}

impl SessionHijackRule {
    pub fn new(meta: RuleMeta, config: SessionHijackConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut out: Vec<&str> = values.collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[async_trait]
impl Rule for SessionHijackRule {
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
        self.config.lookback_minutes >= 1 && self.config.max_session_ip_changes >= 1
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: > {} IP changes, UA swap or country jump within one session",
            self.meta.name, self.meta.version, self.config.max_session_ip_changes
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        let Some(session_id) = event.session_id() else {
            return Ok(RuleEvaluation::no_match());
        };

        let mut session_events: Vec<&SecurityEvent> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.lookback_minutes)
                .filter(|e| e.session_id() == Some(session_id))
                .collect();
        session_events.push(event);
        session_events.sort_by_key(|e| e.timestamp);

        // (a) IP hops.
        let ips = distinct(
            session_events
                .iter()
                .filter_map(|e| e.ip_address.as_deref()),
        );
        if !ips.is_empty() && ips.len() - 1 >= self.config.max_session_ip_changes {
            let result = RuleEvaluation::matched(
                Severity::Critical,
                95,
                format!(
                    "Session {session_id} observed from {} distinct IP addresses",
                    ips.len()
                ),
            )
            .with_actions([
                Action::InvalidateSessions,
                Action::RequireTwoFactor,
                Action::BlockIp,
            ])
            .with_evidence("sessionId", json!(session_id))
            .with_evidence("ipAddresses", json!(ips))
            .with_evidence("ipChanges", json!(ips.len() - 1));
            return Ok(self.tag_result(result));
        }

        // (b) User-agent swap.
        let uas = distinct(session_events.iter().filter_map(|e| e.user_agent()));
        if uas.len() > 1 {
            let result = RuleEvaluation::matched(
                Severity::High,
                90,
                format!("Session {session_id} switched user agents mid-session"),
            )
            .with_actions([Action::InvalidateSessions, Action::RequireTwoFactor])
            .with_evidence("sessionId", json!(session_id))
            .with_evidence("userAgents", json!(uas));
            return Ok(self.tag_result(result));
        }

        // (c) Country jump.
        let countries = distinct(
            session_events
                .iter()
                .filter_map(|e| e.metadata.get_str(meta_keys::COUNTRY)),
        );
        if countries.len() > 1 {
            let result = RuleEvaluation::matched(
                Severity::High,
                85,
                format!("Session {session_id} observed from multiple countries"),
            )
            .with_actions([Action::InvalidateSessions, Action::RequireTwoFactor])
            .with_evidence("sessionId", json!(session_id))
            .with_evidence("countries", json!(countries));
            return Ok(self.tag_result(result));
        }

        Ok(RuleEvaluation::no_match())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use vigil_core::EventType;

    fn session_event(sid: &str, ip: &str, ts: chrono::DateTime<Utc>) -> SecurityEvent {
        let mut ev = SecurityEvent::new(EventType::SessionActivity);
        ev.session_id = Some(sid.to_string());
        ev.ip_address = Some(ip.to_string());
        ev.timestamp = ts;
        ev
    }

    fn rule() -> SessionHijackRule {
        SessionHijackRule::new(
            RuleMeta::named("session-hijack", "Session hijacking", Severity::High),
            SessionHijackConfig::default(),
        )
    }

    #[tokio::test]
    async fn three_ips_in_thirty_seconds_is_critical() {
        let now = Utc.with_ymd_and_hms(2025, 5, 3, 14, 0, 30).unwrap();
        let current = session_event("s1", "198.51.100.3", now);
        let recents = vec![
            session_event("s1", "198.51.100.1", now - Duration::seconds(30)),
            session_event("s1", "198.51.100.2", now - Duration::seconds(15)),
        ];

        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert_eq!(result.score, Some(95));
        assert!(result.suggested_actions.contains(&Action::InvalidateSessions));
        assert!(result.suggested_actions.contains(&Action::RequireTwoFactor));
        assert!(result.suggested_actions.contains(&Action::BlockIp));
        assert_eq!(result.evidence["ipChanges"], json!(2));
    }

    #[tokio::test]
    async fn user_agent_swap_is_high() {
        let now = Utc.with_ymd_and_hms(2025, 5, 3, 14, 0, 30).unwrap();
        let mut current = session_event("s2", "198.51.100.1", now);
        current.user_agent = Some("curl/8.0".to_string());
        let mut prior = session_event("s2", "198.51.100.1", now - Duration::minutes(5));
        prior.user_agent =
            Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/124.0".to_string());

        let result = rule()
            .evaluate(&RuleContext::new(current, vec![prior]))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::High));
        assert_eq!(result.score, Some(90));
        assert!(!result.suggested_actions.contains(&Action::BlockIp));
    }

    #[tokio::test]
    async fn country_jump_is_detected_last() {
        let now = Utc.with_ymd_and_hms(2025, 5, 3, 14, 0, 30).unwrap();
        let mut current = session_event("s3", "198.51.100.1", now);
        current.metadata.insert(meta_keys::COUNTRY, "JP");
        let mut prior = session_event("s3", "198.51.100.1", now - Duration::minutes(10));
        prior.metadata.insert(meta_keys::COUNTRY, "DE");

        let result = rule()
            .evaluate(&RuleContext::new(current, vec![prior]))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.score, Some(85));
        assert_eq!(result.evidence["countries"], json!(["DE", "JP"]));
    }

    #[tokio::test]
    async fn stable_session_does_not_match() {
        let now = Utc::now();
        let current = session_event("s4", "198.51.100.1", now);
        let recents = vec![
            session_event("s4", "198.51.100.1", now - Duration::minutes(5)),
            session_event("s4", "198.51.100.1", now - Duration::minutes(2)),
        ];
        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn other_sessions_do_not_bleed_in() {
        let now = Utc::now();
        let current = session_event("s5", "198.51.100.1", now);
        let recents = vec![
            session_event("other", "203.0.113.1", now - Duration::minutes(1)),
            session_event("other", "203.0.113.2", now - Duration::minutes(2)),
        ];
        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();
        assert!(!result.matched);
    }
}
