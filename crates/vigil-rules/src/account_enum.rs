//! Account enumeration: failed-login bursts walking through usernames that
//! are sequential or near-identical.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SecurityEvent, Severity,
};

use crate::common::{parse_config, within_lookback, RuleMeta};

fn numbered_username() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)(\d+)$").expect("static regex"))
}

/// Configuration for [`AccountEnumerationRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccountEnumerationConfig {
    pub lookback_minutes: i64,
    /// Failed attempts from one IP needed before the checks run.
    pub min_attempts: usize,
    /// Length of a consecutive-integer username run that matches.
    pub sequential_threshold: usize,
    /// Mean pairwise Levenshtein similarity that matches.
    pub similarity_threshold: f64,
}

impl Default for AccountEnumerationConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 10,
            min_attempts: 5,
            sequential_threshold: 3,
            similarity_threshold: 0.8,
        }
    }
}

/// PATTERN rule over the usernames behind one IP's failed logins.
#[derive(Debug, Clone)]
pub struct AccountEnumerationRule {
    meta: RuleMeta,
    config: AccountEnumerationConfig,
}

impl AccountEnumerationRule {
    pub fn new(meta: RuleMeta, config: AccountEnumerationConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }
}

/// Username behind an attempt: email local part, else user id.
fn username_of(event: &SecurityEvent) -> Option<&str> {
    if let Some(email) = event.email() {
        return Some(email.split('@').next().unwrap_or(email));
    }
    event.user_id()
}

/// Longest run of consecutive integers among same-stem numbered usernames
/// (`user1, user2, user3` → 3).
fn longest_sequential_run(usernames: &[&str]) -> usize {
    let mut stems: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for name in usernames {
        if let Some(caps) = numbered_username().captures(name) {
            if let Ok(n) = caps[2].parse::<u64>() {
                let stem = caps.get(1).map_or("", |m| m.as_str());
                stems.entry(stem).or_default().push(n);
            }
        }
    }

    let mut best = 0;
    for numbers in stems.values_mut() {
        numbers.sort_unstable();
        numbers.dedup();
        let mut run = 1;
        for pair in numbers.windows(2) {
            if pair[1] == pair[0] + 1 {
                run += 1;
                best = best.max(run);
            } else {
                run = 1;
            }
        }
        best = best.max(run.min(numbers.len()));
    }
    best
}

/// Mean pairwise normalized Levenshtein similarity; `None` below two names.
fn mean_similarity(usernames: &[&str]) -> Option<f64> {
    if usernames.len() < 2 {
        return None;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..usernames.len() {
        for j in (i + 1)..usernames.len() {
            total += strsim::normalized_levenshtein(usernames[i], usernames[j]);
            pairs += 1;
        }
    }
    Some(total / pairs as f64)
}

#[async_trait]
impl Rule for AccountEnumerationRule {
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
            && self.config.min_attempts >= 2
            && self.config.sequential_threshold >= 2
            && (0.0..=1.0).contains(&self.config.similarity_threshold)
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: sequential or near-identical usernames behind one IP",
            self.meta.name, self.meta.version
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if event.event_type != EventType::LoginFailed {
            return Ok(RuleEvaluation::no_match());
        }
        let Some(ip) = event.ip_address.as_deref() else {
            return Ok(RuleEvaluation::no_match());
        };

        let mut failures: Vec<&SecurityEvent> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.lookback_minutes)
                .filter(|e| {
                    e.event_type == EventType::LoginFailed
                        && e.ip_address.as_deref() == Some(ip)
                })
                .collect();
        failures.push(event);

        if failures.len() < self.config.min_attempts {
            return Ok(RuleEvaluation::no_match());
        }

        let mut usernames: Vec<&str> = failures.iter().filter_map(|e| username_of(e)).collect();
        usernames.sort_unstable();
        usernames.dedup();

        let sequential = longest_sequential_run(&usernames);
        let similarity = mean_similarity(&usernames);

        let sequential_hit = sequential >= self.config.sequential_threshold;
        let similarity_hit =
            similarity.is_some_and(|s| s >= self.config.similarity_threshold);

        if !(sequential_hit || similarity_hit) {
            return Ok(RuleEvaluation::no_match());
        }

        let score = if sequential_hit { 85 } else { 80 };
        let mut result = RuleEvaluation::matched(
            Severity::High,
            score,
            format!(
                "Username enumeration from {ip}: {} attempts over {} distinct accounts",
                failures.len(),
                usernames.len()
            ),
        )
        .with_actions([Action::BlockIp, Action::IncreaseMonitoring])
        .with_evidence("attempts", json!(failures.len()))
        .with_evidence("uniqueUsernames", json!(usernames.len()))
        .with_evidence("sequentialRun", json!(sequential));
        if let Some(s) = similarity {
            result = result.with_evidence("meanSimilarity", json!((s * 100.0).round() / 100.0));
        }

        Ok(self.tag_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn failure(email: &str, ip: &str, ts: chrono::DateTime<Utc>) -> SecurityEvent {
        let mut ev = SecurityEvent::new(EventType::LoginFailed);
        ev.email = Some(email.to_string());
        ev.ip_address = Some(ip.to_string());
        ev.timestamp = ts;
        ev
    }

    fn rule() -> AccountEnumerationRule {
        AccountEnumerationRule::new(
            RuleMeta::named("account-enum", "Account enumeration", Severity::High),
            AccountEnumerationConfig::default(),
        )
    }

    #[tokio::test]
    async fn sequential_usernames_match_high() {
        let now = Utc.with_ymd_and_hms(2025, 5, 8, 16, 0, 0).unwrap();
        let current = failure("user5@example.com", "203.0.113.5", now);
        let recents: Vec<_> = (1..=4)
            .map(|n| {
                failure(
                    &format!("user{n}@example.com"),
                    "203.0.113.5",
                    now - Duration::seconds(n as i64 * 3),
                )
            })
            .collect();

        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::High));
        assert_eq!(result.score, Some(85));
        assert_eq!(result.evidence["sequentialRun"], json!(5));
        assert!(result.suggested_actions.contains(&Action::BlockIp));
    }

    #[tokio::test]
    async fn near_identical_usernames_match_on_similarity() {
        let now = Utc.with_ymd_and_hms(2025, 5, 8, 16, 10, 0).unwrap();
        let names = ["jsmithers", "jsmithery", "jsmitherz", "jsmithersa"];
        let current = failure("jsmither@example.com", "203.0.113.6", now);
        let recents: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                failure(
                    &format!("{n}@example.com"),
                    "203.0.113.6",
                    now - Duration::seconds(i as i64 + 1),
                )
            })
            .collect();

        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.score, Some(80));
    }

    #[tokio::test]
    async fn unrelated_usernames_do_not_match() {
        let now = Utc::now();
        let names = ["alice", "bob", "carol", "dave"];
        let current = failure("erin@example.com", "203.0.113.7", now);
        let recents: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                failure(
                    &format!("{n}@example.com"),
                    "203.0.113.7",
                    now - Duration::seconds(i as i64 + 1),
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
    async fn too_few_attempts_do_not_match() {
        let now = Utc::now();
        let current = failure("user3@example.com", "203.0.113.8", now);
        let recents = vec![
            failure("user1@example.com", "203.0.113.8", now - Duration::seconds(2)),
            failure("user2@example.com", "203.0.113.8", now - Duration::seconds(1)),
        ];
        let result = rule()
            .evaluate(&RuleContext::new(current, recents))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[test]
    fn sequential_run_detection() {
        assert_eq!(longest_sequential_run(&["user1", "user2", "user3", "admin7"]), 3);
        assert_eq!(longest_sequential_run(&["user1", "user3", "user5"]), 1);
        assert_eq!(longest_sequential_run(&["alice", "bob"]), 0);
    }
}
