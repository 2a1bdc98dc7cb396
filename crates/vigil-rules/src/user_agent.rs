//! Suspicious user agents: scanners, bots, tooling, and agents whose shape
//! or behavior does not look like a browser.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SecurityEvent, Severity,
};

use crate::common::{parse_config, within_lookback, RuleMeta};

const SCANNERS: &[&str] = &[
    "nikto", "nmap", "sqlmap", "burp", "zap", "acunetix", "nessus", "metasploit", "masscan",
    "w3af", "dirbuster", "hydra",
];
const BOTS: &[&str] = &["bot", "crawler", "spider", "scraper"];
const TOOLS: &[&str] = &[
    "curl",
    "wget",
    "python",
    "java/",
    "go-http-client",
    "okhttp",
    "postman",
    "headless",
    "puppeteer",
    "phantomjs",
    "selenium",
    "httpclient",
];
const BROWSER_TOKENS: &[&str] = &["mozilla", "chrome", "safari", "firefox", "edge", "opera"];

const SCANNER_WEIGHT: u32 = 50;
const BOT_WEIGHT: u32 = 30;
const TOOL_WEIGHT: u32 = 20;
const MISSING_WEIGHT: u32 = 40;

/// Configuration for [`SuspiciousUserAgentRule`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuspiciousUserAgentConfig {
    /// Substrings that exempt an agent entirely (monitoring probes etc).
    pub whitelist: Vec<String>,
    /// Token matching is case-insensitive unless set.
    pub case_sensitive: bool,
    /// Total score needed to match when no scanner token hit.
    pub min_score: u32,
    pub check_length: bool,
    pub too_short: usize,
    pub too_long: usize,
    pub check_missing: bool,
    pub lookback_minutes: i64,
}

impl Default for SuspiciousUserAgentConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            case_sensitive: false,
            min_score: 40,
            check_length: true,
            too_short: 20,
            too_long: 500,
            check_missing: true,
            lookback_minutes: 10,
        }
    }
}

/// PATTERN rule scoring the current event's user agent plus its recent
/// behavior from the context window.
#[derive(Debug, Clone)]
pub struct SuspiciousUserAgentRule {
    meta: RuleMeta,
    config: SuspiciousUserAgentConfig,
}

impl SuspiciousUserAgentRule {
    pub fn new(meta: RuleMeta, config: SuspiciousUserAgentConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }

    fn normalize(&self, s: &str) -> String {
        if self.config.case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    }

    // Tokens are stored lowercase; the haystack is lowered unless the
    // config asks for exact-case matching.
    fn bucket_hit(&self, normalized: &str, bucket: &[&str]) -> bool {
        bucket.iter().any(|token| normalized.contains(token))
    }
}

fn relevant(event: &SecurityEvent) -> bool {
    matches!(
        event.event_type,
        EventType::LoginSuccess | EventType::LoginFailed | EventType::SessionActivity
    )
}

#[async_trait]
impl Rule for SuspiciousUserAgentRule {
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
        self.config.min_score > 0
            && self.config.too_short < self.config.too_long
            && self.config.lookback_minutes >= 1
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: scanner/bot/tool tokens and non-browser shape, min score {}",
            self.meta.name, self.meta.version, self.config.min_score
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if !relevant(event) {
            return Ok(RuleEvaluation::no_match());
        }

        let ua = event.user_agent().unwrap_or("");
        if ua.is_empty() {
            if !self.config.check_missing {
                return Ok(RuleEvaluation::no_match());
            }
            // Missing agents short-circuit: nothing else to inspect.
            let result = RuleEvaluation::matched(
                Severity::Low,
                MISSING_WEIGHT,
                "Request without a user agent",
            )
            .with_action(Action::IncreaseMonitoring)
            .with_evidence("missingUserAgent", json!(true));
            return Ok(self.tag_result(result));
        }

        let normalized = self.normalize(ua);
        if self
            .config
            .whitelist
            .iter()
            .any(|w| normalized.contains(&self.normalize(w)))
        {
            return Ok(RuleEvaluation::no_match());
        }

        let scanner = self.bucket_hit(&normalized, SCANNERS);
        let bot = self.bucket_hit(&normalized, BOTS);
        let tool = self.bucket_hit(&normalized, TOOLS);

        let mut score = 0u32;
        if scanner {
            score += SCANNER_WEIGHT;
        }
        if bot {
            score += BOT_WEIGHT;
        }
        if tool {
            score += TOOL_WEIGHT;
        }

        if self.config.check_length {
            if ua.len() < self.config.too_short {
                score += 15;
            }
            if ua.len() > self.config.too_long {
                score += 10;
            }
        }
        if !ua.contains(' ') {
            score += 20;
        }
        let lowered = ua.to_lowercase();
        if !BROWSER_TOKENS.iter().any(|t| lowered.contains(t)) {
            score += 25;
        }

        // Behavior over the lookback window, correlated by identical agent.
        let window: Vec<_> =
            within_lookback(&ctx.recent_events, event.timestamp, self.config.lookback_minutes)
                .filter(|e| e.user_agent() == Some(ua))
                .collect();
        let total_events = window.len() + 1;
        let failed = window
            .iter()
            .filter(|e| e.event_type == EventType::LoginFailed)
            .count()
            + usize::from(event.event_type == EventType::LoginFailed);
        let succeeded = window
            .iter()
            .filter(|e| e.event_type == EventType::LoginSuccess)
            .count()
            + usize::from(event.event_type == EventType::LoginSuccess);

        if failed >= 6 {
            score += 30;
        }
        if total_events > 10 && self.config.lookback_minutes <= 5 {
            score += 25;
        }
        if failed >= 4 && succeeded == 0 {
            score += 20;
        }

        if !scanner && score < self.config.min_score {
            return Ok(RuleEvaluation::no_match());
        }

        let severity = if scanner {
            Severity::Critical
        } else if score > 80 {
            Severity::High
        } else if score > 50 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let mut result = RuleEvaluation::matched(
            severity,
            score,
            format!("Suspicious user agent: {ua}"),
        );
        if scanner {
            result = result.with_actions([Action::BlockIp, Action::InvalidateSessions]);
        } else if failed > 5 {
            result = result.with_action(Action::BlockIp);
        } else {
            result = result.with_action(Action::IncreaseMonitoring);
            let rate = total_events as f64 / self.config.lookback_minutes as f64;
            if rate > 2.0 {
                result = result.with_action(Action::RequireTwoFactor);
            }
        }

        result = result
            .with_evidence("userAgent", json!(ua))
            .with_evidence("scannerMatch", json!(scanner))
            .with_evidence("botMatch", json!(bot))
            .with_evidence("toolMatch", json!(tool))
            .with_evidence("failedLogins", json!(failed))
            .with_evidence("totalEvents", json!(total_events));

        Ok(self.tag_result(result))
    }
}
