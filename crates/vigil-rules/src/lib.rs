//! # Vigil Rules
//!
//! The concrete detection heuristics. Each rule implements
//! [`vigil_core::Rule`] and is instantiated from a persisted
//! [`vigil_core::RuleRecord`] whose `config` JSON carries the rule's typed
//! parameters.
//!
//! | Rule | Condition type |
//! |------|----------------|
//! | [`BruteForceRule`] | THRESHOLD |
//! | [`CredentialStuffingRule`] | PATTERN |
//! | [`SessionHijackRule`] | PATTERN |
//! | [`RapidIpChangeRule`] | PATTERN |
//! | [`SuspiciousUserAgentRule`] | PATTERN |
//! | [`AccountEnumerationRule`] | PATTERN |
//! | [`TimeAnomalyRule`] | TIME_BASED |
//! | [`GeoAnomalyRule`] | GEO_BASED |

pub mod account_enum;
pub mod brute_force;
pub mod common;
pub mod credential_stuffing;
pub mod geo_anomaly;
pub mod rapid_ip;
pub mod session_hijack;
pub mod time_anomaly;
pub mod user_agent;

pub use account_enum::{AccountEnumerationConfig, AccountEnumerationRule};
pub use brute_force::{BruteForceConfig, BruteForceRule};
pub use common::RuleMeta;
pub use credential_stuffing::{CredentialStuffingConfig, CredentialStuffingRule};
pub use geo_anomaly::{GeoAnomalyConfig, GeoAnomalyRule};
pub use rapid_ip::{RapidIpChangeConfig, RapidIpChangeRule};
pub use session_hijack::{SessionHijackConfig, SessionHijackRule};
pub use time_anomaly::{HourRange, TimeAnomalyConfig, TimeAnomalyRule};
pub use user_agent::{SuspiciousUserAgentConfig, SuspiciousUserAgentRule};

use std::sync::Arc;
use vigil_core::{ConditionType, Rule, RuleError, RuleRecord};

/// Instantiate the implementation behind a rule row.
///
/// THRESHOLD, TIME_BASED and GEO_BASED map directly; PATTERN rows are
/// disambiguated by their tags (then id), defaulting to credential
/// stuffing.
pub fn instantiate(record: &RuleRecord) -> Result<Arc<dyn Rule>, RuleError> {
    let rule: Arc<dyn Rule> = match record.condition_type {
        ConditionType::Threshold => Arc::new(BruteForceRule::from_record(record)?),
        ConditionType::TimeBased => Arc::new(TimeAnomalyRule::from_record(record)?),
        ConditionType::GeoBased => Arc::new(GeoAnomalyRule::from_record(record)?),
        ConditionType::Pattern => {
            let hint = |needle: &str| {
                record
                    .tags
                    .iter()
                    .any(|t| t.to_lowercase().contains(needle))
                    || record.id.to_lowercase().contains(needle)
            };
            if hint("session") || hint("hijack") {
                Arc::new(SessionHijackRule::from_record(record)?)
            } else if hint("rapid") || hint("ip-change") {
                Arc::new(RapidIpChangeRule::from_record(record)?)
            } else if hint("agent") || hint("ua") {
                Arc::new(SuspiciousUserAgentRule::from_record(record)?)
            } else if hint("enum") {
                Arc::new(AccountEnumerationRule::from_record(record)?)
            } else {
                Arc::new(CredentialStuffingRule::from_record(record)?)
            }
        }
    };
    Ok(rule)
}
