//! Geographic anomalies: blocked origins, allow-list violations and
//! impossible travel between successive logins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use vigil_core::{
    meta_keys, Action, ConditionType, EventType, Rule, RuleContext, RuleError, RuleEvaluation,
    RuleRecord, RuleStatus, Severity,
};

use crate::common::{country_of, event_coords, haversine_km, parse_config, within_lookback, RuleMeta};

/// Configuration for [`GeoAnomalyRule`]. Country names compare
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeoAnomalyConfig {
    pub blocked_countries: Vec<String>,
    /// When non-empty, any country outside the list matches.
    pub allowed_countries: Vec<String>,
    pub suspicious_countries: Vec<String>,
    pub time_window_minutes: i64,
    pub max_velocity_kmh: f64,
}

impl Default for GeoAnomalyConfig {
    fn default() -> Self {
        Self {
            blocked_countries: Vec::new(),
            allowed_countries: Vec::new(),
            suspicious_countries: Vec::new(),
            time_window_minutes: 60,
            max_velocity_kmh: 1_000.0,
        }
    }
}

/// GEO_BASED rule evaluated in strict order: blocked country, allow-list,
/// impossible travel, suspicious country. Locations are consumed as
/// already-resolved "City, Country" strings.
#[derive(Debug, Clone)]
pub struct GeoAnomalyRule {
    meta: RuleMeta,
    config: GeoAnomalyConfig,
}

impl GeoAnomalyRule {
    pub fn new(meta: RuleMeta, config: GeoAnomalyConfig) -> Self {
        Self { meta, config }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RuleError> {
        Ok(Self::new(
            RuleMeta::from_record(record),
            parse_config(&record.config)?,
        ))
    }

    fn in_list(list: &[String], country: &str) -> bool {
        list.iter().any(|c| c.eq_ignore_ascii_case(country))
    }
}

#[async_trait]
impl Rule for GeoAnomalyRule {
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
        ConditionType::GeoBased
    }
    fn tags(&self) -> &[String] {
        &self.meta.tags
    }

    fn validate(&self) -> bool {
        self.config.time_window_minutes >= 1 && self.config.max_velocity_kmh > 0.0
    }

    fn describe(&self) -> String {
        format!(
            "{} v{}: blocked/allowed country lists, impossible travel above {} km/h",
            self.meta.name, self.meta.version, self.config.max_velocity_kmh
        )
    }

    async fn evaluate(&self, ctx: &RuleContext) -> Result<RuleEvaluation, RuleError> {
        let event = &ctx.event;
        if event.event_type != EventType::LoginSuccess {
            return Ok(RuleEvaluation::no_match());
        }
        let Some(location) = event.metadata.get_str(meta_keys::LOCATION) else {
            return Ok(RuleEvaluation::no_match());
        };
        let Some(country) = country_of(location) else {
            return Ok(RuleEvaluation::no_match());
        };

        // (1) Blocked country.
        if Self::in_list(&self.config.blocked_countries, country) {
            let result = RuleEvaluation::matched(
                Severity::Critical,
                100,
                format!("Login from blocked country: {country}"),
            )
            .with_actions([Action::BlockIp, Action::InvalidateSessions])
            .with_evidence("country", json!(country))
            .with_evidence("location", json!(location));
            return Ok(self.tag_result(result));
        }

        // (2) Outside the allow-list.
        if !self.config.allowed_countries.is_empty()
            && !Self::in_list(&self.config.allowed_countries, country)
        {
            let result = RuleEvaluation::matched(
                Severity::Critical,
                90,
                format!("Login from non-allowed country: {country}"),
            )
            .with_actions([Action::BlockIp, Action::RequireTwoFactor])
            .with_evidence("country", json!(country))
            .with_evidence("location", json!(location));
            return Ok(self.tag_result(result));
        }

        // (3) Impossible travel: compare against each prior successful login
        // from a different location inside the window; the fastest implied
        // velocity decides severity.
        if let Some(here) = event_coords(event) {
            let mut fastest: Option<(f64, f64, f64, String)> = None;
            for prior in
                within_lookback(&ctx.recent_events, event.timestamp, self.config.time_window_minutes)
            {
                if prior.event_type != EventType::LoginSuccess {
                    continue;
                }
                let Some(prior_location) = prior.metadata.get_str(meta_keys::LOCATION) else {
                    continue;
                };
                if prior_location == location {
                    continue;
                }
                let Some(there) = event_coords(prior) else {
                    continue;
                };
                let hours = (event.timestamp - prior.timestamp)
                    .num_milliseconds()
                    .max(1) as f64
                    / 3_600_000.0;
                let distance = haversine_km(there, here);
                let velocity = distance / hours;
                if velocity > self.config.max_velocity_kmh
                    && fastest.as_ref().is_none_or(|(v, ..)| velocity > *v)
                {
                    fastest = Some((velocity, distance, hours, prior_location.to_string()));
                }
            }

            if let Some((velocity, distance, hours, from)) = fastest {
                let severity = if velocity > 2_000.0 {
                    Severity::Critical
                } else if velocity > 1_500.0 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let score =
                    (50.0 + (velocity - self.config.max_velocity_kmh) / 20.0).min(100.0) as u32;
                let actions: &[Action] = if velocity > 2_000.0 {
                    &[Action::InvalidateSessions, Action::BlockIp]
                } else if velocity > 1_000.0 {
                    &[Action::RequireTwoFactor, Action::IncreaseMonitoring]
                } else {
                    &[Action::RequireTwoFactor]
                };

                let result = RuleEvaluation::matched(
                    severity,
                    score,
                    format!(
                        "Impossible travel: {from} to {location} at {velocity:.0} km/h",
                    ),
                )
                .with_actions(actions.iter().copied())
                .with_evidence("velocityKmh", json!(velocity.round()))
                .with_evidence("distanceKm", json!(distance.round()))
                .with_evidence("hoursElapsed", json!(hours))
                .with_evidence("fromLocation", json!(from))
                .with_evidence("toLocation", json!(location));
                return Ok(self.tag_result(result));
            }
        }

        // (4) Suspicious country list.
        if Self::in_list(&self.config.suspicious_countries, country) {
            let result = RuleEvaluation::matched(
                Severity::Medium,
                60,
                format!("Login from suspicious country: {country}"),
            )
            .with_actions([Action::RequireTwoFactor, Action::IncreaseMonitoring])
            .with_evidence("country", json!(country))
            .with_evidence("location", json!(location));
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

    fn login_at(location: &str, ts: chrono::DateTime<Utc>) -> SecurityEvent {
        let mut ev = SecurityEvent::new(EventType::LoginSuccess);
        ev.user_id = Some("u".to_string());
        ev.metadata.insert(meta_keys::LOCATION, location);
        ev.timestamp = ts;
        ev
    }

    fn rule(config: GeoAnomalyConfig) -> GeoAnomalyRule {
        GeoAnomalyRule::new(
            RuleMeta::named("geo-anomaly", "Geo anomaly", Severity::High),
            config,
        )
    }

    #[tokio::test]
    async fn berlin_to_tokyo_in_half_an_hour_is_impossible() {
        let now = Utc.with_ymd_and_hms(2025, 5, 4, 10, 0, 0).unwrap();
        let current = login_at("Tokyo, Japan", now);
        let prior = login_at("Berlin, Germany", now - Duration::minutes(30));

        let result = rule(GeoAnomalyConfig::default())
            .evaluate(&RuleContext::new(current, vec![prior]))
            .await
            .unwrap();

        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert!(result.evidence["velocityKmh"].as_f64().unwrap() > 1_000.0);
        assert!(result.suggested_actions.contains(&Action::InvalidateSessions));
        assert!(result.suggested_actions.contains(&Action::BlockIp));
        assert_eq!(result.score, Some(100));
    }

    #[tokio::test]
    async fn plausible_travel_does_not_match() {
        let now = Utc.with_ymd_and_hms(2025, 5, 4, 10, 0, 0).unwrap();
        let current = login_at("Munich, Germany", now);
        // Berlin to Munich is ~500 km; five hours is comfortably drivable.
        let prior = login_at("Berlin, Germany", now - Duration::minutes(300));

        let result = rule(GeoAnomalyConfig::default())
            .evaluate(&RuleContext::new(current, vec![prior]))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn blocked_country_wins_over_everything() {
        let config = GeoAnomalyConfig {
            blocked_countries: vec!["Atlantis".to_string()],
            ..GeoAnomalyConfig::default()
        };
        let now = Utc::now();
        let current = login_at("Capital, Atlantis", now);

        let result = rule(config)
            .evaluate(&RuleContext::new(current, vec![]))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Critical));
        assert_eq!(result.score, Some(100));
        assert!(result.suggested_actions.contains(&Action::BlockIp));
    }

    #[tokio::test]
    async fn allow_list_flags_everything_else() {
        let config = GeoAnomalyConfig {
            allowed_countries: vec!["Germany".to_string()],
            ..GeoAnomalyConfig::default()
        };
        let now = Utc::now();

        let ok = rule(config.clone())
            .evaluate(&RuleContext::new(login_at("Berlin, Germany", now), vec![]))
            .await
            .unwrap();
        assert!(!ok.matched);

        let flagged = rule(config)
            .evaluate(&RuleContext::new(login_at("Paris, France", now), vec![]))
            .await
            .unwrap();
        assert!(flagged.matched);
        assert_eq!(flagged.severity, Some(Severity::Critical));
    }

    #[tokio::test]
    async fn suspicious_country_is_medium() {
        let config = GeoAnomalyConfig {
            suspicious_countries: vec!["Freedonia".to_string()],
            ..GeoAnomalyConfig::default()
        };
        let result = rule(config)
            .evaluate(&RuleContext::new(
                login_at("Fredville, Freedonia", Utc::now()),
                vec![],
            ))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Medium));
        assert_eq!(result.score, Some(60));
    }

    #[tokio::test]
    async fn failed_logins_are_out_of_scope() {
        let mut ev = login_at("Tokyo, Japan", Utc::now());
        ev.event_type = EventType::LoginFailed;
        let result = rule(GeoAnomalyConfig::default())
            .evaluate(&RuleContext::new(ev, vec![]))
            .await
            .unwrap();
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn explicit_coordinates_override_the_city_table() {
        let now = Utc.with_ymd_and_hms(2025, 5, 4, 10, 0, 0).unwrap();
        let mut current = login_at("Somewhere, Nowhere", now);
        current.metadata.insert("lat", 35.6762);
        current.metadata.insert("lon", 139.6503);
        let mut prior = login_at("Elsewhere, Nowhere", now - Duration::minutes(30));
        prior.metadata.insert("lat", 52.52);
        prior.metadata.insert("lon", 13.405);

        let result = rule(GeoAnomalyConfig::default())
            .evaluate(&RuleContext::new(current, vec![prior]))
            .await
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.severity, Some(Severity::Critical));
    }
}
