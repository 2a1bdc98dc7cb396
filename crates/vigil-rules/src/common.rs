//! Helpers shared by the concrete rules: metadata plumbing, lookback
//! filtering, target matching, whitelists, and geo distance.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use vigil_core::{meta_keys, RuleError, RuleRecord, RuleStatus, SecurityEvent, Severity};

/// Identity fields every rule carries, populated from its configuration row.
#[derive(Debug, Clone)]
pub struct RuleMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub status: RuleStatus,
    pub severity: Severity,
    pub tags: Vec<String>,
}

impl RuleMeta {
    pub fn from_record(record: &RuleRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            version: record.version.clone(),
            status: record.status,
            severity: record.severity,
            tags: record.tags.clone(),
        }
    }

    /// Minimal metadata for direct construction (tests, defaults).
    pub fn named(id: &str, name: &str, severity: Severity) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            status: RuleStatus::Active,
            severity,
            tags: Vec::new(),
        }
    }
}

/// Parse a rule's typed config out of its JSON row. `null`/missing yields
/// the config's defaults.
pub fn parse_config<T: DeserializeOwned + Default>(
    value: &serde_json::Value,
) -> Result<T, RuleError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| RuleError::InvalidConfig(e.to_string()))
}

/// Events from `events` that fall inside `minutes` before `now` (inclusive).
pub fn within_lookback<'a>(
    events: &'a [SecurityEvent],
    now: DateTime<Utc>,
    minutes: i64,
) -> impl Iterator<Item = &'a SecurityEvent> {
    let cutoff = now - Duration::minutes(minutes);
    events
        .iter()
        .filter(move |e| e.timestamp >= cutoff && e.timestamp <= now)
}

/// Correlation target of an event, by precedence user id → email → IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    UserId(&'a str),
    Email(&'a str),
    Ip(&'a str),
}

impl<'a> Target<'a> {
    pub fn of(event: &'a SecurityEvent) -> Option<Self> {
        if let Some(u) = event.user_id() {
            Some(Self::UserId(u))
        } else if let Some(e) = event.email() {
            Some(Self::Email(e))
        } else {
            event.ip_address.as_deref().map(Self::Ip)
        }
    }

    /// Whether another event refers to the same target.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        match self {
            Self::UserId(u) => event.user_id() == Some(u),
            Self::Email(m) => event.email() == Some(m),
            Self::Ip(ip) => event.ip_address.as_deref() == Some(ip),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserId(_) => "userId",
            Self::Email(_) => "email",
            Self::Ip(_) => "ipAddress",
        }
    }

    pub fn value(&self) -> &'a str {
        match self {
            Self::UserId(v) | Self::Email(v) | Self::Ip(v) => v,
        }
    }
}

/// Whitelist check for IPs: exact entries or range prefixes
/// (`"10.0."` or `"10.0.*"` cover `10.0.x.y`).
pub fn ip_whitelisted(ip: &str, whitelist: &[String]) -> bool {
    whitelist.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('*') {
            ip.starts_with(prefix)
        } else if entry.ends_with('.') {
            ip.starts_with(entry.as_str())
        } else {
            ip == entry
        }
    })
}

/// Mean of millisecond gaps between consecutive timestamps; `None` for
/// fewer than two events.
pub fn mean_interval_ms(timestamps: &[DateTime<Utc>]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }
    let total: i64 = timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds().max(0))
        .sum();
    Some(total as f64 / (timestamps.len() - 1) as f64)
}

/// Country component of a location string: the last comma-separated part.
pub fn country_of(location: &str) -> Option<&str> {
    let country = location.rsplit(',').next()?.trim();
    (!country.is_empty()).then_some(country)
}

/// City component of a location string: the first comma-separated part.
pub fn city_of(location: &str) -> Option<&str> {
    let city = location.split(',').next()?.trim();
    (!city.is_empty()).then_some(city)
}

/// Resolved coordinates for an event: explicit `lat`/`lon` metadata wins,
/// otherwise the built-in city table is consulted.
pub fn event_coords(event: &SecurityEvent) -> Option<(f64, f64)> {
    if let (Some(lat), Some(lon)) = (
        event.metadata.get_f64("lat"),
        event.metadata.get_f64("lon"),
    ) {
        return Some((lat, lon));
    }
    let location = event.metadata.get_str(meta_keys::LOCATION)?;
    city_coords(city_of(location)?)
}

/// Great-circle distance in kilometres (haversine).
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6_371.0;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Coordinates for major cities. GeoIP resolution is out of scope; events
/// arrive with resolved location strings and this table anchors them.
pub fn city_coords(city: &str) -> Option<(f64, f64)> {
    let coords = match city.to_lowercase().as_str() {
        "amsterdam" => (52.3676, 4.9041),
        "athens" => (37.9838, 23.7275),
        "bangkok" => (13.7563, 100.5018),
        "barcelona" => (41.3874, 2.1686),
        "beijing" => (39.9042, 116.4074),
        "berlin" => (52.5200, 13.4050),
        "boston" => (42.3601, -71.0589),
        "brussels" => (50.8503, 4.3517),
        "buenos aires" => (-34.6037, -58.3816),
        "cairo" => (30.0444, 31.2357),
        "cape town" => (-33.9249, 18.4241),
        "chicago" => (41.8781, -87.6298),
        "copenhagen" => (55.6761, 12.5683),
        "delhi" => (28.7041, 77.1025),
        "dubai" => (25.2048, 55.2708),
        "dublin" => (53.3498, -6.2603),
        "frankfurt" => (50.1109, 8.6821),
        "helsinki" => (60.1699, 24.9384),
        "hong kong" => (22.3193, 114.1694),
        "istanbul" => (41.0082, 28.9784),
        "jakarta" => (-6.2088, 106.8456),
        "johannesburg" => (-26.2041, 28.0473),
        "kyiv" => (50.4501, 30.5234),
        "lagos" => (6.5244, 3.3792),
        "lisbon" => (38.7223, -9.1393),
        "london" => (51.5074, -0.1278),
        "los angeles" => (34.0522, -118.2437),
        "madrid" => (40.4168, -3.7038),
        "melbourne" => (-37.8136, 144.9631),
        "mexico city" => (19.4326, -99.1332),
        "miami" => (25.7617, -80.1918),
        "milan" => (45.4642, 9.1900),
        "moscow" => (55.7558, 37.6173),
        "mumbai" => (19.0760, 72.8777),
        "munich" => (48.1351, 11.5820),
        "nairobi" => (-1.2921, 36.8219),
        "new york" => (40.7128, -74.0060),
        "oslo" => (59.9139, 10.7522),
        "paris" => (48.8566, 2.3522),
        "prague" => (50.0755, 14.4378),
        "rome" => (41.9028, 12.4964),
        "san francisco" => (37.7749, -122.4194),
        "seattle" => (47.6062, -122.3321),
        "seoul" => (37.5665, 126.9780),
        "shanghai" => (31.2304, 121.4737),
        "singapore" => (1.3521, 103.8198),
        "stockholm" => (59.3293, 18.0686),
        "sydney" => (-33.8688, 151.2093),
        "sao paulo" => (-23.5505, -46.6333),
        "são paulo" => (-23.5505, -46.6333),
        "taipei" => (25.0330, 121.5654),
        "tel aviv" => (32.0853, 34.7818),
        "tokyo" => (35.6762, 139.6503),
        "toronto" => (43.6532, -79.3832),
        "vienna" => (48.2082, 16.3738),
        "warsaw" => (52.2297, 21.0122),
        "zurich" => (47.3769, 8.5417),
        _ => return None,
    };
    Some(coords)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vigil_core::EventType;

    #[test]
    fn target_precedence_is_user_then_email_then_ip() {
        let mut ev = SecurityEvent::new(EventType::LoginFailed);
        ev.ip_address = Some("1.2.3.4".to_string());
        assert!(matches!(Target::of(&ev), Some(Target::Ip("1.2.3.4"))));
        ev.email = Some("a@b.c".to_string());
        assert!(matches!(Target::of(&ev), Some(Target::Email("a@b.c"))));
        ev.user_id = Some("u1".to_string());
        assert!(matches!(Target::of(&ev), Some(Target::UserId("u1"))));
    }

    #[test]
    fn whitelist_supports_prefixes() {
        let wl = vec!["203.0.113.7".to_string(), "10.0.".to_string(), "192.168.*".to_string()];
        assert!(ip_whitelisted("203.0.113.7", &wl));
        assert!(ip_whitelisted("10.0.4.1", &wl));
        assert!(ip_whitelisted("192.168.1.50", &wl));
        assert!(!ip_whitelisted("203.0.113.8", &wl));
    }

    #[test]
    fn location_parsing_takes_last_component_as_country() {
        assert_eq!(country_of("Berlin, Germany"), Some("Germany"));
        assert_eq!(country_of("San Jose, CA, United States"), Some("United States"));
        assert_eq!(city_of("San Jose, CA, United States"), Some("San Jose"));
        assert_eq!(country_of(""), None);
    }

    #[test]
    fn berlin_to_tokyo_is_about_nine_thousand_km() {
        let berlin = city_coords("Berlin").unwrap();
        let tokyo = city_coords("Tokyo").unwrap();
        let d = haversine_km(berlin, tokyo);
        assert!((8_500.0..9_500.0).contains(&d), "{d}");
    }

    #[test]
    fn lookback_is_inclusive_of_window_edge() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut old = SecurityEvent::new(EventType::PageView);
        old.timestamp = now - Duration::minutes(15);
        let mut stale = SecurityEvent::new(EventType::PageView);
        stale.timestamp = now - Duration::minutes(16);
        let events = vec![old, stale];
        let kept: Vec<_> = within_lookback(&events, now, 15).collect();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn mean_interval_requires_two_events() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(mean_interval_ms(&[t0]), None);
        let ts = vec![t0, t0 + Duration::seconds(1), t0 + Duration::seconds(3)];
        assert_eq!(mean_interval_ms(&ts), Some(1_500.0));
    }
}
