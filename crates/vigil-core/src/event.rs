//! Security event types consumed by the log pipeline and the rule engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of security event.
///
/// The wire representation is the SCREAMING_SNAKE name; unknown strings
/// round-trip through [`EventType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    LoginSuccess,
    LoginFailed,
    Logout,
    SessionActivity,
    PageView,
    ApiCall,
    TokenRefresh,
    SuspiciousActivity,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::Logout => "LOGOUT",
            Self::SessionActivity => "SESSION_ACTIVITY",
            Self::PageView => "PAGE_VIEW",
            Self::ApiCall => "API_CALL",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "LOGIN_SUCCESS" => Self::LoginSuccess,
            "LOGIN_FAILED" => Self::LoginFailed,
            "LOGOUT" => Self::Logout,
            "SESSION_ACTIVITY" => Self::SessionActivity,
            "PAGE_VIEW" => Self::PageView,
            "API_CALL" => Self::ApiCall,
            "TOKEN_REFRESH" => Self::TokenRefresh,
            "SUSPICIOUS_ACTIVITY" => Self::SuspiciousActivity,
            _ => Self::Custom(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

/// Event severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// One step up the ladder, capped at CRITICAL.
    pub fn escalate(self) -> Self {
        match self {
            Self::Info => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metadata value.
///
/// The bag is a string-keyed map of tagged scalars; a closed set of keys is
/// recognized by the rules, everything else is carried opaquely through
/// hashing and archival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Recognized metadata keys.
pub mod meta_keys {
    pub const EMAIL: &str = "email";
    pub const USER_ID: &str = "userId";
    pub const SESSION_ID: &str = "sessionId";
    pub const COUNTRY: &str = "country";
    pub const LOCATION: &str = "location";
    pub const USER_AGENT: &str = "userAgent";
}

/// Free-form metadata attached to an event.
///
/// Backed by a `BTreeMap` so serialization is key-ordered, which the chain
/// hash depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(MetaValue::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(MetaValue::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic JSON rendering (keys sorted by the backing map).
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// An immutable security event, as handed to the ingestion queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub severity: Severity,
}

impl SecurityEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            user_id: None,
            email: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
            metadata: Metadata::new(),
            severity: Severity::Info,
        }
    }

    /// Email, preferring the typed field over the metadata bag.
    pub fn email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .or_else(|| self.metadata.get_str(meta_keys::EMAIL))
    }

    /// User id, preferring the typed field over the metadata bag.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or_else(|| self.metadata.get_str(meta_keys::USER_ID))
    }

    /// Session id, preferring the typed field over the metadata bag.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or_else(|| self.metadata.get_str(meta_keys::SESSION_ID))
    }

    /// User agent, preferring the typed field over the metadata bag.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent
            .as_deref()
            .or_else(|| self.metadata.get_str(meta_keys::USER_AGENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_wire_names() {
        let t = EventType::LoginFailed;
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"LOGIN_FAILED\"");
        assert_eq!(serde_json::from_str::<EventType>(&json).unwrap(), t);

        let custom: EventType = serde_json::from_str("\"MFA_CHALLENGE\"").unwrap();
        assert_eq!(custom, EventType::Custom("MFA_CHALLENGE".to_string()));
    }

    #[test]
    fn severity_is_ordered_and_escalates() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
        assert_eq!(Severity::Medium.escalate(), Severity::High);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn metadata_canonical_json_is_key_ordered() {
        let meta = Metadata::new().with("zz", "last").with("aa", 1i64);
        assert_eq!(meta.canonical_json(), r#"{"aa":1,"zz":"last"}"#);
    }

    #[test]
    fn recognized_keys_fall_back_to_metadata() {
        let mut ev = SecurityEvent::new(EventType::LoginSuccess);
        ev.metadata.insert(meta_keys::SESSION_ID, "s-123");
        assert_eq!(ev.session_id(), Some("s-123"));
        ev.session_id = Some("typed".to_string());
        assert_eq!(ev.session_id(), Some("typed"));
    }
}
