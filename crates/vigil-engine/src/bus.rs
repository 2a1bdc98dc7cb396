//! Broadcast bus for recommended actions, threat aggregates and alerts.
//!
//! Channels are multi-producer/multi-consumer and non-blocking; with no
//! subscriber attached a message is dropped after the send attempt and the
//! drop is logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use vigil_core::{Action, RuleEvaluation, SecurityEvent, Severity};

/// `security.block.ip`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIpNotice {
    pub ip: Option<String>,
    pub reason: String,
}

/// `security.require.2fa`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequireTwoFactorNotice {
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// `security.invalidate.sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateSessionsNotice {
    pub user_id: Option<String>,
}

/// `security.increase.monitoring`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncreaseMonitoringNotice {
    pub user_id: Option<String>,
    pub ip: Option<String>,
}

/// `threat.detected`: one aggregate per evaluated context with matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatDetected {
    pub event: SecurityEvent,
    pub results: Vec<RuleEvaluation>,
    pub timestamp: DateTime<Utc>,
}

/// Alert payload for matches at HIGH or above; transport is external.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_type: String,
    pub severity: Severity,
    pub details: String,
    pub additional_info: serde_json::Value,
}

const CHANNEL_CAPACITY: usize = 256;

/// The bus itself. Cloning is cheap; all clones share the channels.
#[derive(Debug, Clone)]
pub struct SecurityBus {
    block_ip: broadcast::Sender<BlockIpNotice>,
    require_2fa: broadcast::Sender<RequireTwoFactorNotice>,
    invalidate_sessions: broadcast::Sender<InvalidateSessionsNotice>,
    increase_monitoring: broadcast::Sender<IncreaseMonitoringNotice>,
    threats: broadcast::Sender<ThreatDetected>,
    alerts: broadcast::Sender<AlertNotification>,
}

impl Default for SecurityBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityBus {
    pub fn new() -> Self {
        Self {
            block_ip: broadcast::channel(CHANNEL_CAPACITY).0,
            require_2fa: broadcast::channel(CHANNEL_CAPACITY).0,
            invalidate_sessions: broadcast::channel(CHANNEL_CAPACITY).0,
            increase_monitoring: broadcast::channel(CHANNEL_CAPACITY).0,
            threats: broadcast::channel(CHANNEL_CAPACITY).0,
            alerts: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_block_ip(&self) -> broadcast::Receiver<BlockIpNotice> {
        self.block_ip.subscribe()
    }

    pub fn subscribe_require_2fa(&self) -> broadcast::Receiver<RequireTwoFactorNotice> {
        self.require_2fa.subscribe()
    }

    pub fn subscribe_invalidate_sessions(&self) -> broadcast::Receiver<InvalidateSessionsNotice> {
        self.invalidate_sessions.subscribe()
    }

    pub fn subscribe_increase_monitoring(&self) -> broadcast::Receiver<IncreaseMonitoringNotice> {
        self.increase_monitoring.subscribe()
    }

    pub fn subscribe_threats(&self) -> broadcast::Receiver<ThreatDetected> {
        self.threats.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertNotification> {
        self.alerts.subscribe()
    }

    fn log_drop(channel: &str) {
        debug!(channel, "No subscriber attached, notice dropped");
    }

    /// Publish the typed notice for one recommended action, populated from
    /// the triggering event and evaluation.
    pub fn publish_action(&self, action: Action, event: &SecurityEvent, result: &RuleEvaluation) {
        let reason = result.reason.clone().unwrap_or_default();
        let dropped = match action {
            Action::BlockIp => self
                .block_ip
                .send(BlockIpNotice {
                    ip: event.ip_address.clone(),
                    reason,
                })
                .is_err(),
            Action::RequireTwoFactor => self
                .require_2fa
                .send(RequireTwoFactorNotice {
                    user_id: event.user_id().map(str::to_string),
                    email: event.email().map(str::to_string),
                })
                .is_err(),
            Action::InvalidateSessions => self
                .invalidate_sessions
                .send(InvalidateSessionsNotice {
                    user_id: event.user_id().map(str::to_string),
                })
                .is_err(),
            Action::IncreaseMonitoring => self
                .increase_monitoring
                .send(IncreaseMonitoringNotice {
                    user_id: event.user_id().map(str::to_string),
                    ip: event.ip_address.clone(),
                })
                .is_err(),
        };
        if dropped {
            Self::log_drop(action.channel());
        }
    }

    pub fn publish_threat(&self, threat: ThreatDetected) {
        if self.threats.send(threat).is_err() {
            Self::log_drop("threat.detected");
        }
    }

    pub fn publish_alert(&self, alert: AlertNotification) {
        if self.alerts.send(alert).is_err() {
            Self::log_drop("security.alert");
        }
    }
}
