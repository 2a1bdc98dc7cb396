//! # Vigil Engine
//!
//! Rule registry and evaluation, the broadcast bus for recommended
//! actions, and the repository that keeps the registry in sync with the
//! persisted rule configuration.
//!
//! Evaluation fans out across registered rules concurrently, with a
//! per-rule deadline and full failure isolation; match side-effects
//! (threat aggregate, alerts, follow-up events, action notices) are
//! published from here so callers only see the result list.

pub mod bus;
pub mod engine;
pub mod repository;

pub use bus::{
    AlertNotification, BlockIpNotice, IncreaseMonitoringNotice, InvalidateSessionsNotice,
    RequireTwoFactorNotice, SecurityBus, ThreatDetected,
};
pub use engine::{EngineConfig, EngineError, EngineMetrics, RuleEngine, RuleStats};
pub use repository::RuleRepository;
