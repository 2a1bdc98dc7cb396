//! # Vigil Core
//!
//! Core types for the Vigil security subsystem — events, hash-chained log
//! entries, and the detection-rule contract.
//!
//! ## Key types
//!
//! - [`SecurityEvent`]: immutable input event with a typed metadata bag
//! - [`LogEntry`]: persisted, hash-chained row
//! - [`hash`]: chain hashing, verification, checkpoints
//! - [`Rule`] / [`RuleContext`] / [`RuleEvaluation`]: the heuristic contract
//!
//! ## Chain hashing
//!
//! ```rust
//! use vigil_core::{chain_hash, NewLogEntry, EventType, Severity, Metadata};
//! use chrono::Utc;
//!
//! let entry = NewLogEntry {
//!     event_type: EventType::LoginFailed,
//!     severity: Severity::Medium,
//!     user_id: Some("u-1".into()),
//!     email: None,
//!     ip_address: Some("203.0.113.9".into()),
//!     user_agent: None,
//!     session_id: None,
//!     metadata: Metadata::new(),
//!     message: None,
//! };
//! let hex = chain_hash(1, &entry, Utc::now(), None);
//! assert_eq!(hex.len(), 64);
//! ```

pub mod entry;
pub mod event;
pub mod hash;
pub mod merkle;
pub mod rule;

pub use entry::{LogEntry, NewLogEntry};
pub use event::{meta_keys, EventType, MetaValue, Metadata, SecurityEvent, Severity};
pub use hash::{
    canonical_string, canonical_timestamp, chain_hash, checkpoint, verify_chain, verify_entry,
    BreakKind, ChainBroken, ChainReport, Checkpoint, Hash,
};
pub use merkle::merkle_root;
pub use rule::{
    Action, ConditionType, EventSink, Rule, RuleContext, RuleError, RuleEvaluation, RuleRecord,
    RuleStatus, SinkError,
};
