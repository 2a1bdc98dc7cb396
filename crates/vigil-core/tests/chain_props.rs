//! Property tests for the chain hash: any chain built through `chain_hash`
//! verifies, and any single-field mutation is detected.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;
use vigil_core::{
    chain_hash, verify_chain, EventType, LogEntry, Metadata, NewLogEntry, Severity,
};

fn build_chain(payloads: &[(String, Option<String>)]) -> Vec<LogEntry> {
    let mut entries = Vec::with_capacity(payloads.len());
    let mut prev: Option<String> = None;
    for (i, (message, user_id)) in payloads.iter().enumerate() {
        let seq = (i + 1) as u64;
        let created_at = Utc
            .timestamp_millis_opt(1_750_000_000_000 + i as i64 * 1_000)
            .unwrap();
        let fields = NewLogEntry {
            event_type: EventType::SessionActivity,
            severity: Severity::Info,
            user_id: user_id.clone(),
            email: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
            metadata: Metadata::new(),
            message: Some(message.clone()),
        };
        let current = chain_hash(seq, &fields, created_at, prev.as_deref());
        entries.push(LogEntry {
            id: Uuid::new_v4(),
            sequence_number: seq,
            event_type: fields.event_type,
            severity: fields.severity,
            user_id: fields.user_id,
            email: fields.email,
            ip_address: fields.ip_address,
            user_agent: fields.user_agent,
            session_id: fields.session_id,
            metadata: fields.metadata,
            message: fields.message,
            previous_hash: prev.clone(),
            current_hash: current.clone(),
            created_at,
        });
        prev = Some(current);
    }
    entries
}

proptest! {
    #[test]
    fn appended_chains_always_verify(
        payloads in prop::collection::vec(
            ("[a-zA-Z0-9 ]{0,24}", prop::option::of("[a-z]{1,8}")),
            1..40,
        )
    ) {
        let entries = build_chain(&payloads);
        let report = verify_chain(&entries, None);
        prop_assert!(report.ok);
        prop_assert_eq!(report.checked, entries.len());
    }

    #[test]
    fn message_tampering_is_always_detected(
        payloads in prop::collection::vec(
            ("[a-zA-Z0-9 ]{0,24}", prop::option::of("[a-z]{1,8}")),
            2..30,
        ),
        victim in 0usize..29,
    ) {
        let mut entries = build_chain(&payloads);
        let victim = victim % entries.len();
        let seq = entries[victim].sequence_number;
        entries[victim].message = Some("tampered".to_string());
        // Skip the degenerate case where the mutation is a no-op.
        prop_assume!(payloads[victim].0 != "tampered");

        let report = verify_chain(&entries, None);
        prop_assert!(!report.ok);
        prop_assert_eq!(report.broken.unwrap().sequence_number, seq);
    }
}
