//! Property-based tests for error normalization.

use opsync_core::{normalize, ErrorKind, NormalizedError, RawFailure};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

fn arb_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Network),
        Just(ErrorKind::Auth),
        Just(ErrorKind::Validation),
        Just(ErrorKind::NotFound),
        Just(ErrorKind::Permission),
        Just(ErrorKind::Conflict),
        Just(ErrorKind::Offline),
        Just(ErrorKind::Unknown),
    ]
}

fn arb_raw() -> impl Strategy<Value = RawFailure> {
    prop_oneof![
        (
            proptest::option::of(100u16..600),
            proptest::option::of(prop_oneof![
                Just("23505".to_string()),
                Just("23503".to_string()),
                Just("42501".to_string()),
                Just("PGRST116".to_string()),
                "[A-Z0-9]{5}",
            ]),
            proptest::option::of(".{0,40}"),
        )
            .prop_map(|(status, code, message)| RawFailure::Backend {
                status,
                code,
                message,
                details: None,
                hint: None,
            }),
        (".{0,40}", any::<bool>())
            .prop_map(|(message, offline)| RawFailure::Transport { message, offline }),
        (0u64..60_000).prop_map(|ms| RawFailure::Timeout {
            operation: "load".to_string(),
            after: Duration::from_millis(ms),
        }),
        any::<i64>().prop_map(|n| RawFailure::Other(json!(n))),
        ".{0,40}".prop_map(|s| RawFailure::Other(json!({ "message": s }))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Normalizing an already-normalized error returns it unchanged.
    #[test]
    fn prop_normalize_is_idempotent(raw in arb_raw()) {
        let once = normalize(raw);
        let twice = normalize(RawFailure::Normalized(once.clone()));
        prop_assert_eq!(once, twice);
    }

    /// Normalization never produces an empty message.
    #[test]
    fn prop_normalized_message_never_empty(raw in arb_raw()) {
        let err = normalize(raw);
        prop_assert!(!err.message.trim().is_empty());
    }

    /// Pre-classified errors pass through whatever their kind.
    #[test]
    fn prop_preclassified_passthrough(kind in arb_kind(), message in "[a-z ]{1,30}") {
        let err = NormalizedError::new(kind, message.clone());
        let out = normalize(err.clone().into());
        prop_assert_eq!(out.kind, kind);
        prop_assert_eq!(out.message, message);
    }

    /// Transport failures are always Network or Offline.
    #[test]
    fn prop_transport_is_network_or_offline(offline in any::<bool>()) {
        let err = normalize(RawFailure::Transport {
            message: "connection reset by peer".to_string(),
            offline,
        });
        let expected = if offline { ErrorKind::Offline } else { ErrorKind::Network };
        prop_assert_eq!(err.kind, expected);
    }
}
