//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use message_replicator::config::{EndpointConfig, EndpointKind};
use message_replicator::pool::EndpointIdentity;
use message_replicator::resilience::Backoff;
use message_replicator::transport::Message;
use proptest::prelude::*;
use std::time::Duration;

const TOLERANCE: Duration = Duration::from_micros(1);

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// No attempt ever waits longer than the cap, jitter included.
    #[test]
    fn backoff_never_exceeds_max(
        initial_ms in 1u64..10_000,
        max_ms in 1u64..120_000,
        factor in 1.0f64..4.0,
        jitter in 0.0f64..1.0,
        attempt in 0u32..10_000,
    ) {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            factor,
            jitter,
        };
        prop_assert!(backoff.base_delay(attempt) <= backoff.max_delay);
        prop_assert!(backoff.delay_for_attempt(attempt) <= backoff.max_delay);
    }

    /// Jitter stays within its fraction of the base delay.
    #[test]
    fn backoff_jitter_within_bounds(
        initial_ms in 1u64..5_000,
        jitter in 0.0f64..1.0,
        attempt in 1u32..20,
    ) {
        let backoff = Backoff {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_secs(600),
            factor: 2.0,
            jitter,
        };
        let base = backoff.base_delay(attempt);
        let delay = backoff.delay_for_attempt(attempt);
        let low = base.mul_f64(1.0 - jitter);
        let high = base.mul_f64(1.0 + jitter);
        prop_assert!(delay + TOLERANCE >= low, "{:?} below {:?}", delay, low);
        prop_assert!(delay <= high + TOLERANCE, "{:?} above {:?}", delay, high);
    }

    /// Without jitter the schedule is reproducible.
    #[test]
    fn backoff_deterministic_without_jitter(
        initial_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
        attempt in 0u32..64,
    ) {
        let backoff = Backoff::deterministic(Duration::from_millis(initial_ms), Duration::from_millis(max_ms));
        prop_assert_eq!(backoff.delay_for_attempt(attempt), backoff.base_delay(attempt));
        prop_assert_eq!(backoff.delay_for_attempt(attempt), backoff.delay_for_attempt(attempt));
    }

    /// Once the cap is reached, every later attempt stays at the cap.
    #[test]
    fn backoff_stays_capped(
        initial_ms in 1u64..1_000,
        max_ms in 1u64..10_000,
        attempt in 1u32..1_000,
    ) {
        let backoff = Backoff::deterministic(Duration::from_millis(initial_ms), Duration::from_millis(max_ms));
        if backoff.base_delay(attempt) == backoff.max_delay {
            prop_assert_eq!(backoff.base_delay(attempt + 1), backoff.max_delay);
        }
    }
}

// =============================================================================
// Endpoint Identity Properties
// =============================================================================

fn endpoint(name: &str, servers: Vec<String>) -> EndpointConfig {
    let mut config = EndpointConfig::for_testing(name, EndpointKind::DurableStream, "unused");
    config.servers = servers;
    config
}

proptest! {
    /// Server order, duplicates, surrounding whitespace and the endpoint
    /// name never change the identity.
    #[test]
    fn identity_ignores_order_duplicates_and_name(
        hosts in prop::collection::vec("[a-z]{1,8}", 1..6),
        name_a in "[a-z]{1,8}",
        name_b in "[a-z]{1,8}",
    ) {
        let servers: Vec<String> = hosts.iter().map(|h| format!("redis://{}:6379", h)).collect();

        let mut shuffled: Vec<String> = servers.iter().rev().map(|s| format!("  {} ", s)).collect();
        shuffled.push(servers[0].clone());

        let a = EndpointIdentity::from(&endpoint(&name_a, servers));
        let b = EndpointIdentity::from(&endpoint(&name_b, shuffled));
        prop_assert_eq!(a, b);
    }

    /// Different kinds are never the same cluster.
    #[test]
    fn identity_distinguishes_kind(host in "[a-z]{1,8}") {
        let server = format!("redis://{}:6379", host);
        let stream = EndpointIdentity::from(&EndpointConfig::for_testing("x", EndpointKind::DurableStream, &server));
        let pubsub = EndpointIdentity::from(&EndpointConfig::for_testing("x", EndpointKind::CorePubSub, &server));
        prop_assert_ne!(stream, pubsub);
    }
}

// =============================================================================
// Echo Marker Properties
// =============================================================================

proptest! {
    /// Forwarding through a chain of connectors records exactly that chain.
    #[test]
    fn origin_path_records_every_hop(
        names in prop::collection::vec("[a-z][a-z0-9-]{0,10}", 1..8),
    ) {
        let mut message = Message::new("start", b"payload".to_vec());
        for (hop, name) in names.iter().enumerate() {
            message = message.forwarded(&format!("hop{}", hop), name);
        }

        let path: Vec<String> = message.origin_path().iter().map(|s| s.to_string()).collect();
        prop_assert_eq!(&path, &names);
        for name in &names {
            prop_assert!(message.was_forwarded_by(name));
        }
        prop_assert_eq!(&message.payload, &b"payload".to_vec());
    }

    /// A connector not on the path is never mistaken for one that is,
    /// even when its name is a prefix or suffix of one that is.
    #[test]
    fn origin_path_matches_whole_names_only(
        names in prop::collection::vec("[a-z]{2,8}", 1..5),
    ) {
        let mut message = Message::new("s", Vec::<u8>::new());
        for name in &names {
            message = message.forwarded("s", name);
        }

        let prefix = &names[0][..1];
        if !names.iter().any(|n| n == prefix) {
            prop_assert!(!message.was_forwarded_by(prefix));
        }
        let extended = format!("{}x", names[0]);
        if !names.contains(&extended) {
            prop_assert!(!message.was_forwarded_by(&extended));
        }
    }
}
