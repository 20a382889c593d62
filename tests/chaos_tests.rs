// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the replicator handles failures gracefully without
//! panics, deadlocks, or unaccounted messages.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{pubsub_to_stream, stream_to_stream, wait_connected, wait_for};
use message_replicator::config::ConnectorConfig;
use message_replicator::transport::{Message, ORIGIN_HEADER};
use message_replicator::{ConnectorState, ReplicatorState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// Flapping Endpoints
// =============================================================================

/// Test: A destination that keeps dropping still receives everything, in order
#[tokio::test]
async fn flapping_destination_loses_nothing() {
    let topology = stream_to_stream();
    let mut config = topology.config(vec![ConnectorConfig::for_testing("one", "a", "in", "b", "out")]);
    config.settings.forward.max_retries = 50;
    let replicator = topology.replicator(config);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    let total = 30u8;
    for n in 0..total {
        topology.broker("a").publish("in", vec![n]);
        if n % 5 == 0 {
            topology.broker("b").drop_connections();
        }
        sleep(Duration::from_millis(5)).await;
    }

    wait_for("every message forwarded", || one.stats().forwarded == total as u64).await;

    let payloads = topology.broker("b").payloads("out");
    let expected: Vec<Vec<u8>> = (0..total).map(|n| vec![n]).collect();
    assert_eq!(payloads, expected);

    let stats = one.stats();
    println!("flapping destination stats: {:?}", stats);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.in_flight, 0);

    replicator.stop().await;
}

/// Test: A source that keeps dropping redelivers unacked entries instead of losing them
#[tokio::test]
async fn flapping_source_redelivers_unacked() {
    let topology = stream_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "in", "b", "out")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    for n in 0..20u8 {
        topology.broker("a").publish("in", vec![n]);
        if n % 4 == 0 {
            topology.broker("a").drop_connections();
        }
        sleep(Duration::from_millis(5)).await;
    }
    wait_connected(&replicator).await;

    wait_for("backlog drained", || {
        topology.broker("a").acked_count("in", "replicator:one") == 20
    })
    .await;

    // Acks lost with a dropped connection cause redelivery; first appearances
    // are never dropped or reordered
    let mut seen = Vec::new();
    for payload in topology.broker("b").payloads("out") {
        if !seen.contains(&payload) {
            seen.push(payload);
        }
    }
    let expected: Vec<Vec<u8>> = (0..20u8).map(|n| vec![n]).collect();
    assert_eq!(seen, expected);
    assert_eq!(one.state(), ConnectorState::Running);

    replicator.stop().await;
}

/// Test: Entries still queued when the source drops are forwarded exactly once
#[tokio::test]
async fn source_drop_with_queued_entries_forwards_each_once() {
    let topology = stream_to_stream();
    let mut config = topology.config(vec![ConnectorConfig::for_testing("one", "a", "in", "b", "out")]);
    config.settings.forward.max_retries = 10;
    let replicator = topology.replicator(config);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    // Hold the head in retry so the rest stays queued and unacked
    topology.broker("b").reject_next_publishes(5);
    for n in 0..5u8 {
        topology.broker("a").publish("in", vec![n]);
    }
    wait_for("all accepted", || one.stats().received == 5).await;
    topology.broker("a").drop_connections();

    wait_for("all acked", || topology.broker("a").acked_count("in", "replicator:one") == 5).await;
    sleep(Duration::from_millis(100)).await;

    let expected: Vec<Vec<u8>> = (0..5u8).map(|n| vec![n]).collect();
    assert_eq!(topology.broker("b").payloads("out"), expected);

    let stats = one.stats();
    println!("source drop stats: {:?}", stats);
    assert_eq!(stats.received, 5);
    assert_eq!(stats.forwarded, 5);
    assert_eq!(stats.source_disconnects, 1);
    assert_eq!(topology.broker("a").pending_count("in", "replicator:one"), 0);

    replicator.stop().await;
}

// =============================================================================
// Publish Rejections
// =============================================================================

/// Test: A burst of rejections is absorbed by retries
#[tokio::test]
async fn rejection_burst_absorbed_by_retries() {
    let topology = pubsub_to_stream();
    let mut config = topology.config(vec![ConnectorConfig::for_testing("one", "a", "x", "b", "x")]);
    config.settings.forward.max_retries = 20;
    let replicator = topology.replicator(config);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    topology.broker("b").reject_next_publishes(15);
    for n in 0..5u8 {
        topology.broker("a").publish("x", vec![n]);
    }

    wait_for("all forwarded", || one.stats().forwarded == 5).await;
    let stats = one.stats();
    assert_eq!(stats.retries, 15);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        topology.broker("b").payloads("x"),
        (0..5u8).map(|n| vec![n]).collect::<Vec<_>>()
    );

    replicator.stop().await;
}

/// Test: Every accepted message is accounted for under sustained rejection
#[tokio::test]
async fn sustained_rejection_accounts_every_message() {
    let topology = pubsub_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "x", "b", "x")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    topology.broker("b").reject_next_publishes(usize::MAX);
    for n in 0..4u8 {
        topology.broker("a").publish("x", vec![n]);
    }

    wait_for("all settled", || {
        let stats = one.stats();
        stats.received == 4 && stats.in_flight == 0
    })
    .await;

    let stats = one.stats();
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.forwarded, 0);
    assert_eq!(stats.settled(), stats.received);
    assert_eq!(one.state(), ConnectorState::Running);

    replicator.stop().await;
}

// =============================================================================
// Payload Edge Cases
// =============================================================================

/// Test: Empty, binary and large payloads pass through untouched
#[tokio::test]
async fn edge_case_payloads_pass_through() {
    let topology = stream_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "in", "b", "out")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    let payloads: Vec<Vec<u8>> = vec![
        vec![],
        vec![0x00],
        vec![0xFF; 16],
        (0..=255u8).collect(),
        vec![0xAB; 1024 * 1024],
    ];
    for payload in &payloads {
        topology.broker("a").publish("in", payload.clone());
    }

    wait_for("all forwarded", || one.stats().forwarded == payloads.len() as u64).await;
    assert_eq!(topology.broker("b").payloads("out"), payloads);

    let total: u64 = payloads.iter().map(|p| p.len() as u64).sum();
    assert_eq!(one.stats().bytes_in, total);
    assert_eq!(one.stats().bytes_out, total);

    replicator.stop().await;
}

/// Test: Malformed origin headers never stop a forward
#[tokio::test]
async fn malformed_origin_header_forwarded() {
    let topology = stream_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "in", "b", "out")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    for origin in ["", ",,,", " , ", "other,,"] {
        topology.broker("a").publish_message(
            Message::new("in", b"m".to_vec()).with_header(ORIGIN_HEADER, origin),
        );
    }

    wait_for("all forwarded", || one.stats().forwarded == 4).await;
    assert_eq!(one.stats().suppressed, 0);
    assert!(topology
        .broker("b")
        .messages("out")
        .iter()
        .all(|m| m.was_forwarded_by("one")));

    replicator.stop().await;
}

// =============================================================================
// Concurrency
// =============================================================================

/// Test: Snapshot readers never stall or tear under load
#[tokio::test]
async fn snapshots_during_traffic_are_consistent() {
    let topology = pubsub_to_stream();
    let mut config = topology.config(vec![ConnectorConfig::for_testing("one", "a", "x", "b", "x")]);
    // Pub/sub cannot be paused; leave room for the whole burst
    config.settings.forward.max_pending = 512;
    let replicator = Arc::new(topology.replicator(config));
    replicator.start().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let replicator = Arc::clone(&replicator);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut reads = 0u64;
            while !done.load(Ordering::Relaxed) {
                for snapshot in replicator.snapshot() {
                    let stats = snapshot.stats;
                    assert_eq!(stats.settled() + stats.in_flight, stats.received);
                }
                let _ = replicator.health_check();
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    for n in 0..200u32 {
        topology.broker("a").publish("x", n.to_be_bytes().to_vec());
        if n % 20 == 0 {
            tokio::task::yield_now().await;
        }
    }
    let one = replicator.connector("one").unwrap();
    wait_for("all forwarded", || one.stats().forwarded == 200).await;

    done.store(true, Ordering::Relaxed);
    let reads = reader.await.unwrap();
    println!("snapshot reads during traffic: {}", reads);
    assert!(reads > 0);

    replicator.stop().await;
}

/// Test: Stop during a full outage returns promptly and counts what was stuck
#[tokio::test]
async fn stop_during_outage_is_bounded() {
    let topology = pubsub_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "x", "b", "x")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    topology.broker("b").set_online(false);
    wait_for("destination down", || replicator.pool().connected_count() == 1).await;
    for n in 0..10u8 {
        topology.broker("a").publish("x", vec![n]);
    }
    wait_for("all accepted", || one.stats().received == 10).await;

    let started = std::time::Instant::now();
    replicator.stop().await;
    let elapsed = started.elapsed();

    // Drain deadline (1s) plus bounded overhead
    assert!(elapsed < Duration::from_secs(3), "stop took {:?}", elapsed);
    assert_eq!(replicator.state(), ReplicatorState::Stopped);

    let stats = one.stats();
    assert_eq!(stats.dropped_on_shutdown, 10);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.settled(), stats.received);
}

/// Test: Rapid connector restarts leave no duplicate subscriptions
#[tokio::test]
async fn connector_restart_cycles() {
    let topology = pubsub_to_stream();
    let replicator = topology.replicator_for(vec![ConnectorConfig::for_testing("one", "a", "x", "b", "x")]);
    replicator.start().await.unwrap();
    let one = replicator.connector("one").unwrap();

    for _ in 0..10 {
        one.stop().await;
        assert_eq!(one.state(), ConnectorState::Stopped);
        one.start().await.unwrap();
        assert_eq!(one.state(), ConnectorState::Running);
    }
    wait_for("single subscriber", || topology.broker("a").subscriber_count("x") == 1).await;

    topology.broker("a").publish("x", b"once".to_vec());
    wait_for("forwarded", || one.stats().forwarded == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(topology.broker("b").payloads("x"), vec![b"once".to_vec()]);

    replicator.stop().await;
}
