//! Integration tests for claim races, replays and crash recovery.
//!
//! Runs the services against the in-memory store under a multi-threaded
//! runtime so that concurrent claims really interleave.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use idempotency_core::{ClaimOutcome, IdempotencyCheck, IdempotencyConfig, MetadataUpdate};
use idempotency_runtime::{CorrelationService, IdempotencyService};
use idempotency_testing::{InMemoryStore, ManualClock, init_tracing};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn service() -> IdempotencyService<InMemoryStore> {
    IdempotencyService::new(InMemoryStore::new(), IdempotencyConfig::new("it"))
}

async fn race(service: &IdempotencyService<InMemoryStore>, key: &str, contenders: usize) -> Vec<ClaimOutcome> {
    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let service = service.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                service
                    .start_operation(&key, "corr-race", &format!("msg-{i}"), None)
                    .await
                    .unwrap()
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_claims_have_exactly_one_winner(contenders in 1usize..48, key in "[a-z0-9-]{1,24}") {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let outcomes = rt.block_on(race(&service(), &key, contenders));

        let winners = outcomes.iter().filter(|o| o.is_new()).count();
        prop_assert_eq!(winners, 1);
        prop_assert_eq!(outcomes.len() - winners, contenders - 1);
    }

    #[test]
    fn retry_count_is_monotonic(failures in 1u32..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let service = service();
            service.start_operation("k", "c", "m-0", None).await.unwrap();

            let mut last = 0;
            for attempt in 1..=failures {
                service.fail_operation("k", "transient", None).await.unwrap();
                let record = service.get_record("k").await.unwrap().unwrap();
                prop_assert_eq!(record.retry_count, last + 1);
                last = record.retry_count;

                // Retry takes over the failed record and keeps the count.
                let claim = service
                    .start_operation("k", "c", &format!("m-{attempt}"), None)
                    .await
                    .unwrap();
                prop_assert_eq!(claim, ClaimOutcome::New);
                prop_assert_eq!(service.get_record("k").await.unwrap().unwrap().retry_count, last);
            }
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_of_a_failed_key_have_one_winner() {
    init_tracing();
    let service = service();
    service.start_operation("k", "c", "first", None).await.unwrap();
    service.fail_operation("k", "boom", None).await.unwrap();

    let outcomes = race(&service, "k", 16).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_new()).count(), 1);
}

#[tokio::test]
async fn claim_race_scenario() {
    init_tracing();
    let service = service();
    let key = "create-reservation-42";

    let a = service.start_operation(key, "corr-a", "msg-a", None).await.unwrap();
    let b = service.start_operation(key, "corr-b", "msg-b", None).await.unwrap();
    assert_eq!(a, ClaimOutcome::New);
    assert_eq!(b, ClaimOutcome::Duplicate);

    service
        .complete_operation(key, &json!({"reservationId": "r1"}), None)
        .await
        .unwrap();

    assert_eq!(service.check_idempotency(key).await, IdempotencyCheck::Completed);
    assert_eq!(
        service.get_operation_result(key).await.unwrap(),
        Some(json!({"reservationId": "r1"}))
    );
}

#[tokio::test]
async fn check_follows_the_lifecycle() {
    let service = service();
    let payload = json!({"reservationId": "r9", "seats": ["A1", "A2"], "total": 42.5});

    assert_eq!(service.check_idempotency("k").await, IdempotencyCheck::New);
    service.start_operation("k", "c", "m", None).await.unwrap();
    assert_eq!(service.check_idempotency("k").await, IdempotencyCheck::Duplicate);
    service.complete_operation("k", &payload, None).await.unwrap();
    assert_eq!(service.check_idempotency("k").await, IdempotencyCheck::Completed);
    assert_eq!(service.get_operation_result("k").await.unwrap(), Some(payload));
}

#[tokio::test]
async fn crash_recovery_scenario() {
    let clock = Arc::new(ManualClock::default());
    let store = InMemoryStore::with_clock(clock.clone());
    let config = IdempotencyConfig::new("it").with_processing_ttl(Duration::from_secs(60));
    let service = IdempotencyService::new(store.clone(), config).with_clock(clock.clone());

    // Claimant crashes after claiming.
    service.start_operation("k", "c", "crashed", None).await.unwrap();
    assert_eq!(
        service.start_operation("k", "c", "too-early", None).await.unwrap(),
        ClaimOutcome::Duplicate
    );

    clock.advance(chrono::Duration::seconds(61));

    assert!(!store.contains_key("it:idempotency:k"));
    assert_eq!(
        service.start_operation("k", "c", "recovered", None).await.unwrap(),
        ClaimOutcome::New
    );
}

#[tokio::test]
async fn causal_tracing_across_services() {
    let store = InMemoryStore::new();
    let correlation = CorrelationService::new(store, IdempotencyConfig::new("it"));
    let corr = correlation.generate_correlation_id(Some("api"));

    correlation
        .add_metadata(&corr, MetadataUpdate::default().service("api").endpoint("/reservations"))
        .await;
    correlation.record_event_chain(&corr, "A", None, "ReservationRequested", "api", None).await;
    correlation.record_event_chain(&corr, "B", Some("A"), "SeatHeld", "inventory", None).await;
    correlation.record_event_chain(&corr, "C", Some("B"), "PaymentCaptured", "billing", None).await;
    correlation.record_event_chain(&corr, "D", None, "AuditStarted", "audit", None).await;
    correlation.record_event_chain(&corr, "E", Some("missing-X"), "Late", "billing", None).await;

    let tree = correlation.build_causal_tree(&corr).await;
    assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["A", "D", "E"]);
    assert!(tree["A"].children["B"].children["C"].children.is_empty());

    let stats = correlation.get_chain_stats(&corr).await;
    assert_eq!(stats.total_events, 5);
    assert_eq!(stats.services, vec!["api", "inventory", "billing", "audit"]);
    assert_eq!(stats.event_types.len(), 5);
}
