//! Integration tests against a live `Redis`.
//!
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -p idempotency-redis -- --ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use idempotency_core::{
    ClaimOutcome, IdempotencyCheck, IdempotencyConfig, KeyValueStore, generate_correlation_id,
};
use idempotency_redis::{RedisConfig, RedisStore};
use idempotency_runtime::{CorrelationService, IdempotencyService};
use serde_json::json;
use std::time::Duration;

async fn store() -> RedisStore {
    RedisStore::connect(&RedisConfig::from_env())
        .await
        .expect("Failed to connect to Redis")
}

/// Fresh namespace so runs never see each other's keys.
fn config() -> IdempotencyConfig {
    IdempotencyConfig::new(generate_correlation_id(Some("it")))
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn set_if_absent_has_one_winner() {
    let store = store().await;
    let key = format!("{}:nx", config().namespace);

    let first = store.set_if_absent(&key, b"a".to_vec(), Duration::from_secs(30)).await.unwrap();
    let second = store.set_if_absent(&key, b"b".to_vec(), Duration::from_secs(30)).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(store.get(&key).await.unwrap(), Some(b"a".to_vec()));
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn list_range_follows_lrange_semantics() {
    let store = store().await;
    let key = format!("{}:list", config().namespace);

    for value in ["a", "b", "c"] {
        store.list_append(&key, value.as_bytes().to_vec()).await.unwrap();
    }
    store.expire(&key, Duration::from_secs(30)).await.unwrap();

    let all = store.list_range(&key, 0, -1).await.unwrap();
    let tail = store.list_range(&key, -2, -1).await.unwrap();

    assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(tail, vec![b"b".to_vec(), b"c".to_vec()]);
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn idempotency_lifecycle_over_redis() {
    let service = IdempotencyService::new(store().await, config());

    assert_eq!(service.start_operation("k", "c", "m1", None).await.unwrap(), ClaimOutcome::New);
    assert_eq!(
        service.start_operation("k", "c", "m2", None).await.unwrap(),
        ClaimOutcome::Duplicate
    );
    service.complete_operation("k", &json!({"reservationId": "r1"}), None).await.unwrap();

    assert_eq!(service.check_idempotency("k").await, IdempotencyCheck::Completed);
    assert_eq!(
        service.get_operation_result("k").await.unwrap(),
        Some(json!({"reservationId": "r1"}))
    );
    service.clear_operation("k").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn short_processing_ttl_self_heals() {
    let config = config().with_processing_ttl(Duration::from_secs(1));
    let service = IdempotencyService::new(store().await, config);

    service.start_operation("k", "c", "crashed", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(
        service.start_operation("k", "c", "recovered", None).await.unwrap(),
        ClaimOutcome::New
    );
    service.clear_operation("k").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn causal_tree_over_redis() {
    let correlation = CorrelationService::new(store().await, config());
    let corr = correlation.generate_correlation_id(Some("api"));

    correlation.record_event_chain(&corr, "A", None, "Requested", "api", None).await;
    correlation.record_event_chain(&corr, "B", Some("A"), "Held", "inventory", None).await;

    let tree = correlation.build_causal_tree(&corr).await;
    assert!(tree["A"].children.contains_key("B"));
}
