//! Integration tests for the Redis counter store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! They are ignored by default; run with
//! `cargo test --test redis_store -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use ratewarden::store::RedisStoreConfig;
use ratewarden::{
    AdmissionProtocol, CounterStore, IncrementOutcome, LimitingService, LimitsConfig,
    ManualClock, Policy, RedisStore, StoreError,
};

const REDIS_URL: &str = "redis://127.0.0.1/";

/// Check if Redis is available before running tests
async fn redis_available() -> bool {
    match RedisStore::connect(REDIS_URL).await {
        Ok(store) => store.ping().await.is_ok(),
        Err(_) => false,
    }
}

/// Create a store with a prefix unique to the test and the process
async fn create_test_store(test_name: &str, clock: &ManualClock) -> RedisStore {
    let config = RedisStoreConfig {
        key_prefix: format!("test:{}:{}:", std::process::id(), test_name),
    };

    RedisStore::connect_with_config(REDIS_URL, config, Arc::new(clock.clone()))
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_opens_window() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available at {}", REDIS_URL);
        return;
    }

    let clock = ManualClock::starting_now();
    let store = create_test_store("increment_opens_window", &clock).await;
    store.clear("ip:10.0.0.1").await.unwrap();

    let first = store
        .increment("ip:10.0.0.1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(first.count, 1);

    clock.advance(Duration::from_secs(10));
    let second = store
        .increment("ip:10.0.0.1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(second.count, 2);
    assert_eq!(second.reset_time, first.reset_time);

    let stored = store.get("ip:10.0.0.1").await.unwrap().unwrap();
    assert_eq!(stored, second);

    store.clear("ip:10.0.0.1").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_restarts_expired_window() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let clock = ManualClock::starting_now();
    let store = create_test_store("restarts_expired_window", &clock).await;
    store.clear("token:abc").await.unwrap();

    store
        .set("token:abc", 50, Duration::from_secs(30))
        .await
        .unwrap();
    let overdrawn = store.get("token:abc").await.unwrap().unwrap();
    assert_eq!(overdrawn.count, 50);

    // the hash is still present in Redis, but its window has ended
    clock.advance(Duration::from_secs(31));
    let record = store
        .increment("token:abc", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(record.count, 1);
    assert!(record.reset_time > overdrawn.reset_time);

    store.clear("token:abc").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_get_missing_and_clear() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let clock = ManualClock::starting_now();
    let store = create_test_store("get_missing_and_clear", &clock).await;

    assert!(store.get("ip:never-seen").await.unwrap().is_none());

    store
        .increment("ip:10.0.0.2", Duration::from_secs(60))
        .await
        .unwrap();
    store.clear("ip:10.0.0.2").await.unwrap();
    assert!(store.get("ip:10.0.0.2").await.unwrap().is_none());

    // clearing an absent key is not an error
    store.clear("ip:10.0.0.2").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_below_caps_concurrent_admissions() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let clock = ManualClock::starting_now();
    let store = create_test_store("increment_below", &clock).await;
    store.clear("ip:10.0.0.3").await.unwrap();

    let calls = (0..25).map(|_| {
        let store = store.clone();
        async move {
            store
                .increment_below("ip:10.0.0.3", Duration::from_secs(60), 10)
                .await
                .unwrap()
        }
    });
    let outcomes = join_all(calls).await;

    let admitted = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, IncrementOutcome::Admitted(_)))
        .count();
    assert_eq!(admitted, 10);

    let record = store.get("ip:10.0.0.3").await.unwrap().unwrap();
    assert_eq!(record.count, 10);

    store.clear("ip:10.0.0.3").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_closed_store_rejects_calls() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let clock = ManualClock::starting_now();
    let store = create_test_store("closed", &clock).await;

    store.close().await.unwrap();
    store.close().await.unwrap();

    assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    assert!(matches!(
        store.get("ip:10.0.0.4").await,
        Err(StoreError::Closed)
    ));
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_instances_share_budget() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let clock = ManualClock::starting_now();
    let store_a = Arc::new(create_test_store("shared_budget", &clock).await);
    let store_b = Arc::new(create_test_store("shared_budget", &clock).await);
    store_a.clear("ip:10.0.0.5").await.unwrap();

    let limits = LimitsConfig {
        default_policy: Policy::new(3, Duration::from_secs(60)).unwrap(),
        protocol: AdmissionProtocol::Atomic,
        ..LimitsConfig::default()
    };
    let first = LimitingService::new(limits.clone(), store_a.clone(), Arc::new(clock.clone()))
        .unwrap();
    let second = LimitingService::new(limits, store_b, Arc::new(clock.clone())).unwrap();

    assert!(first.decide("10.0.0.5", "").await.is_ok());
    assert!(second.decide("10.0.0.5", "").await.is_ok());
    assert!(first.decide("10.0.0.5", "").await.is_ok());

    let err = second.decide("10.0.0.5", "").await.unwrap_err();
    assert!(err.is_limit_exceeded());

    store_a.clear("ip:10.0.0.5").await.unwrap();
}
