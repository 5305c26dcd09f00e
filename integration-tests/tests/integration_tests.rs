// End-to-end tests against a running Redis
//
// Run with: REDIS_URL=redis://localhost:6379 cargo test --test integration_tests -- --ignored

use chrono::Utc;
use common::cache::{Cache, Expiration, RedisCacheStore};
use common::config::WorkerConfig;
use common::lease::{
    lease_key, CacheLeaseStore, Lease, LeaseCoordinator, LeaseState, LeaseStore, Ownership,
};
use common::shutdown::shutdown_channel;
use common::worker::{CycleOutcome, JobContext, WorkerHost, WorkerJob};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Helper connecting to the Redis named by `REDIS_URL`
async fn setup_cache() -> Cache {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let store = RedisCacheStore::connect(&url)
        .await
        .expect("Failed to connect to Redis");
    store.health_check().await.expect("Redis is not answering PING");
    Cache::new(Arc::new(store))
}

/// Unique app name so parallel test runs never share keys
fn unique_app() -> String {
    format!("it-{}", Uuid::new_v4().simple())
}

fn coordinator(cache: &Cache, app: &str, host: &str) -> LeaseCoordinator {
    let store = Arc::new(CacheLeaseStore::new(cache.clone(), app));
    LeaseCoordinator::new("Sync", host, chrono::Duration::minutes(16), store)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Office {
    id: u32,
    name: String,
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_typed_values_round_trip_through_redis() {
        let cache = setup_cache().await;
        let app = unique_app();
        let office = Office {
            id: 3,
            name: "Lagos".to_string(),
        };

        cache
            .set(&app, "Office:3", &office, Expiration::After(Duration::from_secs(60)))
            .await
            .unwrap();
        let read: Option<Office> = cache.get(&app, "Office:3").await.unwrap();
        assert_eq!(read, Some(office));

        cache.remove(&app, "Office:3").await.unwrap();
        let read: Option<Office> = cache.get(&app, "Office:3").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires Redis to be running
    async fn test_blocking_get_reads_redis_entries() {
        let cache = setup_cache().await;
        let app = unique_app();
        let office = Office {
            id: 9,
            name: "Hue".to_string(),
        };

        cache.set(&app, "Office:9", &office, Expiration::Never).await.unwrap();
        cache.set(&app, "Office:bad", &"not an office", Expiration::Never).await.unwrap();
        cache
            .set(&app, "Office:huge", &office, Expiration::After(Duration::MAX))
            .await
            .unwrap();

        let reader = cache.clone();
        let blocking_app = app.clone();
        let (found, undecodable, huge, missing) = tokio::task::spawn_blocking(move || {
            (
                reader.get_blocking::<Office>(&blocking_app, "Office:9").unwrap(),
                reader.get_blocking::<Office>(&blocking_app, "Office:bad").unwrap(),
                reader.get_blocking::<Office>(&blocking_app, "Office:huge").unwrap(),
                reader.get_blocking::<Office>(&blocking_app, "Office:none").unwrap(),
            )
        })
        .await
        .unwrap();

        assert_eq!(found, Some(office.clone()));
        assert!(undecodable.is_none());
        assert_eq!(huge, Some(office));
        assert!(missing.is_none());

        cache.remove_all(&app, "Office").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_pattern_removal_stays_inside_namespace() {
        let cache = setup_cache().await;
        let app = unique_app();
        let other = unique_app();

        for key in ["Foo:1", "Foo:2", "Bar:1"] {
            cache.set(&app, key, &key, Expiration::Never).await.unwrap();
        }
        cache.set(&other, "Foo:1", &"keep", Expiration::Never).await.unwrap();

        let removed = cache.remove_all(&app, "Foo:*").await.unwrap();
        assert_eq!(removed, 2);

        let left: Vec<String> = cache.get_all(&app, "*").await.unwrap();
        assert_eq!(left, vec!["Bar:1".to_string()]);
        let untouched: Option<String> = cache.get(&other, "Foo:1").await.unwrap();
        assert_eq!(untouched.as_deref(), Some("keep"));

        cache.remove_all(&other, "Foo").await.unwrap();
        cache.remove_all(&app, "Bar").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_sliding_expiration_is_renewed_by_reads() {
        let cache = setup_cache().await;
        let app = unique_app();

        cache
            .set(&app, "Session", &"live", Expiration::Sliding(Duration::from_millis(600)))
            .await
            .unwrap();

        for _ in 0..3 {
            sleep(Duration::from_millis(300)).await;
            let value: Option<String> = cache.get(&app, "Session").await.unwrap();
            assert_eq!(value.as_deref(), Some("live"));
        }

        sleep(Duration::from_millis(900)).await;
        let value: Option<String> = cache.get(&app, "Session").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_absolute_expiration_in_the_past_removes_key() {
        let cache = setup_cache().await;
        let app = unique_app();

        cache.set(&app, "K", &1u32, Expiration::Never).await.unwrap();
        cache
            .set(&app, "K", &2u32, Expiration::At(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let value: Option<u32> = cache.get(&app, "K").await.unwrap();
        assert!(value.is_none());
    }
}

#[cfg(test)]
mod lease_tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_second_host_stays_inactive_while_first_is_live() {
        let cache = setup_cache().await;
        let app = unique_app();
        let a = coordinator(&cache, &app, "host-a");
        let b = coordinator(&cache, &app, "host-b");

        assert_eq!(a.heartbeat().await, LeaseState::Active);
        assert_eq!(b.heartbeat().await, LeaseState::Inactive);
        assert_eq!(b.ownership().await, Ownership::HeldBy("host-a".to_string()));

        assert!(a.release().await);
        assert_eq!(b.heartbeat().await, LeaseState::Active);
        assert!(b.release().await);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_stale_lease_is_taken_over_after_two_heartbeats() {
        let cache = setup_cache().await;
        let app = unique_app();
        let store = CacheLeaseStore::new(cache.clone(), &app);
        store
            .store("Sync", &Lease::new("crashed-host", Utc::now() - chrono::Duration::minutes(20)))
            .await
            .unwrap();

        let b = coordinator(&cache, &app, "host-b");
        assert_eq!(b.heartbeat().await, LeaseState::Inactive);
        assert_eq!(b.heartbeat().await, LeaseState::Active);

        let raw: Option<String> = cache.get(&app, &lease_key("Sync")).await.unwrap();
        assert!(raw.unwrap().starts_with("host-b|"));
        b.release().await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_only_one_host_executes_while_lease_is_held() {
        let cache = setup_cache().await;
        let app = unique_app();
        let runs = Arc::new(AtomicUsize::new(0));

        let job: Arc<dyn WorkerJob> = {
            let runs = Arc::clone(&runs);
            Arc::new(move |_ctx: JobContext| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
        };

        let mut config = WorkerConfig::new("Sync");
        config.is_enabled = true;
        config.interval_period_seconds = Some(60);

        let mut host_a = WorkerHost::new(cache.clone(), app.clone(), "host-a");
        let mut host_b = WorkerHost::new(cache.clone(), app.clone(), "host-b");
        let a = host_a.register(config.clone(), Arc::clone(&job));
        let b = host_b.register(config, Arc::clone(&job));

        a.coordinator().heartbeat().await;
        b.coordinator().heartbeat().await;

        assert_eq!(a.run_cycle().await, CycleOutcome::Executed);
        assert_eq!(b.run_cycle().await, CycleOutcome::SkippedInactive);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        host_a.shutdown().await;
        host_b.shutdown().await;
        let lease: Option<String> = cache.get(&app, &lease_key("Sync")).await.unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_host_shutdown_releases_lease() {
        let cache = setup_cache().await;
        let app = unique_app();
        let mut host = WorkerHost::new(cache.clone(), app.clone(), "host-a");

        let mut config = WorkerConfig::new("Sync");
        config.is_enabled = true;
        config.start_delay_seconds = Some(0);
        config.interval_period_milliseconds = Some(100);
        host.register(
            config,
            Arc::new(|_ctx: JobContext| async move { Ok::<(), anyhow::Error>(()) }),
        );

        let host = Arc::new(host);
        let (trigger, signal) = shutdown_channel();
        let running = tokio::spawn({
            let host = Arc::clone(&host);
            async move { host.run_until(signal).await }
        });

        sleep(Duration::from_millis(300)).await;
        let lease: Option<String> = cache.get(&app, &lease_key("Sync")).await.unwrap();
        assert!(lease.unwrap().starts_with("host-a|"));

        trigger.fire();
        running.await.unwrap();
        let lease: Option<String> = cache.get(&app, &lease_key("Sync")).await.unwrap();
        assert!(lease.is_none());
    }
}
