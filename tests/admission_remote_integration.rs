//! Integration tests for the admission pipeline's Redis-backed `StateStore`.
//!
//! These tests require Docker (via testcontainers) and start a real Redis
//! server.
//!
//! Run with: `cargo test --test admission_remote_integration`

use hermes_gateway::admission::state_store::{RemoteStore, StateStore};
use std::time::Duration;

use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

async fn start_redis() -> (RemoteStore, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379_u16.tcp())
        .start()
        .await
        .expect("failed to start redis container");

    let host = container.get_host().await.expect("get host");
    let port = container.get_host_port_ipv4(6379).await.expect("get port");
    let url = format!("redis://{}:{}", host, port);

    let store = RemoteStore::connect(&url)
        .await
        .expect("connect to redis");

    (store, container)
}

#[tokio::test]
async fn admits_until_max_then_rejects() {
    let (store, _container) = start_redis().await;
    let key = "sliding_window:1.2.3.4:/a";

    for i in 0..2 {
        let r = store
            .sliding_window_admit(key, 1_000_000 + i, 1000, 2)
            .await
            .expect("admit call");
        assert!(r.admitted, "request {i} should admit");
    }

    let rejected = store
        .sliding_window_admit(key, 1_000_003, 1000, 2)
        .await
        .expect("admit call");
    assert!(!rejected.admitted);
    assert_eq!(rejected.pre_count, 2);
}

#[tokio::test]
async fn eviction_releases_the_window_after_it_elapses() {
    let (store, _container) = start_redis().await;
    let key = "sliding_window:5.5.5.5/b";

    store.sliding_window_admit(key, 2_000_000, 1000, 1).await.unwrap();
    let still_full = store.sliding_window_admit(key, 2_000_500, 1000, 1).await.unwrap();
    assert!(!still_full.admitted);

    let released = store.sliding_window_admit(key, 2_001_001, 1000, 1).await.unwrap();
    assert!(released.admitted);
}

#[tokio::test]
async fn flag_roundtrip_with_ttl() {
    let (store, _container) = start_redis().await;

    store
        .set_with_ttl("white_list:9.9.9.9", "1", Duration::from_secs(1))
        .await
        .expect("set flag");
    assert!(store.exists("white_list:9.9.9.9").await.unwrap());

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(!store.exists("white_list:9.9.9.9").await.unwrap());
}

#[tokio::test]
async fn delete_removes_flag_before_ttl() {
    let (store, _container) = start_redis().await;

    store
        .set_with_ttl("black_list:1.1.1.1", "reason", Duration::from_secs(60))
        .await
        .unwrap();
    store.delete("black_list:1.1.1.1").await.unwrap();
    assert!(!store.exists("black_list:1.1.1.1").await.unwrap());
}

#[tokio::test]
async fn active_ip_tracking_counts_distinct_ips() {
    let (store, _container) = start_redis().await;
    let window = Duration::from_secs(10);

    for ip in ["1.1.1.1", "2.2.2.2", "1.1.1.1", "3.3.3.3"] {
        store.track_active_ip("active_ips", ip, 3_000_000, window).await.unwrap();
    }
    let count = store
        .track_active_ip("active_ips", "3.3.3.3", 3_000_000, window)
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn active_ip_count_does_not_mutate_the_set() {
    let (store, _container) = start_redis().await;
    let window = Duration::from_secs(10);

    store.track_active_ip("active_ips2", "4.4.4.4", 4_000_000, window).await.unwrap();
    let count = store.active_ip_count("active_ips2", 4_000_000, window).await.unwrap();
    assert_eq!(count, 1);
    let count_again = store.active_ip_count("active_ips2", 4_000_000, window).await.unwrap();
    assert_eq!(count_again, 1);
}

#[tokio::test]
async fn ping_succeeds_against_a_live_server() {
    let (store, _container) = start_redis().await;
    store.ping().await.expect("ping should succeed");
}
