//! End-to-end scenarios against a real PostgreSQL instance.

mod common;

use std::time::Duration;

use glacial_cache::CacheEntryOptions;
use tokio::time::sleep;

#[tokio::test]
async fn scenario_1_sliding_renewal_extends_life() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "scenario1");
    config.cache.min_interval = Duration::from_millis(1);
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set(
            "k1",
            b"v1",
            CacheEntryOptions::new().with_sliding_expiration(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    // Renew twice, well inside the sliding window each time.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));
    sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));

    // Let it lapse past the sliding window without a renewing get.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.get("k1").await.unwrap(), None);
}

#[tokio::test]
async fn scenario_2_absolute_caps_sliding() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "scenario2");
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set(
            "k2",
            b"v2",
            CacheEntryOptions::new()
                .with_sliding_expiration(Duration::from_secs(60))
                .with_absolute_expiration_relative(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    // Sliding alone would keep this alive far longer, but the absolute cap
    // governs: entry must be gone shortly after 200ms regardless of gets.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.get("k2").await.unwrap(), Some(b"v2".to_vec()));

    sleep(Duration::from_millis(250)).await;
    assert_eq!(cache.get("k2").await.unwrap(), None);
}

#[tokio::test]
async fn scenario_3_refresh_no_op_without_sliding() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "scenario3");
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set(
            "k3",
            b"v3",
            CacheEntryOptions::new().with_absolute_expiration_relative(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    let before = cache.get_entry("k3").await.unwrap().unwrap().next_expiration;
    // Refresh requires a sliding_interval to act on; with only an absolute
    // expiration set, it must be a no-op.
    cache.refresh("k3").await.unwrap();
    let after = cache.get_entry("k3").await.unwrap().unwrap().next_expiration;
    assert_eq!(before, after);
}

#[tokio::test]
async fn scenario_4_batch_partial_hit() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "scenario4");
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set_multiple(&[
            ("a".to_string(), b"1".to_vec(), CacheEntryOptions::new()),
            ("b".to_string(), b"2".to_vec(), CacheEntryOptions::new()),
        ])
        .await
        .unwrap();

    let results = cache
        .get_multiple(&["a".to_string(), "b".to_string(), "missing".to_string()])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let mut keys: Vec<&str> = results.iter().map(|e| e.key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a", "b"]);
}

#[tokio::test]
async fn remove_multiple_counts_only_keys_that_were_present() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "removecount");
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set_multiple(&[
            ("x".to_string(), b"1".to_vec(), CacheEntryOptions::new()),
            ("y".to_string(), b"2".to_vec(), CacheEntryOptions::new()),
        ])
        .await
        .unwrap();

    let removed = cache
        .remove_multiple(&["x".to_string(), "y".to_string(), "absent".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn refresh_multiple_counts_only_sliding_live_keys() {
    let db = common::start_postgres().await;
    let mut config = common::config_for(&db.connection_string, "refreshcount");
    config.infrastructure.enable_manager_election = false;
    config.maintenance.enable_automatic_cleanup = false;
    let cache = common::connect(config).await;

    cache
        .set(
            "sliding",
            b"v",
            CacheEntryOptions::new().with_sliding_expiration(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    cache
        .set(
            "fixed",
            b"v",
            CacheEntryOptions::new().with_absolute_expiration_relative(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let refreshed = cache
        .refresh_multiple(&["sliding".to_string(), "fixed".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(refreshed, 1);
}

#[tokio::test]
async fn scenario_5_single_leader_with_failover() {
    let db = common::start_postgres().await;
    let config_a = {
        let mut c = common::config_for(&db.connection_string, "scenario5");
        c.infrastructure.lock.verification_interval = Duration::from_millis(50);
        c.infrastructure.lock.base_backoff = Duration::from_millis(50);
        c.infrastructure.lock.max_backoff = Duration::from_millis(200);
        c.infrastructure.lock.backoff_jitter = Duration::from_millis(10);
        c.maintenance.enable_automatic_cleanup = false;
        c
    };
    let config_b = config_a.clone();
    let config_c = config_a.clone();

    let cache_a = common::connect(config_a).await;
    let cache_b = common::connect(config_b).await;
    let cache_c = common::connect(config_c).await;

    // Give the election loop a few verification intervals to settle.
    sleep(Duration::from_millis(500)).await;

    let leaders = [cache_a.is_manager(), cache_b.is_manager(), cache_c.is_manager()];
    assert_eq!(leaders.iter().filter(|&&l| l).count(), 1);

    // Kill whichever instance is currently leading and confirm another
    // takes over within a bounded number of verification intervals.
    if cache_a.is_manager() {
        cache_a.shutdown();
    } else if cache_b.is_manager() {
        cache_b.shutdown();
    } else {
        cache_c.shutdown();
    }

    sleep(Duration::from_millis(1000)).await;
    let leaders_after = [cache_a.is_manager(), cache_b.is_manager(), cache_c.is_manager()];
    assert_eq!(leaders_after.iter().filter(|&&l| l).count(), 1);
}

#[tokio::test]
async fn scenario_6_voluntary_yield_turnover() {
    let db = common::start_postgres().await;
    let mut config_a = common::config_for(&db.connection_string, "scenario6");
    config_a.infrastructure.lock.verification_interval = Duration::from_millis(30);
    config_a.infrastructure.lock.voluntary_yield_interval = Duration::from_millis(60);
    config_a.infrastructure.lock.yield_window = Duration::from_millis(60);
    config_a.maintenance.enable_automatic_cleanup = false;
    let mut config_b = config_a.clone();
    config_b.infrastructure.lock.verification_interval = Duration::from_millis(30);

    let cache_a = common::connect(config_a).await;
    let cache_b = common::connect(config_b).await;

    sleep(Duration::from_millis(300)).await;
    let initial_leader_is_a = cache_a.is_manager();
    assert_ne!(cache_a.is_manager(), cache_b.is_manager());

    // voluntary_yield_interval is well below the polling window, so the
    // leader is guaranteed to yield once its tenure clock crosses it; poll
    // for the resulting turnover within a bounded number of intervals.
    let mut saw_turnover = false;
    for _ in 0..40 {
        sleep(Duration::from_millis(50)).await;
        if cache_a.is_manager() != initial_leader_is_a {
            saw_turnover = true;
            break;
        }
    }
    assert!(saw_turnover, "expected voluntary yield to cause a leadership turnover");
}
