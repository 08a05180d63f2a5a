//! Integration tests against a live Store.
//!
//! Run with `cargo test -- --ignored` and a reachable Redis at
//! `TALKWIRE_TEST_REDIS_URL` (defaults to redis://127.0.0.1:6379).

use std::sync::Arc;

use talkwire_presence::{DeviceInfo, PresenceConfig, PresenceManager, PresenceState};
use talkwire_store::{keys, Store};

fn test_url() -> String {
    std::env::var("TALKWIRE_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_user() -> String {
    format!("user-{}", uuid::Uuid::new_v4())
}

async fn manager(ttl_seconds: u64) -> (Arc<PresenceManager>, Store) {
    let store = Store::connect(&test_url()).await.expect("connect");
    let manager = Arc::new(PresenceManager::new(
        store.clone(),
        PresenceConfig {
            enabled: true,
            ttl_seconds,
        },
        None,
    ));
    (manager, store)
}

fn device() -> DeviceInfo {
    DeviceInfo {
        device_id: "D1".to_string(),
        role: "mobile".to_string(),
    }
}

#[tokio::test]
#[ignore]
async fn online_writes_the_indicator_and_meta() {
    let (manager, store) = manager(120).await;
    let user = unique_user();

    manager
        .set_user_online(&user, device())
        .await
        .expect("online");

    assert!(store.exists(&keys::presence(&user)).await.expect("exists"));
    let meta = store
        .hash_get_all(&keys::presence_meta(&user))
        .await
        .expect("meta");
    assert_eq!(meta.get("status").map(String::as_str), Some("online"));
    assert_eq!(meta.get("device_id").map(String::as_str), Some("D1"));

    let rows = manager.bulk_status(&[user.clone()]).await.expect("bulk");
    assert_eq!(rows[0].status, PresenceState::Online);
    assert!(rows[0].last_seen > 0);
}

#[tokio::test]
#[ignore]
async fn offline_deletes_the_indicator_but_keeps_meta() {
    let (manager, store) = manager(120).await;
    let user = unique_user();

    manager
        .set_user_online(&user, device())
        .await
        .expect("online");
    let online_rows = manager.bulk_status(&[user.clone()]).await.expect("bulk");
    manager.set_user_offline(&user).await.expect("offline");

    assert!(!store.exists(&keys::presence(&user)).await.expect("exists"));
    let rows = manager.bulk_status(&[user.clone()]).await.expect("bulk");
    assert_eq!(rows[0].status, PresenceState::Offline);
    // lastSeen stays queryable and never goes backwards.
    assert!(rows[0].last_seen >= online_rows[0].last_seen);
}

#[tokio::test]
#[ignore]
async fn offline_is_idempotent() {
    let (manager, _store) = manager(120).await;
    let user = unique_user();

    manager
        .set_user_online(&user, device())
        .await
        .expect("online");
    manager.set_user_offline(&user).await.expect("first offline");
    let first = manager.bulk_status(&[user.clone()]).await.expect("bulk");
    manager.set_user_offline(&user).await.expect("second offline");
    let second = manager.bulk_status(&[user.clone()]).await.expect("bulk");

    assert_eq!(first[0].status, PresenceState::Offline);
    assert_eq!(second[0].status, PresenceState::Offline);
    assert!(second[0].last_seen >= first[0].last_seen);
}

#[tokio::test]
#[ignore]
async fn heartbeat_extends_the_ttl_without_resurrecting() {
    let (manager, store) = manager(2).await;
    let user = unique_user();

    manager
        .set_user_online(&user, device())
        .await
        .expect("online");
    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    manager.refresh_heartbeat(&user).await.expect("refresh");
    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    // Without the refresh the 2s TTL would have elapsed by now.
    assert!(store.exists(&keys::presence(&user)).await.expect("exists"));

    manager.set_user_offline(&user).await.expect("offline");
    manager.refresh_heartbeat(&user).await.expect("noop refresh");
    assert!(!store.exists(&keys::presence(&user)).await.expect("exists"));
    let rows = manager.bulk_status(&[user.clone()]).await.expect("bulk");
    assert_eq!(rows[0].status, PresenceState::Offline);
}

#[tokio::test]
#[ignore]
async fn bulk_query_distinguishes_known_and_never_seen_users() {
    let (manager, _store) = manager(120).await;
    let online = unique_user();
    let offline = unique_user();
    let never_seen = unique_user();

    manager
        .set_user_online(&online, device())
        .await
        .expect("online");
    manager
        .set_user_online(&offline, device())
        .await
        .expect("online");
    manager.set_user_offline(&offline).await.expect("offline");

    let rows = manager
        .bulk_status(&[online.clone(), offline.clone(), never_seen.clone()])
        .await
        .expect("bulk");

    assert_eq!(rows[0].status, PresenceState::Online);
    assert_eq!(rows[1].status, PresenceState::Offline);
    assert!(rows[1].last_seen > 0);
    assert_eq!(rows[2].status, PresenceState::Offline);
    assert_eq!(rows[2].last_seen, 0);
}

#[tokio::test]
#[ignore]
async fn transitions_are_observed_through_the_store() {
    let (manager, _store) = manager(120).await;
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let _listener = manager.spawn_listener(Arc::clone(&shutdown));
    // Give the subscribe connection a moment to establish.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let mut events = manager.subscribe();
    let user = unique_user();
    manager
        .set_user_online(&user, device())
        .await
        .expect("online");

    let update = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event");
    assert_eq!(update.user_id, user);
    assert_eq!(update.status, PresenceState::Online);
    shutdown.notify_waiters();
}
