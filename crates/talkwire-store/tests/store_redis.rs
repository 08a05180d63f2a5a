//! Integration tests against a live Store.
//!
//! Run with `cargo test -- --ignored` and a reachable Redis at
//! `TALKWIRE_TEST_REDIS_URL` (defaults to redis://127.0.0.1:6379).

use std::time::Duration;

use talkwire_store::{GroupDirectory, Store, StoreError};

fn test_url() -> String {
    std::env::var("TALKWIRE_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn membership_is_mirrored_both_ways() {
    let store = Store::connect(&test_url()).await.expect("connect");
    let groups = GroupDirectory::new(store, Duration::from_millis(95_000));
    let user = unique("user");
    let group = unique("group");

    groups.add_user(&user, &group).await.expect("add");
    assert!(groups.members(&group).await.expect("members").contains(&user));
    assert!(groups.groups_of(&user).await.expect("groups").contains(&group));

    groups.remove_user(&user, &group).await.expect("remove");
    assert!(groups.members(&group).await.expect("members").is_empty());
    assert!(groups.groups_of(&user).await.expect("groups").is_empty());
}

#[tokio::test]
#[ignore]
async fn second_speaker_sees_busy_and_first_keeps_the_slot() {
    let store = Store::connect(&test_url()).await.expect("connect");
    let groups = GroupDirectory::new(store, Duration::from_millis(95_000));
    let group = unique("group");

    let turn = groups.begin_turn(&group, "alice").await.expect("first turn");
    assert_eq!(turn.from_id, "alice");

    let err = groups.begin_turn(&group, "bob").await.unwrap_err();
    match err {
        StoreError::Busy { holder } => assert_eq!(holder, "alice"),
        other => panic!("expected Busy, got {other}"),
    }

    // Same holder refreshes rather than failing.
    let refreshed = groups.begin_turn(&group, "alice").await.expect("refresh");
    assert_eq!(refreshed.started_at, turn.started_at);
    assert!(refreshed.expires_at >= turn.expires_at);

    groups.end_turn(&group).await.expect("end");
    assert!(groups.current_turn(&group).await.expect("read").is_none());
}

#[tokio::test]
#[ignore]
async fn disconnect_cleanup_clears_only_this_users_slots() {
    let store = Store::connect(&test_url()).await.expect("connect");
    let groups = GroupDirectory::new(store, Duration::from_millis(95_000));
    let mine = unique("group");
    let theirs = unique("group");

    groups.add_user("alice", &mine).await.expect("add");
    groups.add_user("alice", &theirs).await.expect("add");
    groups.begin_turn(&mine, "alice").await.expect("turn");
    groups.begin_turn(&theirs, "carol").await.expect("turn");

    groups.end_turns_of("alice").await.expect("cleanup");

    assert!(groups.current_turn(&mine).await.expect("read").is_none());
    assert_eq!(
        groups
            .current_turn(&theirs)
            .await
            .expect("read")
            .expect("still held")
            .from_id,
        "carol"
    );
}
