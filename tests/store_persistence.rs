//! Integration tests for the JSON-backed store: persistence across reopen,
//! load edge cases, and structural invariants under arbitrary operation
//! sequences.

use feedbot::storage::{FeedInfo, Store, StoreError, StoreState, Subscription};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn sub(user_id: i64, url: &str, title: &str) -> Subscription {
    Subscription::new(user_id, user_id + 1000, url, FeedInfo::new(title, "", ""))
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let store = Store::open(&path).await.unwrap();
    store.add(sub(1, "https://a.example/rss", "A")).await.unwrap();
    store.add(sub(2, "https://b.example/rss", "B")).await.unwrap();
    store
        .update_last_checked(1, "https://a.example/rss", "guid-1")
        .await
        .unwrap();
    store
        .record_feed_error("https://b.example/rss", "HTTP error: status 500")
        .await
        .unwrap();
    let before = serde_json::to_string_pretty(&store.snapshot().await).unwrap();
    drop(store);

    let reopened = Store::open(&path).await.unwrap();
    let after = serde_json::to_string_pretty(&reopened.snapshot().await).unwrap();
    assert_eq!(before, after);

    let subs = reopened.user_subscriptions(1).await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].last_item_guid, "guid-1");
    assert_eq!(subs[0].chat_id, 1001);
    let err = reopened.feed_error("https://b.example/rss").await.unwrap();
    assert_eq!(err.error_count, 1);
}

#[tokio::test]
async fn test_file_shape_uses_string_user_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let store = Store::open(&path).await.unwrap();
    store.add(sub(-77, "https://a.example/rss", "A")).await.unwrap();

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let stored = &raw["subscriptions"]["-77"]["https://a.example/rss"];
    assert_eq!(stored["user_id"], -77);
    assert_eq!(stored["chat_id"], 923);
    assert!(stored["last_checked"].as_str().unwrap().ends_with('Z'));
    assert!(raw["feed_errors"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_file_round_trip_is_byte_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let store = Store::open(&path).await.unwrap();
    store.add(sub(1, "https://a.example/rss", "Ä & <b>")).await.unwrap();
    store.record_feed_error("https://x.example/", "boom").await.unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let state: StoreState = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(serde_json::to_vec_pretty(&state).unwrap(), bytes);
}

#[tokio::test]
async fn test_missing_and_empty_files_are_empty_stores() {
    let dir = tempfile::tempdir().unwrap();

    let missing = Store::open(dir.path().join("nested/absent.json")).await.unwrap();
    assert!(missing.all_subscriptions().await.is_empty());

    let empty_path = dir.path().join("empty.json");
    std::fs::write(&empty_path, "").unwrap();
    let empty = Store::open(&empty_path).await.unwrap();
    assert_eq!(empty.snapshot().await, StoreState::default());

    // First write creates parent directories
    missing.add(sub(1, "https://a.example/rss", "A")).await.unwrap();
    assert!(dir.path().join("nested/absent.json").exists());
}

#[tokio::test]
async fn test_corrupt_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");
    std::fs::write(&path, "{\"subscriptions\": [oops").unwrap();

    match Store::open(&path).await {
        Err(StoreError::CorruptStore { path: p, .. }) => assert!(p.ends_with("db.json")),
        Err(e) => panic!("Expected CorruptStore, got {:?}", e),
        Ok(_) => panic!("Expected CorruptStore, got a store"),
    }
}

#[tokio::test]
async fn test_noop_remove_does_not_create_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let store = Store::open(&path).await.unwrap();
    store.remove(1, "https://absent.example/").await.unwrap();
    store.clear_feed_error("https://absent.example/").await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_no_temp_files_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");

    let store = Store::open(&path).await.unwrap();
    for i in 0..5 {
        store
            .add(sub(1, &format!("https://{i}.example/rss"), "F"))
            .await
            .unwrap();
    }

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["db.json".to_owned()]);
}

// ============================================================================
// Invariants
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Add(i64, u8),
    Remove(i64, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..4, 0u8..4).prop_map(|(u, f)| Op::Add(u, f)),
        (1i64..4, 0u8..4).prop_map(|(u, f)| Op::Remove(u, f)),
    ]
}

fn url(f: u8) -> String {
    format!("https://feed{f}.example/rss")
}

proptest! {
    #[test]
    fn store_matches_model_and_drops_empty_buckets(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = Store::in_memory();
            let mut model: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();

            for op in &ops {
                match *op {
                    Op::Add(u, f) => {
                        let fresh = model.entry(u).or_default().insert(url(f));
                        let result = store.add(sub(u, &url(f), "T")).await;
                        if fresh {
                            prop_assert!(result.is_ok());
                        } else {
                            prop_assert!(matches!(result, Err(StoreError::AlreadySubscribed)));
                        }
                    }
                    Op::Remove(u, f) => {
                        if let Some(set) = model.get_mut(&u) {
                            set.remove(&url(f));
                            if set.is_empty() {
                                model.remove(&u);
                            }
                        }
                        prop_assert!(store.remove(u, &url(f)).await.is_ok());
                    }
                }
            }

            let state = store.snapshot().await;
            prop_assert!(state.subscriptions.values().all(|subs| !subs.is_empty()));
            let actual: BTreeMap<i64, BTreeSet<String>> = state
                .subscriptions
                .iter()
                .map(|(u, subs)| (*u, subs.keys().cloned().collect()))
                .collect();
            prop_assert_eq!(actual, model);
            Ok(())
        })?;
    }
}
