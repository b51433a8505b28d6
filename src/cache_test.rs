use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Notify;

use super::*;

/// Fetcher that counts calls, sleeps `delay`, then answers `{"key": ..., "n": call}`.
fn counting_cache(delay: Duration) -> (EntityCache<String, Value>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cache = EntityCache::new("test", move |key: String| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(delay).await;
            Ok(json!({ "key": key, "n": n }))
        }
    });
    (cache, calls)
}

/// Fetcher that blocks until `gate` is notified, then returns `value`.
fn gated_cache(gate: &Arc<Notify>, value: Value) -> EntityCache<String, Value> {
    let gate = Arc::clone(gate);
    EntityCache::new("gated", move |_key: String| {
        let gate = Arc::clone(&gate);
        let value = value.clone();
        async move {
            gate.notified().await;
            Ok(value)
        }
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// =============================================================================
// get
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_trigger_one_fetch() {
    let (cache, calls) = counting_cache(Duration::from_millis(50));

    let gets = (0..16).map(|_| {
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    let results = futures::future::join_all(gets).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.fetch_count(), 1);
    assert!(results.iter().all(|r| r.as_ref().unwrap()["n"] == 1));
}

#[tokio::test]
async fn ready_entry_is_served_without_fetch() {
    let (cache, calls) = counting_cache(Duration::ZERO);

    let first = cache.get("k").await.unwrap();
    let second = cache.get("k").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_keys_fetch_independently() {
    let (cache, calls) = counting_cache(Duration::ZERO);

    cache.get("a").await.unwrap();
    cache.get("b").await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn entry_moves_from_empty_through_loading_to_ready() {
    let gate = Arc::new(Notify::new());
    let cache = gated_cache(&gate, json!({"topic": "Team"}));
    assert_eq!(cache.state("k"), CacheState::Empty);

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    settle().await;
    assert_eq!(cache.state("k"), CacheState::Loading);
    assert!(cache.peek("k").is_none());

    gate.notify_one();
    waiter.await.unwrap().unwrap();
    assert_eq!(cache.state("k"), CacheState::Ready);
}

#[tokio::test]
async fn conversation_scenario_shares_one_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let cache = {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        EntityCache::new("conversations", move |_id: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(json!({"topic": "Team"}))
            }
        })
    };

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("conv-123").await }
    });
    settle().await;
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("conv-123").await }
    });
    settle().await;
    gate.notify_one();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first, json!({"topic": "Team"}));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.state("conv-123"), CacheState::Ready);
    assert_eq!(cache.peek("conv-123"), Some(json!({"topic": "Team"})));
}

#[tokio::test]
async fn abandoned_get_still_populates_entry() {
    let (cache, calls) = counting_cache(Duration::from_millis(30));

    let abandoned = tokio::time::timeout(Duration::from_millis(1), cache.get("k")).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.state("k"), CacheState::Ready);
    cache.get("k").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prefetch_starts_one_fetch_that_get_joins() {
    let (cache, calls) = counting_cache(Duration::from_millis(30));

    assert!(cache.prefetch("k"));
    assert!(!cache.prefetch("k"));
    assert_eq!(cache.state("k"), CacheState::Loading);

    let value = cache.get("k").await.unwrap();
    assert_eq!(value["n"], 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prefetch_lands_without_any_waiter() {
    let (cache, calls) = counting_cache(Duration::from_millis(10));

    assert!(cache.prefetch("k"));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(cache.state("k"), CacheState::Ready);
    assert!(!cache.prefetch("k"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn prefetch_outside_runtime_does_nothing() {
    let (cache, calls) = counting_cache(Duration::ZERO);

    assert!(!cache.prefetch("k"));
    assert_eq!(cache.state("k"), CacheState::Empty);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_reaches_every_waiter_and_resets_entry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache: EntityCache<String, Value> = {
        let calls = Arc::clone(&calls);
        EntityCache::new("failing", move |_key: String| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                if n == 0 {
                    Err(ClientError::RequestFailed { status: 503, body: "busy".into() })
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        })
    };

    let gets = (0..4).map(|_| {
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    let results = futures::future::join_all(gets).await;

    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, ClientError::CacheFetchFailed { key, .. } if key == "k"));
        assert_eq!(err.status(), Some(503));
    }
    assert_eq!(cache.state("k"), CacheState::Empty);

    assert_eq!(cache.get("k").await.unwrap(), json!({"ok": true}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_fetch_surfaces_internal_error() {
    let cache: EntityCache<String, Value> = EntityCache::new("panicky", |_key: String| async {
        if true {
            panic!("fetch blew up");
        }
        Ok(Value::Null)
    });

    let err = cache.get("k").await.unwrap_err();

    assert!(matches!(err.root(), ClientError::Internal(_)));
    assert_eq!(cache.state("k"), CacheState::Empty);
}

// =============================================================================
// update / invalidate
// =============================================================================

#[tokio::test]
async fn update_then_get_does_not_fetch() {
    let (cache, calls) = counting_cache(Duration::ZERO);

    cache.update("k".to_string(), json!({"topic": "Pushed"}));

    assert_eq!(cache.get("k").await.unwrap(), json!({"topic": "Pushed"}));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_overwrites_ready_value() {
    let (cache, _) = counting_cache(Duration::ZERO);
    cache.get("k").await.unwrap();

    cache.update("k".to_string(), json!("fresh"));

    assert_eq!(cache.state("k"), CacheState::Ready);
    assert_eq!(cache.peek("k"), Some(json!("fresh")));
}

#[tokio::test]
async fn invalidate_then_get_fetches_again() {
    let (cache, calls) = counting_cache(Duration::ZERO);
    cache.get("k").await.unwrap();

    cache.invalidate("k");
    assert_eq!(cache.state("k"), CacheState::Empty);
    let value = cache.get("k").await.unwrap();

    assert_eq!(value["n"], 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn update_during_fetch_is_not_overwritten() {
    let gate = Arc::new(Notify::new());
    let cache = gated_cache(&gate, json!("fetched"));

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    settle().await;
    cache.update("k".to_string(), json!("pushed"));
    gate.notify_one();

    assert_eq!(waiter.await.unwrap().unwrap(), json!("fetched"));
    settle().await;
    assert_eq!(cache.peek("k"), Some(json!("pushed")));
}

#[tokio::test]
async fn invalidate_during_fetch_keeps_entry_empty() {
    let gate = Arc::new(Notify::new());
    let cache = gated_cache(&gate, json!("stale"));

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get("k").await }
    });
    settle().await;
    cache.invalidate("k");
    gate.notify_one();

    waiter.await.unwrap().unwrap();
    settle().await;
    assert_eq!(cache.state("k"), CacheState::Empty);
}

#[tokio::test]
async fn update_with_only_touches_ready_entries() {
    let (cache, _) = counting_cache(Duration::ZERO);
    assert!(cache.update_with("missing", |_| json!("x")).is_none());

    cache.update("k".to_string(), json!({"topic": "Old"}));
    let next = cache.update_with("k", |v| {
        let mut v = v.clone();
        v["topic"] = json!("New");
        v
    });

    assert_eq!(next, Some(json!({"topic": "New"})));
    assert_eq!(cache.peek("k").unwrap()["topic"], "New");
}

#[tokio::test]
async fn remove_and_snapshot_report_ready_entries_only() {
    let (cache, _) = counting_cache(Duration::ZERO);
    cache.update("a".to_string(), json!(1));
    cache.update("b".to_string(), json!(2));
    cache.invalidate("b");

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.values(), vec![json!(1)]);
    assert_eq!(cache.remove("a"), Some(json!(1)));
    assert!(cache.is_empty());
}
