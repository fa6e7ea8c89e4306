//! End-to-end scenarios across `RoomManager`/`Room`/`RoomService`.
//!
//! Run with: cargo test --test integration_tests
//! The Redis-backed scenario is gated behind `#[ignore]` so the default run
//! stays hermetic; run it explicitly against a live server with
//! `cargo test --test integration_tests -- --ignored`.

use async_trait::async_trait;
use room_sync::{
    CommandStore, FakeStore, Payload, PubSub, Result, Room, RoomManager, RoomManagerConfig,
    RoomOptions, RoomService, StoreClientPair,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn manager_over_fake() -> (RoomManager, FakeStore) {
    let fake = FakeStore::new();
    let store = StoreClientPair::new(Arc::new(fake.clone()), Arc::new(fake.clone()));
    (RoomManager::with_store(RoomManagerConfig::default(), store), fake)
}

/// S1. Literal room publish writes the stringified hash and the exact
/// history payload.
#[tokio::test]
async fn s1_publish_writes_hash_and_history() {
    let (mgr, fake) = manager_over_fake();
    let producer = mgr
        .create_room(
            "r",
            RoomOptions {
                enable_full_data: true,
                history_length: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut data = Payload::new();
    data.insert("user".to_string(), json!("a"));
    data.insert("score".to_string(), json!(100));
    producer.publish(data, None).await.unwrap();

    let hash = fake.hgetall("room:r:hash").await.unwrap();
    assert_eq!(hash.get("user").unwrap(), "a");
    assert_eq!(hash.get("score").unwrap(), "100");

    let history = fake.lrange_all("room:r:list").await.unwrap();
    assert_eq!(history.len(), 1);
    let decoded: Payload = serde_json::from_str(&history[0]).unwrap();
    assert_eq!(decoded.get("user").unwrap(), &json!("a"));
    assert_eq!(decoded.get("score").unwrap(), &json!(100));
}

/// S2. A consumer's initial dispatch carries the snapshot with
/// `new_data = None`; a subsequent producer publish delivers `new_data`.
#[tokio::test]
async fn s2_join_then_publish_delivers_initial_and_update() {
    let (mgr, _fake) = manager_over_fake();
    let producer = mgr
        .create_room("r", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap();

    let mut initial_state = Payload::new();
    initial_state.insert("state".to_string(), json!("waiting"));
    producer.publish(initial_state, None).await.unwrap();

    let consumer = mgr.get_room("r", RoomOptions::default()).await.unwrap();
    let deliveries: Arc<Mutex<Vec<(Payload, Option<Payload>)>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries_clone = deliveries.clone();
    consumer
        .join(
            "user1",
            Arc::new(move |full, new, _extra| {
                deliveries_clone.lock().unwrap().push((full.clone(), new.cloned()));
            }),
            None,
        )
        .await
        .unwrap();

    {
        let got = deliveries.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.get("state").unwrap(), &json!("waiting"));
        assert!(got[0].1.is_none());
    }

    let mut update = Payload::new();
    update.insert("state".to_string(), json!("playing"));
    producer.publish(update, None).await.unwrap();

    for _ in 0..50 {
        if deliveries.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let got = deliveries.lock().unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].0.get("state").unwrap(), &json!("playing"));
    assert_eq!(got[1].1.as_ref().unwrap().get("state").unwrap(), &json!("playing"));
}

/// S3. A pattern consumer aggregates across two producer rooms and keeps
/// receiving updates scoped to whichever literal room changes.
#[tokio::test]
async fn s3_pattern_room_aggregates_and_tracks_updates() {
    let (mgr, _fake) = manager_over_fake();
    let producer_a = mgr
        .create_room("p:a", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap();
    let producer_b = mgr
        .create_room("p:b", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap();

    let mut val1 = Payload::new();
    val1.insert("val1".to_string(), json!(100));
    producer_a.publish(val1, None).await.unwrap();
    let mut val2 = Payload::new();
    val2.insert("val2".to_string(), json!(200));
    producer_b.publish(val2, None).await.unwrap();

    let pattern_room = mgr.get_room("p:*", RoomOptions::default()).await.unwrap();
    let deliveries: Arc<Mutex<Vec<(Payload, Option<Payload>)>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries_clone = deliveries.clone();
    pattern_room
        .join(
            "user1",
            Arc::new(move |full, new, _extra| {
                deliveries_clone.lock().unwrap().push((full.clone(), new.cloned()));
            }),
            None,
        )
        .await
        .unwrap();

    {
        let got = deliveries.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.get("val1").unwrap(), &json!("100"));
        assert_eq!(got[0].0.get("val2").unwrap(), &json!("200"));
        assert!(got[0].1.is_none());
    }

    let mut update = Payload::new();
    update.insert("val1".to_string(), json!(111));
    producer_a.publish(update, None).await.unwrap();

    for _ in 0..50 {
        if deliveries.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let got = deliveries.lock().unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].1.as_ref().unwrap().get("val1").unwrap(), &json!(111));
}

/// A pattern consumer with `history_length > 0` aggregates history across
/// every matching literal room's list key, not just their hash keys.
#[tokio::test]
async fn pattern_room_aggregates_history_across_literal_rooms() {
    let (mgr, _fake) = manager_over_fake();
    let producer_a = mgr
        .create_room(
            "h:a",
            RoomOptions { enable_publish: true, history_length: 5, ..Default::default() },
        )
        .await
        .unwrap();
    let producer_b = mgr
        .create_room(
            "h:b",
            RoomOptions { enable_publish: true, history_length: 5, ..Default::default() },
        )
        .await
        .unwrap();

    for n in [1, 2] {
        let mut p = Payload::new();
        p.insert("n".to_string(), json!(n));
        producer_a.publish(p, None).await.unwrap();
    }
    let mut p = Payload::new();
    p.insert("n".to_string(), json!(3));
    producer_b.publish(p, None).await.unwrap();

    let pattern_room = mgr
        .get_room("h:*", RoomOptions { history_length: 5, ..Default::default() })
        .await
        .unwrap();
    let history = pattern_room.get_history_data().await.unwrap();

    assert_eq!(history.len(), 3);
    let mut values: Vec<i64> = history.iter().map(|p| p.get("n").unwrap().as_i64().unwrap()).collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3]);
}

/// S4. Idle reaping removes an empty consumer room past the idle threshold
/// but never a producer room.
#[tokio::test]
async fn s4_idle_reaper_spares_producers() {
    let fake = FakeStore::new();
    let store = StoreClientPair::new(Arc::new(fake.clone()), Arc::new(fake));
    let config = RoomManagerConfig {
        idle_timeout: Duration::from_millis(50),
        check_interval: Duration::from_millis(20),
        ..RoomManagerConfig::default()
    };
    let mgr = RoomManager::with_store(config, store);

    let consumer = mgr.get_room("consumer", RoomOptions::default()).await.unwrap();
    let cb: room_sync::Callback = Arc::new(|_, _, _| {});
    consumer.join("u", cb, None).await.unwrap();
    consumer.leave("u").await;

    let producer = mgr
        .create_room("producer", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap();
    producer.get_full_data().await.unwrap();

    mgr.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    mgr.stop().await;

    assert!(mgr.get_room("consumer", RoomOptions::default()).await.is_ok());
    // get_room recreates a fresh Room if reaped; confirm it's actually a new
    // instance (uninitialized, no history) rather than the one we joined.
    let recreated = mgr.get_room("consumer", RoomOptions::default()).await.unwrap();
    assert!(!Arc::ptr_eq(&consumer, &recreated));
    let _ = producer;
}

/// S5. `createRoom` with a wildcard name and `enable_publish` requested fails.
#[tokio::test]
async fn s5_create_room_rejects_pattern_for_producer() {
    let (mgr, _fake) = manager_over_fake();
    let err = mgr
        .create_room("x*", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, room_sync::Error::PatternNotAllowedForProducer(_)));
}

/// A `CommandStore` that fails its first `hgetall` call and succeeds
/// thereafter, used to exercise the single-flight retry-on-failure path.
struct FlakyOnceStore {
    inner: FakeStore,
    hgetall_calls: AtomicUsize,
    fail_first: AtomicBool,
}

impl FlakyOnceStore {
    fn new(inner: FakeStore) -> Self {
        Self {
            inner,
            hgetall_calls: AtomicUsize::new(0),
            fail_first: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl CommandStore for FlakyOnceStore {
    async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        self.inner.hset(key, fields).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.hgetall_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(room_sync::Error::Redis("simulated fetch failure".to_string()));
        }
        self.inner.hgetall(key).await
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        self.inner.lpush_trim(key, value, cap).await
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        self.inner.lrange_all(key).await
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        self.inner.del(keys).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.inner.publish(channel, payload).await
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.scan_match(pattern).await
    }
}

#[async_trait]
impl PubSub for FlakyOnceStore {
    async fn subscribe_literal(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        self.inner.subscribe_literal(channel).await
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<mpsc::Receiver<String>> {
        self.inner.subscribe_pattern(pattern).await
    }

    async fn unsubscribe_literal(&self, channel: &str) {
        self.inner.unsubscribe_literal(channel).await;
    }

    async fn unsubscribe_pattern(&self, pattern: &str) {
        self.inner.unsubscribe_pattern(pattern).await;
    }
}

/// S6. First `getFullData` propagates the fetch error; a second call (after
/// the singleflight guard clears) succeeds.
#[tokio::test]
async fn s6_initialization_failure_clears_guard_for_retry() {
    let fake = FakeStore::new();
    let flaky = Arc::new(FlakyOnceStore::new(fake.clone()));
    let store = StoreClientPair::new(flaky, Arc::new(fake));
    let mgr = RoomManager::with_store(RoomManagerConfig::default(), store);

    let producer = mgr
        .create_room("r", RoomOptions { enable_publish: true, ..Default::default() })
        .await
        .unwrap();
    let mut data = Payload::new();
    data.insert("state".to_string(), json!("ready"));
    producer.publish(data, None).await.unwrap();

    let consumer = mgr.get_room("r", RoomOptions::default()).await.unwrap();
    let first = consumer.get_full_data().await;
    assert!(first.is_err());

    let second = consumer.get_full_data().await.unwrap();
    assert_eq!(second.get("state").unwrap(), &json!("ready"));
}

/// S7. 100 concurrent `join` calls on a fresh room all receive an initial
/// dispatch; no deadlock or duplicate-fetch failure surfaces.
#[tokio::test]
async fn s7_concurrent_joins_all_receive_initial_dispatch() {
    let (mgr, _fake) = manager_over_fake();
    let room: Arc<Room> = mgr.get_room("r", RoomOptions::default()).await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..100 {
        let room = room.clone();
        let delivered = delivered.clone();
        handles.push(tokio::spawn(async move {
            let cb: room_sync::Callback = Arc::new(move |_full, new, _extra| {
                assert!(new.is_none());
                delivered.fetch_add(1, Ordering::SeqCst);
            });
            room.join(format!("user{i}"), cb, None).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 100);
}

/// The service facade always forces producer intent on `create_room`
/// regardless of what the caller passed in `opts`.
#[tokio::test]
async fn service_facade_forces_producer_intent() {
    let fake = FakeStore::new();
    let store = StoreClientPair::new(Arc::new(fake.clone()), Arc::new(fake));
    let manager = Arc::new(RoomManager::with_store(RoomManagerConfig::default(), store));
    let service = RoomService::new(manager);

    let room = service
        .create_room("lobby", RoomOptions { enable_publish: false, ..Default::default() })
        .await
        .unwrap();
    room.publish(Payload::new(), None).await.unwrap();
}

/// Exercises the real Redis-backed command/pubsub stack end to end. Skipped
/// by default; run with `cargo test -- --ignored` against a live server.
#[tokio::test]
#[ignore = "Requires Redis server"]
async fn redis_backed_publish_and_join_round_trip() {
    tracing_subscriber::fmt().try_init().ok();

    let config = RoomManagerConfig {
        redis_url: "redis://127.0.0.1:6379".to_string(),
        prefix: format!("room-sync-it-{}", std::process::id()),
        ..RoomManagerConfig::default()
    };
    let mgr = RoomManager::new(config).unwrap();
    mgr.start().await;

    let producer = mgr
        .create_room(
            "live",
            RoomOptions {
                enable_full_data: true,
                history_length: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let delivered = Arc::new(AtomicBool::new(false));
    let delivered_clone = delivered.clone();
    let consumer = mgr.get_room("live", RoomOptions::default()).await.unwrap();
    consumer
        .join(
            "watcher",
            Arc::new(move |_full, new, _extra| {
                if new.is_some() {
                    delivered_clone.store(true, Ordering::SeqCst);
                }
            }),
            None,
        )
        .await
        .unwrap();

    let mut data = Payload::new();
    data.insert("tick".to_string(), json!(1));
    producer.publish(data, None).await.unwrap();

    for _ in 0..50 {
        if delivered.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered.load(Ordering::SeqCst));

    mgr.stop().await;
}
