//! End-to-end scenarios over the public API.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_store::{
    CacheEngine, EngineOptions, EventType, ExpiryListener, FileStore, MemoryStore, Record,
    SerdeModel, StateCacheExt, StoreError, StoreResult, TableCache, TableCacheExt, TriggerKey,
    TriggerRegistry, to_record,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn record(value: Value) -> Record {
    to_record(&value).unwrap()
}

fn memory_engine(sweep: Duration) -> CacheEngine {
    CacheEngine::memory(MemoryStore::new(sweep), EngineOptions::default())
}

// ═══════════════════════════════════════════════════════════════════════
//  State record lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn state_record_lifecycle() {
    let engine = memory_engine(Duration::from_secs(60));
    let states = engine.factory("acme", "5511").unwrap().create_state_cache();

    assert!(states.upsert("flow_a", record(json!({"step": 1})), Some(60)).await);
    assert_eq!(states.get_field("flow_a", "step").await, Some(json!(1)));
    assert_eq!(states.increment_field("flow_a", "step", 1, None).await, Some(2));

    let ttl = states.get_ttl("flow_a").await;
    assert!(ttl > 0 && ttl <= 60, "ttl was {ttl}");

    assert_eq!(states.delete("flow_a").await, 1);
    assert!(states.get("flow_a").await.is_none());
}

#[tokio::test]
async fn missing_context_is_a_configuration_error() {
    let engine = memory_engine(Duration::from_secs(60));
    let err = engine.factory("acme", "").unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));
    assert!(engine.publisher("", "1").is_err());
}

// ═══════════════════════════════════════════════════════════════════════
//  Expiry triggers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn expired_trigger_fires_exactly_once() {
    let engine = memory_engine(Duration::from_secs(1));
    engine.start().await.unwrap();

    let (tx, mut fired) = mpsc::unbounded_channel();
    let registry = TriggerRegistry::new();
    registry.register("reminder", move |trigger: TriggerKey| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(trigger);
        }
    });
    let listener = ExpiryListener::new(registry, engine.keys().clone());
    let worker = listener.start(engine.expired_keys().await.unwrap());

    let triggers = engine.factory("acme", "5511").unwrap().create_expiry_cache();
    assert!(triggers.set("reminder", "TXN_1", 1).await);
    assert!(triggers.exists("reminder", "TXN_1").await);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!triggers.exists("reminder", "TXN_1").await);

    let first = tokio::time::timeout(Duration::from_secs(5), fired.recv())
        .await
        .expect("trigger should fire")
        .unwrap();
    assert_eq!(
        first,
        TriggerKey {
            tenant: "acme".into(),
            action: "reminder".into(),
            identifier: "TXN_1".into(),
        }
    );
    assert!(
        tokio::time::timeout(Duration::from_secs(5), fired.recv())
            .await
            .is_err(),
        "trigger fired twice"
    );

    listener.stop();
    worker.await.unwrap();
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_trigger_never_fires() {
    let engine = memory_engine(Duration::from_secs(1));
    engine.start().await.unwrap();

    let (tx, mut fired) = mpsc::unbounded_channel::<TriggerKey>();
    let registry = TriggerRegistry::new();
    registry.register("reminder", move |trigger: TriggerKey| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(trigger);
        }
    });
    let listener = ExpiryListener::new(registry, engine.keys().clone());
    let _worker = listener.start(engine.expired_keys().await.unwrap());

    let triggers = engine.factory("acme", "5511").unwrap().create_expiry_cache();
    triggers.set("reminder", "TXN_2", 2).await;
    assert_eq!(triggers.delete("reminder", "TXN_2").await, 1);

    assert!(
        tokio::time::timeout(Duration::from_secs(5), fired.recv())
            .await
            .is_err()
    );
    engine.stop().await;
}

#[tokio::test]
async fn bulk_cancel_by_identifier() {
    let engine = memory_engine(Duration::from_secs(60));
    let triggers = engine.factory("acme", "5511").unwrap().create_expiry_cache();

    assert!(triggers.set("a", "X", 300).await);
    assert!(triggers.set("b", "X", 300).await);
    assert_eq!(triggers.delete_all_by_identifier("X").await, 2);
    assert_eq!(triggers.delete_all_by_identifier("X").await, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

async fn hammer(tables: Arc<dyn TableCache>, callers: usize) -> Option<Value> {
    let mut tasks = Vec::with_capacity(callers);
    for _ in 0..callers {
        let tables = tables.clone();
        tasks.push(tokio::spawn(async move {
            tables.increment_field("counters", "hits", "n", 1, None).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }
    tables.get_field("counters", "hits", "n").await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_not_lost_in_memory() {
    let engine = memory_engine(Duration::from_secs(60));
    let tables = engine.table_cache("acme").unwrap();
    assert_eq!(hammer(tables, 64).await, Some(json!(64)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_not_lost_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let engine = CacheEngine::file(FileStore::new(dir.path()).unwrap(), EngineOptions::default());
    let tables = engine.table_cache("acme").unwrap();
    assert_eq!(hammer(tables, 24).await, Some(json!(24)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Typed reads
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Stage {
    Browsing,
    Paying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Address {
    city: String,
    zip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Checkout {
    stage: Stage,
    total_cents: i64,
    started_at: DateTime<Utc>,
    ship_to: Address,
    items: Vec<String>,
}

#[tokio::test]
async fn typed_state_round_trip() {
    let engine = memory_engine(Duration::from_secs(60));
    let states = engine.factory("acme", "5511").unwrap().create_state_cache();

    let checkout = Checkout {
        stage: Stage::Paying,
        total_cents: 1999,
        started_at: "2024-05-17T09:30:00Z".parse().unwrap(),
        ship_to: Address {
            city: "Lima".into(),
            zip: None,
        },
        items: vec!["sku-1".into()],
    };
    states.upsert("checkout", to_record(&checkout).unwrap(), None).await;

    let back: Checkout = states
        .get_as("checkout", &SerdeModel::<Checkout>::new())
        .await
        .unwrap();
    assert_eq!(back, checkout);

    // a record of the wrong shape is reported as absent
    states.upsert("broken", record(json!({"stage": "lost"})), None).await;
    assert!(
        states
            .get_as("broken", &SerdeModel::<Checkout>::new())
            .await
            .is_none()
    );
}

#[tokio::test]
async fn closure_hook_reconstructs_table_rows() {
    let engine = memory_engine(Duration::from_secs(60));
    let tables = engine.table_cache("acme").unwrap();
    tables.upsert("prices", "a", record(json!({"cents": 100})), None).await;
    tables.upsert("prices", "b", record(json!({"cents": 250})), None).await;
    tables.upsert("prices", "c", record(json!({"cents": "n/a"})), None).await;

    let cents = |row: Record| -> StoreResult<i64> {
        row.get("cents")
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::Reconstruct("cents is not a number".into()))
    };

    let mut all: Vec<i64> = tables.get_all_as("prices", &cents).await;
    all.sort_unstable();
    assert_eq!(all, vec![100, 250]);

    let found: Option<i64> = tables
        .find_by_field_as("prices", "cents", &json!(250), &cents)
        .await;
    assert_eq!(found, Some(250));
}

// ═══════════════════════════════════════════════════════════════════════
//  Notifications
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn notifications_flow_through_the_engine() {
    let engine = memory_engine(Duration::from_secs(60));
    let subscriber = engine.subscriber();
    let mut incoming = subscriber
        .subscribe_tenant("acme", None, Some(&EventType::IncomingMessage))
        .await
        .unwrap();

    let publisher = engine.publisher("acme", "5511").unwrap();
    assert_eq!(
        publisher
            .publish(&EventType::IncomingMessage, json!({"message_id": "m1"}))
            .await,
        1
    );
    assert_eq!(publisher.publish(&EventType::BotReply, json!({})).await, 0);

    let note = incoming.next().await.unwrap();
    assert_eq!(note.tenant, "acme");
    assert_eq!(note.user_id, "5511");
    assert_eq!(note.platform, "whatsapp");
    assert_eq!(note.data, json!({"message_id": "m1"}));
    assert_eq!(note.channel, "courier:notify:acme:5511:incoming_message");
    assert!(note.timestamp.parse::<DateTime<Utc>>().is_ok());
}

#[tokio::test]
async fn listen_once_returns_first_notification() {
    let engine = memory_engine(Duration::from_secs(60));
    let subscriber = engine.subscriber();
    let publisher = engine.publisher("acme", "1").unwrap();
    let channel = publisher.channel(&EventType::StatusChange);

    let waiter = tokio::spawn({
        let channel = channel.clone();
        async move {
            subscriber
                .listen_once(&[channel], &[], Duration::from_secs(5))
                .await
        }
    });

    // publish until the waiter has subscribed
    let mut delivered = 0;
    for _ in 0..100 {
        delivered = publisher
            .publish(&EventType::StatusChange, json!({"status": "read"}))
            .await;
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, 1);

    let note = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(note.event_type(), EventType::StatusChange);
    assert_eq!(note.data["status"], json!("read"));
}
