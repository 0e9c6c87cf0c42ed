//! Behaviour every storage engine must share.
//!
//! Each check takes a [`CacheEngine`] and is run against the memory and
//! JSON file engines. The Redis run needs a live server and is ignored by
//! default.

use chrono::{TimeZone, Utc};
use courier_store::{
    CacheEngine, EngineOptions, FileStore, MemoryStore, RedisBackend, Record, TTL_MISSING,
    TTL_PERSISTENT, to_record,
};
use serde_json::{Value, json};
use tempfile::TempDir;

fn options() -> EngineOptions {
    EngineOptions {
        default_ttl: None,
        ..EngineOptions::default()
    }
}

fn memory_engine() -> CacheEngine {
    CacheEngine::memory(MemoryStore::default(), options())
}

fn file_engine() -> (CacheEngine, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();
    (CacheEngine::file(store, options()), dir)
}

fn record(value: Value) -> Record {
    to_record(&value).unwrap()
}

/// Unique tenant so runs against a shared Redis never collide.
fn tenant(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7().simple())
}

// ═══════════════════════════════════════════════════════════════════════
//  Checks
// ═══════════════════════════════════════════════════════════════════════

async fn check_record_lifecycle(engine: &CacheEngine) {
    let users = engine.factory(&tenant("life"), "5511").unwrap().create_user_cache();

    assert!(users.get().await.is_none());
    assert!(!users.exists().await);

    assert!(users.upsert(record(json!({"name": "Ana", "age": 30})), None).await);
    assert!(users.exists().await);
    assert_eq!(users.get_field("name").await, Some(json!("Ana")));

    // upsert merges: untouched fields survive
    assert!(users.upsert(record(json!({"age": 31, "city": "Lima"})), None).await);
    let stored = users.get().await.unwrap();
    assert_eq!(stored["name"], json!("Ana"));
    assert_eq!(stored["age"], json!(31));
    assert_eq!(stored["city"], json!("Lima"));

    assert!(users.update_field("city", json!("Quito"), None).await);
    assert_eq!(users.get_field("city").await, Some(json!("Quito")));
    assert_eq!(users.get_field("missing").await, None);

    assert!(users.delete_field("city").await);
    assert!(!users.delete_field("city").await);

    assert_eq!(users.delete().await, 1);
    assert_eq!(users.delete().await, 0);
    assert!(users.get().await.is_none());
}

async fn check_ttl_contract(engine: &CacheEngine) {
    let states = engine.factory(&tenant("ttl"), "1").unwrap().create_state_cache();

    assert_eq!(states.get_ttl("never").await, TTL_MISSING);

    states.upsert("forever", record(json!({"a": 1})), None).await;
    assert_eq!(states.get_ttl("forever").await, TTL_PERSISTENT);

    states.upsert("timed", record(json!({"a": 1})), Some(60)).await;
    let ttl = states.get_ttl("timed").await;
    assert!((58..=60).contains(&ttl), "ttl was {ttl}");

    assert!(states.renew_ttl("forever", 120).await);
    let ttl = states.get_ttl("forever").await;
    assert!((118..=120).contains(&ttl), "ttl was {ttl}");
    assert!(!states.renew_ttl("never", 120).await);

    // no default ttl here, so field updates keep the current one
    states.update_field("timed", "a", json!(2), None).await;
    let ttl = states.get_ttl("timed").await;
    assert!((58..=60).contains(&ttl), "ttl was {ttl}");

    states.delete("timed").await;
    assert_eq!(states.get_ttl("timed").await, TTL_MISSING);
}

async fn check_increment(engine: &CacheEngine) {
    let tables = engine.factory(&tenant("inc"), "1").unwrap().create_table_cache();

    assert_eq!(tables.increment_field("stock", "sku1", "qty", 5, None).await, Some(5));
    assert_eq!(tables.increment_field("stock", "sku1", "qty", -2, None).await, Some(3));
    assert_eq!(tables.get_field("stock", "sku1", "qty").await, Some(json!(3)));

    tables
        .update_field("stock", "sku1", "label", json!("box"), None)
        .await;
    assert_eq!(tables.increment_field("stock", "sku1", "label", 1, None).await, None);
    assert_eq!(tables.get_field("stock", "sku1", "label").await, Some(json!("box")));
}

async fn check_append(engine: &CacheEngine) {
    let agents = engine.factory(&tenant("app"), "1").unwrap().create_ai_state_cache();

    assert!(agents.append_to_list("planner", "steps", json!("search"), None).await);
    assert!(agents.append_to_list("planner", "steps", json!({"tool": "mail"}), None).await);
    assert_eq!(
        agents.get_field("planner", "steps").await,
        Some(json!(["search", {"tool": "mail"}]))
    );

    agents.update_field("planner", "note", json!("text"), None).await;
    assert!(agents.append_to_list("planner", "note", json!(1), None).await);
    assert_eq!(agents.get_field("planner", "note").await, Some(json!([1])));
}

async fn check_value_shapes(engine: &CacheEngine) {
    let users = engine.factory(&tenant("shape"), "1").unwrap().create_user_cache();
    let when = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
    let data = json!({
        "nested": {"a": [1, 2, {"b": null}]},
        "flag": true,
        "off": false,
        "when": when,
        "count": 42,
        "ratio": 0.25,
        "label": "plain",
        "numeric_text": "42",
        "nothing": null,
    });

    users.upsert(record(data.clone()), None).await;
    let stored = Value::Object(users.get().await.unwrap());
    assert_eq!(stored, data);
    assert_eq!(users.get_field("numeric_text").await, Some(json!("42")));
}

async fn check_table_scans(engine: &CacheEngine) {
    let tenant = tenant("scan");
    let tables = engine.factory(&tenant, "1").unwrap().create_table_cache();

    for pk in 0..150 {
        let row = record(json!({"pk": pk, "even": pk % 2 == 0}));
        assert!(tables.upsert("orders", &pk.to_string(), row, None).await);
    }
    tables.upsert("refunds", "7", record(json!({"pk": 7})), None).await;
    tables.upsert("refunds", "8", record(json!({"pk": 8})), None).await;

    assert_eq!(tables.get_all("orders").await.len(), 150);
    assert_eq!(tables.get_all("refunds").await.len(), 2);
    assert!(tables.get_all("absent").await.is_empty());

    let found = tables.find_by_field("orders", "pk", &json!(149)).await.unwrap();
    assert_eq!(found["even"], json!(false));
    assert!(tables.find_by_field("orders", "pk", &json!(1000)).await.is_none());

    assert_eq!(tables.delete_all_by_pkid("7").await, 2);
    assert!(!tables.exists("orders", "7").await);
    assert!(tables.exists("orders", "70").await);
    assert_eq!(tables.delete_all_by_pkid("7").await, 0);
}

async fn check_triggers(engine: &CacheEngine) {
    let triggers = engine.factory(&tenant("trg"), "1").unwrap().create_expiry_cache();

    assert!(triggers.set("a", "X", 60).await);
    assert!(triggers.set("b", "X", 60).await);
    assert!(triggers.set("a", "Y", 60).await);
    assert!(!triggers.set("a", "Z", 0).await);

    assert!(triggers.exists("a", "X").await);
    assert!(!triggers.exists("a", "Z").await);
    let ttl = triggers.get_ttl("b", "X").await;
    assert!((58..=60).contains(&ttl), "ttl was {ttl}");

    assert_eq!(triggers.delete_all_by_identifier("X").await, 2);
    assert_eq!(triggers.delete_all_by_identifier("X").await, 0);
    assert!(triggers.exists("a", "Y").await);

    assert_eq!(triggers.delete("a", "Y").await, 1);
    assert_eq!(triggers.delete("a", "Y").await, 0);
}

async fn check_tenant_isolation(engine: &CacheEngine) {
    let (first, second) = (tenant("iso-a"), tenant("iso-b"));
    let a = engine.factory(&first, "same").unwrap();
    let b = engine.factory(&second, "same").unwrap();

    a.create_user_cache().upsert(record(json!({"who": "a"})), None).await;
    a.create_table_cache()
        .upsert("t", "1", record(json!({"who": "a"})), None)
        .await;

    assert!(b.create_user_cache().get().await.is_none());
    assert!(b.create_table_cache().get_all("t").await.is_empty());
    assert_eq!(b.create_table_cache().delete_all_by_pkid("1").await, 0);
    assert!(a.create_table_cache().exists("t", "1").await);
}

async fn check_separator_in_ids(engine: &CacheEngine) {
    let caches = engine.factory(&tenant("sep"), "a:b").unwrap();
    let states = caches.create_state_cache();
    states.upsert("flow:x", record(json!({"v": 1})), None).await;
    assert_eq!(states.get_field("flow:x", "v").await, Some(json!(1)));
    // must not be confused with handler "flow" of user "x:a:b"
    assert!(!states.exists("flow").await);
}

/// The scripted sequence used for cross-engine parity.
async fn parity_transcript(engine: &CacheEngine) -> Vec<Value> {
    let states = engine.factory("parity", "5511").unwrap().create_state_cache();
    states.delete("flow").await;

    let mut out = Vec::new();
    out.push(json!(states.upsert("flow", record(json!({"step": 1, "tags": []})), None).await));
    out.push(json!(states.get_field("flow", "step").await));
    out.push(json!(states.increment_field("flow", "step", 1, None).await));
    out.push(json!(states.append_to_list("flow", "tags", json!("vip"), None).await));
    out.push(Value::Object(states.get("flow").await.unwrap_or_default()));
    out.push(json!(states.delete("flow").await));
    out.push(json!(states.get("flow").await));
    out
}

async fn run_all(engine: &CacheEngine) {
    check_record_lifecycle(engine).await;
    check_ttl_contract(engine).await;
    check_increment(engine).await;
    check_append(engine).await;
    check_value_shapes(engine).await;
    check_table_scans(engine).await;
    check_triggers(engine).await;
    check_tenant_isolation(engine).await;
    check_separator_in_ids(engine).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory engine
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn memory_engine_meets_contract() {
    run_all(&memory_engine()).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  File engine
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn file_engine_meets_contract() {
    let (engine, _dir) = file_engine();
    run_all(&engine).await;
}

#[tokio::test]
async fn file_engine_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let first = CacheEngine::file(FileStore::new(dir.path()).unwrap(), options());
    first
        .factory("acme", "5511")
        .unwrap()
        .create_user_cache()
        .upsert(record(json!({"name": "Ana"})), Some(600))
        .await;

    let path = dir.path().join("users").join("acme_5511.json");
    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["metadata"]["version"], json!("2"));
    assert!(doc["metadata"]["expires_at"].is_string());

    let second = CacheEngine::file(FileStore::new(dir.path()).unwrap(), options());
    let users = second.factory("acme", "5511").unwrap().create_user_cache();
    assert_eq!(users.get_field("name").await, Some(json!("Ana")));

    users.delete().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn file_engine_lays_out_one_document_per_context() {
    let (engine, dir) = file_engine();
    let caches = engine.factory("acme", "5511").unwrap();
    caches.create_state_cache().upsert("a", record(json!({"x": 1})), None).await;
    caches.create_state_cache().upsert("b", record(json!({"x": 2})), None).await;
    caches
        .create_table_cache()
        .upsert("orders", "1", record(json!({"x": 3})), None)
        .await;
    caches.create_expiry_cache().set("remind", "T1", 60).await;

    let states: Vec<_> = std::fs::read_dir(dir.path().join("states")).unwrap().collect();
    assert_eq!(states.len(), 1);
    assert!(dir.path().join("states").join("acme_5511.json").is_file());
    assert!(dir.path().join("tables").join("acme_tables.json").is_file());
    assert!(dir.path().join("expiry").join("acme_triggers.json").is_file());
}

// ═══════════════════════════════════════════════════════════════════════
//  Cross-engine parity
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn memory_and_file_engines_agree() {
    let (file, _dir) = file_engine();
    let from_memory = parity_transcript(&memory_engine()).await;
    let from_file = parity_transcript(&file).await;
    assert_eq!(from_memory, from_file);

    assert_eq!(from_memory[1], json!(1));
    assert_eq!(from_memory[2], json!(2));
    assert_eq!(from_memory[4], json!({"step": 2, "tags": ["vip"]}));
    assert_eq!(from_memory[5], json!(1));
    assert_eq!(from_memory[6], Value::Null);
}

// ═══════════════════════════════════════════════════════════════════════
//  Redis engine
// ═══════════════════════════════════════════════════════════════════════

fn redis_engine() -> CacheEngine {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    CacheEngine::redis(RedisBackend::new(&url, 16).unwrap(), options())
}

#[tokio::test]
#[ignore = "requires a running Redis server; run with --ignored"]
async fn redis_engine_meets_contract() {
    let engine = redis_engine();
    engine.start().await.unwrap();
    run_all(&engine).await;
    engine.stop().await;
}

#[tokio::test]
#[ignore = "requires a running Redis server; run with --ignored"]
async fn redis_engine_agrees_with_memory() {
    let engine = redis_engine();
    let from_redis = parity_transcript(&engine).await;
    let from_memory = parity_transcript(&memory_engine()).await;
    assert_eq!(from_redis, from_memory);
}
